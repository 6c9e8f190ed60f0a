#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use astm_interface::broker::{BrokerError, Delivery, InMemoryBroker, MessageBroker};
use astm_interface::driver::{DriverRegistry, RecordDriver};
use astm_interface::protocol::astm::constants::{ACK, ENQ, EOT, LF};
use astm_interface::protocol::astm::{split_into_frames, Frame, LinkTimeouts};
use astm_interface::service::{ControllerContext, ControllerRegistry};
use astm_interface::storage::{InMemoryRepository, ServerMessageRepository};

pub const RESULT_UPLOAD: &str = "H|\\^&|||OCD^VISION^5.13.1^J1|||||||P|LIS2-A|20250101120000\rP|1|PID1||||Doe^John||19800101|M\rO|1|S1||ABO|N|20250101120000|||||||||CENT|||||||20250101120000|||F\rR|1|ABO|A|||||F||Auto||20250101120000|J1\rL||\r";

pub const KEEP_ALIVE: &str =
    "H|\\^&|||OCD^VISION^5.14.0.47342^JNumber|||||||P|LIS2-A|20220902174004\rL||";

pub fn short_timeouts() -> LinkTimeouts {
    LinkTimeouts {
        enq_ack: Duration::from_millis(500),
        frame_ack: Duration::from_millis(500),
        intra_transmission: Duration::from_millis(1000),
        enq_retry_delay: Duration::from_millis(10),
    }
}

/// Collaborator bundle for driving one controller in isolation
pub struct TestHarness {
    pub repository: Arc<InMemoryRepository>,
    pub broker: Arc<InMemoryBroker>,
    pub registry: Arc<ControllerRegistry>,
    pub driver: Arc<dyn RecordDriver>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            repository: Arc::new(InMemoryRepository::new()),
            broker: Arc::new(InMemoryBroker::new()),
            registry: Arc::new(ControllerRegistry::new()),
            driver: DriverRegistry::with_defaults().resolve("lis2a"),
        }
    }

    pub fn context(&self, keep_alive_interval: Option<Duration>) -> ControllerContext {
        ControllerContext {
            instrument_name: "vision-1".to_string(),
            remote_address: "10.0.0.5:49152".to_string(),
            driver: Arc::clone(&self.driver),
            server_messages: Arc::clone(&self.repository) as Arc<dyn ServerMessageRepository>,
            broker: Arc::clone(&self.broker) as Arc<dyn MessageBroker>,
            result_queue: "lis.results".to_string(),
            keep_alive_interval,
            link_timeouts: short_timeouts(),
        }
    }

    pub fn context_with_broker(
        &self,
        broker: Arc<dyn MessageBroker>,
        keep_alive_interval: Option<Duration>,
    ) -> ControllerContext {
        ControllerContext {
            broker,
            ..self.context(keep_alive_interval)
        }
    }
}

pub async fn read_byte<S: AsyncRead + Unpin>(stream: &mut S) -> u8 {
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).await.unwrap();
    byte[0]
}

/// Act as the analyzer uploading one transmission
pub async fn analyzer_send<S>(stream: &mut S, content: &[u8])
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[ENQ]).await.unwrap();
    assert_eq!(read_byte(stream).await, ACK, "ENQ was not acknowledged");

    for frame in split_into_frames(content) {
        stream.write_all(&frame.encode()).await.unwrap();
        assert_eq!(
            read_byte(stream).await,
            ACK,
            "frame {} was not acknowledged",
            frame.sequence
        );
    }

    stream.write_all(&[EOT]).await.unwrap();
    stream.flush().await.unwrap();
}

/// Act as the analyzer accepting one download; returns the reassembled
/// content
pub async fn analyzer_receive<S>(stream: &mut S) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if read_byte(stream).await == ENQ {
            break;
        }
    }
    stream.write_all(&[ACK]).await.unwrap();

    let mut content = Vec::new();
    loop {
        let first = read_byte(stream).await;
        if first == EOT {
            break;
        }
        let mut raw = vec![first];
        loop {
            let byte = read_byte(stream).await;
            raw.push(byte);
            if byte == LF {
                break;
            }
        }
        let frame = Frame::parse(&raw).expect("analyzer received malformed frame");
        content.extend_from_slice(&frame.payload);
        stream.write_all(&[ACK]).await.unwrap();
    }
    content
}

/// Poll a condition until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Broker that fails the first `failures` publishes transiently, then
/// succeeds, recording like the in-memory broker
pub struct FlakyBroker {
    inner: InMemoryBroker,
    remaining_failures: AtomicUsize,
}

impl FlakyBroker {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryBroker::new(),
            remaining_failures: AtomicUsize::new(failures),
        }
    }

    pub async fn published_count(&self, queue: &str) -> usize {
        self.inner.published_count(queue).await
    }
}

#[async_trait]
impl MessageBroker for FlakyBroker {
    async fn publish(
        &self,
        queue: &str,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> Result<(), BrokerError> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Transient("broker unavailable".to_string()));
        }
        self.inner.publish(queue, body, headers).await
    }

    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        self.inner.subscribe(queue).await
    }
}
