use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Broker failures split by whether a retry can help, mirroring the
/// PUBLISH_RETRY / ERROR split on the audit rows
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Transient broker failure: {0}")]
    Transient(String),

    #[error("Permanent broker failure: {0}")]
    Permanent(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// One message handed to a subscriber
#[derive(Debug)]
pub struct Delivery {
    pub body: String,
    ack: Option<mpsc::UnboundedSender<()>>,
}

impl Delivery {
    pub fn new(body: String) -> Self {
        Self { body, ack: None }
    }

    pub fn with_ack(body: String, ack: mpsc::UnboundedSender<()>) -> Self {
        Self {
            body,
            ack: Some(ack),
        }
    }

    /// Acknowledge the delivery back to the broker. Consumers call this
    /// only after the message has been made durable.
    pub fn ack(mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }
}

/// The LIS-side message broker, injected from outside the core.
///
/// `publish` pushes a JSON body with headers onto a queue; `subscribe`
/// yields a stream of deliveries from a queue. Any durable broker binding
/// can implement this pair.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(
        &self,
        queue: &str,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> Result<()>;

    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>>;
}

/// Broker used when messaging is disabled: publishes succeed immediately
/// and subscriptions never yield
#[derive(Default)]
pub struct NoopBroker {
    // Senders are parked here so subscription channels stay open
    subscriptions: Mutex<Vec<mpsc::Sender<Delivery>>>,
}

impl NoopBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBroker for NoopBroker {
    async fn publish(
        &self,
        queue: &str,
        _body: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<()> {
        debug!("Messaging disabled, dropping publish to {}", queue);
        Ok(())
    }

    async fn subscribe(&self, _queue: &str) -> Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(1);
        self.subscriptions.lock().await.push(tx);
        Ok(rx)
    }
}

/// A message recorded by the in-memory broker
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub body: String,
    pub headers: HashMap<String, String>,
}

/// In-process broker for tests and single-process deployments: publishes
/// are recorded and fanned out to live subscribers of the queue
#[derive(Default)]
pub struct InMemoryBroker {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<Delivery>>>>,
    published: RwLock<HashMap<String, Vec<PublishedMessage>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published to a queue so far
    pub async fn published(&self, queue: &str) -> Vec<PublishedMessage> {
        self.published
            .read()
            .await
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn published_count(&self, queue: &str) -> usize {
        self.published
            .read()
            .await
            .get(queue)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(
        &self,
        queue: &str,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> Result<()> {
        self.published
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(PublishedMessage {
                body: body.to_string(),
                headers: headers.clone(),
            });

        let mut subscribers = self.subscribers.write().await;
        if let Some(queue_subscribers) = subscribers.get_mut(queue) {
            queue_subscribers.retain(|tx| !tx.is_closed());
            for tx in queue_subscribers.iter() {
                let _ = tx.send(Delivery::new(body.to_string())).await;
            }
        }

        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_publish_records_and_delivers() {
        let broker = InMemoryBroker::new();
        let mut rx = broker.subscribe("orders.vision-1").await.unwrap();

        let headers = HashMap::from([("instrumentName".to_string(), "vision-1".to_string())]);
        broker
            .publish("orders.vision-1", "{\"a\":1}", &headers)
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.body, "{\"a\":1}");
        delivery.ack();

        assert_eq!(broker.published_count("orders.vision-1").await, 1);
        let published = broker.published("orders.vision-1").await;
        assert_eq!(
            published[0].headers.get("instrumentName").unwrap(),
            "vision-1"
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_recorded() {
        let broker = InMemoryBroker::new();
        broker
            .publish("results.lab", "{}", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(broker.published_count("results.lab").await, 1);
        assert_eq!(broker.published_count("other").await, 0);
    }

    #[tokio::test]
    async fn test_noop_broker_accepts_everything() {
        let broker = NoopBroker::new();
        broker
            .publish("anything", "{}", &HashMap::new())
            .await
            .unwrap();

        let mut rx = broker.subscribe("anything").await.unwrap();
        // The channel stays open but nothing ever arrives
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(50),
            rx.recv()
        )
        .await
        .is_err());
    }
}
