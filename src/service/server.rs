use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::Serialize;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::broker::MessageBroker;
use crate::config::{Config, InstrumentConfig};
use crate::driver::DriverRegistry;
use crate::protocol::astm::LinkTimeouts;
use crate::storage::ServerMessageRepository;

use super::connection::{ConnectionController, ConnectionSnapshot, ControllerContext};
use super::registry::ControllerRegistry;

/// Read-only status snapshot of the whole server
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub running: bool,
    pub instruments: Vec<InstrumentStatus>,
}

/// Per-instrument slice of the status snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentStatus {
    pub name: String,
    pub port: u16,
    pub connection_count: usize,
    pub connections: Vec<ConnectionSnapshot>,
}

/// Hosts one TCP acceptor per configured instrument and spawns a
/// connection controller for every accepted socket
pub struct AstmServer {
    config: Arc<Config>,
    drivers: Arc<DriverRegistry>,
    server_messages: Arc<dyn ServerMessageRepository>,
    broker: Arc<dyn MessageBroker>,
    registry: Arc<ControllerRegistry>,
    is_running: Arc<AtomicBool>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AstmServer {
    pub fn new(
        config: Arc<Config>,
        drivers: Arc<DriverRegistry>,
        server_messages: Arc<dyn ServerMessageRepository>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        Self {
            config,
            drivers,
            server_messages,
            broker,
            registry: Arc::new(ControllerRegistry::new()),
            is_running: Arc::new(AtomicBool::new(false)),
            accept_tasks: Mutex::new(Vec::new()),
        }
    }

    /// The registry used for outbound order routing
    pub fn registry(&self) -> Arc<ControllerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Bind every instrument's listener and start accepting. Fails fast if
    /// any port cannot be bound.
    pub async fn start(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = self.accept_tasks.lock().await;
        for instrument in &self.config.instruments {
            let listener = Self::bind(instrument.port)
                .with_context(|| {
                    format!(
                        "Failed to bind port {} for instrument {}",
                        instrument.port, instrument.name
                    )
                })?;

            info!(
                "[{}] Listening on port {} (driver {}, max {} connections)",
                instrument.name,
                instrument.port,
                instrument.driver_class_name,
                instrument.max_connections
            );

            tasks.push(tokio::spawn(Self::accept_loop(
                listener,
                instrument.clone(),
                Arc::clone(&self.config),
                Arc::clone(&self.drivers),
                Arc::clone(&self.server_messages),
                Arc::clone(&self.broker),
                Arc::clone(&self.registry),
                Arc::clone(&self.is_running),
            )));
        }

        Ok(())
    }

    fn bind(port: u16) -> Result<TcpListener> {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(128)?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn accept_loop(
        listener: TcpListener,
        instrument: InstrumentConfig,
        config: Arc<Config>,
        drivers: Arc<DriverRegistry>,
        server_messages: Arc<dyn ServerMessageRepository>,
        broker: Arc<dyn MessageBroker>,
        registry: Arc<ControllerRegistry>,
        is_running: Arc<AtomicBool>,
    ) {
        // Bounded accept waits keep the loop responsive to stop()
        let accept_timeout =
            Duration::from_secs(instrument.connection_timeout_seconds.clamp(1, 10));
        let driver = drivers.resolve(&instrument.driver_class_name);
        let result_queue = instrument.result_queue(&config.messaging);

        while is_running.load(Ordering::SeqCst) {
            match timeout(accept_timeout, listener.accept()).await {
                Ok(Ok((stream, remote_addr))) => {
                    let live = registry.connection_count(&instrument.name).await;
                    if live >= instrument.max_connections {
                        warn!(
                            "[{}] Connection cap {} reached, refusing {}",
                            instrument.name, instrument.max_connections, remote_addr
                        );
                        drop(stream);
                        continue;
                    }

                    info!(
                        "[{}] Accepted connection from {}",
                        instrument.name, remote_addr
                    );

                    let context = ControllerContext {
                        instrument_name: instrument.name.clone(),
                        remote_address: remote_addr.to_string(),
                        driver: Arc::clone(&driver),
                        server_messages: Arc::clone(&server_messages),
                        broker: Arc::clone(&broker),
                        result_queue: result_queue.clone(),
                        keep_alive_interval: instrument.keep_alive_interval(),
                        link_timeouts: LinkTimeouts::default(),
                    };

                    ConnectionController::spawn(stream, context, Arc::clone(&registry)).await;
                }
                Ok(Err(e)) => {
                    error!("[{}] Accept error: {}", instrument.name, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(_) => {
                    // Accept wait elapsed; loop back to re-check the flag
                    continue;
                }
            }
        }

        info!("[{}] Listener stopped", instrument.name);
    }

    /// Stop accepting, then ask every live controller to shut down
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping ASTM interface server");

        for handle in self.registry.all().await {
            handle.stop();
        }

        let mut tasks = self.accept_tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Accept task ended abnormally: {}", e);
            }
        }

        info!("ASTM interface server stopped");
    }

    pub async fn status(&self) -> ServerStatus {
        let mut instruments = Vec::with_capacity(self.config.instruments.len());
        let all = self.registry.all().await;

        for instrument in &self.config.instruments {
            let mut connections = Vec::new();
            for handle in all.iter().filter(|h| h.instrument_name() == instrument.name) {
                connections.push(handle.snapshot().await);
            }
            instruments.push(InstrumentStatus {
                name: instrument.name.clone(),
                port: instrument.port,
                connection_count: connections.len(),
                connections,
            });
        }

        ServerStatus {
            running: self.is_running(),
            instruments,
        }
    }
}
