//! Bidirectional interface service between laboratory analyzers and a LIS.
//!
//! Analyzers connect over TCP speaking ASTM E1381 framing with ASTM E1394 /
//! LIS2-A record payloads. Inbound transmissions (results, queries,
//! keep-alives) are audited, parsed and published towards the LIS; order
//! downloads travel the other way through a durable work queue with
//! busy/collision-aware retries.

pub mod broker;
pub mod config;
pub mod driver;
pub mod model;
pub mod protocol;
pub mod service;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use broker::{InMemoryBroker, MessageBroker, NoopBroker};
use config::Config;
use driver::DriverRegistry;
use service::{AstmServer, OutboundDispatcher};
use storage::{
    InMemoryRepository, OrderMessageRepository, ServerMessageRepository, SqliteRepository,
};

/// A fully wired service instance: TCP listeners plus the outbound
/// dispatcher, sharing one registry
pub struct Application {
    pub server: Arc<AstmServer>,
    pub dispatcher: Arc<OutboundDispatcher>,
}

impl Application {
    /// Compose repositories, broker and driver registry from configuration
    pub async fn build(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let (server_messages, orders): (
            Arc<dyn ServerMessageRepository>,
            Arc<dyn OrderMessageRepository>,
        ) = match &config.database.url {
            Some(url) => {
                let repository = Arc::new(SqliteRepository::connect(url).await?);
                (repository.clone(), repository)
            }
            None => {
                let repository = Arc::new(InMemoryRepository::new());
                (repository.clone(), repository)
            }
        };

        let broker: Arc<dyn MessageBroker> = if config.messaging.enabled {
            Arc::new(InMemoryBroker::new())
        } else {
            Arc::new(NoopBroker::new())
        };

        Self::build_with(config, server_messages, orders, broker)
    }

    /// Compose with externally supplied collaborators (a real broker
    /// binding, shared repositories)
    pub fn build_with(
        config: Arc<Config>,
        server_messages: Arc<dyn ServerMessageRepository>,
        orders: Arc<dyn OrderMessageRepository>,
        broker: Arc<dyn MessageBroker>,
    ) -> Result<Self> {
        let drivers = Arc::new(DriverRegistry::with_defaults());

        let server = Arc::new(AstmServer::new(
            Arc::clone(&config),
            Arc::clone(&drivers),
            Arc::clone(&server_messages),
            Arc::clone(&broker),
        ));

        let dispatcher = OutboundDispatcher::new(
            config,
            drivers,
            orders,
            server_messages,
            broker,
            server.registry(),
        );

        Ok(Self { server, dispatcher })
    }

    /// Start listeners and the dispatcher
    pub async fn start(&self) -> Result<()> {
        self.server.start().await?;
        self.dispatcher.start().await?;
        Ok(())
    }

    /// Graceful shutdown: stop intake first, then the connections
    pub async fn stop(&self) {
        self.dispatcher.stop().await;
        self.server.stop().await;
    }
}
