use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level service configuration, loaded from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub instruments: Vec<InstrumentConfig>,
    pub messaging: MessagingConfig,
    pub database: DatabaseConfig,
}

/// One analyzer endpoint hosted by the service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstrumentConfig {
    /// Logical identifier; keys the registry and the queue names
    pub name: String,
    /// TCP listen port
    pub port: u16,
    /// Record codec variant key, resolved through the driver registry
    pub driver_class_name: String,
    /// Per-instrument concurrent connection cap
    pub max_connections: usize,
    /// Accept-side socket timeout
    pub connection_timeout_seconds: u64,
    /// 0 disables the keep-alive; valid range otherwise is 1..=1440
    pub keep_alive_interval_minutes: u32,
    /// Explicit broker destinations; generated from the messaging section
    /// when unset
    pub order_queue_name: Option<String>,
    pub result_queue_name: Option<String>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            port: 0,
            driver_class_name: "lis2a".to_string(),
            max_connections: 5,
            connection_timeout_seconds: 30,
            keep_alive_interval_minutes: 0,
            order_queue_name: None,
            result_queue_name: None,
        }
    }
}

impl InstrumentConfig {
    /// Broker queue carrying orders for this instrument
    pub fn order_queue(&self, messaging: &MessagingConfig) -> String {
        self.order_queue_name
            .clone()
            .unwrap_or_else(|| format!("{}{}", messaging.order_queue_prefix, self.name))
    }

    /// Broker queue receiving this instrument's results
    pub fn result_queue(&self, messaging: &MessagingConfig) -> String {
        self.result_queue_name
            .clone()
            .unwrap_or_else(|| messaging.result_queue_name.clone())
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        if self.keep_alive_interval_minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(
                u64::from(self.keep_alive_interval_minutes) * 60,
            ))
        }
    }
}

/// Broker connectivity and retry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagingConfig {
    /// When false the broker is stubbed and publishes succeed immediately
    pub enabled: bool,
    pub order_queue_prefix: String,
    pub result_queue_name: String,
    pub retry: RetryConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            order_queue_prefix: "lis.orders.".to_string(),
            result_queue_name: "lis.results".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

/// Outbound-order retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub collision_delay_minutes: i64,
    pub connection_delay_minutes: i64,
    pub schedule_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_attempts: 5,
            collision_delay_minutes: 30,
            connection_delay_minutes: 5,
            schedule_interval_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms.max(1))
    }

    pub fn collision_delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.collision_delay_minutes)
    }

    pub fn connection_delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.connection_delay_minutes)
    }
}

/// Message store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    /// sqlx URL; unset keeps everything in memory
    pub url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: None }
    }
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instruments.is_empty() {
            return Err(anyhow!("At least one instrument must be configured"));
        }

        let mut names = std::collections::HashSet::new();
        let mut ports = std::collections::HashSet::new();

        for instrument in &self.instruments {
            if instrument.name.is_empty() {
                return Err(anyhow!("Instrument name must not be empty"));
            }
            if !names.insert(&instrument.name) {
                return Err(anyhow!("Duplicate instrument name: {}", instrument.name));
            }
            if instrument.port == 0 {
                return Err(anyhow!(
                    "Instrument {} has no listen port",
                    instrument.name
                ));
            }
            if !ports.insert(instrument.port) {
                return Err(anyhow!(
                    "Port {} is assigned to more than one instrument",
                    instrument.port
                ));
            }
            if instrument.keep_alive_interval_minutes > 1440 {
                return Err(anyhow!(
                    "Instrument {}: keepAliveIntervalMinutes must be 0..=1440",
                    instrument.name
                ));
            }
            if instrument.max_connections == 0 {
                return Err(anyhow!(
                    "Instrument {}: maxConnections must be at least 1",
                    instrument.name
                ));
            }
        }

        Ok(())
    }
}
