use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::astm::MessageType;

/// Lifecycle of an inbound audit row.
///
/// `Received` on complete receipt, `Processed` once parsed, `Published`
/// after broker acknowledgment. Transient broker failures park the row in
/// `PublishRetry` for the background republisher; `Error` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessageStatus {
    Received,
    Processed,
    Published,
    PublishRetry,
    Error,
}

impl ServerMessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMessageStatus::Received => "RECEIVED",
            ServerMessageStatus::Processed => "PROCESSED",
            ServerMessageStatus::Published => "PUBLISHED",
            ServerMessageStatus::PublishRetry => "PUBLISH_RETRY",
            ServerMessageStatus::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RECEIVED" => Some(ServerMessageStatus::Received),
            "PROCESSED" => Some(ServerMessageStatus::Processed),
            "PUBLISHED" => Some(ServerMessageStatus::Published),
            "PUBLISH_RETRY" => Some(ServerMessageStatus::PublishRetry),
            "ERROR" => Some(ServerMessageStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerMessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit record for one complete inbound transmission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub id: i64,
    pub message_id: Uuid,
    pub instrument_name: String,
    pub remote_address: String,
    pub raw_message: String,
    pub message_type: MessageType,
    pub status: ServerMessageStatus,
    pub received_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl ServerMessage {
    /// New audit row in RECEIVED, before the id is assigned by the store
    pub fn received(
        instrument_name: &str,
        remote_address: &str,
        raw_message: String,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: 0,
            message_id: Uuid::new_v4(),
            instrument_name: instrument_name.to_string(),
            remote_address: remote_address.to_string(),
            raw_message,
            message_type,
            status: ServerMessageStatus::Received,
            received_at: Utc::now(),
            last_error: None,
        }
    }
}

/// Lifecycle of an outbound order work item.
///
/// `Pending` rows are eligible for the dispatcher once `next_retry_at` has
/// passed; the atomic claim moves them to `Processing`. `Success` means the
/// order was accepted onto a controller's send queue; `Failed` is terminal
/// once the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderMessageStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl OrderMessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderMessageStatus::Pending => "PENDING",
            OrderMessageStatus::Processing => "PROCESSING",
            OrderMessageStatus::Success => "SUCCESS",
            OrderMessageStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderMessageStatus::Pending),
            "PROCESSING" => Some(OrderMessageStatus::Processing),
            "SUCCESS" => Some(OrderMessageStatus::Success),
            "FAILED" => Some(OrderMessageStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderMessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable work item for one outbound order download
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMessage {
    pub id: i64,
    pub message_id: Uuid,
    pub instrument_name: String,
    pub message_content: String,
    pub status: OrderMessageStatus,
    pub retry_count: u32,
    pub max_retry_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl OrderMessage {
    /// New PENDING work item, before the id is assigned by the store
    pub fn pending(
        instrument_name: &str,
        message_content: String,
        max_retry_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            message_id: Uuid::new_v4(),
            instrument_name: instrument_name.to_string(),
            message_content,
            status: OrderMessageStatus::Pending,
            retry_count: 0,
            max_retry_attempts,
            created_at: now,
            updated_at: now,
            last_retry_at: None,
            next_retry_at: None,
            error_message: None,
        }
    }

    /// Whether another delivery attempt is allowed
    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retry_attempts
    }
}
