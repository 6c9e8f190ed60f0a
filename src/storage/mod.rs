use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{OrderMessage, ServerMessage, ServerMessageStatus};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Store for inbound audit rows
#[async_trait]
pub trait ServerMessageRepository: Send + Sync {
    /// Insert the row and return its id
    async fn create(&self, message: &ServerMessage) -> Result<i64>;

    async fn find_by_id(&self, id: i64) -> Result<Option<ServerMessage>>;

    /// Move the row to a new status, replacing the stored error text
    async fn update_status(
        &self,
        id: i64,
        status: ServerMessageStatus,
        last_error: Option<&str>,
    ) -> Result<()>;

    /// Rows in the given status, oldest first, up to `limit`
    async fn find_by_status(
        &self,
        status: ServerMessageStatus,
        limit: usize,
    ) -> Result<Vec<ServerMessage>>;
}

/// Store for outbound order work items
#[async_trait]
pub trait OrderMessageRepository: Send + Sync {
    /// Insert the work item and return its id
    async fn create(&self, order: &OrderMessage) -> Result<i64>;

    async fn find_by_id(&self, id: i64) -> Result<Option<OrderMessage>>;

    /// Atomically transition PENDING → PROCESSING.
    ///
    /// Returns false when the row is not currently PENDING, which is how
    /// concurrent retry processors are kept off the same order.
    async fn claim_for_processing(&self, id: i64) -> Result<bool>;

    /// Terminal success: the order was accepted by a controller
    async fn mark_success(&self, id: i64) -> Result<()>;

    /// Terminal failure once the retry budget is exhausted
    async fn mark_failed(&self, id: i64, error: &str) -> Result<()>;

    /// Back to PENDING with a bumped retry count and a future retry time
    async fn reschedule(
        &self,
        id: i64,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;

    /// PENDING rows whose `next_retry_at` is unset or has passed, oldest
    /// first, up to `limit`
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderMessage>>;

    /// Orders for one instrument in any status, newest first
    async fn find_by_instrument(&self, instrument_name: &str) -> Result<Vec<OrderMessage>>;
}
