use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::model::{
    OrderMessage, OrderMessageStatus, ServerMessage, ServerMessageStatus,
};
use crate::protocol::astm::MessageType;

use super::{OrderMessageRepository, Result, ServerMessageRepository, StorageError};

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS server_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id TEXT NOT NULL,
        instrument_name TEXT NOT NULL,
        remote_address TEXT NOT NULL,
        raw_message TEXT NOT NULL,
        message_type TEXT NOT NULL,
        status TEXT NOT NULL,
        received_at TEXT NOT NULL,
        last_error TEXT
    )",
    "CREATE TABLE IF NOT EXISTS order_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id TEXT NOT NULL,
        instrument_name TEXT NOT NULL,
        message_content TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retry_attempts INTEGER NOT NULL DEFAULT 5,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_retry_at TEXT,
        next_retry_at TEXT,
        error_message TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_server_messages_status
        ON server_messages (status, received_at)",
    "CREATE INDEX IF NOT EXISTS idx_server_messages_instrument_status
        ON server_messages (instrument_name, status)",
    "CREATE INDEX IF NOT EXISTS idx_order_messages_status_retry
        ON order_messages (status, next_retry_at)",
    "CREATE INDEX IF NOT EXISTS idx_order_messages_instrument_status
        ON order_messages (instrument_name, status)",
];

/// SQLite-backed message stores
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Connect to the database at the given sqlx URL and apply the schema.
    /// A missing database file is created.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let repository = Self { pool };
        repository.migrate().await?;
        Ok(repository)
    }

    /// Private in-memory database, used by tests and broker-less setups
    pub async fn in_memory() -> Result<Self> {
        // One connection only: every pooled connection would otherwise get
        // its own empty in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let repository = Self { pool };
        repository.migrate().await?;
        Ok(repository)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StorageError::Internal(format!("Bad stored timestamp: {}", e)))
    }

    fn parse_opt_datetime(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
        value.as_deref().map(Self::parse_datetime).transpose()
    }

    fn row_to_server_message(row: &sqlx::sqlite::SqliteRow) -> Result<ServerMessage> {
        let message_id: String = row.get("message_id");
        let message_type: String = row.get("message_type");
        let status: String = row.get("status");
        let received_at: String = row.get("received_at");

        Ok(ServerMessage {
            id: row.get("id"),
            message_id: Uuid::parse_str(&message_id)
                .map_err(|e| StorageError::Internal(format!("Bad stored uuid: {}", e)))?,
            instrument_name: row.get("instrument_name"),
            remote_address: row.get("remote_address"),
            raw_message: row.get("raw_message"),
            message_type: message_type
                .parse::<MessageType>()
                .unwrap_or(MessageType::Message),
            status: ServerMessageStatus::from_str(&status).ok_or_else(|| {
                StorageError::Internal(format!("Unknown server message status: {}", status))
            })?,
            received_at: Self::parse_datetime(&received_at)?,
            last_error: row.get("last_error"),
        })
    }

    fn row_to_order_message(row: &sqlx::sqlite::SqliteRow) -> Result<OrderMessage> {
        let message_id: String = row.get("message_id");
        let status: String = row.get("status");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        let last_retry_at: Option<String> = row.get("last_retry_at");
        let next_retry_at: Option<String> = row.get("next_retry_at");
        let retry_count: i64 = row.get("retry_count");
        let max_retry_attempts: i64 = row.get("max_retry_attempts");

        Ok(OrderMessage {
            id: row.get("id"),
            message_id: Uuid::parse_str(&message_id)
                .map_err(|e| StorageError::Internal(format!("Bad stored uuid: {}", e)))?,
            instrument_name: row.get("instrument_name"),
            message_content: row.get("message_content"),
            status: OrderMessageStatus::from_str(&status).ok_or_else(|| {
                StorageError::Internal(format!("Unknown order message status: {}", status))
            })?,
            retry_count: retry_count.max(0) as u32,
            max_retry_attempts: max_retry_attempts.max(0) as u32,
            created_at: Self::parse_datetime(&created_at)?,
            updated_at: Self::parse_datetime(&updated_at)?,
            last_retry_at: Self::parse_opt_datetime(last_retry_at)?,
            next_retry_at: Self::parse_opt_datetime(next_retry_at)?,
            error_message: row.get("error_message"),
        })
    }
}

#[async_trait]
impl ServerMessageRepository for SqliteRepository {
    async fn create(&self, message: &ServerMessage) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO server_messages (
                message_id, instrument_name, remote_address, raw_message,
                message_type, status, received_at, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.message_id.to_string())
        .bind(&message.instrument_name)
        .bind(&message.remote_address)
        .bind(&message.raw_message)
        .bind(message.message_type.to_string())
        .bind(message.status.as_str())
        .bind(message.received_at.to_rfc3339())
        .bind(&message.last_error)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<ServerMessage>> {
        let row = sqlx::query("SELECT * FROM server_messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::row_to_server_message(&r)).transpose()
    }

    async fn update_status(
        &self,
        id: i64,
        status: ServerMessageStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE server_messages SET status = ?, last_error = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("server message {}", id)));
        }
        Ok(())
    }

    async fn find_by_status(
        &self,
        status: ServerMessageStatus,
        limit: usize,
    ) -> Result<Vec<ServerMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM server_messages WHERE status = ?
             ORDER BY received_at ASC LIMIT ?",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_server_message).collect()
    }
}

#[async_trait]
impl OrderMessageRepository for SqliteRepository {
    async fn create(&self, order: &OrderMessage) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO order_messages (
                message_id, instrument_name, message_content, status,
                retry_count, max_retry_attempts, created_at, updated_at,
                last_retry_at, next_retry_at, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(order.message_id.to_string())
        .bind(&order.instrument_name)
        .bind(&order.message_content)
        .bind(order.status.as_str())
        .bind(order.retry_count as i64)
        .bind(order.max_retry_attempts as i64)
        .bind(order.created_at.to_rfc3339())
        .bind(order.updated_at.to_rfc3339())
        .bind(order.last_retry_at.map(|d| d.to_rfc3339()))
        .bind(order.next_retry_at.map(|d| d.to_rfc3339()))
        .bind(&order.error_message)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<OrderMessage>> {
        let row = sqlx::query("SELECT * FROM order_messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::row_to_order_message(&r)).transpose()
    }

    async fn claim_for_processing(&self, id: i64) -> Result<bool> {
        // The WHERE clause on the current status makes the claim atomic:
        // of two concurrent processors exactly one sees rows_affected = 1.
        let result = sqlx::query(
            "UPDATE order_messages SET status = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(OrderMessageStatus::Processing.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(OrderMessageStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_success(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE order_messages SET status = ?, updated_at = ?, error_message = NULL
             WHERE id = ?",
        )
        .bind(OrderMessageStatus::Success.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("order message {}", id)));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE order_messages SET status = ?, updated_at = ?, error_message = ?
             WHERE id = ?",
        )
        .bind(OrderMessageStatus::Failed.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("order message {}", id)));
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: i64,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE order_messages SET status = ?, retry_count = retry_count + 1,
                updated_at = ?, last_retry_at = ?, next_retry_at = ?, error_message = ?
             WHERE id = ?",
        )
        .bind(OrderMessageStatus::Pending.as_str())
        .bind(&now)
        .bind(&now)
        .bind(next_retry_at.to_rfc3339())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("order message {}", id)));
        }
        Ok(())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM order_messages
             WHERE status = ? AND (next_retry_at IS NULL OR next_retry_at <= ?)
             ORDER BY id ASC LIMIT ?",
        )
        .bind(OrderMessageStatus::Pending.as_str())
        .bind(now.to_rfc3339())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_order_message).collect()
    }

    async fn find_by_instrument(&self, instrument_name: &str) -> Result<Vec<OrderMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM order_messages WHERE instrument_name = ? ORDER BY id DESC",
        )
        .bind(instrument_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_order_message).collect()
    }
}
