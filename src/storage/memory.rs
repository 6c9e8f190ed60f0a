use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::model::{
    OrderMessage, OrderMessageStatus, ServerMessage, ServerMessageStatus,
};

use super::{OrderMessageRepository, Result, ServerMessageRepository, StorageError};

/// In-memory message stores, used by tests and deployments that do not
/// configure a database
pub struct InMemoryRepository {
    next_id: AtomicI64,
    server_messages: RwLock<HashMap<i64, ServerMessage>>,
    order_messages: RwLock<HashMap<i64, OrderMessage>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            server_messages: RwLock::new(HashMap::new()),
            order_messages: RwLock::new(HashMap::new()),
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerMessageRepository for InMemoryRepository {
    async fn create(&self, message: &ServerMessage) -> Result<i64> {
        let id = self.allocate_id();
        let mut stored = message.clone();
        stored.id = id;
        self.server_messages.write().await.insert(id, stored);
        Ok(id)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<ServerMessage>> {
        Ok(self.server_messages.read().await.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: i64,
        status: ServerMessageStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let mut messages = self.server_messages.write().await;
        let message = messages
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("server message {}", id)))?;
        message.status = status;
        message.last_error = last_error.map(|s| s.to_string());
        Ok(())
    }

    async fn find_by_status(
        &self,
        status: ServerMessageStatus,
        limit: usize,
    ) -> Result<Vec<ServerMessage>> {
        let messages = self.server_messages.read().await;
        let mut matching: Vec<ServerMessage> = messages
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|m| m.received_at);
        matching.truncate(limit);
        Ok(matching)
    }
}

#[async_trait]
impl OrderMessageRepository for InMemoryRepository {
    async fn create(&self, order: &OrderMessage) -> Result<i64> {
        let id = self.allocate_id();
        let mut stored = order.clone();
        stored.id = id;
        self.order_messages.write().await.insert(id, stored);
        Ok(id)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<OrderMessage>> {
        Ok(self.order_messages.read().await.get(&id).cloned())
    }

    async fn claim_for_processing(&self, id: i64) -> Result<bool> {
        let mut orders = self.order_messages.write().await;
        match orders.get_mut(&id) {
            Some(order) if order.status == OrderMessageStatus::Pending => {
                order.status = OrderMessageStatus::Processing;
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_success(&self, id: i64) -> Result<()> {
        let mut orders = self.order_messages.write().await;
        let order = orders
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("order message {}", id)))?;
        order.status = OrderMessageStatus::Success;
        order.updated_at = Utc::now();
        order.error_message = None;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let mut orders = self.order_messages.write().await;
        let order = orders
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("order message {}", id)))?;
        order.status = OrderMessageStatus::Failed;
        order.updated_at = Utc::now();
        order.error_message = Some(error.to_string());
        Ok(())
    }

    async fn reschedule(
        &self,
        id: i64,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let mut orders = self.order_messages.write().await;
        let order = orders
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("order message {}", id)))?;
        let now = Utc::now();
        order.status = OrderMessageStatus::Pending;
        order.retry_count += 1;
        order.updated_at = now;
        order.last_retry_at = Some(now);
        order.next_retry_at = Some(next_retry_at);
        order.error_message = Some(error.to_string());
        Ok(())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderMessage>> {
        let orders = self.order_messages.read().await;
        let mut due: Vec<OrderMessage> = orders
            .values()
            .filter(|o| {
                o.status == OrderMessageStatus::Pending
                    && o.next_retry_at.map(|t| t <= now).unwrap_or(true)
            })
            .cloned()
            .collect();
        due.sort_by_key(|o| o.id);
        due.truncate(limit);
        Ok(due)
    }

    async fn find_by_instrument(&self, instrument_name: &str) -> Result<Vec<OrderMessage>> {
        let orders = self.order_messages.read().await;
        let mut matching: Vec<OrderMessage> = orders
            .values()
            .filter(|o| o.instrument_name == instrument_name)
            .cloned()
            .collect();
        matching.sort_by_key(|o| std::cmp::Reverse(o.id));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::astm::MessageType;
    use chrono::Duration;

    #[tokio::test]
    async fn test_claim_only_succeeds_once() {
        let repo = InMemoryRepository::new();
        let order = OrderMessage::pending("vision-1", "{}".to_string(), 5);
        let id = OrderMessageRepository::create(&repo, &order).await.unwrap();

        assert!(repo.claim_for_processing(id).await.unwrap());
        assert!(!repo.claim_for_processing(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_due_scan_respects_retry_time() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        let order = OrderMessage::pending("vision-1", "{}".to_string(), 5);
        let id = OrderMessageRepository::create(&repo, &order).await.unwrap();

        assert!(repo.claim_for_processing(id).await.unwrap());
        repo.reschedule(id, now + Duration::minutes(30), "collision")
            .await
            .unwrap();

        assert!(repo.find_due(now, 20).await.unwrap().is_empty());
        assert_eq!(
            repo.find_due(now + Duration::minutes(31), 20)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_server_message_status_updates() {
        let repo = InMemoryRepository::new();
        let message = ServerMessage::received(
            "vision-1",
            "127.0.0.1:9",
            "raw".to_string(),
            MessageType::Message,
        );
        let id = ServerMessageRepository::create(&repo, &message).await.unwrap();

        repo.update_status(id, ServerMessageStatus::Error, Some("parse failed"))
            .await
            .unwrap();
        let stored = ServerMessageRepository::find_by_id(&repo, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ServerMessageStatus::Error);
        assert_eq!(stored.last_error.as_deref(), Some("parse failed"));
    }
}
