use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::broker::{Delivery, MessageBroker};
use crate::config::Config;
use crate::driver::DriverRegistry;
use crate::model::{OrderMessage, ServerMessageStatus};
use crate::protocol::astm::AstmMessage;
use crate::storage::{OrderMessageRepository, ServerMessageRepository};

use super::connection::publish_headers;
use super::registry::ControllerRegistry;

/// What happened to one order dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Accepted onto a controller's send queue; order marked SUCCESS
    Dispatched,
    /// Transient obstacle; order back to PENDING with a retry time
    Rescheduled,
    /// Retry budget spent or the payload is unusable; order FAILED
    FailedPermanently,
    /// The order was not PENDING (missing, or another processor owns it)
    NotClaimed,
}

/// Bridges the order broker and the connection controllers.
///
/// Every incoming order is persisted PENDING before anything else; that row
/// is the durability boundary. Dispatch attempts run under the repository's
/// atomic PENDING to PROCESSING claim, and transient obstacles (instrument
/// offline, link busy) reschedule rather than fail.
pub struct OutboundDispatcher {
    config: Arc<Config>,
    drivers: Arc<DriverRegistry>,
    orders: Arc<dyn OrderMessageRepository>,
    server_messages: Arc<dyn ServerMessageRepository>,
    broker: Arc<dyn MessageBroker>,
    registry: Arc<ControllerRegistry>,
    is_running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OutboundDispatcher {
    pub fn new(
        config: Arc<Config>,
        drivers: Arc<DriverRegistry>,
        orders: Arc<dyn OrderMessageRepository>,
        server_messages: Arc<dyn ServerMessageRepository>,
        broker: Arc<dyn MessageBroker>,
        registry: Arc<ControllerRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            drivers,
            orders,
            server_messages,
            broker,
            registry,
            is_running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to every instrument's order queue and start the periodic
    /// retry and publish-retry scans
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = self.tasks.lock().await;

        for instrument in &self.config.instruments {
            let queue = instrument.order_queue(&self.config.messaging);
            let receiver = self
                .broker
                .subscribe(&queue)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to subscribe to {}: {}", queue, e))?;

            info!(
                "[{}] Subscribed to order queue {}",
                instrument.name, queue
            );

            let dispatcher = Arc::clone(self);
            let instrument_name = instrument.name.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher.intake_loop(instrument_name, receiver).await;
            }));
        }

        let dispatcher = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            dispatcher.retry_scan_loop().await;
        }));

        let dispatcher = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            dispatcher.publish_retry_loop().await;
        }));

        Ok(())
    }

    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Outbound dispatcher stopped");
    }

    async fn intake_loop(
        self: Arc<Self>,
        instrument_name: String,
        mut receiver: tokio::sync::mpsc::Receiver<Delivery>,
    ) {
        while let Some(delivery) = receiver.recv().await {
            if !self.is_running.load(Ordering::SeqCst) {
                break;
            }
            self.handle_order_delivery(&instrument_name, delivery).await;
        }
        debug!("[{}] Order intake loop ended", instrument_name);
    }

    /// Persist an incoming order, acknowledge it to the broker, then try an
    /// immediate dispatch
    pub async fn handle_order_delivery(&self, instrument_name: &str, delivery: Delivery) {
        let order = OrderMessage::pending(
            instrument_name,
            delivery.body.clone(),
            self.config.messaging.retry.max_attempts,
        );

        let id = match self.orders.create(&order).await {
            Ok(id) => id,
            Err(e) => {
                // Not acknowledged: the broker will redeliver
                error!(
                    "[{}] Failed to persist incoming order, leaving unacked: {}",
                    instrument_name, e
                );
                return;
            }
        };

        info!(
            "[{}] Order {} persisted as work item {}",
            instrument_name, order.message_id, id
        );
        delivery.ack();

        self.process_order(id).await;
    }

    /// One dispatch attempt for a persisted order
    pub async fn process_order(&self, id: i64) -> DispatchOutcome {
        let order = match self.orders.find_by_id(id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!("Order {} no longer exists", id);
                return DispatchOutcome::NotClaimed;
            }
            Err(e) => {
                error!("Failed to load order {}: {}", id, e);
                return DispatchOutcome::NotClaimed;
            }
        };

        if !order.retries_remaining() {
            warn!(
                "[{}] Order {} exceeded {} attempts, failing permanently",
                order.instrument_name, id, order.max_retry_attempts
            );
            if let Err(e) = self
                .orders
                .mark_failed(id, "retry budget exhausted")
                .await
            {
                error!("Failed to mark order {} failed: {}", id, e);
            }
            return DispatchOutcome::FailedPermanently;
        }

        match self.orders.claim_for_processing(id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "[{}] Order {} already claimed elsewhere",
                    order.instrument_name, id
                );
                return DispatchOutcome::NotClaimed;
            }
            Err(e) => {
                error!("Failed to claim order {}: {}", id, e);
                return DispatchOutcome::NotClaimed;
            }
        }

        self.dispatch_claimed(&order).await
    }

    async fn dispatch_claimed(&self, order: &OrderMessage) -> DispatchOutcome {
        let retry = &self.config.messaging.retry;

        let controller = match self.registry.get(&order.instrument_name).await {
            Some(controller) if controller.is_connected() => controller,
            _ => {
                info!(
                    "[{}] No live connection for order {}, retrying in {} min",
                    order.instrument_name, order.id, retry.connection_delay_minutes
                );
                self.reschedule(order.id, retry.connection_delay(), "instrument not connected")
                    .await;
                return DispatchOutcome::Rescheduled;
            }
        };

        if controller.is_busy().await {
            info!(
                "[{}] Link busy for order {}, retrying in {} min",
                order.instrument_name, order.id, retry.collision_delay_minutes
            );
            self.reschedule(order.id, retry.collision_delay(), "link busy")
                .await;
            return DispatchOutcome::Rescheduled;
        }

        let message: AstmMessage = match serde_json::from_str(&order.message_content) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "[{}] Order {} payload is not a valid message: {}",
                    order.instrument_name, order.id, e
                );
                if let Err(e) = self
                    .orders
                    .mark_failed(order.id, &format!("unusable payload: {}", e))
                    .await
                {
                    error!("Failed to mark order {} failed: {}", order.id, e);
                }
                return DispatchOutcome::FailedPermanently;
            }
        };

        let token = controller.queue_outbound(&message).await;
        if let Err(e) = self.orders.mark_success(order.id).await {
            error!("Failed to mark order {} successful: {}", order.id, e);
        }
        info!(
            "[{}] Order {} handed to controller {}",
            order.instrument_name,
            order.id,
            controller.controller_id()
        );

        // Log how the transmission ends; the durable status was settled at
        // acceptance time.
        let instrument_name = order.instrument_name.clone();
        let order_id = order.id;
        tokio::spawn(async move {
            let status = token.completion().await;
            debug!(
                "[{}] Order {} transmission finished: {:?}",
                instrument_name, order_id, status
            );
        });

        DispatchOutcome::Dispatched
    }

    async fn reschedule(&self, id: i64, delay: chrono::Duration, reason: &str) {
        if let Err(e) = self
            .orders
            .reschedule(id, Utc::now() + delay, reason)
            .await
        {
            error!("Failed to reschedule order {}: {}", id, e);
        }
    }

    async fn retry_scan_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.messaging.retry.schedule_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.is_running.load(Ordering::SeqCst) {
                break;
            }
            self.run_retry_scan().await;
        }
    }

    /// One pass over due PENDING orders
    pub async fn run_retry_scan(&self) {
        let batch = self.config.messaging.retry.batch_size;
        let due = match self.orders.find_due(Utc::now(), batch).await {
            Ok(due) => due,
            Err(e) => {
                error!("Retry scan failed to load due orders: {}", e);
                return;
            }
        };

        if due.is_empty() {
            return;
        }

        debug!("Retry scan picked up {} due order(s)", due.len());
        for order in due {
            self.process_order(order.id).await;
        }
    }

    async fn publish_retry_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.messaging.retry.schedule_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Attempt counts are kept here rather than on the audit row; a
        // restart starts the budget over.
        let mut attempts: HashMap<i64, u32> = HashMap::new();

        loop {
            ticker.tick().await;
            if !self.is_running.load(Ordering::SeqCst) {
                break;
            }
            self.run_publish_retry_scan(&mut attempts).await;
        }
    }

    /// One pass over audit rows parked in PUBLISH_RETRY
    pub async fn run_publish_retry_scan(&self, attempts: &mut HashMap<i64, u32>) {
        let batch = self.config.messaging.retry.batch_size;
        let rows = match self
            .server_messages
            .find_by_status(ServerMessageStatus::PublishRetry, batch)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!("Publish retry scan failed: {}", e);
                return;
            }
        };

        for row in rows {
            let attempt = attempts.entry(row.id).or_insert(0);
            *attempt += 1;

            if *attempt > self.config.messaging.retry.max_attempts {
                warn!(
                    "[{}] Giving up republishing audit row {} after {} attempts",
                    row.instrument_name, row.id, *attempt - 1
                );
                self.update_server_message(
                    row.id,
                    ServerMessageStatus::Error,
                    Some("publish retry budget exhausted"),
                )
                .await;
                attempts.remove(&row.id);
                continue;
            }

            let Some(instrument) = self
                .config
                .instruments
                .iter()
                .find(|i| i.name == row.instrument_name)
            else {
                self.update_server_message(
                    row.id,
                    ServerMessageStatus::Error,
                    Some("instrument no longer configured"),
                )
                .await;
                attempts.remove(&row.id);
                continue;
            };

            let driver = self.drivers.resolve(&instrument.driver_class_name);
            let message = match driver.parse(row.raw_message.as_bytes(), &row.instrument_name)
            {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        "[{}] Audit row {} cannot be reconstructed: {}",
                        row.instrument_name, row.id, e
                    );
                    self.update_server_message(
                        row.id,
                        ServerMessageStatus::Error,
                        Some(&format!("cannot reconstruct message: {}", e)),
                    )
                    .await;
                    attempts.remove(&row.id);
                    continue;
                }
            };

            let body = match serde_json::to_string(&message) {
                Ok(body) => body,
                Err(e) => {
                    self.update_server_message(
                        row.id,
                        ServerMessageStatus::Error,
                        Some(&e.to_string()),
                    )
                    .await;
                    attempts.remove(&row.id);
                    continue;
                }
            };

            let queue = instrument.result_queue(&self.config.messaging);
            match self
                .broker
                .publish(&queue, &body, &publish_headers(&message))
                .await
            {
                Ok(()) => {
                    info!(
                        "[{}] Republished audit row {} to {}",
                        row.instrument_name, row.id, queue
                    );
                    self.update_server_message(row.id, ServerMessageStatus::Published, None)
                        .await;
                    attempts.remove(&row.id);
                }
                Err(e) if e.is_transient() => {
                    debug!(
                        "[{}] Broker still unavailable for audit row {}: {}",
                        row.instrument_name, row.id, e
                    );
                    self.update_server_message(
                        row.id,
                        ServerMessageStatus::PublishRetry,
                        Some(&e.to_string()),
                    )
                    .await;
                }
                Err(e) => {
                    self.update_server_message(
                        row.id,
                        ServerMessageStatus::Error,
                        Some(&e.to_string()),
                    )
                    .await;
                    attempts.remove(&row.id);
                }
            }
        }
    }

    async fn update_server_message(
        &self,
        id: i64,
        status: ServerMessageStatus,
        last_error: Option<&str>,
    ) {
        if let Err(e) = self
            .server_messages
            .update_status(id, status, last_error)
            .await
        {
            error!("Failed to update audit row {} to {}: {}", id, status, e);
        }
    }
}
