use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::time::timeout;

use crate::broker::MessageBroker;
use crate::driver::RecordDriver;
use crate::model::{ServerMessage, ServerMessageStatus};
use crate::protocol::astm::constants::{ENQ, SOCKET_READ_TIMEOUT_MS};
use crate::protocol::astm::{
    AstmLink, AstmMessage, LinkState, LinkTimeouts, MessageType, SendOutcome,
};
use crate::protocol::ProtocolError;
use crate::storage::ServerMessageRepository;

use super::keepalive::{KeepAliveState, KeepAliveStats};
use super::registry::ControllerRegistry;

static NEXT_CONTROLLER_ID: AtomicU64 = AtomicU64::new(1);

/// Final status of one accepted outbound transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Failed(String),
    Abandoned,
}

/// Handle returned by `queue_outbound`; resolves once the transmission
/// leaves the controller for good
#[derive(Debug)]
pub struct AcceptedToken {
    rx: oneshot::Receiver<SendStatus>,
}

impl AcceptedToken {
    pub async fn completion(self) -> SendStatus {
        self.rx.await.unwrap_or(SendStatus::Abandoned)
    }
}

struct OutboundRequest {
    content: Vec<u8>,
    done: Option<oneshot::Sender<SendStatus>>,
    keep_alive: bool,
}

impl OutboundRequest {
    fn finish(mut self, status: SendStatus) {
        if let Some(done) = self.done.take() {
            let _ = done.send(status);
        }
    }
}

/// Everything a controller needs besides its socket
pub struct ControllerContext {
    pub instrument_name: String,
    pub remote_address: String,
    pub driver: Arc<dyn RecordDriver>,
    pub server_messages: Arc<dyn ServerMessageRepository>,
    pub broker: Arc<dyn MessageBroker>,
    pub result_queue: String,
    pub keep_alive_interval: Option<Duration>,
    pub link_timeouts: LinkTimeouts,
}

struct ControllerShared {
    connected: AtomicBool,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    link_state: RwLock<LinkState>,
    keep_alive: RwLock<KeepAliveState>,
    connected_at: DateTime<Utc>,
}

impl ControllerShared {
    async fn set_link_state(&self, state: LinkState) {
        *self.link_state.write().await = state;
    }
}

/// Read-only view of one live connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub instrument_name: String,
    pub remote_address: String,
    pub connected_at: DateTime<Utc>,
    pub link_state: LinkState,
    pub busy: bool,
    pub keep_alive: KeepAliveStats,
}

/// Cloneable handle to a running connection controller.
///
/// The controller task is the sole owner of the socket; the handle talks to
/// it exclusively through its mailbox and shared snapshots.
#[derive(Clone)]
pub struct ControllerHandle {
    controller_id: u64,
    instrument_name: String,
    remote_address: String,
    mailbox: mpsc::Sender<OutboundRequest>,
    driver: Arc<dyn RecordDriver>,
    shared: Arc<ControllerShared>,
}

impl ControllerHandle {
    pub fn controller_id(&self) -> u64 {
        self.controller_id
    }

    pub fn instrument_name(&self) -> &str {
        &self.instrument_name
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Whether the controller task is still servicing its socket
    pub fn is_alive(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.is_alive()
    }

    pub async fn link_state(&self) -> LinkState {
        *self.shared.link_state.read().await
    }

    /// True whenever the link is doing anything other than idling
    pub async fn is_busy(&self) -> bool {
        self.link_state().await != LinkState::Idle
    }

    pub async fn keep_alive_stats(&self) -> KeepAliveStats {
        self.shared.keep_alive.read().await.stats()
    }

    /// Queue a message for transmission. Delivery is FIFO per controller;
    /// the returned token resolves to the final send status. A dead
    /// controller resolves the token to `Abandoned`.
    pub async fn queue_outbound(&self, message: &AstmMessage) -> AcceptedToken {
        let content = self.driver.build(message);
        let (tx, rx) = oneshot::channel();
        let request = OutboundRequest {
            content,
            done: Some(tx),
            keep_alive: false,
        };

        if let Err(e) = self.mailbox.send(request).await {
            // Dropping the request drops its sender, resolving the token
            debug!(
                "[{}] Mailbox closed, outbound abandoned: {}",
                self.instrument_name, e
            );
        }

        AcceptedToken { rx }
    }

    /// Request a cooperative shutdown; observed by the event loop between
    /// socket reads
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.shutdown_notify.notify_waiters();
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        let link_state = self.link_state().await;
        ConnectionSnapshot {
            instrument_name: self.instrument_name.clone(),
            remote_address: self.remote_address.clone(),
            connected_at: self.shared.connected_at,
            link_state,
            busy: link_state != LinkState::Idle,
            keep_alive: self.keep_alive_stats().await,
        }
    }
}

enum SendLoopAction {
    Continue,
    Fatal(String),
}

/// Per-socket connection controller: owns the link state machine and runs
/// the single event loop that multiplexes socket bytes, the outbound
/// mailbox and the keep-alive timer
pub struct ConnectionController;

impl ConnectionController {
    /// Spawn the controller task for an accepted socket and register its
    /// handle for order routing. The handle is also returned to the caller.
    pub async fn spawn<S>(
        stream: S,
        context: ControllerContext,
        registry: Arc<ControllerRegistry>,
    ) -> ControllerHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let controller_id = NEXT_CONTROLLER_ID.fetch_add(1, Ordering::SeqCst);
        let (mailbox_tx, mailbox_rx) = mpsc::channel(32);

        let shared = Arc::new(ControllerShared {
            connected: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            link_state: RwLock::new(LinkState::Idle),
            keep_alive: RwLock::new(KeepAliveState::new(context.keep_alive_interval)),
            connected_at: Utc::now(),
        });

        let handle = ControllerHandle {
            controller_id,
            instrument_name: context.instrument_name.clone(),
            remote_address: context.remote_address.clone(),
            mailbox: mailbox_tx,
            driver: Arc::clone(&context.driver),
            shared: Arc::clone(&shared),
        };

        registry.insert(handle.clone()).await;

        let link = AstmLink::new(stream, context.remote_address.clone())
            .with_timeouts(context.link_timeouts.clone());

        tokio::spawn(Self::run(
            link,
            context,
            shared,
            registry,
            mailbox_rx,
            controller_id,
        ));

        handle
    }

    async fn run<S>(
        mut link: AstmLink<S>,
        context: ControllerContext,
        shared: Arc<ControllerShared>,
        registry: Arc<ControllerRegistry>,
        mut mailbox: mpsc::Receiver<OutboundRequest>,
        controller_id: u64,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!(
            "[{}] Connection controller {} started for {}",
            context.instrument_name, controller_id, context.remote_address
        );

        let socket_read_timeout = Duration::from_millis(SOCKET_READ_TIMEOUT_MS);
        let keep_alive_enabled = context.keep_alive_interval.is_some();
        let keep_alive_period = context
            .keep_alive_interval
            .unwrap_or(Duration::from_secs(3600));
        let mut keep_alive_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + keep_alive_period,
            keep_alive_period,
        );
        keep_alive_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut pending: VecDeque<OutboundRequest> = VecDeque::new();

        let exit_reason: String = loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                break "shutdown requested".to_string();
            }

            // Outbound work is only started while the link is idle; the
            // queue is serviced ahead of new socket waits so a send queued
            // during a reception goes out as soon as the link frees up.
            if let Some(request) = pending.pop_front() {
                match Self::perform_send(&mut link, request, &context, &shared, &mut pending)
                    .await
                {
                    SendLoopAction::Continue => continue,
                    SendLoopAction::Fatal(reason) => break reason,
                }
            }

            tokio::select! {
                _ = shared.shutdown_notify.notified() => {
                    break "shutdown requested".to_string();
                }

                read = timeout(socket_read_timeout, link.read_byte()) => {
                    match read {
                        Err(_) => {
                            trace!(
                                "[{}] Socket idle past read timeout, still listening",
                                context.instrument_name
                            );
                            continue;
                        }
                        Ok(Err(ProtocolError::ConnectionClosed)) => {
                            break "peer closed the connection".to_string();
                        }
                        Ok(Err(e)) => {
                            error!(
                                "[{}] Socket error: {}",
                                context.instrument_name, e
                            );
                            break format!("socket error: {}", e);
                        }
                        Ok(Ok(byte)) => {
                            if byte == ENQ {
                                shared.set_link_state(LinkState::Receiving).await;
                            }
                            let result = link.handle_inbound(byte).await;
                            shared.set_link_state(link.state()).await;
                            match result {
                                Ok(Some(content)) => {
                                    Self::process_inbound(&context, &shared, &content).await;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(
                                        "[{}] Reception failed: {}",
                                        context.instrument_name, e
                                    );
                                    break format!("reception failed: {}", e);
                                }
                            }
                        }
                    }
                }

                request = mailbox.recv() => {
                    match request {
                        Some(request) => pending.push_back(request),
                        None => break "all handles dropped".to_string(),
                    }
                }

                _ = keep_alive_timer.tick(), if keep_alive_enabled => {
                    debug!(
                        "[{}] Keep-alive tick, queueing transmission",
                        context.instrument_name
                    );
                    let message = AstmMessage::keep_alive(
                        &context.instrument_name,
                        context.driver.sender_id(),
                        Utc::now(),
                    );
                    let content = context.driver.build(&message);
                    shared.keep_alive.write().await.sending();
                    pending.push_back(OutboundRequest {
                        content,
                        done: None,
                        keep_alive: true,
                    });
                }
            }
        };

        info!(
            "[{}] Connection controller {} stopping: {}",
            context.instrument_name, controller_id, exit_reason
        );

        shared.connected.store(false, Ordering::SeqCst);

        // Abandon everything still queued, then whatever is in the mailbox
        for request in pending.drain(..) {
            request.finish(SendStatus::Abandoned);
        }
        mailbox.close();
        while let Ok(request) = mailbox.try_recv() {
            request.finish(SendStatus::Abandoned);
        }

        link.shutdown().await;
        shared.set_link_state(LinkState::Error).await;
        registry.remove(&context.instrument_name, controller_id).await;
    }

    async fn perform_send<S>(
        link: &mut AstmLink<S>,
        request: OutboundRequest,
        context: &ControllerContext,
        shared: &ControllerShared,
        pending: &mut VecDeque<OutboundRequest>,
    ) -> SendLoopAction
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        shared.set_link_state(LinkState::WaitingForAck).await;
        let result = link.send_transmission(&request.content).await;
        shared.set_link_state(link.state()).await;

        match result {
            Ok(SendOutcome::Sent) => {
                if request.keep_alive {
                    shared.keep_alive.write().await.sent(true);
                }
                request.finish(SendStatus::Sent);
                SendLoopAction::Continue
            }
            Ok(SendOutcome::YieldedToInbound(content)) => {
                debug!(
                    "[{}] Outbound lost arbitration, servicing inbound first",
                    context.instrument_name
                );
                Self::process_inbound(context, shared, &content).await;
                // The abandoned attempt goes back to the head of the queue
                pending.push_front(request);
                SendLoopAction::Continue
            }
            Err(e) => {
                let reason = e.to_string();
                if request.keep_alive {
                    shared.keep_alive.write().await.sent(false);
                }
                request.finish(SendStatus::Failed(reason.clone()));
                SendLoopAction::Fatal(format!("send failed: {}", reason))
            }
        }
    }

    /// Persistence and publish pipeline for one complete inbound
    /// transmission. The transmission was already acknowledged at the link
    /// layer; failures here are recorded on the audit row and never reach
    /// the socket.
    async fn process_inbound(
        context: &ControllerContext,
        shared: &ControllerShared,
        content: &[u8],
    ) {
        let raw_message = String::from_utf8_lossy(content).to_string();
        let quick_type = context.driver.quick_classify(content);

        info!(
            "[{}] Received {} transmission ({} bytes) from {}",
            context.instrument_name,
            quick_type,
            content.len(),
            context.remote_address
        );

        let audit = ServerMessage::received(
            &context.instrument_name,
            &context.remote_address,
            raw_message,
            quick_type,
        );
        let audit_id = match context.server_messages.create(&audit).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(
                    "[{}] Failed to persist inbound transmission: {}",
                    context.instrument_name, e
                );
                None
            }
        };

        let message = match context.driver.parse(content, &context.instrument_name) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "[{}] Could not parse inbound transmission: {}",
                    context.instrument_name, e
                );
                Self::update_audit(
                    context,
                    audit_id,
                    ServerMessageStatus::Error,
                    Some(&e.to_string()),
                )
                .await;
                return;
            }
        };

        for warning in &message.parse_warnings {
            warn!("[{}] Parse warning: {}", context.instrument_name, warning);
        }

        Self::update_audit(context, audit_id, ServerMessageStatus::Processed, None).await;

        if message.message_type() == MessageType::KeepAlive {
            debug!(
                "[{}] Keep-alive received, suppressing publication",
                context.instrument_name
            );
            shared.keep_alive.write().await.received();
            return;
        }

        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(e) => {
                error!(
                    "[{}] Could not serialize message for publication: {}",
                    context.instrument_name, e
                );
                Self::update_audit(
                    context,
                    audit_id,
                    ServerMessageStatus::Error,
                    Some(&e.to_string()),
                )
                .await;
                return;
            }
        };

        let headers = publish_headers(&message);

        match context
            .broker
            .publish(&context.result_queue, &body, &headers)
            .await
        {
            Ok(()) => {
                info!(
                    "[{}] Published {} message to {}",
                    context.instrument_name,
                    message.message_type(),
                    context.result_queue
                );
                Self::update_audit(context, audit_id, ServerMessageStatus::Published, None)
                    .await;
            }
            Err(e) if e.is_transient() => {
                warn!(
                    "[{}] Broker unavailable, queueing for publish retry: {}",
                    context.instrument_name, e
                );
                Self::update_audit(
                    context,
                    audit_id,
                    ServerMessageStatus::PublishRetry,
                    Some(&e.to_string()),
                )
                .await;
            }
            Err(e) => {
                error!(
                    "[{}] Publish failed permanently: {}",
                    context.instrument_name, e
                );
                Self::update_audit(
                    context,
                    audit_id,
                    ServerMessageStatus::Error,
                    Some(&e.to_string()),
                )
                .await;
            }
        }
    }

    async fn update_audit(
        context: &ControllerContext,
        audit_id: Option<i64>,
        status: ServerMessageStatus,
        last_error: Option<&str>,
    ) {
        let Some(id) = audit_id else {
            return;
        };
        if let Err(e) = context
            .server_messages
            .update_status(id, status, last_error)
            .await
        {
            error!(
                "[{}] Failed to update audit row {} to {}: {}",
                context.instrument_name, id, status, e
            );
        }
    }
}

/// Headers attached to every inbound publish
pub fn publish_headers(message: &AstmMessage) -> std::collections::HashMap<String, String> {
    std::collections::HashMap::from([
        (
            "instrumentName".to_string(),
            message.instrument_name.clone(),
        ),
        ("messageType".to_string(), message.message_type().to_string()),
        (
            "resultCount".to_string(),
            message.result_count().to_string(),
        ),
        ("orderCount".to_string(), message.order_count().to_string()),
        (
            "timestamp".to_string(),
            crate::protocol::astm::format_datetime(&Utc::now()),
        ),
    ])
}
