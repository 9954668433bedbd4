//! Per-agent message bus
//!
//! Each agent owns one [`MessageBus`]. It subscribes to the task-wide
//! channel, its own direct channel and its role channel, and runs every
//! incoming message through a fixed pipeline:
//!
//! ```text
//! transport ──▶ dedup ──▶ ttl ──▶ pending reply? ──▶ addressed to me? ──▶ queue
//!                                     │                                     │
//!                                     ▼                                     ▼
//!                              resolve request                  priority dispatch
//!                                                               (one at a time)
//! ```
//!
//! Replies never enter the handler queue. Handlers run strictly one after
//! another, so handler code never races with itself inside one agent. The
//! queue is re-sorted by priority before every pop, so a critical message
//! arriving in the middle of a low-priority burst is dispatched next.
//!
//! None of the in-memory structures here (pending requests, the seen-id set,
//! the queue) coordinate across processes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::audit::{AuditEntry, SharedAuditSink};
use super::transport::{
    agent_event, agents_channel, role_event, SharedTransport, TransportError, EVENT_BROADCAST,
};
use super::types::{AgentMessage, AgentRole, HeartbeatPayload, MessagePriority, MessageType};
use crate::config::BusConfig;
use crate::state::AgentActivity;

/// Error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Request {correlation_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("Request {correlation_id} was answered with an error: {message}")]
    RequestFailed {
        correlation_id: String,
        message: String,
    },

    #[error("Message {0} has no reply_to; cannot reply")]
    NoReplyTo(String),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bus shutdown")]
    ShutDown,
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Shared reference to a MessageBus
pub type SharedMessageBus = Arc<MessageBus>;

/// Boxed async message handler
pub type MessageHandler =
    Arc<dyn Fn(AgentMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type HandlerTable = RwLock<HashMap<MessageType, Vec<(u64, MessageHandler)>>>;

/// Handle returned by handler registration
///
/// Dropping the handle leaves the handler registered; call
/// [`Unsubscribe::unsubscribe`] to remove it.
#[must_use = "keep the handle to be able to unsubscribe later"]
pub struct Unsubscribe {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    pub fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

/// Target of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// One specific agent
    Agent { id: String, role: AgentRole },
    /// Whichever agent of the role answers first
    Role(AgentRole),
}

/// What the ingest pipeline did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued,
    Duplicate,
    Expired,
    ReplyResolved,
    NotAddressed,
    OwnMessage,
    ShuttingDown,
}

/// Bounded set of recently seen message ids
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
    retain: usize,
}

impl SeenIds {
    fn new(capacity: usize, retain: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
            retain: retain.min(capacity),
        }
    }

    /// Returns false if the id was already present
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > self.capacity {
            while self.order.len() > self.retain {
                if let Some(oldest) = self.order.pop_front() {
                    self.ids.remove(&oldest);
                }
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

type PendingReply = oneshot::Sender<BusResult<AgentMessage>>;

/// Per-agent pub/sub endpoint
pub struct MessageBus {
    agent_id: String,
    role: AgentRole,
    task_id: String,
    transport: SharedTransport,
    audit: Option<SharedAuditSink>,
    config: BusConfig,
    handlers: Arc<HandlerTable>,
    next_handler_id: AtomicU64,
    queue: Mutex<Vec<AgentMessage>>,
    queue_notify: Notify,
    seen: Mutex<SeenIds>,
    pending: Mutex<HashMap<String, PendingReply>>,
    status: Mutex<AgentActivity>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl MessageBus {
    /// Create a bus for one agent. Nothing is received until [`initialize`].
    ///
    /// [`initialize`]: MessageBus::initialize
    pub fn new(
        agent_id: impl Into<String>,
        role: AgentRole,
        task_id: impl Into<String>,
        transport: SharedTransport,
        config: BusConfig,
    ) -> Self {
        let seen = SeenIds::new(config.dedup_capacity, config.dedup_retain);
        Self {
            agent_id: agent_id.into(),
            role,
            task_id: task_id.into(),
            transport,
            audit: None,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_handler_id: AtomicU64::new(1),
            queue: Mutex::new(Vec::new()),
            queue_notify: Notify::new(),
            seen: Mutex::new(seen),
            pending: Mutex::new(HashMap::new()),
            status: Mutex::new(AgentActivity::Idle),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Attach an audit sink for sent messages
    pub fn with_audit(mut self, audit: SharedAuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Create a shared reference to this bus
    pub fn shared(self) -> SharedMessageBus {
        Arc::new(self)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Status advertised in heartbeats
    pub fn set_status(&self, status: AgentActivity) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn status(&self) -> AgentActivity {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Messages waiting for dispatch
    pub fn queue_depth(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Requests still waiting for a reply
    pub fn pending_request_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Ids currently held by the dedup set
    pub fn seen_count(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Subscribe to the task, agent and role channels, then start the
    /// dispatch loop and the heartbeat emitter. Calling it twice is a no-op.
    pub async fn initialize(self: &Arc<Self>) -> BusResult<()> {
        if self.is_shut_down() {
            return Err(BusError::ShutDown);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channel = agents_channel(&self.task_id);
        let events = [
            EVENT_BROADCAST.to_string(),
            agent_event(&self.agent_id),
            role_event(self.role),
        ];

        let mut handles = Vec::with_capacity(events.len() + 2);
        for event in &events {
            let receiver = match self.transport.subscribe(&channel, event).await {
                Ok(receiver) => receiver,
                Err(e) => {
                    // Leave the bus re-initializable after a failed subscribe
                    self.shutdown_tasks(std::mem::take(&mut handles)).await;
                    self.initialized.store(false, Ordering::SeqCst);
                    return Err(e.into());
                }
            };
            handles.push(self.spawn_receiver(receiver, event.clone()));
        }

        handles.push(self.spawn_dispatcher());
        if let Some(interval) = self.config.heartbeat_interval() {
            handles.push(self.spawn_heartbeat(interval));
        }

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);

        info!(
            agent_id = %self.agent_id,
            role = %self.role,
            task_id = %self.task_id,
            "Message bus initialized"
        );
        Ok(())
    }

    /// Stop the heartbeat, reject every pending request and drop the
    /// transport subscriptions.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let pending: Vec<(String, PendingReply)> = self
            .pending
            .lock()
            .map(|mut p| p.drain().collect())
            .unwrap_or_default();
        let rejected = pending.len();
        for (_, reply) in pending {
            let _ = reply.send(Err(BusError::ShutDown));
        }

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        self.shutdown_tasks(handles).await;

        info!(
            agent_id = %self.agent_id,
            rejected_requests = rejected,
            "Message bus shut down"
        );
    }

    /// Abort without joining: shutdown may be called from inside a handler,
    /// i.e. from the dispatcher task itself.
    async fn shutdown_tasks(&self, handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.abort();
        }
        tokio::task::yield_now().await;
    }

    fn spawn_receiver(
        self: &Arc<Self>,
        mut receiver: broadcast::Receiver<AgentMessage>,
        event: String,
    ) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(message) => {
                            bus.ingest(message);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(agent_id = %bus.agent_id, event, skipped, "Receiver lagged; messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                while let Some(message) = bus.next_message() {
                    if token.is_cancelled() {
                        return;
                    }
                    bus.dispatch(message).await;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = bus.queue_notify.notified() => {}
                }
            }
        })
    }

    fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = bus.send_heartbeat().await {
                            warn!(agent_id = %bus.agent_id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    /// Broadcast one heartbeat now
    pub async fn send_heartbeat(&self) -> BusResult<AgentMessage> {
        let payload = HeartbeatPayload {
            agent_id: self.agent_id.clone(),
            role: self.role,
            status: self.status(),
            queue_depth: self.queue_depth(),
        };
        let message = AgentMessage::with_payload(MessageType::Heartbeat, &payload)?
            .priority(MessagePriority::Low)
            .ttl_ms(self.config.heartbeat_ttl_ms);
        let message = self.stamp(message, None, None);
        self.transmit(message, EVENT_BROADCAST.to_string(), self.config.audit_heartbeats)
            .await
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send directly to one agent
    pub async fn send_to_agent(
        &self,
        target_id: &str,
        target_role: AgentRole,
        message: AgentMessage,
    ) -> BusResult<AgentMessage> {
        let message = self.stamp(message, Some(target_id.to_string()), Some(target_role));
        self.transmit(message, agent_event(target_id), true).await
    }

    /// Send to every agent of a role
    pub async fn broadcast_to_role(
        &self,
        role: AgentRole,
        message: AgentMessage,
    ) -> BusResult<AgentMessage> {
        let message = self.stamp(message, None, Some(role));
        self.transmit(message, role_event(role), true).await
    }

    /// Send to every agent on the task
    pub async fn broadcast(&self, message: AgentMessage) -> BusResult<AgentMessage> {
        let message = self.stamp(message, None, None);
        self.transmit(message, EVENT_BROADCAST.to_string(), true).await
    }

    /// Send and wait for a reply carrying the same correlation id
    ///
    /// Exactly one of reply, timeout, send error or shutdown ends the
    /// request, and the pending entry is removed in every case.
    pub async fn request(
        &self,
        recipient: Recipient,
        mut message: AgentMessage,
        timeout: Duration,
    ) -> BusResult<AgentMessage> {
        if self.is_shut_down() {
            return Err(BusError::ShutDown);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(correlation_id.clone(), tx);

        message.correlation_id = Some(correlation_id.clone());
        message.reply_to = Some(self.agent_id.clone());

        let sent = match &recipient {
            Recipient::Agent { id, role } => self.send_to_agent(id, *role, message).await,
            Recipient::Role(role) => self.broadcast_to_role(*role, message).await,
        };
        if let Err(e) = sent {
            self.remove_pending(&correlation_id);
            return Err(e);
        }

        debug!(
            agent_id = %self.agent_id,
            correlation_id = %correlation_id,
            recipient = ?recipient,
            "Request sent"
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without an answer: only happens on shutdown
            Ok(Err(_)) => Err(BusError::ShutDown),
            Err(_) => {
                self.remove_pending(&correlation_id);
                warn!(
                    agent_id = %self.agent_id,
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(BusError::RequestTimeout {
                    correlation_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Answer a request. Only valid when the original carried `reply_to`.
    pub async fn reply(
        &self,
        original: &AgentMessage,
        mut response: AgentMessage,
    ) -> BusResult<AgentMessage> {
        let reply_to = original
            .reply_to
            .clone()
            .ok_or_else(|| BusError::NoReplyTo(original.id.clone()))?;
        response.correlation_id = original.correlation_id.clone();
        self.send_to_agent(&reply_to, original.sender_role, response).await
    }

    fn stamp(
        &self,
        mut message: AgentMessage,
        recipient_id: Option<String>,
        recipient_role: Option<AgentRole>,
    ) -> AgentMessage {
        message.id = Uuid::new_v4().to_string();
        message.sender_id = self.agent_id.clone();
        message.sender_role = self.role;
        message.task_id = self.task_id.clone();
        message.timestamp = Utc::now();
        message.recipient_id = recipient_id;
        message.recipient_role = recipient_role;
        message
    }

    async fn transmit(
        &self,
        message: AgentMessage,
        event: String,
        audit: bool,
    ) -> BusResult<AgentMessage> {
        let channel = agents_channel(&self.task_id);
        self.transport.publish(&channel, &event, &message).await?;

        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            to = %message.recipient_label(),
            "Message sent"
        );

        if audit {
            if let Some(sink) = &self.audit {
                let sink = Arc::clone(sink);
                let entry = AuditEntry::from(&message);
                tokio::spawn(async move {
                    if let Err(e) = sink.record(entry).await {
                        warn!(error = %e, "Failed to record message in audit log");
                    }
                });
            }
        }

        Ok(message)
    }

    fn remove_pending(&self, correlation_id: &str) -> Option<PendingReply> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(correlation_id)
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Register a handler for a message type. All handlers for a type run,
    /// in registration order.
    pub fn on_message<F, Fut>(&self, message_type: MessageType, handler: F) -> Unsubscribe
    where
        F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let handler: MessageHandler =
            Arc::new(move |message: AgentMessage| handler(message).boxed());
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(message_type)
            .or_default()
            .push((id, handler));

        let table: Weak<HandlerTable> = Arc::downgrade(&self.handlers);
        Unsubscribe::new(move || {
            if let Some(table) = table.upgrade() {
                if let Some(list) = table
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .get_mut(&message_type)
                {
                    list.retain(|(handler_id, _)| *handler_id != id);
                }
            }
        })
    }

    /// Number of handlers registered for a type
    pub fn handler_count(&self, message_type: MessageType) -> usize {
        self.handlers
            .read()
            .map(|h| h.get(&message_type).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Run one incoming message through the pipeline
    ///
    /// Called by the transport receivers; also usable directly to inject
    /// messages, e.g. before [`initialize`](MessageBus::initialize) starts
    /// the dispatch loop.
    pub fn ingest(&self, message: AgentMessage) -> IngestOutcome {
        if self.is_shut_down() {
            return IngestOutcome::ShuttingDown;
        }

        let fresh = self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(&message.id);
        if !fresh {
            debug!(message_id = %message.id, "Duplicate message dropped");
            return IngestOutcome::Duplicate;
        }

        if message.sender_id == self.agent_id {
            return IngestOutcome::OwnMessage;
        }

        if message.is_expired() {
            debug!(
                message_id = %message.id,
                message_type = %message.message_type,
                "Expired message dropped"
            );
            return IngestOutcome::Expired;
        }

        if let Some(correlation_id) = message.correlation_id.clone() {
            if let Some(reply) = self.remove_pending(&correlation_id) {
                let result = if message.message_type == MessageType::Error {
                    Err(BusError::RequestFailed {
                        correlation_id,
                        message: error_text(&message.payload),
                    })
                } else {
                    Ok(message)
                };
                let _ = reply.send(result);
                return IngestOutcome::ReplyResolved;
            }
        }

        if !self.is_addressed_to_me(&message) {
            return IngestOutcome::NotAddressed;
        }

        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        self.queue_notify.notify_one();
        IngestOutcome::Queued
    }

    fn is_addressed_to_me(&self, message: &AgentMessage) -> bool {
        match (&message.recipient_id, message.recipient_role) {
            (Some(id), _) => *id == self.agent_id,
            (None, Some(role)) => role == self.role,
            (None, None) => true,
        }
    }

    /// Pop the highest-priority message, skipping any that expired while
    /// queued. Sorting is stable so equal priorities keep arrival order.
    fn next_message(&self) -> Option<AgentMessage> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.sort_by_key(|m| m.priority);
        while !queue.is_empty() {
            let message = queue.remove(0);
            if message.is_expired() {
                debug!(message_id = %message.id, "Message expired in queue");
                continue;
            }
            return Some(message);
        }
        None
    }

    async fn dispatch(&self, message: AgentMessage) {
        let handlers: Vec<MessageHandler> = self
            .handlers
            .read()
            .map(|h| {
                h.get(&message.message_type)
                    .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(
                message_id = %message.id,
                message_type = %message.message_type,
                "No handler registered"
            );
            return;
        }

        for handler in handlers {
            let outcome = AssertUnwindSafe(handler(message.clone())).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    agent_id = %self.agent_id,
                    message_id = %message.id,
                    message_type = %message.message_type,
                    error = %e,
                    "Message handler failed"
                ),
                Err(_) => warn!(
                    agent_id = %self.agent_id,
                    message_id = %message.id,
                    message_type = %message.message_type,
                    "Message handler panicked"
                ),
            }
        }
    }
}

/// Best-effort error text from an error payload
fn error_text(payload: &serde_json::Value) -> String {
    payload
        .get("message")
        .or_else(|| payload.get("error"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| payload.to_string())
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::transport::InMemoryTransport;
    use serde_json::json;

    fn quiet_config() -> BusConfig {
        BusConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        }
    }

    fn bus(id: &str, role: AgentRole) -> SharedMessageBus {
        let transport: SharedTransport = Arc::new(InMemoryTransport::new());
        MessageBus::new(id, role, "task-1", transport, quiet_config()).shared()
    }

    fn incoming(id: &str, message_type: MessageType) -> AgentMessage {
        let mut msg = AgentMessage::new(message_type, json!({}));
        msg.id = id.to_string();
        msg.sender_id = "someone-else".to_string();
        msg.task_id = "task-1".to_string();
        msg
    }

    #[test]
    fn test_seen_ids_trim_to_retain() {
        let mut seen = SeenIds::new(4, 2);
        for id in ["a", "b", "c", "d", "e"] {
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 2);
        // most recent survive
        assert!(!seen.insert("e"));
        assert!(seen.insert("a"));
    }

    #[test]
    fn test_pipeline_drops() {
        let bus = bus("me", AgentRole::Coder);

        assert_eq!(bus.ingest(incoming("m1", MessageType::Progress)), IngestOutcome::Queued);
        assert_eq!(bus.ingest(incoming("m1", MessageType::Progress)), IngestOutcome::Duplicate);

        let mut other_agent = incoming("m2", MessageType::Progress);
        other_agent.recipient_id = Some("not-me".into());
        assert_eq!(bus.ingest(other_agent), IngestOutcome::NotAddressed);

        let mut other_role = incoming("m3", MessageType::Progress);
        other_role.recipient_role = Some(AgentRole::Writer);
        assert_eq!(bus.ingest(other_role), IngestOutcome::NotAddressed);

        let mut my_role = incoming("m4", MessageType::Progress);
        my_role.recipient_role = Some(AgentRole::Coder);
        assert_eq!(bus.ingest(my_role), IngestOutcome::Queued);

        let mut own = incoming("m5", MessageType::Progress);
        own.sender_id = "me".into();
        assert_eq!(bus.ingest(own), IngestOutcome::OwnMessage);

        assert_eq!(bus.queue_depth(), 2);
    }

    #[test]
    fn test_next_message_orders_by_priority_then_arrival() {
        let bus = bus("me", AgentRole::Coder);
        let mut first_normal = incoming("n1", MessageType::Progress);
        first_normal.priority = MessagePriority::Normal;
        let mut high = incoming("h1", MessageType::Progress);
        high.priority = MessagePriority::High;
        let mut second_normal = incoming("n2", MessageType::Progress);
        second_normal.priority = MessagePriority::Normal;

        bus.ingest(first_normal);
        bus.ingest(high);
        bus.ingest(second_normal);

        let order: Vec<String> = std::iter::from_fn(|| bus.next_message())
            .map(|m| m.id)
            .collect();
        assert_eq!(order, vec!["h1", "n1", "n2"]);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_handler() {
        let bus = bus("me", AgentRole::Coder);
        let first = bus.on_message(MessageType::Progress, |_| async { Ok(()) });
        let _second = bus.on_message(MessageType::Progress, |_| async { Ok(()) });
        assert_eq!(bus.handler_count(MessageType::Progress), 2);

        first.unsubscribe();
        assert_eq!(bus.handler_count(MessageType::Progress), 1);
    }

    #[tokio::test]
    async fn test_reply_requires_reply_to() {
        let bus = bus("me", AgentRole::Coder);
        let original = incoming("m1", MessageType::TaskClaim);
        let err = bus
            .reply(&original, AgentMessage::new(MessageType::TaskResult, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoReplyTo(_)));
    }

    #[test]
    fn test_error_text_extraction() {
        assert_eq!(error_text(&json!({"message": "boom"})), "boom");
        assert_eq!(error_text(&json!({"error": "bad"})), "bad");
        assert_eq!(error_text(&json!(42)), "42");
    }
}
