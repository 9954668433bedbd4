//! Pub/sub transport abstraction
//!
//! The bus never talks to a concrete broker. It publishes to named
//! channel/event pairs and subscribes to them through [`Transport`].
//! Delivery is best-effort and at-least-once; ordering is not guaranteed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{AgentMessage, AgentRole};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Event name for task-wide broadcasts
pub const EVENT_BROADCAST: &str = "message";

/// Event name for state change notifications
pub const EVENT_STATE_CHANGE: &str = "state_change";

/// Channel carrying agent traffic for a task
pub fn agents_channel(task_id: &str) -> String {
    format!("agents:{}", task_id)
}

/// Channel carrying shared-state change notifications for a task
pub fn state_channel(task_id: &str) -> String {
    format!("state:{}", task_id)
}

/// Event addressed to a single agent
pub fn agent_event(agent_id: &str) -> String {
    format!("agent:{}", agent_id)
}

/// Event addressed to every agent of a role
pub fn role_event(role: AgentRole) -> String {
    format!("role:{}", role)
}

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to publish on {channel}/{event}: {message}")]
    PublishFailed {
        channel: String,
        event: String,
        message: String,
    },

    #[error("Failed to subscribe to {channel}/{event}: {message}")]
    SubscribeFailed {
        channel: String,
        event: String,
        message: String,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Shared reference to a transport
pub type SharedTransport = Arc<dyn Transport>;

/// Fire-and-forget publish plus per channel/event subscription
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish to every current subscriber of `channel`/`event`
    async fn publish(&self, channel: &str, event: &str, message: &AgentMessage)
        -> TransportResult<()>;

    /// Subscribe to `channel`/`event`. Dropping the receiver unsubscribes.
    async fn subscribe(
        &self,
        channel: &str,
        event: &str,
    ) -> TransportResult<broadcast::Receiver<AgentMessage>>;
}

/// In-process transport backed by Tokio broadcast channels
///
/// One broadcast channel per channel/event pair. Publishing to a pair with
/// no subscribers succeeds and the message is dropped, matching a hosted
/// realtime broker.
#[derive(Default)]
pub struct InMemoryTransport {
    topics: Mutex<HashMap<String, broadcast::Sender<AgentMessage>>>,
    published: AtomicU64,
    fail_publishes: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this transport
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn topic(channel: &str, event: &str) -> String {
        format!("{}/{}", channel, event)
    }

    fn sender(&self, channel: &str, event: &str) -> broadcast::Sender<AgentMessage> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(Self::topic(channel, event))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Number of messages successfully published
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of live subscribers on a channel/event pair
    pub fn subscriber_count(&self, channel: &str, event: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .get(&Self::topic(channel, event))
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Make every subsequent publish fail (fault injection)
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        message: &AgentMessage,
    ) -> TransportResult<()> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed {
                channel: channel.to_string(),
                event: event.to_string(),
                message: "transport unavailable".to_string(),
            });
        }

        let sender = self.sender(channel, event);
        match sender.send(message.clone()) {
            Ok(receivers) => debug!(channel, event, receivers, "Message published"),
            // No receivers is OK - broadcast semantics
            Err(_) => debug!(channel, event, "Message published (no receivers)"),
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        event: &str,
    ) -> TransportResult<broadcast::Receiver<AgentMessage>> {
        Ok(self.sender(channel, event).subscribe())
    }
}
