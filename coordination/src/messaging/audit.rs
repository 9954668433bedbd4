//! Audit trail for sent messages
//!
//! Every message a bus transmits is offered to an [`AuditSink`] on a
//! detached task. Sinks are best-effort: a failed write is logged by the bus
//! and never fails the send.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{AgentMessage, MessageType};

/// Error type for audit operations
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for audit operations
pub type AuditResult<T> = Result<T, AuditError>;

/// Shared reference to an audit sink
pub type SharedAuditSink = Arc<dyn AuditSink>;

/// One audited message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub message_id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content_json: serde_json::Value,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl From<&AgentMessage> for AuditEntry {
    fn from(message: &AgentMessage) -> Self {
        Self {
            message_id: message.id.clone(),
            from: message.sender_id.clone(),
            to: message.recipient_label(),
            message_type: message.message_type,
            content_json: message.payload.clone(),
            task_id: message.task_id.clone(),
            correlation_id: message.correlation_id.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// Append-only sink for the message audit trail
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> AuditResult<()>;
}

/// Sink that only emits a debug log line per message
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) -> AuditResult<()> {
        debug!(
            message_id = %entry.message_id,
            from = %entry.from,
            to = %entry.to,
            message_type = %entry.message_type,
            task_id = %entry.task_id,
            "audit"
        );
        Ok(())
    }
}

/// Bounded in-memory audit history with simple queries
pub struct MemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    capacity: usize,
}

impl MemoryAuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Create a shared reference to this log
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all retained entries, oldest first
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Entries recorded within the last `minutes`
    pub fn recent(&self, minutes: i64) -> Vec<AuditEntry> {
        let cutoff = Utc::now() - Duration::minutes(minutes);
        self.filtered(|e| e.recorded_at >= cutoff)
    }

    /// Request and reply sharing a correlation id
    pub fn by_correlation(&self, correlation_id: &str) -> Vec<AuditEntry> {
        self.filtered(|e| e.correlation_id.as_deref() == Some(correlation_id))
    }

    pub fn by_sender(&self, sender_id: &str) -> Vec<AuditEntry> {
        self.filtered(|e| e.from == sender_id)
    }

    pub fn by_type(&self, message_type: MessageType) -> Vec<AuditEntry> {
        self.filtered(|e| e.message_type == message_type)
    }

    fn filtered(&self, predicate: impl Fn(&AuditEntry) -> bool) -> Vec<AuditEntry> {
        self.entries
            .read()
            .map(|entries| entries.iter().filter(|e| predicate(e)).cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryAuditLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> AuditResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| AuditError::StoreError("audit log lock poisoned".to_string()))?;
        entries.push(entry);
        if entries.len() > self.capacity {
            let overflow = entries.len() - self.capacity;
            entries.drain(..overflow);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(from: &str, correlation: Option<&str>) -> AuditEntry {
        let mut msg = AgentMessage::new(MessageType::TaskResult, json!({"ok": true}));
        msg.id = uuid::Uuid::new_v4().to_string();
        msg.sender_id = from.to_string();
        msg.correlation_id = correlation.map(String::from);
        AuditEntry::from(&msg)
    }

    #[tokio::test]
    async fn test_memory_log_queries() {
        let log = MemoryAuditLog::new(10);
        log.record(entry("a", Some("c1"))).await.unwrap();
        log.record(entry("b", Some("c1"))).await.unwrap();
        log.record(entry("a", None)).await.unwrap();

        assert_eq!(log.len(), 3);
        assert_eq!(log.by_correlation("c1").len(), 2);
        assert_eq!(log.by_sender("a").len(), 2);
        assert_eq!(log.recent(5).len(), 3);
        assert_eq!(log.by_type(MessageType::TaskResult).len(), 3);
    }

    #[tokio::test]
    async fn test_memory_log_is_bounded() {
        let log = MemoryAuditLog::new(2);
        for sender in ["a", "b", "c"] {
            log.record(entry(sender, None)).await.unwrap();
        }
        let senders: Vec<String> = log.entries().into_iter().map(|e| e.from).collect();
        assert_eq!(senders, vec!["b", "c"]);
    }

    #[test]
    fn test_entry_labels_broadcast() {
        let e = entry("a", None);
        assert_eq!(e.to, "broadcast");
    }
}
