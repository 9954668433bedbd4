//! Message types exchanged between agents
//!
//! Every agent speaks [`AgentMessage`]. The payload is opaque JSON; the
//! well-known payload shapes that the coordination layer itself produces
//! (heartbeats, interrupts, conflict escalations) are typed here.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::state::AgentActivity;

/// Unique identifier for messages
pub type MessageId = String;

/// Capability category of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Researcher,
    Coder,
    Analyst,
    Reviewer,
    Browser,
    Writer,
}

impl AgentRole {
    /// All roles, orchestrator first
    pub fn all() -> &'static [AgentRole] {
        &[
            AgentRole::Orchestrator,
            AgentRole::Researcher,
            AgentRole::Coder,
            AgentRole::Analyst,
            AgentRole::Reviewer,
            AgentRole::Browser,
            AgentRole::Writer,
        ]
    }

    /// Roles that execute subtasks
    pub fn workers() -> &'static [AgentRole] {
        &AgentRole::all()[1..]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::Researcher => "researcher",
            AgentRole::Coder => "coder",
            AgentRole::Analyst => "analyst",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Browser => "browser",
            AgentRole::Writer => "writer",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentRole::all()
            .iter()
            .copied()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown agent role: {s}"))
    }
}

/// Kind of message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    TaskResult,
    StateUpdate,
    Handoff,
    Interrupt,
    Heartbeat,
    Error,
    Progress,
    /// Worker asks the orchestrator for exclusive ownership of an assignment
    TaskClaim,
    /// Conflict resolver asks the orchestrator to decide a conflict
    ConflictEscalation,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskAssignment => "task_assignment",
            MessageType::TaskResult => "task_result",
            MessageType::StateUpdate => "state_update",
            MessageType::Handoff => "handoff",
            MessageType::Interrupt => "interrupt",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Error => "error",
            MessageType::Progress => "progress",
            MessageType::TaskClaim => "task_claim",
            MessageType::ConflictEscalation => "conflict_escalation",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. Declaration order is dispatch order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

/// The unit of communication between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender_id: String,
    pub sender_role: AgentRole,
    /// Absent together with `recipient_role` means broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_role: Option<AgentRole>,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Time-to-live in milliseconds, measured from `timestamp`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl AgentMessage {
    /// Create an unsent message. Sender, id and timestamp are stamped by the
    /// bus when the message is transmitted.
    pub fn new(message_type: MessageType, payload: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            message_type,
            sender_id: String::new(),
            sender_role: AgentRole::Orchestrator,
            recipient_id: None,
            recipient_role: None,
            task_id: String::new(),
            timestamp: Utc::now(),
            priority: MessagePriority::Normal,
            payload,
            correlation_id: None,
            reply_to: None,
            ttl: None,
            retry_count: None,
        }
    }

    /// Create a message from a serializable payload
    pub fn with_payload<T: Serialize>(
        message_type: MessageType,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(message_type, serde_json::to_value(payload)?))
    }

    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn ttl_ms(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Whether the message has outlived its TTL at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => {
                (now - self.timestamp).num_milliseconds() > i64::try_from(ttl).unwrap_or(i64::MAX)
            }
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none() && self.recipient_role.is_none()
    }

    /// Deserialize the payload into a typed shape
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }

    /// Human-readable recipient, used in logs and the audit trail
    pub fn recipient_label(&self) -> String {
        match (&self.recipient_id, &self.recipient_role) {
            (Some(id), _) => id.clone(),
            (None, Some(role)) => format!("role:{role}"),
            (None, None) => "broadcast".to_string(),
        }
    }
}

/// Heartbeat payload advertised by every bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub agent_id: String,
    pub role: AgentRole,
    pub status: AgentActivity,
    pub queue_depth: usize,
}

/// What an interrupted agent is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptAction {
    /// Stop all work; the task was cancelled
    Cancel,
    /// Back off and retry after `retry_after_ms`
    Wait,
    /// Give up the contended work item; someone else holds it
    Abort,
}

/// Interrupt payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptPayload {
    pub action: InterruptAction,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl InterruptPayload {
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self {
            action: InterruptAction::Cancel,
            reason: reason.into(),
            resource: None,
            holder: None,
            retry_after_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_priority_order() {
        let mut priorities = vec![
            MessagePriority::Low,
            MessagePriority::Critical,
            MessagePriority::Normal,
            MessagePriority::High,
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                MessagePriority::Critical,
                MessagePriority::High,
                MessagePriority::Normal,
                MessagePriority::Low
            ]
        );
    }

    #[test]
    fn test_ttl_expiry() {
        let mut msg = AgentMessage::new(MessageType::Heartbeat, json!({})).ttl_ms(1000);
        msg.timestamp = Utc::now() - Duration::milliseconds(2000);
        assert!(msg.is_expired());

        msg.timestamp = Utc::now();
        assert!(!msg.is_expired());

        let no_ttl = AgentMessage::new(MessageType::Progress, json!({}));
        assert!(!no_ttl.is_expired_at(Utc::now() + Duration::days(365)));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let mut msg = AgentMessage::new(MessageType::Progress, json!({})).ttl_ms(u64::MAX);
        msg.timestamp = Utc::now() - Duration::days(365);
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let mut msg = AgentMessage::new(MessageType::TaskAssignment, json!({"k": 1}));
        msg.correlation_id = Some("c-1".into());
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "task_assignment");
        assert_eq!(value["correlationId"], "c-1");
        assert!(value.get("recipientId").is_none());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Reviewer".parse::<AgentRole>().unwrap(), AgentRole::Reviewer);
        assert!("janitor".parse::<AgentRole>().is_err());
        assert!(!AgentRole::workers().contains(&AgentRole::Orchestrator));
    }
}
