//! Conflict events and their resolutions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::clock::VectorClock;
use crate::config::ConflictPolicy;
use crate::messaging::AgentRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Two agents wrote the same state path without seeing each other
    ConcurrentWrite,
    /// Two agents want the same exclusive resource
    ResourceContention,
    /// Two agents claimed the same subtask
    TaskOverlap,
    /// No policy applies; the orchestrator decides
    Undecidable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    CausalOrder,
    Merge,
    Priority,
    FirstClaim,
    OrchestratorDecision,
    TimestampFallback,
}

/// One side of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contender {
    pub agent_id: String,
    pub role: AgentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub clock: VectorClock,
    pub timestamp: DateTime<Utc>,
}

impl Contender {
    pub fn new(agent_id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            value: None,
            clock: VectorClock::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_clock(mut self, clock: VectorClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    /// State path, resource name or subtask id under dispute
    pub resource: String,
    pub contenders: Vec<Contender>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictEvent {
    pub fn new(conflict_type: ConflictType, resource: impl Into<String>, contenders: Vec<Contender>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conflict_type,
            resource: resource.into(),
            contenders,
            detected_at: Utc::now(),
        }
    }

    /// Earliest timestamp wins; agent id breaks exact ties
    pub fn earliest(&self) -> Option<&Contender> {
        self.contenders
            .iter()
            .min_by(|a, b| (a.timestamp, &a.agent_id).cmp(&(b.timestamp, &b.agent_id)))
    }

    /// Highest-priority role wins; earliest timestamp breaks ties
    pub fn highest_priority(&self, policy: &ConflictPolicy) -> Option<&Contender> {
        self.contenders.iter().min_by(|a, b| {
            (policy.priority_rank(a.role), a.timestamp, &a.agent_id).cmp(&(
                policy.priority_rank(b.role),
                b.timestamp,
                &b.agent_id,
            ))
        })
    }

    pub fn contender(&self, agent_id: &str) -> Option<&Contender> {
        self.contenders.iter().find(|c| c.agent_id == agent_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub conflict_id: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub resource: String,
    pub strategy: ResolutionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    #[serde(default)]
    pub losers: Vec<String>,
    /// Value to apply to the resource, when the conflict was about a value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub resolved_at: DateTime<Utc>,
}

impl Resolution {
    pub(crate) fn new(event: &ConflictEvent, strategy: ResolutionStrategy) -> Self {
        Self {
            conflict_id: event.id.clone(),
            conflict_type: event.conflict_type,
            resource: event.resource.clone(),
            strategy,
            winner: None,
            losers: Vec::new(),
            value: None,
            resolved_at: Utc::now(),
        }
    }

    /// Declare `winner` and mark every other contender a loser
    pub(crate) fn won_by(mut self, event: &ConflictEvent, winner: &Contender) -> Self {
        self.winner = Some(winner.agent_id.clone());
        self.losers = event
            .contenders
            .iter()
            .filter(|c| c.agent_id != winner.agent_id)
            .map(|c| c.agent_id.clone())
            .collect();
        self.value = winner.value.clone();
        self
    }
}

/// Payload of a `conflict_escalation` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRequest {
    pub conflict: ConflictEvent,
}

/// Payload of the orchestrator's reply to an escalation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationDecision {
    pub winner: String,
}
