//! Conflict resolver
//!
//! Resolves conflicts by policy:
//!
//! | type                  | strategy                                          |
//! |-----------------------|---------------------------------------------------|
//! | `concurrent_write`    | causal order, else merge if mergeable, else escalate |
//! | `resource_contention` | role priority table, then timestamp; losers wait  |
//! | `task_overlap`        | first claim wins; losers abort                    |
//! | `undecidable`         | ask the orchestrator, else earliest timestamp     |
//!
//! Guarded writes ([`ConflictResolver::guarded_set`]) keep a vector clock per
//! state path under `vectorClocks.<path>` so that writes made without having
//! seen the previous writer's value are detected, including across restarts.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::clock::{ClockOrdering, VectorClock};
use super::merge::merge_all;
use super::types::{
    ConflictEvent, ConflictType, Contender, EscalationDecision, EscalationRequest, Resolution,
    ResolutionStrategy,
};
use crate::config::ConflictPolicy;
use crate::messaging::{
    AgentMessage, AgentRole, BusError, InterruptAction, InterruptPayload, MessagePriority,
    MessageType, Recipient, SharedMessageBus,
};
use crate::state::{SharedStateHandle, StateError};

/// Error type for conflict resolution
#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("Conflict {0} has no contenders")]
    NoContenders(String),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for conflict resolution
pub type ConflictResult<T> = Result<T, ConflictError>;

/// State root holding the audit list of resolutions
pub const RESOLUTIONS_PATH: &str = "conflictResolutions";

/// State root holding persisted clocks
pub const CLOCKS_ROOT: &str = "vectorClocks";

/// Persisted clock and last writer of a guarded path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockEntry {
    pub clock: VectorClock,
    pub agent_id: String,
    pub role: AgentRole,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a guarded write
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedWrite {
    /// What the path holds now
    pub value: Value,
    pub clock: VectorClock,
    /// Present when the write collided with another writer
    pub resolution: Option<Resolution>,
}

/// Clock storage key for a state path; dots would otherwise nest
pub fn clock_key(path: &str) -> String {
    format!("{}.{}", CLOCKS_ROOT, path.replace('.', "/"))
}

pub struct ConflictResolver {
    bus: SharedMessageBus,
    state: SharedStateHandle,
    policy: ConflictPolicy,
    /// This agent's view of each guarded path's clock
    local_clocks: Mutex<HashMap<String, VectorClock>>,
    history: Mutex<VecDeque<Resolution>>,
    pending: Mutex<HashMap<String, ConflictEvent>>,
}

impl ConflictResolver {
    pub fn new(bus: SharedMessageBus, state: SharedStateHandle, policy: ConflictPolicy) -> Self {
        Self {
            bus,
            state,
            policy,
            local_clocks: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Most recent resolutions, oldest first
    pub fn history(&self) -> Vec<Resolution> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Conflicts currently being resolved
    pub fn pending(&self) -> Vec<ConflictEvent> {
        self.pending
            .lock()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    pub async fn resolve(&self, event: ConflictEvent) -> ConflictResult<Resolution> {
        if event.contenders.is_empty() {
            return Err(ConflictError::NoContenders(event.id));
        }
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.id.clone(), event.clone());

        let resolution = match event.conflict_type {
            ConflictType::ConcurrentWrite => self.resolve_concurrent_write(&event).await,
            ConflictType::ResourceContention => self.resolve_contention(&event).await,
            ConflictType::TaskOverlap => self.resolve_overlap(&event).await,
            ConflictType::Undecidable => self.escalate(&event).await,
        };

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&event.id);
        self.record(&resolution).await;

        info!(
            conflict_id = %resolution.conflict_id,
            conflict_type = ?resolution.conflict_type,
            resource = %resolution.resource,
            strategy = ?resolution.strategy,
            winner = ?resolution.winner,
            "Conflict resolved"
        );
        Ok(resolution)
    }

    async fn resolve_concurrent_write(&self, event: &ConflictEvent) -> Resolution {
        let mut ordered: Vec<&Contender> = event.contenders.iter().collect();
        ordered.sort_by(|a, b| {
            (a.clock.weight(), a.timestamp, &a.agent_id).cmp(&(
                b.clock.weight(),
                b.timestamp,
                &b.agent_id,
            ))
        });

        let causal_chain = ordered.windows(2).all(|pair| {
            matches!(
                pair[0].clock.compare(&pair[1].clock),
                ClockOrdering::Before | ClockOrdering::Equal
            )
        });
        if causal_chain {
            if let Some(last) = ordered.last() {
                return Resolution::new(event, ResolutionStrategy::CausalOrder).won_by(event, last);
            }
        }

        if self.policy.merge_rules.is_mergeable(&event.resource) {
            let merged = merge_all(ordered.iter().filter_map(|c| c.value.as_ref()));
            if let Some(merged) = merged {
                let mut resolution = Resolution::new(event, ResolutionStrategy::Merge);
                resolution.value = Some(merged);
                return resolution;
            }
            debug!(resource = %event.resource, "Values not mergeable; escalating");
        }

        self.escalate(event).await
    }

    async fn resolve_contention(&self, event: &ConflictEvent) -> Resolution {
        let Some(winner) = event.highest_priority(&self.policy) else {
            return Resolution::new(event, ResolutionStrategy::Priority);
        };
        let resolution = Resolution::new(event, ResolutionStrategy::Priority).won_by(event, winner);
        let payload = InterruptPayload {
            action: InterruptAction::Wait,
            reason: format!("{} is held by higher-priority {}", event.resource, winner.role),
            resource: Some(event.resource.clone()),
            holder: Some(winner.agent_id.clone()),
            retry_after_ms: Some(self.policy.contention_backoff_ms),
        };
        self.notify_losers(event, &resolution, &payload).await;
        resolution
    }

    async fn resolve_overlap(&self, event: &ConflictEvent) -> Resolution {
        let Some(winner) = event.earliest() else {
            return Resolution::new(event, ResolutionStrategy::FirstClaim);
        };
        let resolution = Resolution::new(event, ResolutionStrategy::FirstClaim).won_by(event, winner);
        let payload = InterruptPayload {
            action: InterruptAction::Abort,
            reason: format!("{} was claimed first by {}", event.resource, winner.agent_id),
            resource: Some(event.resource.clone()),
            holder: Some(winner.agent_id.clone()),
            retry_after_ms: None,
        };
        self.notify_losers(event, &resolution, &payload).await;
        resolution
    }

    /// Ask the orchestrator; fall back to the earliest contender when no
    /// usable answer arrives in time
    async fn escalate(&self, event: &ConflictEvent) -> Resolution {
        if self.bus.role() != AgentRole::Orchestrator {
            match self.ask_orchestrator(event).await {
                Ok(Some(resolution)) => return resolution,
                Ok(None) => warn!(conflict_id = %event.id, "Escalation answer named no contender"),
                Err(e) => warn!(conflict_id = %event.id, error = %e, "Escalation unanswered"),
            }
        }
        match event.earliest() {
            Some(winner) => {
                Resolution::new(event, ResolutionStrategy::TimestampFallback).won_by(event, winner)
            }
            None => Resolution::new(event, ResolutionStrategy::TimestampFallback),
        }
    }

    async fn ask_orchestrator(&self, event: &ConflictEvent) -> ConflictResult<Option<Resolution>> {
        let request = AgentMessage::with_payload(
            MessageType::ConflictEscalation,
            &EscalationRequest {
                conflict: event.clone(),
            },
        )?
        .priority(MessagePriority::High)
        .ttl_ms(self.policy.escalation_timeout_ms);

        let reply = self
            .bus
            .request(
                Recipient::Role(AgentRole::Orchestrator),
                request,
                self.policy.escalation_timeout(),
            )
            .await?;
        let decision: EscalationDecision = reply.payload_as()?;
        Ok(event.contender(&decision.winner).map(|winner| {
            Resolution::new(event, ResolutionStrategy::OrchestratorDecision).won_by(event, winner)
        }))
    }

    async fn notify_losers(&self, event: &ConflictEvent, resolution: &Resolution, payload: &InterruptPayload) {
        for loser in event
            .contenders
            .iter()
            .filter(|c| resolution.losers.contains(&c.agent_id))
        {
            if loser.agent_id == self.bus.agent_id() {
                continue;
            }
            let message = match AgentMessage::with_payload(MessageType::Interrupt, payload) {
                Ok(message) => message.priority(MessagePriority::Critical),
                Err(e) => {
                    warn!(error = %e, "Failed to encode interrupt");
                    return;
                }
            };
            if let Err(e) = self.bus.send_to_agent(&loser.agent_id, loser.role, message).await {
                warn!(
                    conflict_id = %event.id,
                    agent_id = %loser.agent_id,
                    error = %e,
                    "Failed to notify conflict loser"
                );
            }
        }
    }

    async fn record(&self, resolution: &Resolution) {
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push_back(resolution.clone());
            while history.len() > self.policy.history_limit.max(1) {
                history.pop_front();
            }
        }
        if let Err(e) = self.state.append_to_list(RESOLUTIONS_PATH, resolution).await {
            warn!(conflict_id = %resolution.conflict_id, error = %e, "Failed to persist resolution");
        }
    }

    // =========================================================================
    // Guarded writes
    // =========================================================================

    /// Read a guarded path and fold its persisted clock into this agent's
    /// view, so a following write is ordered after the value read.
    pub async fn guarded_get(&self, path: &str) -> ConflictResult<Option<Value>> {
        if let Some(entry) = self.load_entry(path).await? {
            self.local_clocks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(path.to_string())
                .or_default()
                .merge_in_place(&entry.clock);
        }
        Ok(self.state.get_fresh(path).await?)
    }

    /// Write `value` to `path`, resolving a collision with the previous
    /// writer when this agent had not seen that write.
    pub async fn guarded_set(&self, path: &str, value: Value) -> ConflictResult<GuardedWrite> {
        let agent_id = self.bus.agent_id().to_string();
        let mut clock = self.local_clock(path);
        clock.increment(&agent_id);
        let mine = Contender::new(&agent_id, self.bus.role())
            .with_value(value)
            .with_clock(clock.clone());

        let stored = self.load_entry(path).await?;
        let (applied, resolution) = match stored {
            Some(entry)
                if matches!(
                    entry.clock.compare(&clock),
                    ClockOrdering::After | ClockOrdering::Concurrent
                ) =>
            {
                let current = self.state.get_fresh(path).await?;
                let theirs = Contender {
                    agent_id: entry.agent_id.clone(),
                    role: entry.role,
                    value: current,
                    clock: entry.clock.clone(),
                    timestamp: entry.timestamp,
                };
                clock.merge_in_place(&entry.clock);
                let event = ConflictEvent::new(ConflictType::ConcurrentWrite, path, vec![theirs, mine]);
                let resolution = self.resolve(event).await?;
                let applied = resolution.value.clone().unwrap_or(Value::Null);
                (applied, Some(resolution))
            }
            _ => (mine.value.clone().unwrap_or(Value::Null), None),
        };

        self.state.set(path, &applied).await?;
        let entry = ClockEntry {
            clock: clock.clone(),
            agent_id,
            role: self.bus.role(),
            timestamp: Utc::now(),
        };
        self.state.set(&clock_key(path), &entry).await?;
        self.local_clocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), clock.clone());

        Ok(GuardedWrite {
            value: applied,
            clock,
            resolution,
        })
    }

    fn local_clock(&self, path: &str) -> VectorClock {
        self.local_clocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Persisted clock entry for a guarded path, read from the store
    pub async fn load_entry(&self, path: &str) -> ConflictResult<Option<ClockEntry>> {
        match self.state.get_fresh(&clock_key(path)).await? {
            Some(Value::Null) | None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, StateConfig};
    use crate::messaging::{InMemoryTransport, MessageBus, SharedTransport};
    use crate::state::{InMemoryTaskStore, SharedStateManager, SharedTaskStore, TaskSeed};
    use chrono::Duration;
    use serde_json::json;

    fn quiet_bus() -> BusConfig {
        BusConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        }
    }

    async fn resolver_for(
        agent_id: &str,
        role: AgentRole,
        transport: SharedTransport,
        store: SharedTaskStore,
    ) -> ConflictResolver {
        let bus = MessageBus::new(agent_id, role, "t1", transport.clone(), quiet_bus()).shared();
        bus.initialize().await.unwrap();
        let state = SharedStateManager::new("t1", agent_id, store, transport, StateConfig::default()).shared();
        state.initialize(TaskSeed::new("u1", "objective")).await.unwrap();
        ConflictResolver::new(bus, state, ConflictPolicy::default())
    }

    async fn resolver(role: AgentRole) -> ConflictResolver {
        let transport: SharedTransport = InMemoryTransport::new().shared();
        resolver_for("self", role, transport, InMemoryTaskStore::new().shared()).await
    }

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|&(k, v)| (k, v)).collect()
    }

    #[tokio::test]
    async fn test_causal_chain_picks_last_writer() {
        let resolver = resolver(AgentRole::Orchestrator).await;
        let event = ConflictEvent::new(
            ConflictType::ConcurrentWrite,
            "plan.currentPhase",
            vec![
                Contender::new("b", AgentRole::Coder)
                    .with_value(json!(2))
                    .with_clock(clock(&[("a", 1), ("b", 1)])),
                Contender::new("a", AgentRole::Coder)
                    .with_value(json!(1))
                    .with_clock(clock(&[("a", 1)])),
            ],
        );
        let resolution = resolver.resolve(event).await.unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::CausalOrder);
        assert_eq!(resolution.winner.as_deref(), Some("b"));
        assert_eq!(resolution.value, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_concurrent_mergeable_write_merges() {
        let resolver = resolver(AgentRole::Orchestrator).await;
        let event = ConflictEvent::new(
            ConflictType::ConcurrentWrite,
            "artifacts.sources",
            vec![
                Contender::new("a", AgentRole::Researcher)
                    .with_value(json!(["x", "y"]))
                    .with_clock(clock(&[("a", 1)])),
                Contender::new("b", AgentRole::Analyst)
                    .with_value(json!(["y", "z"]))
                    .with_clock(clock(&[("b", 1)])),
            ],
        );
        let resolution = resolver.resolve(event).await.unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::Merge);
        assert_eq!(resolution.value, Some(json!(["x", "y", "z"])));
        assert!(resolution.winner.is_none());
    }

    #[tokio::test]
    async fn test_unmergeable_write_falls_back_to_earliest() {
        // The orchestrator cannot escalate to itself
        let resolver = resolver(AgentRole::Orchestrator).await;
        let now = Utc::now();
        let event = ConflictEvent::new(
            ConflictType::ConcurrentWrite,
            "plan.currentPhase",
            vec![
                Contender::new("late", AgentRole::Coder)
                    .with_value(json!(3))
                    .with_clock(clock(&[("late", 1)]))
                    .at(now),
                Contender::new("early", AgentRole::Coder)
                    .with_value(json!(2))
                    .with_clock(clock(&[("early", 1)]))
                    .at(now - Duration::seconds(1)),
            ],
        );
        let resolution = resolver.resolve(event).await.unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::TimestampFallback);
        assert_eq!(resolution.winner.as_deref(), Some("early"));
    }

    #[tokio::test]
    async fn test_contention_orchestrator_wins_regardless_of_time() {
        let resolver = resolver(AgentRole::Orchestrator).await;
        let now = Utc::now();
        let event = ConflictEvent::new(
            ConflictType::ResourceContention,
            "browser",
            vec![
                Contender::new("r1", AgentRole::Researcher).at(now - Duration::seconds(10)),
                Contender::new("o1", AgentRole::Orchestrator).at(now),
            ],
        );
        let resolution = resolver.resolve(event).await.unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::Priority);
        assert_eq!(resolution.winner.as_deref(), Some("o1"));
        assert_eq!(resolution.losers, vec!["r1"]);
    }

    #[tokio::test]
    async fn test_resolutions_are_recorded() {
        let resolver = resolver(AgentRole::Orchestrator).await;
        let event = ConflictEvent::new(
            ConflictType::TaskOverlap,
            "subtask-1",
            vec![Contender::new("a", AgentRole::Coder)],
        );
        resolver.resolve(event).await.unwrap();

        assert_eq!(resolver.history().len(), 1);
        assert!(resolver.pending().is_empty());
        let stored: Vec<Resolution> = resolver.state.get(RESOLUTIONS_PATH).await.unwrap().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].strategy, ResolutionStrategy::FirstClaim);
    }

    #[tokio::test]
    async fn test_empty_event_rejected() {
        let resolver = resolver(AgentRole::Orchestrator).await;
        let event = ConflictEvent::new(ConflictType::TaskOverlap, "x", vec![]);
        assert!(matches!(
            resolver.resolve(event).await,
            Err(ConflictError::NoContenders(_))
        ));
    }

    #[tokio::test]
    async fn test_guarded_writes_detect_unseen_writer() {
        let transport: SharedTransport = InMemoryTransport::new().shared();
        let store = InMemoryTaskStore::new().shared();
        let a = resolver_for("a", AgentRole::Researcher, transport.clone(), store.clone()).await;
        let b = resolver_for("b", AgentRole::Analyst, transport, store).await;

        let first = a.guarded_set("context.facts", json!(["f1"])).await.unwrap();
        assert!(first.resolution.is_none());

        // b never read a's write: concurrent, and the path is mergeable
        let second = b.guarded_set("context.facts", json!(["f2"])).await.unwrap();
        let resolution = second.resolution.expect("collision");
        assert_eq!(resolution.strategy, ResolutionStrategy::Merge);
        assert_eq!(second.value, json!(["f1", "f2"]));

        // a reads first, so its next write follows b's
        a.guarded_get("context.facts").await.unwrap();
        let third = a.guarded_set("context.facts", json!(["f1", "f2", "f3"])).await.unwrap();
        assert!(third.resolution.is_none());
        assert_eq!(third.clock.get("a"), 2);
        assert_eq!(third.clock.get("b"), 1);

        let entry = b.load_entry("context.facts").await.unwrap().unwrap();
        assert_eq!(entry.agent_id, "a");
        assert_eq!(entry.clock, third.clock);
    }

    #[tokio::test]
    async fn test_clocks_survive_restart() {
        let transport: SharedTransport = InMemoryTransport::new().shared();
        let store = InMemoryTaskStore::new().shared();
        {
            let a = resolver_for("a", AgentRole::Coder, transport.clone(), store.clone()).await;
            a.guarded_set("plan.notes", json!("draft")).await.unwrap();
        }
        let restarted = resolver_for("a2", AgentRole::Coder, transport, store).await;
        let entry = restarted.load_entry("plan.notes").await.unwrap().unwrap();
        assert_eq!(entry.clock.get("a"), 1);
        assert_eq!(clock_key("plan.notes"), "vectorClocks.plan/notes");
    }
}
