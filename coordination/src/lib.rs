//! Coordination primitives for multi-agent task execution
//!
//! This library provides:
//! - A per-agent message bus with request/reply, priority dispatch,
//!   deduplication, TTL expiry and heartbeats
//! - A path-addressed shared task state with caching and change fan-out
//! - Vector-clock conflict detection and policy-based resolution
//!
//! Agents share no memory. Everything they coordinate on goes through a
//! [`messaging::Transport`] and a [`state::TaskRecordStore`]; in-memory
//! implementations of both are included, and a RocksDB store is available
//! with the `heavy-state` feature.
//!
//! # Per-process scope
//!
//! Pending requests, dedup sets, handler queues and path caches live in
//! process memory. They give guarantees inside one agent process only and
//! provide no mutual exclusion between processes.

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod conflict;
pub mod messaging;
pub mod state;

// Re-export configuration
pub use config::{BusConfig, ConfigError, ConflictPolicy, CoordinationConfig, MergeRules, StateConfig};

// Re-export messaging types
pub use messaging::{
    AgentMessage, AgentRole, AuditSink, BusError, InMemoryTransport, MemoryAuditLog, MessageBus,
    MessagePriority, MessageType, Recipient, SharedMessageBus, SharedTransport, Transport,
    Unsubscribe,
};

// Re-export state types
pub use state::{
    AgentActivity, AgentStatus, Artifact, InMemoryTaskStore, Phase, PhaseStatus, Plan,
    SharedState, SharedStateHandle, SharedStateManager, SharedTaskStore, StateChange, StateError,
    Subtask, SubtaskStatus, TaskError, TaskRecordStore, TaskSeed, TaskStatus,
};

// Re-export conflict types
pub use conflict::{
    ConflictError, ConflictEvent, ConflictResolver, ConflictType, Contender, Resolution,
    ResolutionStrategy, VectorClock,
};
