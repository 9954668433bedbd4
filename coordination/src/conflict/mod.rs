//! Conflict detection and resolution
//!
//! Agents share no memory and the task record is never locked, so two agents
//! can write the same path or want the same resource at once. This module
//! orders writes with [`VectorClock`]s and settles disputes by policy
//! (causal order, automatic merge, role priority, first claim) before
//! falling back to the orchestrator and, failing that, the earliest
//! timestamp. Resolution never blocks indefinitely.
//!
//! # Usage
//!
//! ```ignore
//! use coordination::conflict::{ConflictEvent, ConflictResolver, ConflictType, Contender};
//!
//! let resolver = ConflictResolver::new(bus, state, policy);
//! let resolution = resolver
//!     .resolve(ConflictEvent::new(
//!         ConflictType::ResourceContention,
//!         "browser-session",
//!         vec![Contender::new("r1", AgentRole::Researcher), Contender::new("o1", AgentRole::Orchestrator)],
//!     ))
//!     .await?;
//! assert_eq!(resolution.winner.as_deref(), Some("o1"));
//! ```

pub mod clock;
pub mod merge;
pub mod resolver;
pub mod types;

pub use clock::{ClockOrdering, VectorClock};
pub use merge::{merge_all, merge_values};
pub use resolver::{
    clock_key, ClockEntry, ConflictError, ConflictResolver, ConflictResult, GuardedWrite,
    CLOCKS_ROOT, RESOLUTIONS_PATH,
};
pub use types::{
    ConflictEvent, ConflictType, Contender, EscalationDecision, EscalationRequest, Resolution,
    ResolutionStrategy,
};
