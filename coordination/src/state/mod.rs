//! Shared task state
//!
//! One [`SharedState`] document per task, addressed by dot paths and shared
//! by every agent working on the task.
//!
//! # Architecture
//!
//! - `types`: the typed document (plan, agents, artifacts, context, metrics)
//! - `path`: dot-path reads and copy-on-write writes on JSON documents
//! - `store`: [`TaskRecord`] persistence behind [`TaskRecordStore`]
//! - `schema`: which record field and column family each root lives in
//! - `manager`: [`SharedStateManager`], cache, validation and change fan-out
//! - `rocks` (feature `heavy-state`): RocksDB record store and audit trail
//!
//! # Usage
//!
//! ```ignore
//! use coordination::state::{InMemoryTaskStore, SharedStateManager, TaskSeed, TaskStatus};
//!
//! let manager = SharedStateManager::new("task-1", "orch-1", store, transport, Default::default())
//!     .shared();
//! manager.initialize(TaskSeed::new("user-1", "Summarize three papers")).await?;
//! manager.set_status(TaskStatus::Planning).await?;
//! manager.append_to_list("context.facts", &"papers found: 3").await?;
//! ```

pub mod manager;
pub mod path;
#[cfg(feature = "heavy-state")]
pub mod rocks;
pub mod schema;
pub mod store;
pub mod types;

pub use manager::{
    SharedStateHandle, SharedStateManager, StateChange, StateChangeHandler, StateError,
    StateResult, TaskSeed,
};
pub use path::PathError;
#[cfg(feature = "heavy-state")]
pub use rocks::{RocksTaskStore, SharedRocksTaskStore};
pub use schema::StorageField;
pub use store::{
    InMemoryTaskStore, RecordEdit, RecordUpdate, SharedTaskStore, StoreError, StoreResult, TaskRecord,
    TaskRecordStore,
};
pub use types::{
    AgentActivity, AgentMetrics, AgentStatus, Artifact, ArtifactType, Phase, PhaseStatus, Plan,
    SharedContext, SharedState, Subtask, SubtaskStatus, TaskError, TaskId, TaskMetrics,
    TaskStatus,
};
