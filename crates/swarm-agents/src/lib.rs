//! Agents for a message-driven task swarm
//!
//! An [`Orchestrator`] turns an objective into a phased [`coordination::Plan`],
//! broadcasts each subtask to the role that owns it and arbitrates the
//! claims that come back. [`WorkerAgent`]s claim assignments for their role,
//! run them through a [`RoleExecutor`] backed by an [`InferenceClient`] and
//! report results, errors and progress on the bus.
//!
//! [`SwarmBuilder`] wires a full in-process swarm on a single transport and
//! task record store.

pub mod agents;
pub mod capabilities;
pub mod config;
pub mod inference;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod protocol;
pub mod swarm;
pub mod worker;

pub use agents::{ExecutorRegistry, RoleExecutor, SharedExecutor, TaskContext, WorkerResult};
pub use capabilities::RoleTable;
pub use config::{InferenceConfig, OrchestratorPolicy, SwarmConfig, WorkerSettings};
pub use inference::{
    HttpInferenceClient, InferenceClient, InferenceError, InferenceRequest, InferenceResponse,
    SharedInferenceClient,
};
pub use orchestrator::{Orchestrator, OrchestratorError, RunSummary, SharedOrchestrator};
pub use planner::PlanError;
pub use swarm::{Swarm, SwarmBuilder, SwarmError};
pub use worker::{SharedWorker, WorkerAgent, WorkerError};
