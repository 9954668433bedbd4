//! In-process swarm: one orchestrator plus a worker pool on one transport.
//!
//! Every agent still gets its own bus endpoint and state manager, so the
//! agents only share what they would share across processes: the
//! transport and the task record store.

use std::sync::Arc;

use coordination::messaging::SharedAuditSink;
use coordination::{
    AgentRole, InMemoryTaskStore, InMemoryTransport, MessageBus, SharedStateHandle,
    SharedStateManager, SharedTaskStore, SharedTransport, StateError, TaskSeed,
};
use tracing::info;
use uuid::Uuid;

use crate::agents::ExecutorRegistry;
use crate::config::SwarmConfig;
use crate::inference::SharedInferenceClient;
use crate::orchestrator::{Orchestrator, OrchestratorError, RunSummary, SharedOrchestrator};
use crate::worker::{SharedWorker, WorkerAgent, WorkerError};

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

pub struct SwarmBuilder {
    task_id: String,
    seed: TaskSeed,
    client: SharedInferenceClient,
    config: SwarmConfig,
    registry: ExecutorRegistry,
    transport: Option<SharedTransport>,
    store: Option<SharedTaskStore>,
    audit: Option<SharedAuditSink>,
}

impl SwarmBuilder {
    pub fn new(task_id: impl Into<String>, seed: TaskSeed, client: SharedInferenceClient) -> Self {
        Self {
            task_id: task_id.into(),
            seed,
            client,
            config: SwarmConfig::default(),
            registry: ExecutorRegistry::with_defaults(),
            transport: None,
            store: None,
            audit: None,
        }
    }

    pub fn config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: SharedTaskStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Audit sink attached to every agent's bus.
    pub fn audit(mut self, audit: SharedAuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Create the task record, then start the orchestrator and the workers.
    pub async fn launch(self) -> Result<Swarm, SwarmError> {
        let transport = self
            .transport
            .unwrap_or_else(|| -> SharedTransport { InMemoryTransport::new().shared() });
        let store = self.store.unwrap_or_else(|| InMemoryTaskStore::new().shared());
        let coordination = &self.config.coordination;

        let bus_for = |agent_id: &str, role: AgentRole| {
            let bus = MessageBus::new(
                agent_id,
                role,
                self.task_id.as_str(),
                Arc::clone(&transport),
                coordination.bus.clone(),
            );
            let bus = match &self.audit {
                Some(audit) => bus.with_audit(Arc::clone(audit)),
                None => bus,
            };
            bus.shared()
        };
        let state_for = |agent_id: &str| -> SharedStateHandle {
            SharedStateManager::new(
                self.task_id.as_str(),
                agent_id,
                Arc::clone(&store),
                Arc::clone(&transport),
                coordination.state.clone(),
            )
            .shared()
        };

        let orchestrator_id = format!("orchestrator-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let state = state_for(&orchestrator_id);
        state.initialize(self.seed.clone()).await?;
        let orchestrator = Orchestrator::new(
            bus_for(&orchestrator_id, AgentRole::Orchestrator),
            state,
            self.config.roles.clone(),
            self.config.orchestrator.clone(),
            coordination.conflict.clone(),
        )
        .shared();
        orchestrator.start().await?;

        let mut workers = Vec::new();
        for role in self.registry.roles() {
            let Some(executor) = self.registry.get(role) else {
                continue;
            };
            for n in 1..=self.config.workers.per_role.max(1) {
                let agent_id = format!("{role}-{n}");
                let state = state_for(&agent_id);
                state.initialize(self.seed.clone()).await?;
                let worker = WorkerAgent::new(
                    bus_for(&agent_id, role),
                    state,
                    Arc::clone(&executor),
                    Arc::clone(&self.client),
                    self.config.roles.timeout_for(role),
                )
                .with_claim_timeout(self.config.workers.claim_timeout())
                .shared();
                worker.start().await?;
                workers.push(worker);
            }
        }

        info!(
            task_id = %self.task_id,
            orchestrator = %orchestrator_id,
            workers = workers.len(),
            "Swarm launched"
        );
        Ok(Swarm {
            task_id: self.task_id,
            objective: self.seed.objective,
            store,
            orchestrator,
            workers,
        })
    }
}

pub struct Swarm {
    task_id: String,
    objective: String,
    store: SharedTaskStore,
    orchestrator: SharedOrchestrator,
    workers: Vec<SharedWorker>,
}

impl Swarm {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn orchestrator(&self) -> &SharedOrchestrator {
        &self.orchestrator
    }

    pub fn workers(&self) -> &[SharedWorker] {
        &self.workers
    }

    pub fn store(&self) -> &SharedTaskStore {
        &self.store
    }

    /// Plan the objective and execute the plan.
    pub async fn run(&self) -> Result<RunSummary, SwarmError> {
        self.orchestrator.create_plan(&self.objective).await?;
        Ok(self.orchestrator.execute().await?)
    }

    pub async fn shutdown(&self) {
        for worker in &self.workers {
            worker.stop().await;
        }
        self.orchestrator.stop().await;
        info!(task_id = %self.task_id, "Swarm shut down");
    }
}

/// New random task id.
pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}
