//! Orchestration loop: plan → dispatch subtasks phase by phase → review.
//!
//! ```text
//! pending → planning → executing → reviewing → completed
//!                          │            │
//!                          └────────────┴──▶ failed | cancelled
//! ```
//!
//! The orchestrator owns the authoritative [`Plan`] and rewrites the whole
//! `plan` root after each mutation. Subtasks are broadcast to a role; the
//! first worker to claim an assignment gets it and every later claimant is
//! turned away through the conflict resolver's first-claim path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use coordination::conflict::{EscalationDecision, EscalationRequest};
use coordination::messaging::{HeartbeatPayload, InterruptAction, InterruptPayload};
use coordination::state::TaskMetrics;
use coordination::{
    AgentActivity, AgentMessage, AgentRole, BusError, ConflictError, ConflictEvent,
    ConflictPolicy, ConflictResolver, ConflictType, Contender, MessagePriority, MessageType,
    PhaseStatus, Plan, SharedMessageBus, SharedStateHandle, StateError, SubtaskStatus, TaskError,
    TaskStatus, Unsubscribe,
};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::WorkerResult;
use crate::capabilities::RoleTable;
use crate::config::OrchestratorPolicy;
use crate::planner::{self, PlanError};
use crate::protocol::{
    codes, AssignmentPayload, ClaimDecision, ClaimRequest, ProgressPayload, TaskErrorPayload,
    TaskResultPayload,
};

/// Longest fact carried from one subtask to the next.
const MAX_FACT_LEN: usize = 280;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Conflict error: {0}")]
    Conflict(#[from] ConflictError),

    #[error("No plan has been created")]
    NoPlan,

    #[error("Unknown phase {0}")]
    UnknownPhase(String),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Phase {phase_id} failed: subtask {subtask_id}: {message}")]
    PhaseFailed {
        phase_id: String,
        subtask_id: String,
        message: String,
    },

    #[error("No phase can start; waiting on dependencies: {}", .0.join(", "))]
    DependenciesUnsatisfied(Vec<String>),
}

impl OrchestratorError {
    /// Code stored in the task error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PhaseFailed { .. } => codes::SUBTASK_FAILED,
            Self::DependenciesUnsatisfied(_) => codes::PHASE_DEPENDENCIES_UNSATISFIED,
            _ => codes::ORCHESTRATION_ERROR,
        }
    }
}

/// What a finished `execute` looks like.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub task_id: String,
    pub status: TaskStatus,
    pub phases_completed: usize,
    pub phases_total: usize,
    pub tokens_used: u64,
    pub credits_used: f64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// An agent the orchestrator has heard from.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveAgent {
    pub id: String,
    pub role: AgentRole,
    pub status: AgentActivity,
    pub assignment: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_progress: Option<String>,
}

impl ActiveAgent {
    fn new(id: &str, role: AgentRole) -> Self {
        Self {
            id: id.to_string(),
            role,
            status: AgentActivity::Idle,
            assignment: None,
            last_heartbeat: Utc::now(),
            last_progress: None,
        }
    }
}

#[derive(Debug)]
enum SubtaskOutcome {
    Completed {
        agent_id: String,
        result: WorkerResult,
    },
    Failed {
        message: String,
        code: String,
        recoverable: bool,
    },
}

#[derive(Debug, Clone)]
struct Holder {
    agent_id: String,
    role: AgentRole,
    granted_at: DateTime<Utc>,
}

struct Assignment {
    phase_id: String,
    subtask_id: String,
    holder: Option<Holder>,
    outcome: Option<oneshot::Sender<SubtaskOutcome>>,
}

enum ClaimCheck {
    Granted { phase_id: String, subtask_id: String },
    Repeat,
    Contested(Holder),
    Closed(Option<String>),
}

enum SubtaskReport {
    Completed,
    Failed(String),
}

pub type SharedOrchestrator = Arc<Orchestrator>;

pub struct Orchestrator {
    id: String,
    bus: SharedMessageBus,
    state: SharedStateHandle,
    resolver: ConflictResolver,
    roles: RoleTable,
    policy: OrchestratorPolicy,
    plan: tokio::sync::Mutex<Plan>,
    assignments: Mutex<HashMap<String, Assignment>>,
    agents: Mutex<HashMap<String, ActiveAgent>>,
    metrics: Mutex<TaskMetrics>,
    cancel: CancellationToken,
    subscriptions: Mutex<Vec<Unsubscribe>>,
}

impl Orchestrator {
    pub fn new(
        bus: SharedMessageBus,
        state: SharedStateHandle,
        roles: RoleTable,
        policy: OrchestratorPolicy,
        conflict: ConflictPolicy,
    ) -> Self {
        let resolver = ConflictResolver::new(Arc::clone(&bus), Arc::clone(&state), conflict);
        Self {
            id: bus.agent_id().to_string(),
            bus,
            state,
            resolver,
            roles,
            policy,
            plan: tokio::sync::Mutex::new(Plan::default()),
            assignments: Mutex::new(HashMap::new()),
            agents: Mutex::new(HashMap::new()),
            metrics: Mutex::new(TaskMetrics::default()),
            cancel: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(self) -> SharedOrchestrator {
        Arc::new(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_id(&self) -> &str {
        self.bus.task_id()
    }

    pub fn bus(&self) -> &SharedMessageBus {
        &self.bus
    }

    pub fn state(&self) -> &SharedStateHandle {
        &self.state
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub async fn plan(&self) -> Plan {
        self.plan.lock().await.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Agents heard from, ordered by id.
    pub fn active_agents(&self) -> Vec<ActiveAgent> {
        let mut agents: Vec<ActiveAgent> = self.lock_agents().values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Agents whose last heartbeat is older than `window`. Reported, not evicted.
    pub fn stale_agents(&self, window: Duration) -> Vec<String> {
        let window = chrono::Duration::milliseconds(window.as_millis().min(i64::MAX as u128) as i64);
        let now = Utc::now();
        let mut stale: Vec<String> = self
            .lock_agents()
            .values()
            .filter(|a| a.status != AgentActivity::Terminated && now - a.last_heartbeat > window)
            .map(|a| a.id.clone())
            .collect();
        stale.sort();
        stale
    }

    fn lock_agents(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveAgent>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_assignments(&self) -> std::sync::MutexGuard<'_, HashMap<String, Assignment>> {
        self.assignments.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register message handlers and join the bus.
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        let handles = vec![
            self.handle(MessageType::TaskClaim, |o, m| async move { o.handle_claim(m).await }),
            self.handle(MessageType::TaskResult, |o, m| async move { o.handle_task_result(m) }),
            self.handle(MessageType::Error, |o, m| async move { o.handle_agent_error(m) }),
            self.handle(MessageType::Heartbeat, |o, m| async move { o.handle_heartbeat(m) }),
            self.handle(MessageType::Progress, |o, m| async move { o.handle_progress(m) }),
            self.handle(MessageType::ConflictEscalation, |o, m| async move {
                o.handle_escalation(m).await
            }),
        ];
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);

        self.bus.initialize().await?;
        self.bus.set_status(AgentActivity::Busy);
        info!(task_id = %self.task_id(), orchestrator = %self.id, "Orchestrator started");
        Ok(())
    }

    /// Register a handler that holds the orchestrator weakly.
    fn handle<F, Fut>(self: &Arc<Self>, message_type: MessageType, f: F) -> Unsubscribe
    where
        F: Fn(Arc<Self>, AgentMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let f = Arc::new(f);
        self.bus.on_message(message_type, move |message| {
            let weak = Weak::clone(&weak);
            let f = Arc::clone(&f);
            async move {
                match weak.upgrade() {
                    Some(orchestrator) => f(orchestrator, message).await,
                    None => Ok(()),
                }
            }
        })
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        for handle in self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.unsubscribe();
        }
        self.bus.set_status(AgentActivity::Terminated);
        self.bus.shutdown().await;
        self.state.shutdown();
    }

    // =========================================================================
    // Planning
    // =========================================================================

    /// Build the phased plan for `objective` and publish it.
    pub async fn create_plan(&self, objective: &str) -> Result<Plan, OrchestratorError> {
        self.state.set_status(TaskStatus::Planning).await?;
        let plan = planner::create_plan(objective)?;
        self.install_plan(plan.clone()).await?;
        info!(
            task_id = %self.task_id(),
            phases = plan.phases.len(),
            "Plan created"
        );
        Ok(plan)
    }

    /// Use a caller-supplied plan instead of the generated one.
    pub async fn use_plan(&self, plan: Plan) -> Result<(), OrchestratorError> {
        planner::validate(&plan)?;
        self.state.set_status(TaskStatus::Planning).await?;
        self.install_plan(plan).await
    }

    async fn install_plan(&self, plan: Plan) -> Result<(), OrchestratorError> {
        let mut current = self.plan.lock().await;
        *current = plan;
        self.state.set("plan", &*current).await?;
        Ok(())
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run the plan to a terminal status.
    ///
    /// Task failures are recorded in shared state and in the summary; the
    /// `Err` side is reserved for calling `execute` without a plan.
    pub async fn execute(self: &Arc<Self>) -> Result<RunSummary, OrchestratorError> {
        if self.plan.lock().await.phases.is_empty() {
            return Err(OrchestratorError::NoPlan);
        }

        let started = tokio::time::Instant::now();
        {
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.started_at = Some(Utc::now());
        }
        self.persist_metrics().await;

        let outcome = match self.state.set_status(TaskStatus::Executing).await {
            Ok(_) => self.run_phases().await,
            Err(e) => Err(e.into()),
        };

        let (status, error) = match outcome {
            Ok(()) => (TaskStatus::Completed, None),
            Err(_) if self.is_cancelled() => (TaskStatus::Cancelled, None),
            Err(e) => {
                error!(task_id = %self.task_id(), code = e.code(), error = %e, "Task failed");
                (TaskStatus::Failed, Some(TaskError::new(e.code(), e.to_string(), false)))
            }
        };
        Ok(self.finish(status, error, started).await)
    }

    /// Passes over the unfinished phases until all are terminal or a pass
    /// starts nothing.
    async fn run_phases(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        loop {
            let pending: Vec<String> = {
                let plan = self.plan.lock().await;
                plan.phases
                    .iter()
                    .filter(|p| !p.is_terminal())
                    .map(|p| p.id.clone())
                    .collect()
            };
            if pending.is_empty() {
                return Ok(());
            }

            let mut progressed = false;
            for phase_id in &pending {
                if self.is_cancelled() {
                    return Err(OrchestratorError::Cancelled);
                }
                if !self.plan.lock().await.can_start_phase(phase_id) {
                    debug!(phase_id = %phase_id, "Dependencies incomplete; phase deferred");
                    continue;
                }
                self.execute_phase(phase_id).await?;
                progressed = true;
            }

            if !progressed {
                return Err(OrchestratorError::DependenciesUnsatisfied(pending));
            }
        }
    }

    async fn execute_phase(self: &Arc<Self>, phase_id: &str) -> Result<(), OrchestratorError> {
        let (groups, is_last) = {
            let mut plan = self.plan.lock().await;
            let is_last = plan.phases.len() > 1
                && plan
                    .phases
                    .iter()
                    .filter(|p| p.id != phase_id)
                    .all(|p| p.is_terminal());
            let phase = plan
                .phase_mut(phase_id)
                .ok_or_else(|| OrchestratorError::UnknownPhase(phase_id.to_string()))?;
            phase.mark_in_progress();
            let ids: Vec<String> = phase.subtasks.iter().map(|s| s.id.clone()).collect();
            self.state.set("plan", &*plan).await?;

            let groups: Vec<Vec<String>> = if self.policy.parallel_subtasks {
                vec![ids]
            } else {
                ids.into_iter().map(|id| vec![id]).collect()
            };
            (groups, is_last)
        };

        if is_last {
            self.state.set_status(TaskStatus::Reviewing).await?;
        }
        info!(task_id = %self.task_id(), phase_id, "Phase started");

        for group in groups {
            let reports = join_all(group.iter().map(|id| self.execute_subtask(phase_id, id))).await;
            for (subtask_id, report) in group.iter().zip(reports) {
                if let SubtaskReport::Failed(message) = report? {
                    let mut plan = self.plan.lock().await;
                    if let Some(phase) = plan.phase_mut(phase_id) {
                        phase.mark_failed();
                    }
                    self.state.set("plan", &*plan).await?;
                    return Err(OrchestratorError::PhaseFailed {
                        phase_id: phase_id.to_string(),
                        subtask_id: subtask_id.clone(),
                        message,
                    });
                }
            }
        }

        let mut plan = self.plan.lock().await;
        plan.phase_mut(phase_id)
            .ok_or_else(|| OrchestratorError::UnknownPhase(phase_id.to_string()))?
            .mark_completed()?;
        plan.current_phase = (plan.current_phase + 1).min(plan.total_phases);
        self.state.set("plan", &*plan).await?;
        info!(task_id = %self.task_id(), phase_id, "Phase completed");
        Ok(())
    }

    /// Dispatch one subtask until it succeeds, fails for good, or retries
    /// run out.
    async fn execute_subtask(
        self: &Arc<Self>,
        phase_id: &str,
        subtask_id: &str,
    ) -> Result<SubtaskReport, OrchestratorError> {
        let mut attempt: u32 = 1;
        loop {
            if self.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            let (payload, role) = self.prepare_assignment(phase_id, subtask_id, attempt).await?;
            let assignment_id = payload.assignment_id.clone();
            let outcome_rx = self.open_assignment(&assignment_id, phase_id, subtask_id);

            let message = AgentMessage::with_payload(MessageType::TaskAssignment, &payload)
                .map_err(BusError::from)?;
            if let Err(e) = self.bus.broadcast_to_role(role, message).await {
                self.close_assignment(&assignment_id);
                return Err(e.into());
            }
            info!(
                task_id = %self.task_id(),
                subtask_id,
                assignment_id = %assignment_id,
                role = %role,
                attempt,
                "Subtask dispatched"
            );

            let deadline = self.roles.timeout_for(role) + self.policy.dispatch_grace();
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.close_assignment(&assignment_id);
                    return Err(OrchestratorError::Cancelled);
                }
                waited = tokio::time::timeout(deadline, outcome_rx) => match waited {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => SubtaskOutcome::Failed {
                        message: "assignment abandoned".to_string(),
                        code: codes::ORCHESTRATION_ERROR.to_string(),
                        recoverable: false,
                    },
                    Err(_) => {
                        self.abort_holder(&assignment_id).await;
                        SubtaskOutcome::Failed {
                            message: format!("no outcome within {}ms", deadline.as_millis()),
                            code: codes::DISPATCH_TIMEOUT.to_string(),
                            recoverable: true,
                        }
                    }
                },
            };
            self.close_assignment(&assignment_id);

            match outcome {
                SubtaskOutcome::Completed { agent_id, result } => {
                    self.complete_subtask(phase_id, subtask_id, &agent_id, result).await?;
                    return Ok(SubtaskReport::Completed);
                }
                SubtaskOutcome::Failed {
                    message,
                    code,
                    recoverable,
                } => {
                    let retry = recoverable && self.policy.auto_retry && attempt <= self.policy.max_retries;
                    warn!(
                        task_id = %self.task_id(),
                        subtask_id,
                        attempt,
                        code = %code,
                        recoverable,
                        retry,
                        error = %message,
                        "Subtask attempt failed"
                    );
                    if retry {
                        attempt += 1;
                        continue;
                    }
                    self.fail_subtask(phase_id, subtask_id, &message).await?;
                    return Ok(SubtaskReport::Failed(message));
                }
            }
        }
    }

    async fn prepare_assignment(
        &self,
        phase_id: &str,
        subtask_id: &str,
        attempt: u32,
    ) -> Result<(AssignmentPayload, AgentRole), OrchestratorError> {
        let objective: String = self.state.get("objective").await?.unwrap_or_default();
        let facts: Vec<String> = self.state.get("context.facts").await?.unwrap_or_default();

        let mut plan = self.plan.lock().await;
        let phase = plan
            .phase_mut(phase_id)
            .ok_or_else(|| OrchestratorError::UnknownPhase(phase_id.to_string()))?;
        let phase_title = phase.title.clone();
        let subtask = phase
            .subtasks
            .iter_mut()
            .find(|s| s.id == subtask_id)
            .ok_or_else(|| OrchestratorError::UnknownPhase(format!("{phase_id}/{subtask_id}")))?;
        subtask.attempts = attempt;
        subtask.status = SubtaskStatus::Pending;
        subtask.assigned_agent = None;

        let role = self.roles.role_for_title(&subtask.title);
        let payload = AssignmentPayload {
            assignment_id: Uuid::new_v4().to_string(),
            objective,
            phase_id: phase_id.to_string(),
            phase_title,
            subtask: subtask.clone(),
            attempt,
            facts,
        };
        self.state.set("plan", &*plan).await?;
        Ok((payload, role))
    }

    fn open_assignment(
        &self,
        assignment_id: &str,
        phase_id: &str,
        subtask_id: &str,
    ) -> oneshot::Receiver<SubtaskOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock_assignments().insert(
            assignment_id.to_string(),
            Assignment {
                phase_id: phase_id.to_string(),
                subtask_id: subtask_id.to_string(),
                holder: None,
                outcome: Some(tx),
            },
        );
        rx
    }

    fn close_assignment(&self, assignment_id: &str) {
        let closed = self.lock_assignments().remove(assignment_id);
        if let Some(holder) = closed.and_then(|a| a.holder) {
            if let Some(agent) = self.lock_agents().get_mut(&holder.agent_id) {
                if agent.assignment.as_deref() == Some(assignment_id) {
                    agent.assignment = None;
                }
            }
        }
    }

    /// Take an overdue assignment back from whoever holds it.
    async fn abort_holder(&self, assignment_id: &str) {
        let holder = self
            .lock_assignments()
            .get(assignment_id)
            .and_then(|a| a.holder.clone());
        let Some(holder) = holder else {
            return;
        };
        let interrupt = InterruptPayload {
            action: InterruptAction::Abort,
            reason: "dispatch deadline passed".to_string(),
            resource: Some(assignment_id.to_string()),
            holder: None,
            retry_after_ms: None,
        };
        match AgentMessage::with_payload(MessageType::Interrupt, &interrupt) {
            Ok(message) => {
                let message = message.priority(MessagePriority::Critical);
                if let Err(e) = self.bus.send_to_agent(&holder.agent_id, holder.role, message).await {
                    warn!(agent_id = %holder.agent_id, error = %e, "Failed to abort overdue holder");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode interrupt"),
        }
    }

    async fn complete_subtask(
        &self,
        phase_id: &str,
        subtask_id: &str,
        agent_id: &str,
        result: WorkerResult,
    ) -> Result<(), OrchestratorError> {
        for artifact in &result.artifacts {
            match self.state.add_artifact(artifact).await {
                Ok(_) => {}
                Err(StateError::ArtifactExists(id)) => {
                    warn!(artifact_id = %id, "Artifact already stored; kept the first")
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.add_tokens(result.metrics.tokens_used).await;

        let fact = {
            let mut plan = self.plan.lock().await;
            let subtask = plan
                .phase_mut(phase_id)
                .and_then(|p| p.subtasks.iter_mut().find(|s| s.id == subtask_id));
            let fact = match subtask {
                Some(subtask) => {
                    subtask.status = SubtaskStatus::Completed;
                    subtask.assigned_agent = Some(agent_id.to_string());
                    subtask.error = None;
                    let fact = fact_from(&subtask.title, &result.data);
                    subtask.result = Some(result.data);
                    fact
                }
                None => None,
            };
            self.state.set("plan", &*plan).await?;
            fact
        };
        if let Some(fact) = fact {
            if let Err(e) = self.state.append_to_list("context.facts", &fact).await {
                warn!(error = %e, "Failed to record fact");
            }
        }

        info!(
            task_id = %self.task_id(),
            subtask_id,
            agent_id,
            artifacts = result.artifacts.len(),
            tokens = result.metrics.tokens_used,
            "Subtask completed"
        );
        Ok(())
    }

    async fn fail_subtask(&self, phase_id: &str, subtask_id: &str, message: &str) -> Result<(), OrchestratorError> {
        let mut plan = self.plan.lock().await;
        if let Some(subtask) = plan
            .phase_mut(phase_id)
            .and_then(|p| p.subtasks.iter_mut().find(|s| s.id == subtask_id))
        {
            subtask.status = SubtaskStatus::Failed;
            subtask.error = Some(message.to_string());
        }
        self.state.set("plan", &*plan).await?;
        Ok(())
    }

    async fn add_tokens(&self, tokens: u64) {
        {
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.tokens_used += tokens;
            metrics.credits_used = metrics.tokens_used as f64 / 1000.0 * self.policy.credits_per_1k_tokens;
        }
        self.persist_metrics().await;
    }

    async fn persist_metrics(&self) {
        let metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Err(e) = self.state.set("metrics", &metrics).await {
            warn!(task_id = %self.task_id(), error = %e, "Failed to persist metrics");
        }
    }

    async fn finish(
        &self,
        status: TaskStatus,
        error: Option<TaskError>,
        started: tokio::time::Instant,
    ) -> RunSummary {
        let duration_ms = started.elapsed().as_millis() as u64;
        let metrics = {
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.completed_at = Some(Utc::now());
            metrics.total_duration_ms = Some(duration_ms);
            metrics.clone()
        };
        self.persist_metrics().await;

        if let Some(error) = &error {
            if let Err(e) = self.state.set("error", error).await {
                warn!(task_id = %self.task_id(), error = %e, "Failed to record task error");
            }
        }
        if let Err(e) = self.state.set_status(status).await {
            warn!(task_id = %self.task_id(), status = %status, error = %e, "Failed to record final status");
        }

        let plan = self.plan.lock().await;
        let summary = RunSummary {
            task_id: self.task_id().to_string(),
            status,
            phases_completed: plan
                .phases
                .iter()
                .filter(|p| p.status == PhaseStatus::Completed)
                .count(),
            phases_total: plan.phases.len(),
            tokens_used: metrics.tokens_used,
            credits_used: metrics.credits_used,
            duration_ms,
            error,
        };
        info!(
            task_id = %summary.task_id,
            status = %summary.status,
            phases_completed = summary.phases_completed,
            tokens = summary.tokens_used,
            duration_ms,
            "Task finished"
        );
        summary
    }

    /// Stop dispatching, interrupt every live agent and mark the task cancelled.
    pub async fn cancel(&self, reason: &str) -> Result<(), OrchestratorError> {
        self.cancel.cancel();

        let targets: Vec<(String, AgentRole)> = self
            .lock_agents()
            .values()
            .filter(|a| a.status != AgentActivity::Terminated)
            .map(|a| (a.id.clone(), a.role))
            .collect();
        let interrupt = AgentMessage::with_payload(MessageType::Interrupt, &InterruptPayload::cancel(reason))
            .map_err(BusError::from)?
            .priority(MessagePriority::Critical);
        for (agent_id, role) in targets {
            if let Err(e) = self.bus.send_to_agent(&agent_id, role, interrupt.clone()).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to interrupt agent");
            }
            if let Some(agent) = self.lock_agents().get_mut(&agent_id) {
                agent.status = AgentActivity::Terminated;
                agent.assignment = None;
            }
        }

        self.state.set_status(TaskStatus::Cancelled).await?;
        info!(task_id = %self.task_id(), reason, "Task cancelled");
        Ok(())
    }

    // =========================================================================
    // Message handlers
    // =========================================================================

    async fn handle_claim(&self, message: AgentMessage) -> anyhow::Result<()> {
        let claim: ClaimRequest = message.payload_as()?;
        let decision = self.arbitrate_claim(&claim).await;
        debug!(
            assignment_id = %claim.assignment_id,
            agent_id = %claim.agent_id,
            granted = decision.granted,
            "Claim decided"
        );
        self.bus
            .reply(&message, AgentMessage::with_payload(MessageType::TaskClaim, &decision)?)
            .await?;
        Ok(())
    }

    async fn arbitrate_claim(&self, claim: &ClaimRequest) -> ClaimDecision {
        let now = Utc::now();
        let check = {
            let mut assignments = self.lock_assignments();
            match assignments.get_mut(&claim.assignment_id) {
                None => ClaimCheck::Closed(None),
                Some(assignment) if assignment.outcome.is_none() => {
                    ClaimCheck::Closed(assignment.holder.as_ref().map(|h| h.agent_id.clone()))
                }
                Some(assignment) => match assignment.holder.clone() {
                    None => {
                        assignment.holder = Some(Holder {
                            agent_id: claim.agent_id.clone(),
                            role: claim.role,
                            granted_at: now,
                        });
                        ClaimCheck::Granted {
                            phase_id: assignment.phase_id.clone(),
                            subtask_id: assignment.subtask_id.clone(),
                        }
                    }
                    Some(holder) if holder.agent_id == claim.agent_id => ClaimCheck::Repeat,
                    Some(holder) => ClaimCheck::Contested(holder),
                },
            }
        };

        match check {
            ClaimCheck::Granted { phase_id, subtask_id } => {
                {
                    let mut agents = self.lock_agents();
                    let agent = agents
                        .entry(claim.agent_id.clone())
                        .or_insert_with(|| ActiveAgent::new(&claim.agent_id, claim.role));
                    agent.status = AgentActivity::Busy;
                    agent.assignment = Some(claim.assignment_id.clone());
                }
                self.mark_claimed(&phase_id, &subtask_id, &claim.agent_id).await;
                ClaimDecision::granted()
            }
            ClaimCheck::Repeat => ClaimDecision::granted(),
            ClaimCheck::Closed(holder) => ClaimDecision::denied(holder),
            ClaimCheck::Contested(holder) => {
                // Claims are ordered by arrival here, so the holder always wins
                let late = now.max(holder.granted_at + chrono::Duration::milliseconds(1));
                let event = ConflictEvent::new(
                    ConflictType::TaskOverlap,
                    claim.assignment_id.clone(),
                    vec![
                        Contender::new(&holder.agent_id, holder.role).at(holder.granted_at),
                        Contender::new(&claim.agent_id, claim.role).at(late),
                    ],
                );
                if let Err(e) = self.resolver.resolve(event).await {
                    warn!(assignment_id = %claim.assignment_id, error = %e, "Claim overlap unresolved");
                }
                ClaimDecision::denied(Some(holder.agent_id))
            }
        }
    }

    async fn mark_claimed(&self, phase_id: &str, subtask_id: &str, agent_id: &str) {
        let mut plan = self.plan.lock().await;
        if let Some(subtask) = plan
            .phase_mut(phase_id)
            .and_then(|p| p.subtasks.iter_mut().find(|s| s.id == subtask_id))
        {
            subtask.status = SubtaskStatus::InProgress;
            subtask.assigned_agent = Some(agent_id.to_string());
        }
        if let Err(e) = self.state.set("plan", &*plan).await {
            warn!(subtask_id, error = %e, "Failed to persist claim");
        }
    }

    fn handle_task_result(&self, message: AgentMessage) -> anyhow::Result<()> {
        let payload: TaskResultPayload = message.payload_as()?;
        self.settle(
            &payload.assignment_id,
            &payload.agent_id,
            SubtaskOutcome::Completed {
                agent_id: payload.agent_id.clone(),
                result: payload.result,
            },
        );
        Ok(())
    }

    fn handle_agent_error(&self, message: AgentMessage) -> anyhow::Result<()> {
        let payload: TaskErrorPayload = message.payload_as()?;
        self.settle(
            &payload.assignment_id,
            &payload.agent_id,
            SubtaskOutcome::Failed {
                message: payload.message,
                code: payload.code,
                recoverable: payload.recoverable,
            },
        );
        Ok(())
    }

    /// Hand a worker's outcome to the waiting dispatcher. Reports from
    /// anyone but the holder are ignored.
    fn settle(&self, assignment_id: &str, agent_id: &str, outcome: SubtaskOutcome) {
        let sender = {
            let mut assignments = self.lock_assignments();
            match assignments.get_mut(assignment_id) {
                Some(assignment)
                    if assignment.holder.as_ref().map(|h| h.agent_id.as_str()) == Some(agent_id) =>
                {
                    assignment.outcome.take()
                }
                _ => None,
            }
        };
        if let Some(agent) = self.lock_agents().get_mut(agent_id) {
            agent.assignment = None;
            agent.status = AgentActivity::Idle;
        }
        match sender {
            Some(sender) => {
                let _ = sender.send(outcome);
            }
            None => debug!(assignment_id, agent_id, "Outcome for unknown or settled assignment ignored"),
        }
    }

    fn handle_heartbeat(&self, message: AgentMessage) -> anyhow::Result<()> {
        let heartbeat: HeartbeatPayload = message.payload_as()?;
        self.note_heartbeat(&heartbeat, message.timestamp);
        Ok(())
    }

    fn note_heartbeat(&self, heartbeat: &HeartbeatPayload, at: DateTime<Utc>) {
        let mut agents = self.lock_agents();
        let agent = agents
            .entry(heartbeat.agent_id.clone())
            .or_insert_with(|| ActiveAgent::new(&heartbeat.agent_id, heartbeat.role));
        if agent.status != AgentActivity::Terminated {
            agent.status = heartbeat.status;
        }
        agent.last_heartbeat = at;
    }

    fn handle_progress(&self, message: AgentMessage) -> anyhow::Result<()> {
        let progress: ProgressPayload = message.payload_as()?;
        debug!(
            agent_id = %progress.agent_id,
            subtask_id = %progress.subtask_id,
            progress = %progress.message,
            "Progress"
        );
        let mut agents = self.lock_agents();
        let agent = agents
            .entry(progress.agent_id.clone())
            .or_insert_with(|| ActiveAgent::new(&progress.agent_id, message.sender_role));
        agent.last_progress = Some(progress.message);
        agent.last_heartbeat = message.timestamp;
        Ok(())
    }

    /// Answer a resolver that could not settle a conflict by policy.
    async fn handle_escalation(&self, message: AgentMessage) -> anyhow::Result<()> {
        let request: EscalationRequest = message.payload_as()?;
        let Some(winner) = request.conflict.highest_priority(self.resolver.policy()) else {
            warn!(conflict_id = %request.conflict.id, "Escalated conflict has no contenders");
            return Ok(());
        };
        info!(
            conflict_id = %request.conflict.id,
            resource = %request.conflict.resource,
            winner = %winner.agent_id,
            "Escalation decided"
        );
        let decision = EscalationDecision {
            winner: winner.agent_id.clone(),
        };
        self.bus
            .reply(
                &message,
                AgentMessage::with_payload(MessageType::ConflictEscalation, &decision)?
                    .priority(MessagePriority::High),
            )
            .await?;
        Ok(())
    }
}

/// One-line summary of a subtask result for later subtasks.
fn fact_from(title: &str, data: &Value) -> Option<String> {
    let text = ["summary", "analysis", "explanation", "content"]
        .iter()
        .find_map(|key| data.get(*key).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())?;
    let mut fact = format!("{title}: {}", text.trim());
    if fact.len() > MAX_FACT_LEN {
        let mut end = MAX_FACT_LEN;
        while !fact.is_char_boundary(end) {
            end -= 1;
        }
        fact.truncate(end);
        fact.push('…');
    }
    Some(fact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::conflict::ResolutionStrategy;
    use coordination::messaging::InMemoryTransport;
    use coordination::state::InMemoryTaskStore;
    use coordination::{
        BusConfig, MessageBus, Phase, Recipient, SharedStateManager, SharedTransport, StateConfig,
        Subtask, TaskSeed,
    };

    fn quiet() -> BusConfig {
        BusConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        }
    }

    async fn orchestrator(transport: &SharedTransport) -> SharedOrchestrator {
        let store = InMemoryTaskStore::new().shared();
        let bus = MessageBus::new("orch", AgentRole::Orchestrator, "task-1", transport.clone(), quiet()).shared();
        let state = SharedStateManager::new("task-1", "orch", store, transport.clone(), StateConfig::default())
            .shared();
        state
            .initialize(TaskSeed::new("user-1", "Compare the latest vector databases"))
            .await
            .unwrap();
        let orchestrator = Orchestrator::new(
            bus,
            state,
            RoleTable::default(),
            OrchestratorPolicy::default(),
            ConflictPolicy::default(),
        )
        .shared();
        orchestrator.start().await.unwrap();
        orchestrator
    }

    async fn peer(transport: &SharedTransport, id: &str, role: AgentRole) -> SharedMessageBus {
        let bus = MessageBus::new(id, role, "task-1", transport.clone(), quiet()).shared();
        bus.initialize().await.unwrap();
        bus
    }

    fn claim(agent_id: &str) -> AgentMessage {
        AgentMessage::with_payload(
            MessageType::TaskClaim,
            &ClaimRequest {
                assignment_id: "a1".into(),
                subtask_id: "s1".into(),
                agent_id: agent_id.into(),
                role: AgentRole::Coder,
                claimed_at: Utc::now(),
            },
        )
        .unwrap()
    }

    fn to_orchestrator() -> Recipient {
        Recipient::Agent {
            id: "orch".into(),
            role: AgentRole::Orchestrator,
        }
    }

    #[tokio::test]
    async fn test_create_plan_publishes_plan() {
        let transport: SharedTransport = InMemoryTransport::new().shared();
        let orchestrator = orchestrator(&transport).await;

        let plan = orchestrator
            .create_plan("Compare the latest vector databases")
            .await
            .unwrap();
        assert_eq!(plan.phases.last().map(|p| p.id.as_str()), Some(planner::REVIEW_PHASE));

        let state = orchestrator.state();
        assert_eq!(state.status().await.unwrap(), TaskStatus::Planning);
        let stored: Plan = state.get("plan").await.unwrap().unwrap();
        assert_eq!(stored, plan);
    }

    #[tokio::test]
    async fn test_execute_without_plan_is_rejected() {
        let transport: SharedTransport = InMemoryTransport::new().shared();
        let orchestrator = orchestrator(&transport).await;
        assert!(matches!(orchestrator.execute().await, Err(OrchestratorError::NoPlan)));
    }

    #[tokio::test]
    async fn test_first_claim_wins_and_late_claimant_is_aborted() {
        let transport: SharedTransport = InMemoryTransport::new().shared();
        let orchestrator = orchestrator(&transport).await;
        orchestrator
            .use_plan(Plan::new(vec![Phase::new("execution", "Execution", "")
                .with_subtask(Subtask::new("s1", "Implement parser", ""))]))
            .await
            .unwrap();
        let _outcome = orchestrator.open_assignment("a1", "execution", "s1");

        let first = peer(&transport, "coder-1", AgentRole::Coder).await;
        let second = peer(&transport, "coder-2", AgentRole::Coder).await;
        let interrupts = Arc::new(Mutex::new(Vec::<InterruptPayload>::new()));
        let sink = Arc::clone(&interrupts);
        let _h = second.on_message(MessageType::Interrupt, move |message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(message.payload_as()?);
                Ok(())
            }
        });

        let reply = first
            .request(to_orchestrator(), claim("coder-1"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reply.payload_as::<ClaimDecision>().unwrap().granted);

        let reply = second
            .request(to_orchestrator(), claim("coder-2"), Duration::from_secs(1))
            .await
            .unwrap();
        let decision: ClaimDecision = reply.payload_as().unwrap();
        assert!(!decision.granted);
        assert_eq!(decision.holder.as_deref(), Some("coder-1"));

        for _ in 0..100 {
            if !interrupts.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let interrupt = interrupts.lock().unwrap()[0].clone();
        assert_eq!(interrupt.action, InterruptAction::Abort);
        assert_eq!(interrupt.resource.as_deref(), Some("a1"));
        assert_eq!(interrupt.holder.as_deref(), Some("coder-1"));

        let resolution = orchestrator.resolver().history().pop().unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::FirstClaim);
        assert_eq!(resolution.winner.as_deref(), Some("coder-1"));

        let plan = orchestrator.plan().await;
        let subtask = &plan.phases[0].subtasks[0];
        assert_eq!(subtask.status, SubtaskStatus::InProgress);
        assert_eq!(subtask.assigned_agent.as_deref(), Some("coder-1"));
        assert_eq!(
            orchestrator.active_agents()[0].assignment.as_deref(),
            Some("a1")
        );
    }

    #[tokio::test]
    async fn test_claim_for_unknown_assignment_is_denied() {
        let transport: SharedTransport = InMemoryTransport::new().shared();
        let _orchestrator = orchestrator(&transport).await;
        let coder = peer(&transport, "coder-1", AgentRole::Coder).await;

        let reply = coder
            .request(to_orchestrator(), claim("coder-1"), Duration::from_secs(1))
            .await
            .unwrap();
        let decision: ClaimDecision = reply.payload_as().unwrap();
        assert_eq!(decision, ClaimDecision::denied(None));
    }

    #[tokio::test]
    async fn test_escalation_answered_by_role_priority() {
        let transport: SharedTransport = InMemoryTransport::new().shared();
        let _orchestrator = orchestrator(&transport).await;
        let researcher = peer(&transport, "researcher-1", AgentRole::Researcher).await;

        let now = Utc::now();
        let conflict = ConflictEvent::new(
            ConflictType::Undecidable,
            "report-draft",
            vec![
                Contender::new("researcher-1", AgentRole::Researcher).at(now - chrono::Duration::seconds(5)),
                Contender::new("reviewer-1", AgentRole::Reviewer).at(now),
            ],
        );
        let request = AgentMessage::with_payload(MessageType::ConflictEscalation, &EscalationRequest { conflict })
            .unwrap();
        let reply = researcher
            .request(Recipient::Role(AgentRole::Orchestrator), request, Duration::from_secs(1))
            .await
            .unwrap();
        let decision: EscalationDecision = reply.payload_as().unwrap();
        assert_eq!(decision.winner, "reviewer-1");
    }

    #[tokio::test]
    async fn test_stale_agents_are_reported_not_evicted() {
        let transport: SharedTransport = InMemoryTransport::new().shared();
        let orchestrator = orchestrator(&transport).await;
        let beat = |id: &str| HeartbeatPayload {
            agent_id: id.into(),
            role: AgentRole::Coder,
            status: AgentActivity::Idle,
            queue_depth: 0,
        };
        orchestrator.note_heartbeat(&beat("coder-old"), Utc::now() - chrono::Duration::minutes(10));
        orchestrator.note_heartbeat(&beat("coder-new"), Utc::now());

        assert_eq!(orchestrator.stale_agents(Duration::from_secs(60)), vec!["coder-old"]);
        assert_eq!(orchestrator.active_agents().len(), 2);
    }

    #[test]
    fn test_fact_from_result_is_bounded() {
        let data = serde_json::json!({"summary": "x".repeat(1_000)});
        let fact = fact_from("Search", &data).unwrap();
        assert!(fact.starts_with("Search: x"));
        assert!(fact.chars().count() <= MAX_FACT_LEN + 1);
        assert!(fact_from("Search", &serde_json::json!({"files": []})).is_none());
    }
}
