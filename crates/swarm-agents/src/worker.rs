//! Worker agent lifecycle.
//!
//! ```text
//! idle ──assignment──▶ waiting ──claim granted──▶ busy ──done──▶ idle
//!                         │                         ├──timeout──▶ error      (absorbing)
//!                         └──claim denied──▶ idle   └──interrupt─▶ terminated (absorbing)
//! ```
//!
//! Execution runs on its own tokio task so the bus keeps dispatching while
//! a subtask is in flight. That is what lets an agent drop a second
//! assignment while busy and honor an interrupt mid-execution. The
//! one-subtask-at-a-time guarantee holds inside this process only.

use std::sync::{Arc, LazyLock, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use coordination::messaging::{InterruptAction, InterruptPayload};
use coordination::state::{AgentMetrics, AgentStatus};
use coordination::{
    AgentActivity, AgentMessage, AgentRole, BusError, MessagePriority, MessageType, Recipient,
    SharedMessageBus, SharedStateHandle, StateChange, StateError, TaskStatus, Unsubscribe,
};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{SharedExecutor, WorkerResult};
use crate::inference::{InferenceError, SharedInferenceClient};
use crate::protocol::{
    codes, AssignmentPayload, ClaimDecision, ClaimRequest, ProgressPayload, TaskErrorPayload,
    TaskResultPayload,
};

/// Error text that marks a failure as worth retrying.
static RECOVERABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(network|timed? ?out|rate.?limit|too many requests|connection (reset|refused|closed)|econnreset|socket hang up|temporarily unavailable|service unavailable|bad gateway|\b5\d\d\b)",
    )
    .expect("recoverable pattern is valid")
});

/// Whether a free-form error message describes a transient failure.
pub fn is_recoverable_message(message: &str) -> bool {
    RECOVERABLE_PATTERN.is_match(message)
}

/// Typed classification first, then the message text.
pub fn is_recoverable(err: &InferenceError) -> bool {
    err.is_recoverable() || is_recoverable_message(&err.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Worker {0} is terminated")]
    Terminated(String),
}

pub type WorkerResultOf<T> = Result<T, WorkerError>;

/// Shared reference to a worker.
pub type SharedWorker = Arc<WorkerAgent>;

struct InFlight {
    assignment_id: String,
    cancel: CancellationToken,
}

struct WorkerInner {
    status: AgentActivity,
    current: Option<InFlight>,
    record: AgentStatus,
}

/// Who sent an assignment; claims and reports go back there.
#[derive(Debug, Clone)]
struct Dispatcher {
    id: String,
    role: AgentRole,
}

enum Outcome {
    Finished(WorkerResult),
    Failed(InferenceError),
    TimedOut,
    Interrupted,
}

pub struct WorkerAgent {
    id: String,
    role: AgentRole,
    bus: SharedMessageBus,
    state: SharedStateHandle,
    executor: SharedExecutor,
    client: SharedInferenceClient,
    timeout: Duration,
    claim_timeout: Duration,
    inner: Mutex<WorkerInner>,
    shutdown: CancellationToken,
    subscriptions: Mutex<Vec<Unsubscribe>>,
}

impl WorkerAgent {
    /// Identity comes from the bus; `timeout` is the per-subtask deadline.
    pub fn new(
        bus: SharedMessageBus,
        state: SharedStateHandle,
        executor: SharedExecutor,
        client: SharedInferenceClient,
        timeout: Duration,
    ) -> Self {
        let id = bus.agent_id().to_string();
        let role = bus.role();
        let record = AgentStatus::new(id.clone(), role);
        Self {
            id,
            role,
            bus,
            state,
            executor,
            client,
            timeout,
            claim_timeout: Duration::from_secs(5),
            inner: Mutex::new(WorkerInner {
                status: AgentActivity::Idle,
                current: None,
                record,
            }),
            shutdown: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn shared(self) -> SharedWorker {
        Arc::new(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn bus(&self) -> &SharedMessageBus {
        &self.bus
    }

    pub fn status(&self) -> AgentActivity {
        self.lock().status
    }

    /// Assignment currently claimed or executing.
    pub fn current_assignment(&self) -> Option<String> {
        self.lock().current.as_ref().map(|c| c.assignment_id.clone())
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.lock().record.metrics.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register handlers, join the bus and publish the agent record.
    pub async fn start(self: &Arc<Self>) -> WorkerResultOf<()> {
        if self.status() == AgentActivity::Terminated {
            return Err(WorkerError::Terminated(self.id.clone()));
        }

        let weak = Arc::downgrade(self);
        let assignments = self.bus.on_message(MessageType::TaskAssignment, move |message| {
            let worker = Weak::clone(&weak);
            async move {
                if let Some(worker) = worker.upgrade() {
                    worker.handle_assignment(message)?;
                }
                Ok(())
            }
        });
        let weak = Arc::downgrade(self);
        let interrupts = self.bus.on_message(MessageType::Interrupt, move |message| {
            let worker = Weak::clone(&weak);
            async move {
                if let Some(worker) = worker.upgrade() {
                    worker.handle_interrupt(message.payload_as()?);
                }
                Ok(())
            }
        });
        let weak = Arc::downgrade(self);
        let updates = self.state.on_state_change(move |change| {
            let worker = Weak::clone(&weak);
            async move {
                if let Some(worker) = worker.upgrade() {
                    worker.on_state_update(&change);
                }
                Ok(())
            }
        });
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([assignments, interrupts, updates]);

        self.bus.initialize().await?;
        self.set_activity(AgentActivity::Idle, None);
        self.persist_record().await;

        info!(agent_id = %self.id, role = %self.role, "Worker started");
        Ok(())
    }

    /// Stop accepting work, cancel anything in flight and leave the bus.
    pub async fn stop(&self) {
        self.terminate("worker stopped");
        for handle in self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.unsubscribe();
        }
        self.bus.shutdown().await;
        self.persist_record().await;
    }

    fn terminate(&self, reason: &str) {
        let in_flight = {
            let mut inner = self.lock();
            inner.status = AgentActivity::Terminated;
            inner.record.status = AgentActivity::Terminated;
            inner.record.current_task = None;
            inner.current.take()
        };
        if let Some(in_flight) = in_flight {
            in_flight.cancel.cancel();
        }
        self.shutdown.cancel();
        self.bus.set_status(AgentActivity::Terminated);
        info!(agent_id = %self.id, reason, "Worker terminated");
    }

    // =========================================================================
    // Incoming messages
    // =========================================================================

    fn handle_assignment(self: &Arc<Self>, message: AgentMessage) -> anyhow::Result<()> {
        let payload: AssignmentPayload = message.payload_as()?;
        let cancel = self.shutdown.child_token();
        {
            let mut inner = self.lock();
            if inner.status != AgentActivity::Idle {
                debug!(
                    agent_id = %self.id,
                    assignment_id = %payload.assignment_id,
                    status = %inner.status,
                    "Not idle; assignment dropped"
                );
                return Ok(());
            }
            inner.status = AgentActivity::Waiting;
            inner.record.status = AgentActivity::Waiting;
            inner.current = Some(InFlight {
                assignment_id: payload.assignment_id.clone(),
                cancel: cancel.clone(),
            });
        }
        self.bus.set_status(AgentActivity::Waiting);

        let dispatcher = Dispatcher {
            id: message.sender_id.clone(),
            role: message.sender_role,
        };
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run_assignment(dispatcher, payload, cancel).await });
        Ok(())
    }

    fn handle_interrupt(self: &Arc<Self>, interrupt: InterruptPayload) {
        match interrupt.action {
            InterruptAction::Cancel => {
                self.terminate(&interrupt.reason);
                // Shutting down from inside a handler would abort this very task
                let bus = Arc::clone(&self.bus);
                tokio::spawn(async move { bus.shutdown().await });
            }
            InterruptAction::Abort => {
                let aborted = {
                    let mut inner = self.lock();
                    let matches = inner
                        .current
                        .as_ref()
                        .is_some_and(|c| Some(&c.assignment_id) == interrupt.resource.as_ref());
                    if matches && inner.status != AgentActivity::Terminated {
                        inner.status = AgentActivity::Idle;
                        inner.record.status = AgentActivity::Idle;
                        inner.record.current_task = None;
                        inner.current.take()
                    } else {
                        None
                    }
                };
                if let Some(in_flight) = aborted {
                    in_flight.cancel.cancel();
                    self.bus.set_status(AgentActivity::Idle);
                    info!(
                        agent_id = %self.id,
                        assignment_id = %in_flight.assignment_id,
                        holder = ?interrupt.holder,
                        "Assignment aborted"
                    );
                }
            }
            InterruptAction::Wait => {
                let backoff = Duration::from_millis(interrupt.retry_after_ms.unwrap_or(0));
                {
                    let mut inner = self.lock();
                    if inner.status != AgentActivity::Idle {
                        return;
                    }
                    inner.status = AgentActivity::Waiting;
                    inner.record.status = AgentActivity::Waiting;
                }
                self.bus.set_status(AgentActivity::Waiting);
                let worker = Arc::clone(self);
                tokio::spawn(async move {
                    worker.persist_record().await;
                    tokio::time::sleep(backoff).await;
                    let resumed = {
                        let mut inner = worker.lock();
                        if inner.status == AgentActivity::Waiting && inner.current.is_none() {
                            inner.status = AgentActivity::Idle;
                            inner.record.status = AgentActivity::Idle;
                            true
                        } else {
                            false
                        }
                    };
                    if resumed {
                        worker.bus.set_status(AgentActivity::Idle);
                        worker.persist_record().await;
                    }
                });
            }
        }
    }

    /// Peer writes to shared state. Cancellation also arrives here when the
    /// interrupt was lost.
    fn on_state_update(self: &Arc<Self>, change: &StateChange) {
        if change.changed_by == self.id {
            return;
        }
        debug!(agent_id = %self.id, path = %change.path, by = %change.changed_by, "State update received");
        let cancelled = change.path == "status"
            && serde_json::from_value::<TaskStatus>(change.value.clone()).ok() == Some(TaskStatus::Cancelled);
        if cancelled && self.status() != AgentActivity::Terminated {
            self.terminate("task cancelled");
            let bus = Arc::clone(&self.bus);
            tokio::spawn(async move { bus.shutdown().await });
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn run_assignment(
        self: Arc<Self>,
        dispatcher: Dispatcher,
        payload: AssignmentPayload,
        cancel: CancellationToken,
    ) {
        match self.claim(&dispatcher, &payload).await {
            Ok(true) => {}
            Ok(false) => {
                info!(agent_id = %self.id, assignment_id = %payload.assignment_id, "Claim denied");
                self.settle(&payload.assignment_id, AgentActivity::Idle);
                return;
            }
            Err(e) => {
                warn!(agent_id = %self.id, assignment_id = %payload.assignment_id, error = %e, "Claim failed");
                self.settle(&payload.assignment_id, AgentActivity::Idle);
                return;
            }
        }
        if !self.begin(&payload.assignment_id, &payload.subtask.id) {
            debug!(agent_id = %self.id, assignment_id = %payload.assignment_id, "Assignment withdrawn before start");
            return;
        }
        self.persist_record().await;
        self.report_progress(&dispatcher, &payload, "started").await;

        let ctx = payload.context(self.bus.task_id(), &self.id);
        let started = tokio::time::Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Interrupted,
            run = tokio::time::timeout(self.timeout, self.executor.execute(&ctx, self.client.as_ref())) => match run {
                Err(_) => Outcome::TimedOut,
                Ok(Ok(result)) => Outcome::Finished(result),
                Ok(Err(e)) => Outcome::Failed(e),
            },
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Interrupted => {
                debug!(agent_id = %self.id, assignment_id = %payload.assignment_id, "Execution interrupted");
            }
            Outcome::Finished(mut result) if result.success => {
                result.metrics.duration_ms = duration_ms;
                self.report_result(&dispatcher, &payload, result).await;
                self.record_metrics(true, duration_ms);
                self.settle(&payload.assignment_id, AgentActivity::Idle);
            }
            Outcome::Finished(result) => {
                let message = result
                    .error
                    .unwrap_or_else(|| "executor reported failure".to_string());
                let recoverable = is_recoverable_message(&message);
                self.report_error(&dispatcher, &payload, message, codes::EXECUTION_FAILED, recoverable)
                    .await;
                self.record_metrics(false, duration_ms);
                self.settle(&payload.assignment_id, AgentActivity::Idle);
            }
            Outcome::Failed(e) => {
                let recoverable = is_recoverable(&e);
                self.report_error(&dispatcher, &payload, e.to_string(), codes::INFERENCE_FAILED, recoverable)
                    .await;
                self.record_metrics(false, duration_ms);
                self.settle(&payload.assignment_id, AgentActivity::Idle);
            }
            Outcome::TimedOut => {
                let message = format!("subtask exceeded the {}ms deadline", self.timeout.as_millis());
                warn!(agent_id = %self.id, assignment_id = %payload.assignment_id, "{}", message);
                self.report_error(&dispatcher, &payload, message, codes::TIMEOUT, true)
                    .await;
                self.record_metrics(false, duration_ms);
                self.settle(&payload.assignment_id, AgentActivity::Error);
            }
        }
        self.persist_record().await;
    }

    async fn claim(&self, dispatcher: &Dispatcher, payload: &AssignmentPayload) -> WorkerResultOf<bool> {
        let request = AgentMessage::with_payload(
            MessageType::TaskClaim,
            &ClaimRequest {
                assignment_id: payload.assignment_id.clone(),
                subtask_id: payload.subtask.id.clone(),
                agent_id: self.id.clone(),
                role: self.role,
                claimed_at: Utc::now(),
            },
        )
        .map_err(BusError::from)?
        .priority(MessagePriority::High);

        let reply = self
            .bus
            .request(
                Recipient::Agent {
                    id: dispatcher.id.clone(),
                    role: dispatcher.role,
                },
                request,
                self.claim_timeout,
            )
            .await?;
        let decision: ClaimDecision = reply.payload_as().map_err(BusError::from)?;
        Ok(decision.granted)
    }

    /// Leave the assignment, unless an interrupt already took it away.
    fn settle(&self, assignment_id: &str, next: AgentActivity) {
        let changed = {
            let mut inner = self.lock();
            let ours = inner
                .current
                .as_ref()
                .is_some_and(|c| c.assignment_id == assignment_id);
            if !ours || inner.status == AgentActivity::Terminated {
                false
            } else {
                inner.current = None;
                inner.status = next;
                inner.record.status = next;
                inner.record.current_task = None;
                true
            }
        };
        if changed {
            self.bus.set_status(next);
        }
    }

    /// Go Busy on the claimed assignment. Checked under the same lock the
    /// abort path takes, so an interrupt cannot slip in between.
    fn begin(&self, assignment_id: &str, subtask_id: &str) -> bool {
        {
            let mut inner = self.lock();
            let ours = inner
                .current
                .as_ref()
                .is_some_and(|c| c.assignment_id == assignment_id && !c.cancel.is_cancelled());
            if !ours || inner.status == AgentActivity::Terminated {
                return false;
            }
            inner.status = AgentActivity::Busy;
            inner.record.status = AgentActivity::Busy;
            inner.record.current_task = Some(subtask_id.to_string());
            inner.record.last_heartbeat = Utc::now();
        }
        self.bus.set_status(AgentActivity::Busy);
        true
    }

    fn set_activity(&self, status: AgentActivity, current_task: Option<String>) {
        {
            let mut inner = self.lock();
            if inner.status == AgentActivity::Terminated {
                return;
            }
            inner.status = status;
            inner.record.status = status;
            inner.record.current_task = current_task;
            inner.record.last_heartbeat = Utc::now();
        }
        self.bus.set_status(status);
    }

    fn record_metrics(&self, success: bool, duration_ms: u64) {
        self.lock().record.metrics.record(success, duration_ms);
    }

    /// Best effort; a failed write is logged and dropped.
    async fn persist_record(&self) {
        let record = {
            let mut inner = self.lock();
            inner.record.last_heartbeat = Utc::now();
            inner.record.clone()
        };
        if let Err(e) = self.state.upsert_agent(&record).await {
            warn!(agent_id = %self.id, error = %e, "Failed to persist agent record");
        }
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    async fn send(&self, dispatcher: &Dispatcher, message: Result<AgentMessage, serde_json::Error>) {
        let outcome = match message {
            Ok(message) => self
                .bus
                .send_to_agent(&dispatcher.id, dispatcher.role, message)
                .await
                .map(|_| ()),
            Err(e) => Err(BusError::from(e)),
        };
        if let Err(e) = outcome {
            warn!(agent_id = %self.id, error = %e, "Failed to report to dispatcher");
        }
    }

    async fn report_result(&self, dispatcher: &Dispatcher, payload: &AssignmentPayload, result: WorkerResult) {
        info!(
            agent_id = %self.id,
            assignment_id = %payload.assignment_id,
            duration_ms = result.metrics.duration_ms,
            tokens = result.metrics.tokens_used,
            "Subtask completed"
        );
        let message = AgentMessage::with_payload(
            MessageType::TaskResult,
            &TaskResultPayload {
                assignment_id: payload.assignment_id.clone(),
                subtask_id: payload.subtask.id.clone(),
                agent_id: self.id.clone(),
                result,
            },
        );
        self.send(dispatcher, message).await;
    }

    async fn report_error(
        &self,
        dispatcher: &Dispatcher,
        payload: &AssignmentPayload,
        message: String,
        code: &str,
        recoverable: bool,
    ) {
        warn!(
            agent_id = %self.id,
            assignment_id = %payload.assignment_id,
            code,
            recoverable,
            error = %message,
            "Subtask failed"
        );
        let message = AgentMessage::with_payload(
            MessageType::Error,
            &TaskErrorPayload {
                assignment_id: payload.assignment_id.clone(),
                subtask_id: payload.subtask.id.clone(),
                agent_id: self.id.clone(),
                message,
                code: code.to_string(),
                recoverable,
            },
        )
        .map(|m| m.priority(MessagePriority::High));
        self.send(dispatcher, message).await;
    }

    async fn report_progress(&self, dispatcher: &Dispatcher, payload: &AssignmentPayload, note: &str) {
        let message = AgentMessage::with_payload(
            MessageType::Progress,
            &ProgressPayload {
                assignment_id: payload.assignment_id.clone(),
                subtask_id: payload.subtask.id.clone(),
                agent_id: self.id.clone(),
                message: note.to_string(),
            },
        )
        .map(|m| m.priority(MessagePriority::Low));
        self.send(dispatcher, message).await;
    }
}

impl Drop for WorkerAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use coordination::messaging::InMemoryTransport;
    use coordination::state::{InMemoryTaskStore, TaskRecordStore};
    use coordination::{
        BusConfig, MessageBus, SharedStateManager, SharedTaskStore, SharedTransport, StateConfig,
        Subtask, TaskSeed,
    };
    use serde_json::json;

    use crate::agents::ExecutorRegistry;
    use crate::inference::{
        InferenceClient, InferenceRequest, InferenceResponse, MockInferenceClient,
    };

    fn quiet() -> BusConfig {
        BusConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        }
    }

    struct Harness {
        transport: SharedTransport,
        store: SharedTaskStore,
        orchestrator: SharedMessageBus,
        reports: Arc<Mutex<Vec<AgentMessage>>>,
    }

    async fn harness(grant: bool) -> Harness {
        harness_with(grant, false).await
    }

    /// An orchestrator stand-in that answers claims and records reports.
    /// With `abort_first` it withdraws each assignment before granting it.
    async fn harness_with(grant: bool, abort_first: bool) -> Harness {
        let transport: SharedTransport = InMemoryTransport::new().shared();
        let store = InMemoryTaskStore::new().shared();
        let orchestrator =
            MessageBus::new("orch", AgentRole::Orchestrator, "task-1", transport.clone(), quiet()).shared();

        let replier = Arc::clone(&orchestrator);
        let _claims = orchestrator.on_message(MessageType::TaskClaim, move |message| {
            let replier = Arc::clone(&replier);
            async move {
                if abort_first {
                    let claim: ClaimRequest = message.payload_as()?;
                    let abort = InterruptPayload {
                        action: InterruptAction::Abort,
                        reason: "withdrawn".into(),
                        resource: Some(claim.assignment_id),
                        holder: None,
                        retry_after_ms: None,
                    };
                    replier
                        .send_to_agent(
                            &message.sender_id,
                            AgentRole::Coder,
                            AgentMessage::with_payload(MessageType::Interrupt, &abort)?
                                .priority(MessagePriority::Critical),
                        )
                        .await?;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                let decision = if grant {
                    ClaimDecision::granted()
                } else {
                    ClaimDecision::denied(Some("someone-else".into()))
                };
                replier
                    .reply(&message, AgentMessage::with_payload(MessageType::TaskClaim, &decision)?)
                    .await?;
                Ok(())
            }
        });
        let reports = Arc::new(Mutex::new(Vec::new()));
        for message_type in [MessageType::TaskResult, MessageType::Error] {
            let sink = Arc::clone(&reports);
            let _h = orchestrator.on_message(message_type, move |message| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(message);
                    Ok(())
                }
            });
        }
        orchestrator.initialize().await.unwrap();

        Harness {
            transport,
            store,
            orchestrator,
            reports,
        }
    }

    async fn worker(h: &Harness, client: SharedInferenceClient, timeout: Duration) -> SharedWorker {
        let bus = MessageBus::new("coder-1", AgentRole::Coder, "task-1", h.transport.clone(), quiet()).shared();
        let state = SharedStateManager::new(
            "task-1",
            "coder-1",
            h.store.clone(),
            h.transport.clone(),
            StateConfig::default(),
        )
        .shared();
        state.initialize(TaskSeed::new("user-1", "build it")).await.unwrap();
        let executor = ExecutorRegistry::with_defaults().get(AgentRole::Coder).unwrap();
        let worker = WorkerAgent::new(bus, state, executor, client, timeout).shared();
        worker.start().await.unwrap();
        worker
    }

    fn assignment(id: &str) -> AgentMessage {
        AgentMessage::with_payload(
            MessageType::TaskAssignment,
            &AssignmentPayload {
                assignment_id: id.into(),
                objective: "build it".into(),
                phase_id: "execution".into(),
                phase_title: "Execution".into(),
                subtask: Subtask::new(format!("sub-{id}"), "Implement parser", ""),
                attempt: 1,
                facts: Vec::new(),
            },
        )
        .unwrap()
    }

    async fn assign(h: &Harness, id: &str) {
        h.orchestrator
            .broadcast_to_role(AgentRole::Coder, assignment(id))
            .await
            .unwrap();
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    /// Sleeps before answering and counts calls.
    struct SlowClient {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InferenceClient for SlowClient {
        async fn infer(&self, _request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(InferenceResponse::new(json!("done"), 7))
        }
    }

    #[test]
    fn test_message_classification() {
        assert!(is_recoverable_message("upstream returned 503"));
        assert!(is_recoverable_message("Connection reset by peer"));
        assert!(is_recoverable_message("request timed out"));
        assert!(is_recoverable_message("Rate limit exceeded"));
        assert!(!is_recoverable_message("invalid prompt: missing objective"));
        assert!(is_recoverable(&InferenceError::Rejected("gateway timeout".into())));
        assert!(!is_recoverable(&InferenceError::Rejected("content policy".into())));
    }

    #[tokio::test]
    async fn test_successful_subtask_reports_result_and_metrics() {
        let h = harness(true).await;
        let mut client = MockInferenceClient::new();
        client
            .expect_infer()
            .times(1)
            .returning(|_| Ok(InferenceResponse::new(json!("wrote parser"), 50)));
        let worker = worker(&h, Arc::new(client), Duration::from_secs(5)).await;

        assign(&h, "a1").await;
        assert!(eventually(|| h.reports.lock().unwrap().len() == 1).await);

        let report = h.reports.lock().unwrap()[0].clone();
        assert_eq!(report.message_type, MessageType::TaskResult);
        let payload: TaskResultPayload = report.payload_as().unwrap();
        assert_eq!(payload.assignment_id, "a1");
        assert!(payload.result.success);
        assert_eq!(payload.result.metrics.tokens_used, 50);

        assert!(eventually(|| worker.status() == AgentActivity::Idle).await);
        assert_eq!(worker.metrics().tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_recoverable_inference_error_is_reported() {
        let h = harness(true).await;
        let mut client = MockInferenceClient::new();
        client
            .expect_infer()
            .returning(|_| Err(InferenceError::Status { status: 502, body: "bad gateway".into() }));
        let worker = worker(&h, Arc::new(client), Duration::from_secs(5)).await;

        assign(&h, "a1").await;
        assert!(eventually(|| h.reports.lock().unwrap().len() == 1).await);
        let payload: TaskErrorPayload = h.reports.lock().unwrap()[0].payload_as().unwrap();
        assert!(payload.recoverable);
        assert_eq!(payload.code, codes::INFERENCE_FAILED);
        assert!(eventually(|| worker.status() == AgentActivity::Idle).await);
        assert_eq!(worker.metrics().tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_denied_claim_never_executes() {
        let h = harness(false).await;
        let mut client = MockInferenceClient::new();
        client.expect_infer().times(0);
        let worker = worker(&h, Arc::new(client), Duration::from_secs(5)).await;

        assign(&h, "a1").await;
        assert!(eventually(|| worker.current_assignment().is_none()
            && worker.status() == AgentActivity::Idle)
            .await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_busy_worker_drops_second_assignment() {
        let h = harness(true).await;
        let client = Arc::new(SlowClient {
            delay: Duration::from_millis(300),
            calls: AtomicUsize::new(0),
        });
        let worker = worker(&h, client.clone(), Duration::from_secs(5)).await;

        assign(&h, "a1").await;
        assert!(eventually(|| worker.status() == AgentActivity::Busy).await);
        assign(&h, "a2").await;

        assert!(eventually(|| h.reports.lock().unwrap().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        let reports = h.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        let payload: TaskResultPayload = reports[0].payload_as().unwrap();
        assert_eq!(payload.assignment_id, "a1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_recoverable_timeout() {
        let h = harness(true).await;
        let client = Arc::new(SlowClient {
            delay: Duration::from_secs(3_600),
            calls: AtomicUsize::new(0),
        });
        let worker = worker(&h, client, Duration::from_millis(1_000)).await;

        assign(&h, "a1").await;
        assert!(eventually(|| h.reports.lock().unwrap().len() == 1).await);
        let payload: TaskErrorPayload = h.reports.lock().unwrap()[0].payload_as().unwrap();
        assert_eq!(payload.code, codes::TIMEOUT);
        assert!(payload.recoverable);
        assert!(eventually(|| worker.status() == AgentActivity::Error).await);

        // Error is absorbing
        assign(&h, "a2").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupt_terminates_in_flight_work() {
        let h = harness(true).await;
        let client = Arc::new(SlowClient {
            delay: Duration::from_secs(60),
            calls: AtomicUsize::new(0),
        });
        let worker = worker(&h, client.clone(), Duration::from_secs(120)).await;

        assign(&h, "a1").await;
        assert!(eventually(|| worker.status() == AgentActivity::Busy).await);

        let interrupt = AgentMessage::with_payload(MessageType::Interrupt, &InterruptPayload::cancel("user cancelled"))
            .unwrap()
            .priority(MessagePriority::Critical);
        h.orchestrator
            .send_to_agent("coder-1", AgentRole::Coder, interrupt)
            .await
            .unwrap();

        assert!(eventually(|| worker.status() == AgentActivity::Terminated).await);
        assert!(worker.current_assignment().is_none());
        assign(&h, "a2").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert!(h.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_for_other_assignment_is_ignored() {
        let h = harness(true).await;
        let client = Arc::new(SlowClient {
            delay: Duration::from_millis(200),
            calls: AtomicUsize::new(0),
        });
        let worker = worker(&h, client, Duration::from_secs(5)).await;
        assign(&h, "a1").await;
        assert!(eventually(|| worker.status() == AgentActivity::Busy).await);

        let abort = InterruptPayload {
            action: InterruptAction::Abort,
            reason: "claimed elsewhere".into(),
            resource: Some("some-other-assignment".into()),
            holder: Some("coder-9".into()),
            retry_after_ms: None,
        };
        h.orchestrator
            .send_to_agent(
                "coder-1",
                AgentRole::Coder,
                AgentMessage::with_payload(MessageType::Interrupt, &abort).unwrap(),
            )
            .await
            .unwrap();

        assert!(eventually(|| h.reports.lock().unwrap().len() == 1).await);
        assert_eq!(h.reports.lock().unwrap()[0].message_type, MessageType::TaskResult);
    }

    #[tokio::test]
    async fn test_abort_before_start_leaves_worker_idle() {
        let h = harness_with(true, true).await;
        let mut client = MockInferenceClient::new();
        client.expect_infer().times(0);
        let worker = worker(&h, Arc::new(client), Duration::from_secs(5)).await;

        assign(&h, "a1").await;
        assert!(eventually(|| worker.current_assignment().is_none()
            && worker.status() == AgentActivity::Idle)
            .await);
        // Outlast the delayed grant
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(worker.status(), AgentActivity::Idle);
        assert!(worker.current_assignment().is_none());
        assert!(h.reports.lock().unwrap().is_empty());
    }

    async fn persisted_activity(h: &Harness) -> Option<AgentActivity> {
        let record = h.store.load("task-1").await.unwrap()?;
        let state = record.to_state().unwrap();
        state.agents.get("coder-1").map(|agent| agent.status)
    }

    async fn eventually_persisted(h: &Harness, expected: AgentActivity) -> bool {
        for _ in 0..200 {
            if persisted_activity(h).await == Some(expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_wait_interrupt_is_persisted_and_released() {
        let h = harness(true).await;
        let client = MockInferenceClient::new();
        let worker = worker(&h, Arc::new(client), Duration::from_secs(5)).await;

        let wait = InterruptPayload {
            action: InterruptAction::Wait,
            reason: "lower priority".into(),
            resource: Some("context.memory".into()),
            holder: Some("writer-1".into()),
            retry_after_ms: Some(200),
        };
        h.orchestrator
            .send_to_agent(
                "coder-1",
                AgentRole::Coder,
                AgentMessage::with_payload(MessageType::Interrupt, &wait).unwrap(),
            )
            .await
            .unwrap();

        assert!(eventually(|| worker.status() == AgentActivity::Waiting).await);
        assert!(eventually_persisted(&h, AgentActivity::Waiting).await);

        assert!(eventually(|| worker.status() == AgentActivity::Idle).await);
        assert!(eventually_persisted(&h, AgentActivity::Idle).await);
    }
}
