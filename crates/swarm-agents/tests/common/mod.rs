//! Shared fixtures for the swarm integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coordination::{AgentActivity, AgentRole};
use serde_json::json;
use swarm_agents::config::SwarmConfig;
use swarm_agents::inference::{InferenceClient, InferenceError, InferenceRequest, InferenceResponse};
use swarm_agents::worker::SharedWorker;

pub const WORKER_TOKENS: u64 = 100;
pub const REVIEW_TOKENS: u64 = 50;

/// Inference fake: answers by role, with per-role queued failures and an
/// optional role that never answers.
#[derive(Default)]
pub struct ScriptedClient {
    calls: Mutex<Vec<InferenceRequest>>,
    failures: Mutex<HashMap<AgentRole, VecDeque<InferenceError>>>,
    hang: Option<AgentRole>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call for `role` with `error`.
    pub fn fail_next(self, role: AgentRole, error: InferenceError) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .push_back(error);
        self
    }

    pub fn hang_on(mut self, role: AgentRole) -> Self {
        self.hang = Some(role);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls_for(&self, role: AgentRole) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.agent_role == role)
            .count()
    }

    /// `phaseId` of every request, in arrival order.
    pub fn phase_order(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r.context["phaseId"].as_str().map(String::from))
            .collect()
    }
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let role = request.agent_role;
        self.calls.lock().unwrap().push(request);

        if self.hang == Some(role) {
            std::future::pending::<()>().await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&role)
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }

        Ok(match role {
            AgentRole::Reviewer => InferenceResponse::new(
                json!({"approved": true, "summary": "Reads well"}),
                REVIEW_TOKENS,
            ),
            _ => InferenceResponse::new(json!("Dear team, welcome aboard."), WORKER_TOKENS),
        })
    }
}

/// Short deadlines and no heartbeats.
pub fn fast_config() -> SwarmConfig {
    let mut config = SwarmConfig::default();
    config.coordination.bus.heartbeat_interval_ms = 0;
    for profile in &mut config.roles.roles {
        profile.timeout_ms = 1_000;
    }
    config.orchestrator.dispatch_grace_ms = 200;
    config.workers.claim_timeout_ms = 1_000;
    config
}

pub fn worker(workers: &[SharedWorker], id: &str) -> SharedWorker {
    workers
        .iter()
        .find(|w| w.id() == id)
        .cloned()
        .unwrap_or_else(|| panic!("no worker {id}"))
}

/// Poll until `worker` reaches `status`.
pub async fn wait_for_status(worker: &SharedWorker, status: AgentActivity) {
    for _ in 0..300 {
        if worker.status() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never became {status}, still {}", worker.id(), worker.status());
}
