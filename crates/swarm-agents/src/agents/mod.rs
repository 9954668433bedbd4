//! Role executors.
//!
//! Each worker role is one [`RoleExecutor`]: it turns a subtask into an
//! inference request with a role-specific system prompt and shapes the
//! response into a [`WorkerResult`]. Workers look executors up by role in an
//! [`ExecutorRegistry`].

pub mod coder;
pub mod reviewer;
pub mod specialists;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use coordination::{AgentRole, Artifact, Subtask};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::inference::{InferenceClient, InferenceError, InferenceRequest, InferenceResponse};
use crate::prompts;

pub use coder::CoderExecutor;
pub use reviewer::ReviewerExecutor;
pub use specialists::{AnalystExecutor, BrowserExecutor, ResearcherExecutor, WriterExecutor};

/// Everything an executor needs to know about one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub task_id: String,
    pub objective: String,
    pub phase_id: String,
    pub phase_title: String,
    pub subtask: Subtask,
    /// Agent executing the subtask; stamped on artifacts.
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

impl TaskContext {
    pub fn new(
        task_id: impl Into<String>,
        objective: impl Into<String>,
        phase_id: impl Into<String>,
        phase_title: impl Into<String>,
        subtask: Subtask,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            objective: objective.into(),
            phase_id: phase_id.into(),
            phase_title: phase_title.into(),
            subtask,
            agent_id: String::new(),
            facts: Vec::new(),
            attempt: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetrics {
    pub duration_ms: u64,
    pub tokens_used: u64,
}

/// Outcome of one subtask execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub metrics: ResultMetrics,
}

impl WorkerResult {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            artifacts: Vec::new(),
            metrics: ResultMetrics::default(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            artifacts: Vec::new(),
            metrics: ResultMetrics::default(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// One worker role's way of performing a subtask.
#[async_trait]
pub trait RoleExecutor: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Action name sent to the inference endpoint.
    fn action(&self) -> &'static str;

    fn system_prompt(&self) -> &'static str {
        prompts::system_prompt(self.role())
    }

    /// Turn a raw response into a result.
    fn shape(&self, ctx: &TaskContext, response: InferenceResponse) -> WorkerResult;

    fn request(&self, ctx: &TaskContext) -> InferenceRequest {
        InferenceRequest {
            action: self.action().to_string(),
            task_id: ctx.task_id.clone(),
            prompt: prompts::subtask_prompt(ctx),
            context: json!({
                "phaseId": ctx.phase_id,
                "subtaskId": ctx.subtask.id,
                "attempt": ctx.attempt,
            }),
            agent_role: self.role(),
            system_prompt: self.system_prompt().to_string(),
        }
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        client: &dyn InferenceClient,
    ) -> Result<WorkerResult, InferenceError> {
        let response = client.infer(self.request(ctx)).await?;
        let tokens_used = response.tokens_used;
        let mut result = self.shape(ctx, response);
        result.metrics.tokens_used = tokens_used;
        Ok(result)
    }
}

/// Shared reference to a role executor.
pub type SharedExecutor = Arc<dyn RoleExecutor>;

/// Role → executor table.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<AgentRole, SharedExecutor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in executor for every worker role.
    pub fn with_defaults() -> Self {
        Self::new()
            .register(Arc::new(ResearcherExecutor))
            .register(Arc::new(CoderExecutor))
            .register(Arc::new(AnalystExecutor))
            .register(Arc::new(ReviewerExecutor))
            .register(Arc::new(BrowserExecutor))
            .register(Arc::new(WriterExecutor))
    }

    /// Add or replace the executor for its role.
    pub fn register(mut self, executor: SharedExecutor) -> Self {
        self.executors.insert(executor.role(), executor);
        self
    }

    pub fn get(&self, role: AgentRole) -> Option<SharedExecutor> {
        self.executors.get(&role).cloned()
    }

    pub fn roles(&self) -> Vec<AgentRole> {
        let mut roles: Vec<AgentRole> = self.executors.keys().copied().collect();
        roles.sort();
        roles
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("roles", &self.roles())
            .finish()
    }
}

/// Response `result` as text, whatever its JSON shape.
pub(crate) fn result_text(response: &InferenceResponse) -> String {
    match &response.result {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::MockInferenceClient;

    fn ctx() -> TaskContext {
        let mut ctx = TaskContext::new(
            "t1",
            "Compare databases",
            "research",
            "Research",
            Subtask::new("s1", "Search benchmarks", ""),
        );
        ctx.agent_id = "researcher-1".into();
        ctx
    }

    #[test]
    fn test_default_registry_covers_workers() {
        let registry = ExecutorRegistry::with_defaults();
        assert_eq!(registry.roles().len(), AgentRole::workers().len());
        for role in AgentRole::workers() {
            assert_eq!(registry.get(*role).map(|e| e.role()), Some(*role));
        }
        assert!(registry.get(AgentRole::Orchestrator).is_none());
    }

    #[tokio::test]
    async fn test_execute_sends_role_prompt_and_counts_tokens() {
        let mut client = MockInferenceClient::new();
        client
            .expect_infer()
            .withf(|req| {
                req.agent_role == AgentRole::Researcher
                    && req.action == "research"
                    && req.system_prompt == prompts::RESEARCHER_PROMPT
                    && req.context["subtaskId"] == "s1"
            })
            .times(1)
            .returning(|_| Ok(InferenceResponse::new(json!("found it"), 321)));

        let result = ResearcherExecutor.execute(&ctx(), &client).await.unwrap();
        assert!(result.success);
        assert_eq!(result.metrics.tokens_used, 321);
    }

    #[tokio::test]
    async fn test_execute_propagates_inference_error() {
        let mut client = MockInferenceClient::new();
        client
            .expect_infer()
            .returning(|_| Err(InferenceError::RateLimited));

        let err = CoderExecutor.execute(&ctx(), &client).await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
