//! Reviewer executor: the quality gate at the end of every plan.

use coordination::state::ArtifactType;
use coordination::{AgentRole, Artifact};
use serde_json::{json, Value};

use super::{result_text, RoleExecutor, TaskContext, WorkerResult};
use crate::inference::InferenceResponse;

pub struct ReviewerExecutor;

/// Severities that block approval.
const BLOCKING: &[&str] = &["critical", "blocker", "high"];

impl ReviewerExecutor {
    fn is_blocking(issue: &Value) -> bool {
        issue
            .get("severity")
            .and_then(Value::as_str)
            .map(|s| BLOCKING.contains(&s.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

impl RoleExecutor for ReviewerExecutor {
    fn role(&self) -> AgentRole {
        AgentRole::Reviewer
    }

    fn action(&self) -> &'static str {
        "review"
    }

    fn shape(&self, ctx: &TaskContext, response: InferenceResponse) -> WorkerResult {
        let issues = response.list("issues");
        let blocking = issues.iter().filter(|i| Self::is_blocking(i)).count();
        // An explicit verdict wins over the issue count
        let approved = response
            .result
            .get("approved")
            .and_then(Value::as_bool)
            .unwrap_or(blocking == 0);
        let summary = response
            .result
            .get("summary")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| result_text(&response));

        let report = json!({
            "approved": approved,
            "summary": summary,
            "issues": issues,
        });
        WorkerResult::success(json!({
            "approved": approved,
            "issueCount": issues.len(),
            "blockingCount": blocking,
        }))
        .with_artifact(
            Artifact::new(ArtifactType::Report, format!("review-{}", ctx.subtask.id), report, &ctx.agent_id)
                .with_metadata("approved", approved),
        )
    }
}
