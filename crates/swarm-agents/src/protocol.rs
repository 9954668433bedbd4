//! Payloads exchanged between the orchestrator and workers.
//!
//! ```text
//! orchestrator ──task_assignment──▶ role:<role>          (broadcast to the role)
//! worker       ──task_claim───────▶ orchestrator         (request/reply)
//! orchestrator ──ClaimDecision────▶ worker               (reply)
//! worker       ──task_result/error▶ orchestrator
//! worker       ──progress─────────▶ orchestrator
//! ```

use chrono::{DateTime, Utc};
use coordination::{AgentRole, Subtask};
use serde::{Deserialize, Serialize};

use crate::agents::{TaskContext, WorkerResult};

/// One dispatch of one subtask. A retry is a new assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentPayload {
    pub assignment_id: String,
    pub objective: String,
    pub phase_id: String,
    pub phase_title: String,
    pub subtask: Subtask,
    pub attempt: u32,
    #[serde(default)]
    pub facts: Vec<String>,
}

impl AssignmentPayload {
    pub fn context(&self, task_id: &str, agent_id: &str) -> TaskContext {
        let mut ctx = TaskContext::new(
            task_id,
            self.objective.clone(),
            self.phase_id.clone(),
            self.phase_title.clone(),
            self.subtask.clone(),
        );
        ctx.agent_id = agent_id.to_string();
        ctx.facts = self.facts.clone();
        ctx.attempt = self.attempt;
        ctx
    }
}

/// A worker asking for exclusive ownership of an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub assignment_id: String,
    pub subtask_id: String,
    pub agent_id: String,
    pub role: AgentRole,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimDecision {
    pub granted: bool,
    /// Current owner when the claim is denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

impl ClaimDecision {
    pub fn granted() -> Self {
        Self {
            granted: true,
            holder: None,
        }
    }

    pub fn denied(holder: Option<String>) -> Self {
        Self {
            granted: false,
            holder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultPayload {
    pub assignment_id: String,
    pub subtask_id: String,
    pub agent_id: String,
    pub result: WorkerResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskErrorPayload {
    pub assignment_id: String,
    pub subtask_id: String,
    pub agent_id: String,
    pub message: String,
    pub code: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub assignment_id: String,
    pub subtask_id: String,
    pub agent_id: String,
    pub message: String,
}

/// Error codes carried in [`TaskErrorPayload::code`] and task errors.
pub mod codes {
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INFERENCE_FAILED: &str = "INFERENCE_FAILED";
    pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
    pub const NO_EXECUTOR: &str = "NO_EXECUTOR";
    pub const DISPATCH_TIMEOUT: &str = "DISPATCH_TIMEOUT";
    pub const SUBTASK_FAILED: &str = "SUBTASK_FAILED";
    pub const PHASE_DEPENDENCIES_UNSATISFIED: &str = "PHASE_DEPENDENCIES_UNSATISFIED";
    pub const ORCHESTRATION_ERROR: &str = "ORCHESTRATION_ERROR";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_builds_context() {
        let payload = AssignmentPayload {
            assignment_id: "a1".into(),
            objective: "Compare databases".into(),
            phase_id: "research".into(),
            phase_title: "Research".into(),
            subtask: Subtask::new("s1", "Search", ""),
            attempt: 2,
            facts: vec!["f".into()],
        };
        let ctx = payload.context("t1", "researcher-1");
        assert_eq!(ctx.task_id, "t1");
        assert_eq!(ctx.agent_id, "researcher-1");
        assert_eq!(ctx.attempt, 2);
        assert_eq!(ctx.facts, vec!["f"]);
    }

    #[test]
    fn test_denied_claim_names_holder() {
        let value = serde_json::to_value(ClaimDecision::denied(Some("coder-1".into()))).unwrap();
        assert_eq!(value["granted"], false);
        assert_eq!(value["holder"], "coder-1");
    }
}
