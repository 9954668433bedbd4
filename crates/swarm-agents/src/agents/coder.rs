//! Coder executor: writes code and returns it as file artifacts.

use coordination::state::ArtifactType;
use coordination::{AgentRole, Artifact};
use serde_json::{json, Value};

use super::{result_text, RoleExecutor, TaskContext, WorkerResult};
use crate::inference::InferenceResponse;

pub struct CoderExecutor;

impl RoleExecutor for CoderExecutor {
    fn role(&self) -> AgentRole {
        AgentRole::Coder
    }

    fn action(&self) -> &'static str {
        "code"
    }

    fn shape(&self, ctx: &TaskContext, response: InferenceResponse) -> WorkerResult {
        let files = response.list("files");
        let mut paths = Vec::with_capacity(files.len());
        let mut result = WorkerResult::success(Value::Null);

        for file in &files {
            let Some(path) = file.get("path").and_then(Value::as_str) else {
                continue;
            };
            let content = file.get("content").cloned().unwrap_or(Value::Null);
            let language = file
                .get("language")
                .and_then(Value::as_str)
                .unwrap_or("text");
            paths.push(path.to_string());
            result = result.with_artifact(
                Artifact::new(ArtifactType::Code, path, content, &ctx.agent_id)
                    .with_metadata("language", language)
                    .with_metadata("subtaskId", ctx.subtask.id.as_str()),
            );
        }

        result.data = json!({
            "explanation": result_text(&response),
            "files": paths,
        });
        result
    }
}
