//! Researcher, analyst, browser and writer executors.

use coordination::state::ArtifactType;
use coordination::{AgentRole, Artifact};
use serde_json::{json, Value};

use super::{result_text, RoleExecutor, TaskContext, WorkerResult};
use crate::inference::InferenceResponse;

pub struct ResearcherExecutor;

impl RoleExecutor for ResearcherExecutor {
    fn role(&self) -> AgentRole {
        AgentRole::Researcher
    }

    fn action(&self) -> &'static str {
        "research"
    }

    fn shape(&self, ctx: &TaskContext, response: InferenceResponse) -> WorkerResult {
        let summary = result_text(&response);
        let sources = response.list("sources");
        WorkerResult::success(json!({
            "summary": summary,
            "sources": sources,
        }))
        .with_artifact(
            Artifact::new(
                ArtifactType::Report,
                format!("research-{}", ctx.subtask.id),
                json!({"summary": summary, "sources": sources}),
                &ctx.agent_id,
            )
            .with_metadata("sourceCount", sources.len()),
        )
    }
}

pub struct AnalystExecutor;

impl RoleExecutor for AnalystExecutor {
    fn role(&self) -> AgentRole {
        AgentRole::Analyst
    }

    fn action(&self) -> &'static str {
        "analyze"
    }

    fn shape(&self, ctx: &TaskContext, response: InferenceResponse) -> WorkerResult {
        let charts = response.list("charts");
        let mut result = WorkerResult::success(json!({
            "analysis": result_text(&response),
            "chartCount": charts.len(),
        }));
        for (i, chart) in charts.into_iter().enumerate() {
            let name = chart
                .get("title")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("chart-{}-{}", ctx.subtask.id, i + 1));
            result = result.with_artifact(Artifact::new(ArtifactType::Data, name, chart, &ctx.agent_id));
        }
        result
    }
}

pub struct BrowserExecutor;

impl RoleExecutor for BrowserExecutor {
    fn role(&self) -> AgentRole {
        AgentRole::Browser
    }

    fn action(&self) -> &'static str {
        "browse"
    }

    fn shape(&self, ctx: &TaskContext, response: InferenceResponse) -> WorkerResult {
        let mut result = WorkerResult::success(json!({
            "content": result_text(&response),
            "pages": response.list("pages"),
        }));
        for shot in response.list("screenshots") {
            let Some(storage_ref) = shot.get("storageRef").and_then(Value::as_str) else {
                continue;
            };
            let name = shot
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(storage_ref)
                .to_string();
            // Screenshots are referenced, not inlined
            let mut artifact = Artifact::new(ArtifactType::Screenshot, name, Value::Null, &ctx.agent_id);
            artifact.content = None;
            artifact.storage_ref = Some(storage_ref.to_string());
            result = result.with_artifact(artifact);
        }
        result
    }
}

pub struct WriterExecutor;

impl RoleExecutor for WriterExecutor {
    fn role(&self) -> AgentRole {
        AgentRole::Writer
    }

    fn action(&self) -> &'static str {
        "write"
    }

    fn shape(&self, ctx: &TaskContext, response: InferenceResponse) -> WorkerResult {
        let text = result_text(&response);
        if text.trim().is_empty() {
            return WorkerResult::failure("writer returned an empty document");
        }
        WorkerResult::success(json!({"length": text.len()})).with_artifact(Artifact::new(
            ArtifactType::Report,
            ctx.subtask.title.clone(),
            Value::String(text),
            &ctx.agent_id,
        ))
    }
}
