//! Shared task state
//!
//! One [`SharedState`] exists per task. Field names serialize in camelCase
//! so that dot paths (`plan.currentPhase`, `agents.<id>.status`) address the
//! same shapes everywhere.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::manager::StateError;
use crate::messaging::AgentRole;

/// Unique identifier for tasks
pub type TaskId = String;

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Planning,
    Executing,
    /// Optional quality-gate stage
    Reviewing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Position on the forward path; terminal failure states share the end
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Planning => 1,
            Self::Executing => 2,
            Self::Reviewing => 3,
            Self::Completed | Self::Failed | Self::Cancelled => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Forward-only transitions; failure and cancellation from anywhere
    /// non-terminal. Re-asserting the current status is allowed.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed | Self::Cancelled => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Reviewing => "reviewing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    /// Failed with retries exhausted; abandoned
    Failed,
}

impl SubtaskStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What an agent is doing right now
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentActivity {
    #[default]
    Idle,
    Busy,
    Waiting,
    Error,
    Terminated,
}

impl fmt::Display for AgentActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Waiting => "waiting",
            Self::Error => "error",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A unit of dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: SubtaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl Subtask {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            status: SubtaskStatus::Pending,
            assigned_agent: None,
            result: None,
            error: None,
            attempts: 0,
        }
    }
}

/// A unit of planning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: PhaseStatus,
    /// Phases that must be completed first
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Phase {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            status: PhaseStatus::Pending,
            dependencies: Vec::new(),
            subtasks: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn depends_on(mut self, phase_id: impl Into<String>) -> Self {
        self.dependencies.push(phase_id.into());
        self
    }

    pub fn with_subtask(mut self, subtask: Subtask) -> Self {
        self.subtasks.push(subtask);
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, PhaseStatus::Completed | PhaseStatus::Failed)
    }

    pub fn mark_in_progress(&mut self) {
        self.status = PhaseStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    /// Refuses while any subtask is neither completed nor abandoned
    pub fn mark_completed(&mut self) -> Result<(), StateError> {
        if let Some(open) = self.subtasks.iter().find(|s| !s.status.is_settled()) {
            return Err(StateError::PhaseIncomplete {
                phase_id: self.id.clone(),
                subtask_id: open.id.clone(),
            });
        }
        self.status = PhaseStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self) {
        self.status = PhaseStatus::Failed;
        self.completed_at = Some(Utc::now());
    }
}

/// Phased work breakdown for a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub current_phase: u32,
    #[serde(default)]
    pub total_phases: u32,
}

impl Plan {
    pub fn new(phases: Vec<Phase>) -> Self {
        let total_phases = phases.len() as u32;
        Self {
            phases,
            current_phase: 0,
            total_phases,
        }
    }

    pub fn phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    pub fn phase_mut(&mut self, phase_id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == phase_id)
    }

    /// A phase may start once every dependency is completed
    pub fn can_start_phase(&self, phase_id: &str) -> bool {
        let Some(phase) = self.phase(phase_id) else {
            return false;
        };
        phase.dependencies.iter().all(|dep| {
            self.phase(dep)
                .map(|p| p.status == PhaseStatus::Completed)
                .unwrap_or(false)
        })
    }

    pub fn is_finished(&self) -> bool {
        self.phases.iter().all(Phase::is_terminal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    File,
    Data,
    Report,
    Screenshot,
    Code,
}

/// A work product. Never mutated; newer output is a new artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_ref: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Artifact {
    pub fn new(
        artifact_type: ArtifactType,
        name: impl Into<String>,
        content: serde_json::Value,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            artifact_type,
            name: name.into(),
            content: Some(content),
            storage_ref: None,
            created_by: created_by.into(),
            created_at: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Per-agent execution counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_duration_ms: f64,
}

impl AgentMetrics {
    /// Fold one finished task into the counters and the running average
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        let previous = self.tasks_completed + self.tasks_failed;
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let total = previous + 1;
        self.avg_duration_ms =
            (self.avg_duration_ms * previous as f64 + duration_ms as f64) / total as f64;
    }
}

/// Liveness and activity of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub id: String,
    pub role: AgentRole,
    pub status: AgentActivity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metrics: AgentMetrics,
}

impl AgentStatus {
    pub fn new(id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            role,
            status: AgentActivity::Idle,
            current_task: None,
            last_heartbeat: Utc::now(),
            metrics: AgentMetrics::default(),
        }
    }

    /// No heartbeat within `window`
    pub fn is_stale(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > window
    }
}

/// Knowledge accumulated while working on a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedContext {
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub memory: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub credits_used: f64,
}

/// Structured task failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub message: String,
    pub code: String,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

impl TaskError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            recoverable,
            timestamp: Utc::now(),
        }
    }
}

/// Single source of truth for a task's orchestration progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedState {
    pub task_id: TaskId,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentStatus>,
    #[serde(default)]
    pub context: SharedContext,
    #[serde(default)]
    pub metrics: TaskMetrics,
    #[serde(default)]
    pub error: Option<TaskError>,
    /// Any other root (`conflictResolutions`, `vectorClocks`, ...)
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl SharedState {
    /// Initial empty state: pending, no plan, zeroed metrics
    pub fn new(task_id: impl Into<String>, user_id: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            user_id: user_id.into(),
            objective: objective.into(),
            status: TaskStatus::Pending,
            plan: Plan::default(),
            artifacts: BTreeMap::new(),
            agents: BTreeMap::new(),
            context: SharedContext::default(),
            metrics: TaskMetrics::default(),
            error: None,
            extensions: serde_json::Map::new(),
        }
    }
}
