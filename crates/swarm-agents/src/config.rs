//! Swarm configuration.
//!
//! Values come from `Default` (which reads `SWARM_*` environment variables
//! for the inference endpoint), then optionally a TOML file. The coordination
//! layer's own settings are embedded and keep their `COORD_*` overrides.

use std::path::Path;
use std::time::Duration;

use coordination::{ConfigError, CoordinationConfig};
use serde::{Deserialize, Serialize};

use crate::capabilities::RoleTable;

/// Inference endpoint used by every worker role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Client-side HTTP timeout; the worker deadline is usually shorter.
    pub request_timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("SWARM_INFERENCE_URL")
                .unwrap_or_else(|_| "http://localhost:8317/v1/agents/invoke".into()),
            api_key: std::env::var("SWARM_INFERENCE_API_KEY").ok(),
            model: std::env::var("SWARM_INFERENCE_MODEL").unwrap_or_else(|_| "default".into()),
            request_timeout_ms: 300_000,
        }
    }
}

impl InferenceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// How the orchestrator dispatches and retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorPolicy {
    /// Re-dispatch subtasks that failed with a recoverable error.
    pub auto_retry: bool,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Run all subtasks of a phase as one concurrent group.
    pub parallel_subtasks: bool,
    /// Extra wait on top of the role timeout before a dispatch counts as lost.
    pub dispatch_grace_ms: u64,
    pub credits_per_1k_tokens: f64,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        Self {
            auto_retry: true,
            max_retries: 2,
            parallel_subtasks: false,
            dispatch_grace_ms: 5_000,
            credits_per_1k_tokens: 1.0,
        }
    }
}

impl OrchestratorPolicy {
    pub fn dispatch_grace(&self) -> Duration {
        Duration::from_millis(self.dispatch_grace_ms)
    }
}

/// Worker agent tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Instances started per worker role by the swarm runtime.
    pub per_role: usize,
    /// How long a worker waits for the orchestrator to grant a claim.
    pub claim_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            per_role: 1,
            claim_timeout_ms: 5_000,
        }
    }
}

impl WorkerSettings {
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }
}

/// Top-level swarm configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub inference: InferenceConfig,
    pub roles: RoleTable,
    pub orchestrator: OrchestratorPolicy,
    pub workers: WorkerSettings,
    pub coordination: CoordinationConfig,
}

impl SwarmConfig {
    /// Parse from a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load a TOML file, then apply `COORD_*` overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.coordination.apply_env()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.coordination.apply_env()?;
        if let Ok(value) = std::env::var("SWARM_WORKERS_PER_ROLE") {
            config.workers.per_role =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    key: "SWARM_WORKERS_PER_ROLE".into(),
                    value,
                })?;
        }
        Ok(config)
    }
}
