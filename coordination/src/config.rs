//! Configuration for the coordination primitives
//!
//! Everything that the bus, the state manager and the conflict resolver
//! would otherwise hard-code lives here and is passed to constructors, so
//! tests can substitute alternate priority orders or timings.
//!
//! Values come from `Default`, then optionally a TOML file, then `COORD_*`
//! environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messaging::AgentRole;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

/// Message bus tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Heartbeat interval in milliseconds; 0 disables the emitter
    pub heartbeat_interval_ms: u64,
    /// TTL stamped on heartbeats so stale ones self-expire
    pub heartbeat_ttl_ms: u64,
    /// Size at which the recently-seen id set is trimmed
    pub dedup_capacity: usize,
    /// Number of most recent ids kept after a trim
    pub dedup_retain: usize,
    /// Default timeout for request/reply
    pub request_timeout_ms: u64,
    /// Whether heartbeats are written to the audit sink
    pub audit_heartbeats: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            heartbeat_ttl_ms: 5_000,
            dedup_capacity: 1_000,
            dedup_retain: 500,
            request_timeout_ms: 30_000,
            audit_heartbeats: false,
        }
    }
}

impl BusConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Shared state manager tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Lifetime of a path cache entry in milliseconds
    pub cache_ttl_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { cache_ttl_ms: 1_000 }
    }
}

impl StateConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Which state paths may be merged automatically on a concurrent write
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeRules {
    /// First path segment that marks a mergeable subtree
    pub root_segments: Vec<String>,
    /// Substrings of any segment that mark a mergeable resource
    pub segment_markers: Vec<String>,
    /// File-like extensions that mark a mergeable resource
    pub extensions: Vec<String>,
}

impl Default for MergeRules {
    fn default() -> Self {
        Self {
            root_segments: vec!["context".into(), "artifacts".into(), "facts".into()],
            segment_markers: vec!["notes".into(), "facts".into()],
            extensions: vec![".json".into()],
        }
    }
}

impl MergeRules {
    pub fn is_mergeable(&self, path: &str) -> bool {
        let lower = path.to_ascii_lowercase();
        if self.extensions.iter().any(|ext| lower.ends_with(ext)) {
            return true;
        }
        let mut segments = lower.split('.');
        let root = segments.next().unwrap_or_default();
        if self.root_segments.iter().any(|r| r == root) {
            return true;
        }
        lower
            .split('.')
            .any(|segment| self.segment_markers.iter().any(|m| segment.contains(m.as_str())))
    }
}

/// Conflict arbitration policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictPolicy {
    /// Roles from highest to lowest priority for resource contention
    pub role_priority: Vec<AgentRole>,
    pub merge_rules: MergeRules,
    /// Backoff handed to contention losers
    pub contention_backoff_ms: u64,
    /// How long to wait for the orchestrator to decide an escalated conflict
    pub escalation_timeout_ms: u64,
    /// Number of resolutions kept in the in-process history
    pub history_limit: usize,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            role_priority: vec![
                AgentRole::Orchestrator,
                AgentRole::Reviewer,
                AgentRole::Coder,
                AgentRole::Analyst,
                AgentRole::Researcher,
                AgentRole::Browser,
                AgentRole::Writer,
            ],
            merge_rules: MergeRules::default(),
            contention_backoff_ms: 2_000,
            escalation_timeout_ms: 5_000,
            history_limit: 500,
        }
    }
}

impl ConflictPolicy {
    /// Position of `role` in the priority table; unknown roles rank last
    pub fn priority_rank(&self, role: AgentRole) -> usize {
        self.role_priority
            .iter()
            .position(|r| *r == role)
            .unwrap_or(self.role_priority.len())
    }

    pub fn escalation_timeout(&self) -> Duration {
        Duration::from_millis(self.escalation_timeout_ms)
    }
}

/// Top-level configuration for the coordination layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub bus: BusConfig,
    pub state: StateConfig,
    pub conflict: ConflictPolicy,
}

impl CoordinationConfig {
    /// Parse from a TOML document; missing keys keep their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults with `COORD_*` environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `COORD_*` environment overrides in place
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_u64("COORD_HEARTBEAT_INTERVAL_MS")? {
            self.bus.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_u64("COORD_HEARTBEAT_TTL_MS")? {
            self.bus.heartbeat_ttl_ms = v;
        }
        if let Some(v) = env_u64("COORD_REQUEST_TIMEOUT_MS")? {
            self.bus.request_timeout_ms = v;
        }
        if let Some(v) = env_u64("COORD_CACHE_TTL_MS")? {
            self.state.cache_ttl_ms = v;
        }
        if let Some(v) = env_u64("COORD_CONTENTION_BACKOFF_MS")? {
            self.conflict.contention_backoff_ms = v;
        }
        if let Some(v) = env_u64("COORD_ESCALATION_TIMEOUT_MS")? {
            self.conflict.escalation_timeout_ms = v;
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
