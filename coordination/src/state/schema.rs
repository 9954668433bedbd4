//! Storage layout for task records
//!
//! A task record is split into independently updated fields. In RocksDB
//! each field has its own column family keyed by task id, so a status flip
//! does not rewrite the plan.

/// Column family for the immutable header (task id, user id, objective)
pub const CF_HEADER: &str = "header";

/// Column family for task status
pub const CF_STATUS: &str = "status";

/// Column family for the plan document
pub const CF_PLAN: &str = "plan";

/// Column family for memory context (every non-dedicated root)
pub const CF_MEMORY: &str = "memory";

/// Column family for metrics
pub const CF_METRICS: &str = "metrics";

/// Column family for the structured error
pub const CF_ERROR: &str = "error";

/// Column family for the message audit trail
pub const CF_AUDIT: &str = "audit";

/// All column family names
pub const ALL_CFS: &[&str] = &[
    CF_HEADER, CF_STATUS, CF_PLAN, CF_MEMORY, CF_METRICS, CF_ERROR, CF_AUDIT,
];

/// Roots that may not be written after creation
pub const HEADER_ROOTS: &[&str] = &["taskId", "userId", "objective"];

/// Which stored field a state root lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageField {
    Header,
    Status,
    Plan,
    Memory,
    Metrics,
    Error,
}

impl StorageField {
    pub fn for_root(root: &str) -> Self {
        match root {
            "status" => Self::Status,
            "plan" => Self::Plan,
            "metrics" => Self::Metrics,
            "error" => Self::Error,
            r if HEADER_ROOTS.contains(&r) => Self::Header,
            _ => Self::Memory,
        }
    }

    pub fn for_path(path: &str) -> Self {
        Self::for_root(super::path::root(path))
    }

    pub fn column_family(self) -> &'static str {
        match self {
            Self::Header => CF_HEADER,
            Self::Status => CF_STATUS,
            Self::Plan => CF_PLAN,
            Self::Memory => CF_MEMORY,
            Self::Metrics => CF_METRICS,
            Self::Error => CF_ERROR,
        }
    }
}

/// Key prefixes for compound keys
pub mod keys {
    pub fn task(task_id: &str) -> String {
        format!("task:{}", task_id)
    }

    /// Audit key (timestamp-based for ordering)
    pub fn audit(timestamp_nanos: i64, message_id: &str) -> String {
        format!("evt:{:020}:{}", timestamp_nanos, message_id)
    }

    pub fn parse_audit_timestamp(key: &str) -> Option<i64> {
        let mut parts = key.split(':');
        match (parts.next(), parts.next()) {
            (Some("evt"), Some(ts)) => ts.parse().ok(),
            _ => None,
        }
    }
}
