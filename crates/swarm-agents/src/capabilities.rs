//! Role capability table.
//!
//! Maps subtask titles to required capabilities by keyword, and capabilities
//! to the worker role that covers them best. The table is plain data passed
//! to the orchestrator, so tests and deployments can swap it out.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use coordination::AgentRole;
use serde::{Deserialize, Serialize};

/// Something a worker role can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    WebSearch,
    WebBrowse,
    FileRead,
    FileWrite,
    CodeExecution,
    CodeReview,
    DataAnalysis,
    Visualization,
    Summarization,
    Writing,
    QualityCheck,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WebSearch => "web_search",
            Self::WebBrowse => "web_browse",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::CodeExecution => "code_execution",
            Self::CodeReview => "code_review",
            Self::DataAnalysis => "data_analysis",
            Self::Visualization => "visualization",
            Self::Summarization => "summarization",
            Self::Writing => "writing",
            Self::QualityCheck => "quality_check",
        };
        f.write_str(s)
    }
}

/// One worker role: what it can do and how long it may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleProfile {
    pub role: AgentRole,
    pub capabilities: Vec<Capability>,
    /// Deadline for a single subtask, in milliseconds.
    pub timeout_ms: u64,
}

impl RoleProfile {
    pub fn new(role: AgentRole, capabilities: Vec<Capability>, timeout_ms: u64) -> Self {
        Self {
            role,
            capabilities,
            timeout_ms,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Title keywords that imply capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub keywords: Vec<String>,
    pub capabilities: Vec<Capability>,
}

impl KeywordRule {
    pub fn new(keywords: &[&str], capabilities: Vec<Capability>) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            capabilities,
        }
    }

    fn matches(&self, lowered: &str) -> bool {
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}

/// Role profiles plus the keyword rules used to pick among them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleTable {
    pub roles: Vec<RoleProfile>,
    pub rules: Vec<KeywordRule>,
    /// Role used when a title matches no rule.
    pub default_role: AgentRole,
    /// Timeout for roles missing from `roles`.
    pub default_timeout_ms: u64,
}

impl Default for RoleTable {
    fn default() -> Self {
        use Capability::*;
        Self {
            roles: vec![
                RoleProfile::new(AgentRole::Researcher, vec![WebSearch, WebBrowse, Summarization], 120_000),
                RoleProfile::new(AgentRole::Coder, vec![FileRead, FileWrite, CodeExecution, CodeReview], 180_000),
                RoleProfile::new(AgentRole::Analyst, vec![DataAnalysis, Visualization, CodeExecution], 150_000),
                RoleProfile::new(AgentRole::Reviewer, vec![QualityCheck, CodeReview], 90_000),
                RoleProfile::new(AgentRole::Browser, vec![WebBrowse, FileRead], 120_000),
                RoleProfile::new(AgentRole::Writer, vec![Writing, Summarization], 120_000),
            ],
            rules: vec![
                KeywordRule::new(&["search", "research", "find", "sources", "look up"], vec![WebSearch]),
                KeywordRule::new(&["browse", "navigate", "scrape", "screenshot", "website"], vec![WebBrowse]),
                KeywordRule::new(&["code", "implement", "script", "program", "build"], vec![FileWrite, CodeReview]),
                KeywordRule::new(&["analy", "data", "statistic", "metric", "trend"], vec![DataAnalysis]),
                KeywordRule::new(&["chart", "graph", "plot", "visuali"], vec![Visualization]),
                KeywordRule::new(&["review", "quality", "verify", "check"], vec![QualityCheck]),
                KeywordRule::new(&["write", "draft", "report", "document", "deliverable"], vec![Writing]),
                KeywordRule::new(&["summar"], vec![Summarization]),
            ],
            default_role: AgentRole::Analyst,
            default_timeout_ms: 120_000,
        }
    }
}

impl RoleTable {
    pub fn profile(&self, role: AgentRole) -> Option<&RoleProfile> {
        self.roles.iter().find(|p| p.role == role)
    }

    pub fn timeout_for(&self, role: AgentRole) -> Duration {
        Duration::from_millis(
            self.profile(role)
                .map(|p| p.timeout_ms)
                .unwrap_or(self.default_timeout_ms),
        )
    }

    /// Capabilities implied by a subtask title.
    pub fn required_capabilities(&self, title: &str) -> BTreeSet<Capability> {
        let lowered = title.to_lowercase();
        self.rules
            .iter()
            .filter(|rule| rule.matches(&lowered))
            .flat_map(|rule| rule.capabilities.iter().copied())
            .collect()
    }

    /// The role covering the most required capabilities. Ties go to the role
    /// listed first; no coverage at all falls back to `default_role`.
    pub fn select_role(&self, required: &BTreeSet<Capability>) -> AgentRole {
        let mut best: Option<(usize, AgentRole)> = None;
        for profile in &self.roles {
            let covered = profile
                .capabilities
                .iter()
                .filter(|c| required.contains(c))
                .count();
            if covered > 0 && best.map_or(true, |(score, _)| covered > score) {
                best = Some((covered, profile.role));
            }
        }
        best.map(|(_, role)| role).unwrap_or(self.default_role)
    }

    pub fn role_for_title(&self, title: &str) -> AgentRole {
        self.select_role(&self.required_capabilities(title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_goes_to_researcher() {
        let table = RoleTable::default();
        let caps = table.required_capabilities("Search for recent benchmarks");
        assert!(caps.contains(&Capability::WebSearch));
        assert_eq!(table.select_role(&caps), AgentRole::Researcher);
    }

    #[test]
    fn test_code_needs_write_and_review() {
        let table = RoleTable::default();
        let caps = table.required_capabilities("Implement the CSV parser");
        assert_eq!(
            caps,
            BTreeSet::from([Capability::FileWrite, Capability::CodeReview])
        );
        assert_eq!(table.select_role(&caps), AgentRole::Coder);
    }

    #[test]
    fn test_review_goes_to_reviewer() {
        let table = RoleTable::default();
        assert_eq!(table.role_for_title("Review and quality check results"), AgentRole::Reviewer);
    }

    #[test]
    fn test_unmatched_title_uses_default_role() {
        let table = RoleTable::default();
        assert_eq!(table.role_for_title("Ponder"), AgentRole::Analyst);
    }

    #[test]
    fn test_timeouts_fall_back_to_default() {
        let mut table = RoleTable::default();
        table.roles.retain(|p| p.role != AgentRole::Writer);
        assert_eq!(table.timeout_for(AgentRole::Coder), Duration::from_millis(180_000));
        assert_eq!(table.timeout_for(AgentRole::Writer), Duration::from_millis(120_000));
    }
}
