//! Objective → phased plan.
//!
//! Plans always end with an execution phase followed by a review phase.
//! Research and analysis phases are prepended when the objective asks for
//! them. Each phase depends on the one before it.
//!
//! Every plan, generated or supplied, goes through [`validate`] before it is
//! executed: duplicate ids, dangling dependencies and cycles are rejected up
//! front instead of surfacing as phases that can never start.

use std::collections::HashMap;

use coordination::{Phase, Plan, Subtask};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

pub const RESEARCH_PHASE: &str = "research";
pub const ANALYSIS_PHASE: &str = "analysis";
pub const EXECUTION_PHASE: &str = "execution";
pub const REVIEW_PHASE: &str = "review";

const RESEARCH_KEYWORDS: &[&str] = &[
    "research",
    "search",
    "find",
    "investigate",
    "compare",
    "sources",
    "latest",
    "survey",
];
const ANALYSIS_KEYWORDS: &[&str] = &[
    "analy",
    "data",
    "trend",
    "statistic",
    "metric",
    "chart",
    "compare",
    "evaluate",
];
const CODE_KEYWORDS: &[&str] = &[
    "code",
    "implement",
    "script",
    "program",
    "function",
    "app",
    "api",
    "bug",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Plan has no phases")]
    Empty,

    #[error("Phase id {0} is used more than once")]
    DuplicatePhase(String),

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Phase dependencies form a cycle through {0}")]
    Cycle(String),
}

fn mentions(lowered: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| lowered.contains(k))
}

/// Build the phased plan for an objective.
pub fn create_plan(objective: &str) -> Result<Plan, PlanError> {
    let lowered = objective.to_lowercase();
    let mut phases = Vec::with_capacity(4);

    if mentions(&lowered, RESEARCH_KEYWORDS) {
        phases.push(
            Phase::new(RESEARCH_PHASE, "Research", "Gather information and sources").with_subtask(
                Subtask::new(
                    format!("{RESEARCH_PHASE}-1"),
                    "Search for sources on the objective",
                    objective,
                ),
            ),
        );
    }
    if mentions(&lowered, ANALYSIS_KEYWORDS) {
        phases.push(
            Phase::new(ANALYSIS_PHASE, "Analysis", "Analyze the gathered material").with_subtask(
                Subtask::new(
                    format!("{ANALYSIS_PHASE}-1"),
                    "Analyze the gathered data",
                    objective,
                ),
            ),
        );
    }

    let execution_title = if mentions(&lowered, CODE_KEYWORDS) {
        "Implement the solution in code"
    } else {
        "Write the requested deliverable"
    };
    phases.push(
        Phase::new(EXECUTION_PHASE, "Execution", "Produce the deliverable").with_subtask(
            Subtask::new(format!("{EXECUTION_PHASE}-1"), execution_title, objective),
        ),
    );
    phases.push(
        Phase::new(REVIEW_PHASE, "Review", "Quality check of the results").with_subtask(
            Subtask::new(
                format!("{REVIEW_PHASE}-1"),
                "Review the results for quality",
                objective,
            ),
        ),
    );

    // Chain each phase to its predecessor
    for i in 1..phases.len() {
        let previous = phases[i - 1].id.clone();
        phases[i].dependencies.push(previous);
    }

    let plan = Plan::new(phases);
    validate(&plan)?;
    Ok(plan)
}

/// Check the dependency graph and return phase ids in a runnable order.
pub fn validate(plan: &Plan) -> Result<Vec<String>, PlanError> {
    if plan.phases.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut graph = DiGraph::<&str, ()>::with_capacity(plan.phases.len(), plan.phases.len());
    let mut nodes = HashMap::with_capacity(plan.phases.len());
    for phase in &plan.phases {
        let node = graph.add_node(phase.id.as_str());
        if nodes.insert(phase.id.as_str(), node).is_some() {
            return Err(PlanError::DuplicatePhase(phase.id.clone()));
        }
    }

    for phase in &plan.phases {
        let to = nodes[phase.id.as_str()];
        for dependency in &phase.dependencies {
            let from = nodes
                .get(dependency.as_str())
                .ok_or_else(|| PlanError::UnknownDependency {
                    phase: phase.id.clone(),
                    dependency: dependency.clone(),
                })?;
            graph.add_edge(*from, to, ());
        }
    }

    toposort(&graph, None)
        .map(|order| order.into_iter().map(|n| graph[n].to_string()).collect())
        .map_err(|cycle| PlanError::Cycle(graph[cycle.node_id()].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::RoleTable;
    use coordination::AgentRole;

    fn ids(plan: &Plan) -> Vec<&str> {
        plan.phases.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_plain_objective_gets_execution_and_review() {
        let plan = create_plan("Draft a welcome email for new hires").unwrap();
        assert_eq!(ids(&plan), vec![EXECUTION_PHASE, REVIEW_PHASE]);
        assert_eq!(plan.total_phases, 2);
        assert_eq!(plan.phases[1].dependencies, vec![EXECUTION_PHASE.to_string()]);
    }

    #[test]
    fn test_research_and_analysis_are_prepended() {
        let plan = create_plan("Compare the latest vector databases").unwrap();
        assert_eq!(
            ids(&plan),
            vec![RESEARCH_PHASE, ANALYSIS_PHASE, EXECUTION_PHASE, REVIEW_PHASE]
        );
        assert!(plan.phases[0].dependencies.is_empty());
        assert_eq!(plan.phases[2].dependencies, vec![ANALYSIS_PHASE.to_string()]);
    }

    #[test]
    fn test_subtask_titles_route_to_expected_roles() {
        let table = RoleTable::default();
        let plan = create_plan("Research rate limiters and implement one in code").unwrap();
        let roles: Vec<AgentRole> = plan
            .phases
            .iter()
            .map(|p| table.role_for_title(&p.subtasks[0].title))
            .collect();
        assert_eq!(
            roles,
            vec![AgentRole::Researcher, AgentRole::Coder, AgentRole::Reviewer]
        );

        let plan = create_plan("Write a short poem").unwrap();
        assert_eq!(
            table.role_for_title(&plan.phases[0].subtasks[0].title),
            AgentRole::Writer
        );
    }

    #[test]
    fn test_validate_returns_dependency_order() {
        let plan = Plan::new(vec![
            Phase::new("b", "B", "").depends_on("a"),
            Phase::new("a", "A", ""),
        ]);
        assert_eq!(validate(&plan).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_validate_rejects_bad_graphs() {
        assert_eq!(validate(&Plan::default()), Err(PlanError::Empty));

        let dangling = Plan::new(vec![Phase::new("a", "A", "").depends_on("ghost")]);
        assert_eq!(
            validate(&dangling),
            Err(PlanError::UnknownDependency {
                phase: "a".into(),
                dependency: "ghost".into()
            })
        );

        let duplicate = Plan::new(vec![Phase::new("a", "A", ""), Phase::new("a", "A2", "")]);
        assert_eq!(validate(&duplicate), Err(PlanError::DuplicatePhase("a".into())));

        let cycle = Plan::new(vec![
            Phase::new("a", "A", "").depends_on("b"),
            Phase::new("b", "B", "").depends_on("a"),
        ]);
        assert!(matches!(validate(&cycle), Err(PlanError::Cycle(_))));
    }
}
