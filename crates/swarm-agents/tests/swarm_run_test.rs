//! Full runs of an in-process swarm against a scripted inference client.

mod common;

use std::sync::Arc;

use common::{fast_config, wait_for_status, worker, ScriptedClient, REVIEW_TOKENS, WORKER_TOKENS};
use coordination::{AgentActivity, AgentRole, PhaseStatus, SubtaskStatus, TaskSeed, TaskStatus};
use swarm_agents::inference::InferenceError;
use swarm_agents::planner::EXECUTION_PHASE;
use swarm_agents::protocol::codes;
use swarm_agents::swarm::{Swarm, SwarmBuilder};

const OBJECTIVE: &str = "Draft a welcome email for new hires";

async fn launch(task_id: &str, client: &Arc<ScriptedClient>) -> Swarm {
    SwarmBuilder::new(task_id, TaskSeed::new("user-1", OBJECTIVE), client.clone())
        .config(fast_config())
        .launch()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_objective_runs_to_completion() {
    let client = ScriptedClient::new().shared();
    let swarm = launch("task-complete", &client).await;

    let summary = swarm.run().await.unwrap();
    assert_eq!(summary.status, TaskStatus::Completed);
    assert_eq!(summary.phases_completed, 2);
    assert_eq!(summary.phases_total, 2);
    assert_eq!(summary.tokens_used, WORKER_TOKENS + REVIEW_TOKENS);
    assert!((summary.credits_used - 0.15).abs() < 1e-9);
    assert!(summary.error.is_none());

    let state = swarm.orchestrator().state().snapshot().await.unwrap();
    assert_eq!(state.status, TaskStatus::Completed);
    assert_eq!(state.plan.current_phase, 2);
    assert!(state.plan.phases.iter().all(|p| p.status == PhaseStatus::Completed));
    // The writer's report and the reviewer's report
    assert_eq!(state.artifacts.len(), 2);
    assert_eq!(state.metrics.tokens_used, WORKER_TOKENS + REVIEW_TOKENS);
    assert!(state.metrics.completed_at.is_some());
    assert!(state.agents.contains_key("writer-1"));
    assert!(state.agents.contains_key("reviewer-1"));

    assert_eq!(client.calls_for(AgentRole::Writer), 1);
    assert_eq!(client.calls_for(AgentRole::Reviewer), 1);
    assert_eq!(worker(swarm.workers(), "writer-1").metrics().tasks_completed, 1);

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_recoverable_failure_is_redispatched() {
    let client = ScriptedClient::new()
        .fail_next(
            AgentRole::Writer,
            InferenceError::Status {
                status: 502,
                body: "bad gateway".into(),
            },
        )
        .shared();
    let swarm = launch("task-retry", &client).await;

    let summary = swarm.run().await.unwrap();
    assert_eq!(summary.status, TaskStatus::Completed);
    assert_eq!(client.calls_for(AgentRole::Writer), 2);

    let writer = worker(swarm.workers(), "writer-1");
    assert_eq!(writer.metrics().tasks_failed, 1);
    assert_eq!(writer.metrics().tasks_completed, 1);

    let plan = swarm.orchestrator().plan().await;
    let subtask = &plan.phases[0].subtasks[0];
    assert_eq!(plan.phases[0].id, EXECUTION_PHASE);
    assert_eq!(subtask.status, SubtaskStatus::Completed);
    assert!(subtask.attempts >= 2);

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_unrecoverable_failure_fails_the_task() {
    let client = ScriptedClient::new()
        .fail_next(AgentRole::Writer, InferenceError::Rejected("content policy".into()))
        .shared();
    let swarm = launch("task-fail", &client).await;

    let summary = swarm.run().await.unwrap();
    assert_eq!(summary.status, TaskStatus::Failed);
    assert_eq!(summary.phases_completed, 0);
    assert_eq!(
        summary.error.as_ref().map(|e| e.code.as_str()),
        Some(codes::SUBTASK_FAILED)
    );
    // No retry, and the review phase never starts
    assert_eq!(client.calls_for(AgentRole::Writer), 1);
    assert_eq!(client.calls_for(AgentRole::Reviewer), 0);

    let state = swarm.orchestrator().state().snapshot().await.unwrap();
    assert_eq!(state.status, TaskStatus::Failed);
    assert_eq!(state.plan.phases[0].status, PhaseStatus::Failed);
    assert_eq!(state.plan.phases[0].subtasks[0].status, SubtaskStatus::Failed);
    assert_eq!(state.plan.phases[1].status, PhaseStatus::Pending);
    assert_eq!(state.error.map(|e| e.code), Some(codes::SUBTASK_FAILED.to_string()));

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_cancel_interrupts_busy_worker() {
    let client = ScriptedClient::new().hang_on(AgentRole::Writer).shared();
    let swarm = launch("task-cancel", &client).await;
    let orchestrator = Arc::clone(swarm.orchestrator());
    let writer = worker(swarm.workers(), "writer-1");

    orchestrator.create_plan(OBJECTIVE).await.unwrap();
    let (summary, _) = tokio::join!(orchestrator.execute(), async {
        wait_for_status(&writer, AgentActivity::Busy).await;
        orchestrator.cancel("user request").await.unwrap();
    });

    let summary = summary.unwrap();
    assert_eq!(summary.status, TaskStatus::Cancelled);
    assert!(summary.error.is_none());
    assert!(orchestrator.is_cancelled());

    wait_for_status(&writer, AgentActivity::Terminated).await;
    assert!(writer.current_assignment().is_none());
    assert_eq!(orchestrator.state().status().await.unwrap(), TaskStatus::Cancelled);
    assert_eq!(client.calls_for(AgentRole::Reviewer), 0);

    // Idle workers see the cancelled status and stop too
    wait_for_status(&worker(swarm.workers(), "reviewer-1"), AgentActivity::Terminated).await;

    swarm.shutdown().await;
}
