//! Worker integration tests against the in-memory store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use taskhive_core::{
    AgentEventType, CoordinationError, ExecutionState, ExecutorInstance, ExecutorStatus, Issue,
    IssueStatus, IssueType, Result, LABEL_NEEDS_QUALITY_GATES,
};
use taskhive_storage::{CoordinationStore, MemoryStore};
use taskhive_worker::{
    run_pipeline, ExecutionOutcome, GateOutcome, PhaseContext, PhaseRunner, PhaseToggles, Worker,
    WorkerConfig,
};

fn task(id: &str, title: &str) -> Issue {
    let mut issue = Issue::new(id, title, IssueType::Task);
    issue.acceptance_criteria = "done when tested".to_string();
    issue
}

async fn claimed_issue(store: &dyn CoordinationStore, id: &str) -> Issue {
    store
        .register_instance(&ExecutorInstance::new("exec-1", "host", 7, "0.2.0"))
        .await
        .unwrap();
    let issue = store.create_issue(&task(id, "pipeline"), "tester").await.unwrap();
    store.claim_issue(id, "exec-1").await.unwrap();
    issue
}

/// Runner that records which phases ran.
#[derive(Default)]
struct RecordingRunner {
    toggles: Option<PhaseToggles>,
    assessed: AtomicBool,
    executed: AtomicUsize,
    analyzed: AtomicBool,
    gated: AtomicBool,
    fail_gates: bool,
    fail_execute_once: AtomicBool,
}

#[async_trait]
impl PhaseRunner for RecordingRunner {
    fn phases(&self) -> PhaseToggles {
        self.toggles.unwrap_or_default()
    }

    async fn assess(&self, _ctx: &PhaseContext<'_>) -> Result<()> {
        self.assessed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<ExecutionOutcome> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        if self.fail_execute_once.swap(false, Ordering::SeqCst) {
            return Err(CoordinationError::transient(
                "execute",
                "simulated tool crash",
            ));
        }
        ctx.save_checkpoint(&json!({"step": "executed"})).await?;
        Ok(ExecutionOutcome {
            summary: "did the thing".to_string(),
            exit_code: Some(0),
            output_sample: "ok".to_string(),
        })
    }

    async fn analyze(&self, _ctx: &PhaseContext<'_>) -> Result<()> {
        self.analyzed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run_gates(&self, _ctx: &PhaseContext<'_>) -> Result<GateOutcome> {
        self.gated.store(true, Ordering::SeqCst);
        if self.fail_gates {
            Ok(GateOutcome::Failed {
                reason: "lint exploded".to_string(),
            })
        } else {
            Ok(GateOutcome::Passed)
        }
    }
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn pipeline_runs_all_phases() {
    let store = MemoryStore::new();
    let issue = claimed_issue(&store, "th-p1").await;
    let runner = RecordingRunner::default();

    let report = run_pipeline(&store, "exec-1", &runner, &issue)
        .await
        .expect("pipeline");
    assert_eq!(report.issue_id, "th-p1");
    assert_eq!(report.summary, "did the thing");

    assert!(runner.assessed.load(Ordering::SeqCst));
    assert_eq!(runner.executed.load(Ordering::SeqCst), 1);
    assert!(runner.analyzed.load(Ordering::SeqCst));
    assert!(runner.gated.load(Ordering::SeqCst));

    let state = store.get_execution_state("th-p1").await.unwrap().unwrap();
    assert_eq!(state.state, ExecutionState::Completed);

    let checkpoint: serde_json::Value =
        serde_json::from_str(&store.get_checkpoint("th-p1").await.unwrap()).unwrap();
    assert_eq!(checkpoint, json!({"step": "executed"}));

    let history = store.get_execution_history("th-p1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].success, Some(true));
    assert_eq!(history[0].exit_code, Some(0));
    assert_eq!(history[0].summary, "did the thing");

    let events = store.get_agent_events("th-p1", 0).await.unwrap();
    for expected in [
        AgentEventType::IssueClaimed,
        AgentEventType::AssessmentStarted,
        AgentEventType::AssessmentCompleted,
        AgentEventType::AnalysisStarted,
        AgentEventType::AnalysisCompleted,
        AgentEventType::QualityGatesStarted,
        AgentEventType::QualityGatesCompleted,
    ] {
        assert!(
            events.iter().any(|e| e.event_type == expected),
            "missing {expected} event"
        );
    }
}

#[tokio::test]
async fn pipeline_honors_phase_skips() {
    let store = MemoryStore::new();
    let issue = claimed_issue(&store, "th-p2").await;
    let runner = RecordingRunner {
        toggles: Some(PhaseToggles::minimal()),
        ..Default::default()
    };

    run_pipeline(&store, "exec-1", &runner, &issue)
        .await
        .expect("pipeline with skips");

    assert!(!runner.assessed.load(Ordering::SeqCst));
    assert!(!runner.analyzed.load(Ordering::SeqCst));
    assert!(!runner.gated.load(Ordering::SeqCst));

    let state = store.get_execution_state("th-p2").await.unwrap().unwrap();
    assert_eq!(state.state, ExecutionState::Completed);

    let events = store.get_agent_events("th-p2", 0).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == AgentEventType::QualityGatesSkipped));
    assert!(!events
        .iter()
        .any(|e| e.event_type == AgentEventType::AssessmentStarted));
}

#[tokio::test]
async fn pipeline_gate_failure_marks_failed() {
    let store = MemoryStore::new();
    let issue = claimed_issue(&store, "th-p3").await;
    let runner = RecordingRunner {
        fail_gates: true,
        ..Default::default()
    };

    let err = run_pipeline(&store, "exec-1", &runner, &issue)
        .await
        .expect_err("gates must fail the pipeline");
    assert!(err.to_string().contains("lint exploded"));

    let state = store.get_execution_state("th-p3").await.unwrap().unwrap();
    assert_eq!(state.state, ExecutionState::Failed);

    let history = store.get_execution_history("th-p3").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].success, Some(false));
    assert!(history[0].error_sample.contains("lint exploded"));
}

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_min_poll_interval(Duration::from_millis(10))
        .with_max_poll_interval(Duration::from_millis(50))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_janitor_interval(Duration::from_secs(3600))
}

#[tokio::test]
async fn worker_processes_ready_issue_end_to_end() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    store.create_issue(&task("th-w1", "workload"), "tester").await.unwrap();

    let worker = Arc::new(Worker::new(
        store.clone(),
        Arc::new(RecordingRunner::default()),
        fast_config(),
    ));
    let instance_id = worker.instance_id().to_string();
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    // The claim release is the worker's last post-success step, so once
    // the execution row is gone the whole hand-off has happened.
    wait_until("issue to close and release", || {
        let store = store.clone();
        async move {
            let closed = store
                .get_issue("th-w1")
                .await
                .map(|i| i.status == IssueStatus::Closed)
                .unwrap_or(false);
            let released = store
                .get_execution_state("th-w1")
                .await
                .map(|s| s.is_none())
                .unwrap_or(false);
            closed && released
        }
    })
    .await;

    // Success hand-off fired and the claim was released.
    assert!(store
        .has_label("th-w1", LABEL_NEEDS_QUALITY_GATES)
        .await
        .unwrap());
    assert!(store.get_execution_state("th-w1").await.unwrap().is_none());

    let history = store.get_execution_history("th-w1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].success, Some(true));

    worker.shutdown();
    handle.await.unwrap().unwrap();

    let instance = store.get_instance(&instance_id).await.unwrap();
    assert_eq!(instance.status, ExecutorStatus::Stopped);
}

#[tokio::test]
async fn worker_reopens_on_error_and_peer_retries() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    store.create_issue(&task("th-w2", "flaky"), "tester").await.unwrap();

    let runner = RecordingRunner::default();
    runner.fail_execute_once.store(true, Ordering::SeqCst);
    let runner = Arc::new(runner);

    let worker = Arc::new(Worker::new(store.clone(), runner.clone(), fast_config()));
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    // First attempt fails and reopens; the retry succeeds and closes.
    wait_until("issue to close after retry", || {
        let store = store.clone();
        async move {
            store
                .get_issue("th-w2")
                .await
                .map(|i| i.status == IssueStatus::Closed)
                .unwrap_or(false)
        }
    })
    .await;

    assert!(runner.executed.load(Ordering::SeqCst) >= 2);
    let history = store.get_execution_history("th-w2").await.unwrap();
    assert!(history.len() >= 2);
    assert_eq!(history[0].success, Some(false));
    assert_eq!(history.last().unwrap().success, Some(true));

    // The failed attempt left the reopen audit trail.
    let events = store.get_events("th-w2", 0).await.unwrap();
    assert!(events.iter().any(|e| {
        e.comment
            .as_deref()
            .is_some_and(|c| c.contains("simulated tool crash"))
    }));

    worker.shutdown();
    handle.await.unwrap().unwrap();
}
