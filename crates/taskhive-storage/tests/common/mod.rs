//! Shared test suite run against every CoordinationStore backend.
//!
//! Each function takes a `&dyn CoordinationStore` (or an `Arc` for the
//! concurrency checks) so the SQLite and in-memory backends exercise the
//! same assertions.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use taskhive_core::{
    AgentEvent, AgentEventType, CoordinationError, Dependency, DependencyType, EventRetention,
    ExecutionAttempt, ExecutionState, ExecutorInstance, ExecutorStatus, Issue, IssueEventType,
    IssueStatus, IssueType, IssueUpdate, Priority, Severity, WorkflowTrigger,
    LABEL_NEEDS_QUALITY_GATES, LABEL_TASK_READY,
};
use taskhive_storage::{CoordinationStore, IssueFilter, ReadyFilter, REOPEN_MESSAGE};

pub fn task(id: &str, title: &str) -> Issue {
    let mut issue = Issue::new(id, title, IssueType::Task);
    issue.acceptance_criteria = "verified by tests".to_string();
    issue
}

pub fn instance(id: &str) -> ExecutorInstance {
    ExecutorInstance::new(id, "host-a", 100, "0.2.0")
}

/// S1: register, create, claim, walk the full pipeline, release.
pub async fn happy_path(store: &dyn CoordinationStore) {
    store
        .register_instance(&instance("exec-1"))
        .await
        .expect("register");
    let mut issue = task("vc-1", "x");
    issue.priority = Priority::new(1).unwrap();
    store.create_issue(&issue, "tester").await.expect("create");

    store.claim_issue("vc-1", "exec-1").await.expect("claim");

    let claimed = store.get_issue("vc-1").await.unwrap();
    assert_eq!(claimed.status, IssueStatus::InProgress);
    let execution = store
        .get_execution_state("vc-1")
        .await
        .unwrap()
        .expect("execution row");
    assert_eq!(execution.state, ExecutionState::Claimed);
    assert_eq!(execution.executor_instance_id, "exec-1");
    assert_eq!(execution.checkpoint, "{}");

    for state in [
        ExecutionState::Assessing,
        ExecutionState::Executing,
        ExecutionState::Analyzing,
        ExecutionState::Gates,
        ExecutionState::Completed,
    ] {
        store
            .update_execution_state("vc-1", state)
            .await
            .unwrap_or_else(|e| panic!("transition to {state}: {e}"));
    }

    store.release_issue("vc-1").await.expect("release");
    assert!(store.get_execution_state("vc-1").await.unwrap().is_none());
}

/// S2: concurrent claims; exactly one wins, the loser sees "already
/// claimed".
pub async fn claim_contention(store: Arc<dyn CoordinationStore>) {
    store.register_instance(&instance("exec-1")).await.unwrap();
    store.register_instance(&instance("exec-2")).await.unwrap();
    store.create_issue(&task("vc-1", "contended"), "tester").await.unwrap();

    let s1 = store.clone();
    let s2 = store.clone();
    let t1 = tokio::spawn(async move { s1.claim_issue("vc-1", "exec-1").await });
    let t2 = tokio::spawn(async move { s2.claim_issue("vc-1", "exec-2").await });
    let r1 = t1.await.unwrap();
    let r2 = t2.await.unwrap();

    let (winner, loser_err) = match (r1, r2) {
        (Ok(()), Err(e)) => ("exec-1", e),
        (Err(e), Ok(())) => ("exec-2", e),
        (Ok(()), Ok(())) => panic!("both claims succeeded"),
        (Err(e1), Err(e2)) => panic!("both claims failed: {e1} / {e2}"),
    };
    assert!(
        loser_err.to_string().contains("already claimed"),
        "unexpected loser error: {loser_err}"
    );
    let execution = store.get_execution_state("vc-1").await.unwrap().unwrap();
    assert_eq!(execution.executor_instance_id, winner);
}

/// S3: stale-worker reclamation end to end.
pub async fn crash_recovery(store: &dyn CoordinationStore) {
    let mut stale = instance("exec-stale");
    stale.last_heartbeat = chrono::Utc::now() - chrono::Duration::minutes(10);
    store.register_instance(&stale).await.unwrap();

    store.create_issue(&task("vc-2", "doomed"), "tester").await.unwrap();
    store.claim_issue("vc-2", "exec-stale").await.unwrap();
    store
        .save_checkpoint("vc-2", &json!({"step": 2}))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let report = store.cleanup_stale_instances(300, &cancel).await.unwrap();
    assert_eq!(report.cleaned, 1);
    assert!(!report.interrupted);

    let cleaned = store.get_instance("exec-stale").await.unwrap();
    assert_eq!(cleaned.status, ExecutorStatus::Stopped);
    assert!(store.get_execution_state("vc-2").await.unwrap().is_none());
    assert_eq!(store.get_issue("vc-2").await.unwrap().status, IssueStatus::Open);

    let events = store.get_events("vc-2", 0).await.unwrap();
    let comment = events
        .iter()
        .filter(|e| e.event_type == IssueEventType::Commented)
        .find_map(|e| e.comment.clone())
        .expect("cleanup comment");
    assert!(comment.contains("exec-stale"), "comment: {comment}");
    assert!(comment.contains("300"), "comment: {comment}");

    // The sweep is idempotent.
    let again = store.cleanup_stale_instances(300, &cancel).await.unwrap();
    assert_eq!(again.cleaned, 0);

    store.register_instance(&instance("exec-2")).await.unwrap();
    let ready = store.get_ready_work(&ReadyFilter::default()).await.unwrap();
    assert!(ready.iter().any(|i| i.id == "vc-2"));
    store.claim_issue("vc-2", "exec-2").await.expect("reclaim");
}

/// S4: cycle rejection names every participant and leaves the store
/// unchanged.
pub async fn cycle_prevention(store: &dyn CoordinationStore) {
    for id in ["vc-A", "vc-B", "vc-C"] {
        store.create_issue(&task(id, id), "tester").await.unwrap();
    }
    store
        .add_dependency(&Dependency::new("vc-A", "vc-B", DependencyType::Blocks), "tester")
        .await
        .unwrap();
    store
        .add_dependency(&Dependency::new("vc-B", "vc-C", DependencyType::Blocks), "tester")
        .await
        .unwrap();

    let err = store
        .add_dependency(&Dependency::new("vc-C", "vc-A", DependencyType::Blocks), "tester")
        .await
        .expect_err("cycle must be rejected");
    let message = err.to_string();
    for id in ["vc-A", "vc-B", "vc-C"] {
        assert!(message.contains(id), "error {message} missing {id}");
    }

    // No dependency row was left behind.
    assert!(store.get_dependencies("vc-C").await.unwrap().is_empty());
    assert!(store.detect_cycles().await.unwrap().is_empty());
}

/// S5: workflow overlay transition plus idempotent re-invocation.
pub async fn workflow_overlay(store: &dyn CoordinationStore) {
    store.create_issue(&task("vc-5", "overlay"), "tester").await.unwrap();
    assert!(store.add_label("vc-5", LABEL_TASK_READY, "tester").await.unwrap());

    let transition = store
        .transition_workflow_state(
            "vc-5",
            LABEL_TASK_READY,
            LABEL_NEEDS_QUALITY_GATES,
            WorkflowTrigger::EpicCompleted,
            "exec-1",
        )
        .await
        .unwrap();
    assert!(transition.removed);
    assert!(transition.added);
    assert!(transition.event_recorded);

    assert_eq!(
        store.get_state_label("vc-5").await.unwrap().as_deref(),
        Some(LABEL_NEEDS_QUALITY_GATES)
    );
    assert!(!store.has_label("vc-5", LABEL_TASK_READY).await.unwrap());

    let agent_events = store.get_agent_events("vc-5", 0).await.unwrap();
    let transitions: Vec<&AgentEvent> = agent_events
        .iter()
        .filter(|e| e.event_type == AgentEventType::LabelStateTransition)
        .collect();
    assert_eq!(transitions.len(), 1);
    let data = &transitions[0].data;
    assert_eq!(data["from_label"], LABEL_TASK_READY);
    assert_eq!(data["to_label"], LABEL_NEEDS_QUALITY_GATES);
    assert_eq!(data["trigger"], "epic_completed");
    assert_eq!(data["actor"], "exec-1");

    let label_events_before = store
        .get_events("vc-5", 0)
        .await
        .unwrap()
        .iter()
        .filter(|e| {
            matches!(
                e.event_type,
                IssueEventType::LabelAdded | IssueEventType::LabelRemoved
            )
        })
        .count();

    // Re-invoking is a no-op on the labels and emits no new label events.
    let repeat = store
        .transition_workflow_state(
            "vc-5",
            LABEL_TASK_READY,
            LABEL_NEEDS_QUALITY_GATES,
            WorkflowTrigger::EpicCompleted,
            "exec-1",
        )
        .await
        .unwrap();
    assert!(!repeat.removed);
    assert!(!repeat.added);

    let label_events_after = store
        .get_events("vc-5", 0)
        .await
        .unwrap()
        .iter()
        .filter(|e| {
            matches!(
                e.event_type,
                IssueEventType::LabelAdded | IssueEventType::LabelRemoved
            )
        })
        .count();
    assert_eq!(label_events_before, label_events_after);
}

/// S6: error-path release reopens the issue with the audit trail intact.
pub async fn error_path_reopen(store: &dyn CoordinationStore) {
    store.register_instance(&instance("exec-1")).await.unwrap();
    store.create_issue(&task("vc-6", "fragile"), "tester").await.unwrap();
    store.claim_issue("vc-6", "exec-1").await.unwrap();
    store
        .update_execution_state("vc-6", ExecutionState::Executing)
        .await
        .unwrap();

    store
        .release_and_reopen("vc-6", "exec-1", "compiler crashed")
        .await
        .unwrap();

    assert!(store.get_execution_state("vc-6").await.unwrap().is_none());
    assert_eq!(store.get_issue("vc-6").await.unwrap().status, IssueStatus::Open);

    let events = store.get_events("vc-6", 0).await.unwrap();
    assert!(events.iter().any(|e| {
        e.event_type == IssueEventType::Commented
            && e.comment.as_deref() == Some("compiler crashed")
    }));
    assert!(events.iter().any(|e| {
        e.event_type == IssueEventType::StatusChanged
            && e.comment.as_deref() == Some(REOPEN_MESSAGE)
    }));

    store.claim_issue("vc-6", "exec-1").await.expect("reclaim after reopen");
}

/// Property 2: claiming a non-open issue fails and changes nothing.
pub async fn claim_respects_status(store: &dyn CoordinationStore) {
    store.register_instance(&instance("exec-1")).await.unwrap();
    store.create_issue(&task("vc-7", "finished"), "tester").await.unwrap();
    store.close_issue("vc-7", "tester").await.unwrap();

    let err = store.claim_issue("vc-7", "exec-1").await.expect_err("closed issue");
    assert!(err.to_string().contains("not open"), "error: {err}");
    assert!(store.get_execution_state("vc-7").await.unwrap().is_none());

    let err = store.claim_issue("vc-99999", "exec-1").await.expect_err("absent issue");
    assert!(matches!(err, CoordinationError::NotFound { .. }));
}

/// Property 4: only transitions in the table succeed.
pub async fn illegal_transitions_rejected(store: &dyn CoordinationStore) {
    store.register_instance(&instance("exec-1")).await.unwrap();
    store.create_issue(&task("vc-8", "machine"), "tester").await.unwrap();
    store.claim_issue("vc-8", "exec-1").await.unwrap();

    // Backward and skipped-into states are rejected.
    for bad in [ExecutionState::Analyzing, ExecutionState::Gates, ExecutionState::Committing] {
        let err = store
            .update_execution_state("vc-8", bad)
            .await
            .expect_err("illegal transition");
        assert!(
            err.to_string().contains("invalid state transition"),
            "error: {err}"
        );
    }

    // The failure escape hatch works from a mid-pipeline state.
    store
        .update_execution_state("vc-8", ExecutionState::Executing)
        .await
        .unwrap();
    store
        .update_execution_state("vc-8", ExecutionState::Failed)
        .await
        .unwrap();

    // Terminal states accept nothing.
    let err = store
        .update_execution_state("vc-8", ExecutionState::Completed)
        .await
        .expect_err("terminal");
    assert!(err.to_string().contains("invalid state transition"));
}

/// Property 6 (sequential shape): generated IDs are dense and increasing.
pub async fn monotonic_ids(store: &dyn CoordinationStore) {
    let mut issue = task("", "generated");
    let first = store.create_issue(&issue, "tester").await.unwrap();
    issue.title = "generated 2".to_string();
    let second = store.create_issue(&issue, "tester").await.unwrap();
    assert_ne!(first.id, second.id);

    let prefix = first.id.split('-').next().unwrap().to_string();
    let n1: i64 = first.id[prefix.len() + 1..].parse().unwrap();
    let n2: i64 = second.id[prefix.len() + 1..].parse().unwrap();
    assert_eq!(n2, n1 + 1);
}

/// Counter seeding: a pre-set ID is respected and the counter skips past
/// it.
pub async fn counter_seeds_from_existing(store: &dyn CoordinationStore) {
    let preset = task("th-41", "imported");
    let stored = store.create_issue(&preset, "tester").await.unwrap();
    assert_eq!(stored.id, "th-41");

    let generated = store.create_issue(&task("", "fresh"), "tester").await.unwrap();
    let n: i64 = generated.id["th-".len()..].parse().unwrap();
    assert!(n > 41, "generated {} should skip past th-41", generated.id);
}

/// Property 7: label add/remove idempotence at the event level.
pub async fn idempotent_label_events(store: &dyn CoordinationStore) {
    store.create_issue(&task("vc-9", "labelled"), "tester").await.unwrap();

    assert!(store.add_label("vc-9", "urgent", "tester").await.unwrap());
    assert!(!store.add_label("vc-9", "urgent", "tester").await.unwrap());
    assert!(!store.add_label("vc-9", "urgent", "tester").await.unwrap());

    let added_events = store
        .get_events("vc-9", 0)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == IssueEventType::LabelAdded)
        .count();
    assert_eq!(added_events, 1);

    assert!(!store.remove_label("vc-9", "absent", "tester").await.unwrap());
    let removed_events = store
        .get_events("vc-9", 0)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == IssueEventType::LabelRemoved)
        .count();
    assert_eq!(removed_events, 0);
}

/// Property 8: readiness is exactly "status matches and no unresolved
/// blocker".
pub async fn readiness_correctness(store: &dyn CoordinationStore) {
    store.create_issue(&task("vc-free", "no deps"), "tester").await.unwrap();
    store.create_issue(&task("vc-blocked", "waiting"), "tester").await.unwrap();
    store.create_issue(&task("vc-blocker", "open blocker"), "tester").await.unwrap();
    store.create_issue(&task("vc-done-dep", "done blocker"), "tester").await.unwrap();
    store.create_issue(&task("vc-closed-blocker", "closed"), "tester").await.unwrap();
    store.close_issue("vc-closed-blocker", "tester").await.unwrap();

    store
        .add_dependency(
            &Dependency::new("vc-blocked", "vc-blocker", DependencyType::Blocks),
            "tester",
        )
        .await
        .unwrap();
    store
        .add_dependency(
            &Dependency::new("vc-done-dep", "vc-closed-blocker", DependencyType::Blocks),
            "tester",
        )
        .await
        .unwrap();
    // Non-blocking edge types never gate readiness.
    store
        .add_dependency(
            &Dependency::new("vc-free", "vc-blocker", DependencyType::Related),
            "tester",
        )
        .await
        .unwrap();

    let ready: Vec<String> = store
        .get_ready_work(&ReadyFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert!(ready.contains(&"vc-free".to_string()));
    assert!(ready.contains(&"vc-done-dep".to_string()));
    assert!(ready.contains(&"vc-blocker".to_string()));
    assert!(!ready.contains(&"vc-blocked".to_string()));

    let blocked = store.get_blocked_issues().await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].issue.id, "vc-blocked");
    assert_eq!(blocked[0].blocker_ids, vec!["vc-blocker".to_string()]);
}

/// Property 10 round trips: checkpoint and create/get.
pub async fn round_trips(store: &dyn CoordinationStore) {
    store.register_instance(&instance("exec-1")).await.unwrap();
    let mut issue = task("vc-rt", "round trip");
    issue.description = "look closely".to_string();
    issue.assignee = Some("crew".to_string());
    issue.estimated_minutes = Some(90);
    let stored = store.create_issue(&issue, "tester").await.unwrap();
    let fetched = store.get_issue("vc-rt").await.unwrap();
    assert_eq!(stored.id, fetched.id);
    assert_eq!(fetched.status, stored.status);
    assert_eq!(fetched.priority, stored.priority);
    assert_eq!(fetched.issue_type, stored.issue_type);
    // Timestamps may lose sub-second precision in transit.
    assert!((stored.created_at - fetched.created_at).num_seconds().abs() < 1);
    assert_eq!(fetched.title, issue.title);
    assert_eq!(fetched.description, issue.description);
    assert_eq!(fetched.assignee, issue.assignee);
    assert_eq!(fetched.estimated_minutes, issue.estimated_minutes);

    store.claim_issue("vc-rt", "exec-1").await.unwrap();
    let value = json!({"step": 3, "files": ["a.rs", "b.rs"], "nested": {"ok": true}});
    store.save_checkpoint("vc-rt", &value).await.unwrap();
    let raw = store.get_checkpoint("vc-rt").await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed, value);
}

/// Search filters: status, type, labels AND, text, limit.
pub async fn search_filters(store: &dyn CoordinationStore) {
    let mut a = task("vc-s1", "alpha needle");
    a.priority = Priority::new(0).unwrap();
    store.create_issue(&a, "tester").await.unwrap();
    let mut b = Issue::new("vc-s2", "beta", IssueType::Epic);
    b.description = "has the needle too".to_string();
    store.create_issue(&b, "tester").await.unwrap();
    store.create_issue(&task("vc-s3", "gamma"), "tester").await.unwrap();

    store.add_label("vc-s1", "backend", "tester").await.unwrap();
    store.add_label("vc-s1", "perf", "tester").await.unwrap();
    store.add_label("vc-s2", "backend", "tester").await.unwrap();

    let found = store
        .search_issues("needle", &IssueFilter::default())
        .await
        .unwrap();
    let ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();
    assert!(ids.contains(&"vc-s1"));
    assert!(ids.contains(&"vc-s2"));
    assert!(!ids.contains(&"vc-s3"));

    let both_labels = store
        .search_issues(
            "",
            &IssueFilter {
                labels: vec!["backend".to_string(), "perf".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(both_labels.len(), 1);
    assert_eq!(both_labels[0].id, "vc-s1");

    let epics = store
        .search_issues(
            "",
            &IssueFilter {
                issue_type: Some(IssueType::Epic),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(epics.iter().all(|i| i.issue_type == IssueType::Epic));

    let limited = store
        .search_issues(
            "",
            &IssueFilter {
                limit: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(limited.len() <= 2);
}

/// Statistics on an empty store are all zero; lead time shows up after a
/// close.
pub async fn statistics(store: &dyn CoordinationStore) {
    let empty = store.get_statistics().await.unwrap();
    assert_eq!(empty.total, 0);
    assert_eq!(empty.ready, 0);
    assert_eq!(empty.blocked, 0);
    assert_eq!(empty.avg_lead_time_hours, 0.0);

    store.create_issue(&task("vc-st1", "one"), "tester").await.unwrap();
    store.create_issue(&task("vc-st2", "two"), "tester").await.unwrap();
    store.close_issue("vc-st2", "tester").await.unwrap();

    let stats = store.get_statistics().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.open, 1);
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.ready, 1);
    assert!(stats.avg_lead_time_hours >= 0.0);
}

/// Dependency tree walks respect the depth bound and mark truncation.
pub async fn dependency_tree(store: &dyn CoordinationStore) {
    for id in ["vc-t1", "vc-t2", "vc-t3", "vc-t4"] {
        store.create_issue(&task(id, id), "tester").await.unwrap();
    }
    store
        .add_dependency(&Dependency::new("vc-t1", "vc-t2", DependencyType::Blocks), "tester")
        .await
        .unwrap();
    store
        .add_dependency(&Dependency::new("vc-t2", "vc-t3", DependencyType::Blocks), "tester")
        .await
        .unwrap();
    store
        .add_dependency(&Dependency::new("vc-t3", "vc-t4", DependencyType::Blocks), "tester")
        .await
        .unwrap();

    let full = store.get_dependency_tree("vc-t1", 10).await.unwrap();
    assert_eq!(full.len(), 4);
    assert!(full.iter().all(|n| !n.truncated));
    assert_eq!(full[0].issue.id, "vc-t1");
    assert_eq!(full[0].depth, 0);

    let bounded = store.get_dependency_tree("vc-t1", 2).await.unwrap();
    assert_eq!(bounded.len(), 3);
    let leaf = bounded.iter().find(|n| n.issue.id == "vc-t3").unwrap();
    assert_eq!(leaf.depth, 2);
    assert!(leaf.truncated, "vc-t3 has children beyond the bound");

    let err = store.get_dependency_tree("vc-t1", 0).await.expect_err("bad depth");
    assert!(matches!(err, CoordinationError::Validation { .. }));
}

/// Update events: updated vs status_changed vs closed.
pub async fn update_issue_events(store: &dyn CoordinationStore) {
    store.create_issue(&task("vc-u1", "editable"), "tester").await.unwrap();

    store
        .update_issue(
            "vc-u1",
            &IssueUpdate {
                notes: Some("touched".to_string()),
                ..Default::default()
            },
            "tester",
        )
        .await
        .unwrap();
    store
        .update_issue(
            "vc-u1",
            &IssueUpdate {
                status: Some(IssueStatus::Blocked),
                ..Default::default()
            },
            "tester",
        )
        .await
        .unwrap();
    let closed = store
        .update_issue(
            "vc-u1",
            &IssueUpdate {
                status: Some(IssueStatus::Closed),
                ..Default::default()
            },
            "tester",
        )
        .await
        .unwrap();
    assert!(closed.closed_at.is_some());

    let events = store.get_events("vc-u1", 0).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == IssueEventType::Updated));
    assert!(events.iter().any(|e| e.event_type == IssueEventType::StatusChanged));
    assert!(events.iter().any(|e| e.event_type == IssueEventType::Closed));

    let err = store
        .update_issue("vc-u1", &IssueUpdate::default(), "tester")
        .await
        .expect_err("empty update");
    assert!(matches!(err, CoordinationError::Validation { .. }));
}

/// Validation failures leave nothing behind.
pub async fn validation_rejects(store: &dyn CoordinationStore) {
    // Task without acceptance criteria.
    let bare = Issue::new("vc-v1", "no criteria", IssueType::Task);
    let err = store.create_issue(&bare, "tester").await.expect_err("invalid");
    assert!(matches!(err, CoordinationError::Validation { .. }));
    assert!(matches!(
        store.get_issue("vc-v1").await.expect_err("must not exist"),
        CoordinationError::NotFound { .. }
    ));

    // Self-dependency.
    store.create_issue(&task("vc-v2", "selfish"), "tester").await.unwrap();
    let err = store
        .add_dependency(&Dependency::new("vc-v2", "vc-v2", DependencyType::Blocks), "tester")
        .await
        .expect_err("self edge");
    assert!(matches!(err, CoordinationError::Validation { .. }));

    // Dependency on a missing issue names the missing endpoint.
    let err = store
        .add_dependency(&Dependency::new("vc-v2", "vc-ghost", DependencyType::Blocks), "tester")
        .await
        .expect_err("missing endpoint");
    assert!(err.to_string().contains("vc-ghost"), "error: {err}");
}

/// Executor registry: upsert, heartbeat, active ordering, retention.
pub async fn executor_registry(store: &dyn CoordinationStore) {
    let mut first = instance("exec-a");
    first.version = "0.1.0".to_string();
    store.register_instance(&first).await.unwrap();

    // Upsert overwrites the volatile fields.
    first.version = "0.2.0".to_string();
    first.pid = 222;
    store.register_instance(&first).await.unwrap();
    let stored = store.get_instance("exec-a").await.unwrap();
    assert_eq!(stored.version, "0.2.0");
    assert_eq!(stored.pid, 222);

    let err = store.update_heartbeat("exec-ghost").await.expect_err("missing");
    assert!(matches!(err, CoordinationError::NotFound { .. }));

    let before = store.get_instance("exec-a").await.unwrap().last_heartbeat;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store.update_heartbeat("exec-a").await.unwrap();
    let after = store.get_instance("exec-a").await.unwrap().last_heartbeat;
    assert!(after > before);

    let mut old_stopped = instance("exec-old");
    old_stopped.status = ExecutorStatus::Stopped;
    old_stopped.started_at = chrono::Utc::now() - chrono::Duration::days(30);
    store.register_instance(&old_stopped).await.unwrap();
    let mut recent_stopped = instance("exec-recent");
    recent_stopped.status = ExecutorStatus::Stopped;
    recent_stopped.started_at = chrono::Utc::now() - chrono::Duration::days(20);
    store.register_instance(&recent_stopped).await.unwrap();

    let active = store.get_active_instances().await.unwrap();
    assert!(active.iter().all(|i| i.status == ExecutorStatus::Running));
    assert!(active.iter().any(|i| i.instance_id == "exec-a"));

    // Keep the most recent stopped instance, delete the older one.
    let deleted = store
        .delete_old_stopped_instances(7 * 24 * 3600, 1)
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(store.get_instance("exec-recent").await.is_ok());
    assert!(store.get_instance("exec-old").await.is_err());

    let err = store.delete_old_stopped_instances(0, 1).await.expect_err("bad args");
    assert!(matches!(err, CoordinationError::Validation { .. }));
    let err = store.delete_old_stopped_instances(60, -1).await.expect_err("bad args");
    assert!(matches!(err, CoordinationError::Validation { .. }));
}

/// Execution history: auto numbering, completion updates, ordering.
pub async fn execution_history(store: &dyn CoordinationStore) {
    store.create_issue(&task("vc-h1", "history"), "tester").await.unwrap();

    let first_id = store
        .record_attempt(&ExecutionAttempt::new("vc-h1"))
        .await
        .unwrap();
    let second_id = store
        .record_attempt(&ExecutionAttempt::new("vc-h1"))
        .await
        .unwrap();
    assert_ne!(first_id, second_id);

    let mut completion = ExecutionAttempt::new("vc-h1");
    completion.id = Some(first_id);
    completion.completed_at = Some(chrono::Utc::now());
    completion.success = Some(true);
    completion.exit_code = Some(0);
    completion.summary = "all green".to_string();
    store.record_attempt(&completion).await.unwrap();

    let history = store.get_execution_history("vc-h1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].attempt_number, 1);
    assert_eq!(history[1].attempt_number, 2);
    assert_eq!(history[0].success, Some(true));
    assert_eq!(history[0].summary, "all green");
    assert_eq!(history[1].success, None);

    let mut bogus = ExecutionAttempt::new("vc-h1");
    bogus.id = Some(999_999);
    let err = store.record_attempt(&bogus).await.expect_err("unknown attempt");
    assert!(matches!(err, CoordinationError::NotFound { .. }));
}

/// Agent-event retention: age, per-issue cap, critical survival,
/// cancellation.
pub async fn agent_event_retention(store: &dyn CoordinationStore) {
    store.create_issue(&task("vc-r1", "aged"), "tester").await.unwrap();
    store.create_issue(&task("vc-r2", "noisy"), "tester").await.unwrap();

    let retention = EventRetention {
        info_warning_days: 7,
        error_critical_days: 30,
        per_issue_limit: 5,
        global_limit: 1_000,
        batch_size: 100,
    };

    // vc-r1 checks the age windows: an ancient info event is past both
    // cutoffs, an old error is still inside the error window.
    let mut ancient = AgentEvent::new(
        AgentEventType::Progress,
        "vc-r1",
        Severity::Info,
        "long ago",
    );
    ancient.timestamp = chrono::Utc::now() - chrono::Duration::days(40);
    store.record_agent_event(&ancient).await.unwrap();
    let mut old_error =
        AgentEvent::new(AgentEventType::Error, "vc-r1", Severity::Error, "recent-ish");
    old_error.timestamp = chrono::Utc::now() - chrono::Duration::days(10);
    store.record_agent_event(&old_error).await.unwrap();

    // vc-r2 checks the per-issue cap: fresh info events past the cap,
    // plus one critical that must survive pruning.
    for i in 0..8 {
        store
            .record_agent_event(&AgentEvent::new(
                AgentEventType::Progress,
                "vc-r2",
                Severity::Info,
                format!("tick {i}"),
            ))
            .await
            .unwrap();
    }
    store
        .record_agent_event(&AgentEvent::new(
            AgentEventType::WatchdogAlert,
            "vc-r2",
            Severity::Critical,
            "never drop this",
        ))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let report = store.cleanup_agent_events(&retention, &cancel).await.unwrap();
    assert!(report.deleted >= 1, "expected deletions, got {report:?}");
    assert!(!report.interrupted);

    let aged = store.get_agent_events("vc-r1", 0).await.unwrap();
    assert!(aged.iter().all(|e| e.message != "long ago"));
    assert!(
        aged.iter().any(|e| e.message == "recent-ish"),
        "errors inside their window survive"
    );

    let capped = store.get_agent_events("vc-r2", 0).await.unwrap();
    assert!(capped.len() as i64 <= retention.per_issue_limit);
    assert!(
        capped.iter().any(|e| e.severity == Severity::Critical),
        "critical events survive the cap"
    );

    // A cancelled token interrupts the sweep.
    cancel.cancel();
    let interrupted = store.cleanup_agent_events(&retention, &cancel).await.unwrap();
    assert!(interrupted.interrupted);
}

/// Config keys override the generated-ID prefix.
pub async fn config_prefix_override(store: &dyn CoordinationStore) {
    store.set_config("issue_prefix", "zz").await.unwrap();
    assert_eq!(
        store.get_config("issue_prefix").await.unwrap().as_deref(),
        Some("zz")
    );
    let generated = store.create_issue(&task("", "prefixed"), "tester").await.unwrap();
    assert!(generated.id.starts_with("zz-"), "id: {}", generated.id);
}
