//! Integration tests for SqliteStore
//!
//! Every test opens a fresh database file in a temp directory, so tests
//! are independent and parallel-safe.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use tempfile::TempDir;

use taskhive_core::{CoordinationConfig, CoordinationError, ExecutionState, Issue, IssueType};
use taskhive_storage::{CoordinationStore, SqliteStore};

async fn fresh_store() -> (TempDir, SqliteStore) {
    let dir = TempDir::new().expect("temp dir");
    let store = SqliteStore::open(dir.path().join("taskhive.db"), CoordinationConfig::default())
        .await
        .expect("open store");
    (dir, store)
}

#[tokio::test]
async fn happy_path() {
    let (_dir, store) = fresh_store().await;
    common::happy_path(&store).await;
}

#[tokio::test]
async fn claim_contention() {
    let (_dir, store) = fresh_store().await;
    common::claim_contention(Arc::new(store)).await;
}

#[tokio::test]
async fn crash_recovery() {
    let (_dir, store) = fresh_store().await;
    common::crash_recovery(&store).await;
}

#[tokio::test]
async fn cycle_prevention() {
    let (_dir, store) = fresh_store().await;
    common::cycle_prevention(&store).await;
}

#[tokio::test]
async fn workflow_overlay() {
    let (_dir, store) = fresh_store().await;
    common::workflow_overlay(&store).await;
}

#[tokio::test]
async fn error_path_reopen() {
    let (_dir, store) = fresh_store().await;
    common::error_path_reopen(&store).await;
}

#[tokio::test]
async fn claim_respects_status() {
    let (_dir, store) = fresh_store().await;
    common::claim_respects_status(&store).await;
}

#[tokio::test]
async fn illegal_transitions_rejected() {
    let (_dir, store) = fresh_store().await;
    common::illegal_transitions_rejected(&store).await;
}

#[tokio::test]
async fn monotonic_ids() {
    let (_dir, store) = fresh_store().await;
    common::monotonic_ids(&store).await;
}

#[tokio::test]
async fn counter_seeds_from_existing() {
    let (_dir, store) = fresh_store().await;
    common::counter_seeds_from_existing(&store).await;
}

#[tokio::test]
async fn idempotent_label_events() {
    let (_dir, store) = fresh_store().await;
    common::idempotent_label_events(&store).await;
}

#[tokio::test]
async fn readiness_correctness() {
    let (_dir, store) = fresh_store().await;
    common::readiness_correctness(&store).await;
}

#[tokio::test]
async fn round_trips() {
    let (_dir, store) = fresh_store().await;
    common::round_trips(&store).await;
}

#[tokio::test]
async fn search_filters() {
    let (_dir, store) = fresh_store().await;
    common::search_filters(&store).await;
}

#[tokio::test]
async fn statistics() {
    let (_dir, store) = fresh_store().await;
    common::statistics(&store).await;
}

#[tokio::test]
async fn dependency_tree() {
    let (_dir, store) = fresh_store().await;
    common::dependency_tree(&store).await;
}

#[tokio::test]
async fn update_issue_events() {
    let (_dir, store) = fresh_store().await;
    common::update_issue_events(&store).await;
}

#[tokio::test]
async fn validation_rejects() {
    let (_dir, store) = fresh_store().await;
    common::validation_rejects(&store).await;
}

#[tokio::test]
async fn executor_registry() {
    let (_dir, store) = fresh_store().await;
    common::executor_registry(&store).await;
}

#[tokio::test]
async fn execution_history() {
    let (_dir, store) = fresh_store().await;
    common::execution_history(&store).await;
}

#[tokio::test]
async fn agent_event_retention() {
    let (_dir, store) = fresh_store().await;
    common::agent_event_retention(&store).await;
}

#[tokio::test]
async fn config_prefix_override() {
    let (_dir, store) = fresh_store().await;
    common::config_prefix_override(&store).await;
}

// ============================================
// SQLite-specific concurrency and corruption checks
// ============================================

/// Property 6 under concurrency: N parallel creators get N dense,
/// distinct suffixes.
#[test_log::test(tokio::test)]
async fn concurrent_id_generation() {
    let (_dir, store) = fresh_store().await;
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let issue = common::task("", &format!("concurrent {i}"));
            store.create_issue(&issue, "tester").await.map(|i| i.id)
        }));
    }

    let mut suffixes = BTreeSet::new();
    for handle in handles {
        let id = handle.await.unwrap().expect("create under contention");
        let n: i64 = id["th-".len()..].parse().expect("numeric suffix");
        assert!(suffixes.insert(n), "duplicate id {id}");
    }
    let expected: BTreeSet<i64> = (1..=10).collect();
    assert_eq!(suffixes, expected);
}

/// Property 3: racing state transitions end with exactly one winner.
#[test_log::test(tokio::test)]
async fn concurrent_state_updates() {
    let (_dir, store) = fresh_store().await;
    let store = Arc::new(store);

    store
        .register_instance(&common::instance("exec-1"))
        .await
        .unwrap();
    store
        .create_issue(&common::task("vc-cas", "raced"), "tester")
        .await
        .unwrap();
    store.claim_issue("vc-cas", "exec-1").await.unwrap();

    let s1 = store.clone();
    let s2 = store.clone();
    let t1 =
        tokio::spawn(async move { s1.update_execution_state("vc-cas", ExecutionState::Assessing).await });
    let t2 =
        tokio::spawn(async move { s2.update_execution_state("vc-cas", ExecutionState::Assessing).await });
    let results = [t1.await.unwrap(), t2.await.unwrap()];

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one transition must win: {results:?}");
    let loser = results.into_iter().find(|r| r.is_err()).unwrap().unwrap_err();
    assert!(
        matches!(
            loser,
            CoordinationError::Conflict { .. } | CoordinationError::State { .. }
        ),
        "loser error: {loser}"
    );

    let state = store.get_execution_state("vc-cas").await.unwrap().unwrap();
    assert_eq!(state.state, ExecutionState::Assessing);
}

/// detect_cycles finds a cycle seeded past the guard (out-of-band write)
/// and reports it exactly once.
#[tokio::test]
async fn detect_seeded_cycle() {
    let (_dir, store) = fresh_store().await;
    for id in ["vc-x", "vc-y", "vc-z"] {
        store
            .create_issue(&common::task(id, id), "tester")
            .await
            .unwrap();
    }
    // Bypass add_dependency's cycle guard, as an out-of-band writer would.
    for (from, to) in [("vc-x", "vc-y"), ("vc-y", "vc-z"), ("vc-z", "vc-x")] {
        sqlx::query(
            "INSERT INTO dependencies (issue_id, depends_on_id, type, created_at) \
             VALUES (?, ?, 'blocks', ?)",
        )
        .bind(from)
        .bind(to)
        .bind(chrono::Utc::now())
        .execute(store.pool())
        .await
        .unwrap();
    }

    let cycles = store.detect_cycles().await.unwrap();
    assert_eq!(cycles.len(), 1, "one distinct cycle: {cycles:?}");
    assert_eq!(cycles[0], vec!["vc-x".to_string(), "vc-y".into(), "vc-z".into()]);
}

/// A corrupted stored ID suffix surfaces as a fatal error from the
/// counter seeding path.
#[tokio::test]
async fn corrupted_id_is_fatal() {
    let (_dir, store) = fresh_store().await;
    let bogus = Issue::new("th-abc", "corrupted", IssueType::Chore);
    store.create_issue(&bogus, "tester").await.unwrap();

    let err = store
        .create_issue(&common::task("", "needs counter"), "tester")
        .await
        .expect_err("corrupted suffix must be fatal");
    assert!(matches!(err, CoordinationError::Fatal { .. }), "error: {err}");
}

/// WAL journaling and foreign keys are actually on.
#[tokio::test]
async fn pragmas_applied() {
    let (_dir, store) = fresh_store().await;
    let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(journal_mode.to_lowercase(), "wal");

    let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(foreign_keys, 1);
}

/// Reopening an existing database file is idempotent and keeps data.
#[tokio::test]
async fn reopen_preserves_data() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("taskhive.db");
    {
        let store = SqliteStore::open(&path, CoordinationConfig::default())
            .await
            .unwrap();
        store
            .create_issue(&common::task("vc-keep", "durable"), "tester")
            .await
            .unwrap();
    }
    let store = SqliteStore::open(&path, CoordinationConfig::default())
        .await
        .unwrap();
    let issue = store.get_issue("vc-keep").await.unwrap();
    assert_eq!(issue.title, "durable");
}
