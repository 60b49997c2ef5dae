//! The in-memory store runs the same suite as the SQL backends; this is
//! what makes it a trustworthy test double.

mod common;

use std::sync::Arc;

use taskhive_storage::MemoryStore;

#[tokio::test]
async fn happy_path() {
    common::happy_path(&MemoryStore::new()).await;
}

#[tokio::test]
async fn claim_contention() {
    common::claim_contention(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn crash_recovery() {
    common::crash_recovery(&MemoryStore::new()).await;
}

#[tokio::test]
async fn cycle_prevention() {
    common::cycle_prevention(&MemoryStore::new()).await;
}

#[tokio::test]
async fn workflow_overlay() {
    common::workflow_overlay(&MemoryStore::new()).await;
}

#[tokio::test]
async fn error_path_reopen() {
    common::error_path_reopen(&MemoryStore::new()).await;
}

#[tokio::test]
async fn claim_respects_status() {
    common::claim_respects_status(&MemoryStore::new()).await;
}

#[tokio::test]
async fn illegal_transitions_rejected() {
    common::illegal_transitions_rejected(&MemoryStore::new()).await;
}

#[tokio::test]
async fn monotonic_ids() {
    common::monotonic_ids(&MemoryStore::new()).await;
}

#[tokio::test]
async fn counter_seeds_from_existing() {
    common::counter_seeds_from_existing(&MemoryStore::new()).await;
}

#[tokio::test]
async fn idempotent_label_events() {
    common::idempotent_label_events(&MemoryStore::new()).await;
}

#[tokio::test]
async fn readiness_correctness() {
    common::readiness_correctness(&MemoryStore::new()).await;
}

#[tokio::test]
async fn round_trips() {
    common::round_trips(&MemoryStore::new()).await;
}

#[tokio::test]
async fn search_filters() {
    common::search_filters(&MemoryStore::new()).await;
}

#[tokio::test]
async fn statistics() {
    common::statistics(&MemoryStore::new()).await;
}

#[tokio::test]
async fn dependency_tree() {
    common::dependency_tree(&MemoryStore::new()).await;
}

#[tokio::test]
async fn update_issue_events() {
    common::update_issue_events(&MemoryStore::new()).await;
}

#[tokio::test]
async fn validation_rejects() {
    common::validation_rejects(&MemoryStore::new()).await;
}

#[tokio::test]
async fn executor_registry() {
    common::executor_registry(&MemoryStore::new()).await;
}

#[tokio::test]
async fn execution_history() {
    common::execution_history(&MemoryStore::new()).await;
}

#[tokio::test]
async fn agent_event_retention() {
    common::agent_event_retention(&MemoryStore::new()).await;
}

#[tokio::test]
async fn config_prefix_override() {
    common::config_prefix_override(&MemoryStore::new()).await;
}
