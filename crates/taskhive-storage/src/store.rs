//! CoordinationStore trait definition
//!
//! The single capability set every backend implements. Consumers depend on
//! this trait rather than on a concrete backend so that the embedded
//! SQLite store, the networked Postgres store, and the in-memory test
//! double are interchangeable.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use taskhive_core::{
    AgentEvent, CoordinationError, Dependency, EventRetention, ExecutionAttempt, ExecutionState,
    ExecutorInstance, Issue, IssueEvent, IssueExecution, IssueStatus, IssueType, IssueUpdate,
    Priority, Result, SortPolicy, WorkflowTransition, WorkflowTrigger,
};

/// Filter for `search_issues`.
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub status: Option<IssueStatus>,
    pub priority: Option<Priority>,
    pub issue_type: Option<IssueType>,
    pub assignee: Option<String>,
    /// Issues must carry every one of these labels.
    pub labels: Vec<String>,
    /// Maximum results; 0 means "unlimited", which still hits the
    /// configured protective cap.
    pub limit: i64,
}

/// Filter for `get_ready_work`.
#[derive(Debug, Clone)]
pub struct ReadyFilter {
    /// Status the issue itself must have.
    pub status: IssueStatus,
    pub assignee: Option<String>,
    /// Maximum results; 0 falls back to the configured cap.
    pub limit: i64,
    /// Tie-break ordering after the priority sort; `None` uses the
    /// configured policy.
    pub sort: Option<SortPolicy>,
}

impl Default for ReadyFilter {
    fn default() -> Self {
        ReadyFilter {
            status: IssueStatus::Open,
            assignee: None,
            limit: 0,
            sort: None,
        }
    }
}

/// A node in a dependency tree walk.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub issue: Issue,
    /// Depth from the root (0 = root).
    pub depth: i64,
    /// The walk stopped here because of the depth bound, not because the
    /// node is a leaf.
    pub truncated: bool,
}

/// A blocked issue together with the issues blocking it.
#[derive(Debug, Clone)]
pub struct BlockedIssue {
    pub issue: Issue,
    /// IDs of unresolved `blocks` dependencies, sorted.
    pub blocker_ids: Vec<String>,
}

/// Aggregate statistics over the issue table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    pub total: i64,
    pub open: i64,
    pub in_progress: i64,
    pub blocked_status: i64,
    pub closed: i64,
    /// Issues with at least one unresolved blocker.
    pub blocked: i64,
    /// Issues eligible for claiming right now.
    pub ready: i64,
    /// Mean hours from creation to close across closed issues; zero when
    /// nothing has closed yet.
    pub avg_lead_time_hours: f64,
}

/// Outcome of a stale-instance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Instances cleaned (claims released, stale ones stopped).
    pub cleaned: u64,
    /// The sweep stopped early on cancellation; the count is partial.
    pub interrupted: bool,
}

/// Outcome of an agent-event retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted: u64,
    /// The sweep stopped early on cancellation; the count is partial.
    pub interrupted: bool,
}

/// Transactional store for the coordination core.
///
/// Implementations must be safe for concurrent use from many tasks and
/// many processes: claims ride a uniqueness constraint, state transitions
/// are compare-and-swap, and every compound mutation is atomic.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // =========================================================================
    // Issues
    // =========================================================================

    /// Validate and insert an issue, assigning an ID from the per-prefix
    /// counter when the input ID is empty, and record a `created` audit
    /// event. Returns the stored issue.
    async fn create_issue(&self, issue: &Issue, actor: &str) -> Result<Issue>;

    async fn get_issue(&self, id: &str) -> Result<Issue>;

    /// Text search over title/description/id plus structured filters.
    async fn search_issues(&self, query: &str, filter: &IssueFilter) -> Result<Vec<Issue>>;

    /// Apply a partial update and record an `updated`, `status_changed`,
    /// or `closed` audit event depending on the status change. Returns the
    /// merged issue.
    async fn update_issue(&self, id: &str, update: &IssueUpdate, actor: &str) -> Result<Issue>;

    /// Close an issue (status -> closed, closed_at stamped).
    async fn close_issue(&self, id: &str, actor: &str) -> Result<()>;

    // =========================================================================
    // Dependencies
    // =========================================================================

    /// Insert a dependency edge. `blocks` edges are cycle-checked; the
    /// error names every issue on the would-be cycle and leaves the store
    /// unchanged.
    async fn add_dependency(&self, dep: &Dependency, actor: &str) -> Result<()>;

    async fn remove_dependency(
        &self,
        issue_id: &str,
        depends_on_id: &str,
        actor: &str,
    ) -> Result<()>;

    /// Issues this one depends on.
    async fn get_dependencies(&self, issue_id: &str) -> Result<Vec<Issue>>;

    /// Issues that depend on this one.
    async fn get_dependents(&self, issue_id: &str) -> Result<Vec<Issue>>;

    /// Walk the dependency graph downward from `issue_id`, bounded at
    /// `max_depth`; nodes cut off by the bound are marked truncated.
    async fn get_dependency_tree(&self, issue_id: &str, max_depth: i64) -> Result<Vec<TreeNode>>;

    /// Every distinct `blocks` cycle, each reported once as a sequence of
    /// issue IDs, deterministically ordered.
    async fn detect_cycles(&self) -> Result<Vec<Vec<String>>>;

    // =========================================================================
    // Readiness and statistics
    // =========================================================================

    /// Issues matching the filter with no unresolved `blocks` dependency,
    /// ordered by priority then the sort policy.
    async fn get_ready_work(&self, filter: &ReadyFilter) -> Result<Vec<Issue>>;

    /// Unresolved issues with unresolved blockers, with the aggregated
    /// blocker list.
    async fn get_blocked_issues(&self) -> Result<Vec<BlockedIssue>>;

    async fn get_statistics(&self) -> Result<Statistics>;

    // =========================================================================
    // Labels and workflow overlay
    // =========================================================================

    /// Add a label. Returns true when the label was actually added; the
    /// no-op path commits without an audit event.
    async fn add_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<bool>;

    /// Remove a label. Returns true when the label was actually removed;
    /// the no-op path commits without an audit event.
    async fn remove_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<bool>;

    async fn get_labels(&self, issue_id: &str) -> Result<Vec<String>>;

    async fn has_label(&self, issue_id: &str, label: &str) -> Result<bool>;

    /// The highest-priority reserved workflow label on the issue, if any.
    async fn get_state_label(&self, issue_id: &str) -> Result<Option<String>>;

    /// Atomically swap `from_label` for `to_label` and append a
    /// `label_state_transition` agent event. No-op halves are reported in
    /// the result instead of emitting events.
    async fn transition_workflow_state(
        &self,
        issue_id: &str,
        from_label: &str,
        to_label: &str,
        trigger: WorkflowTrigger,
        actor: &str,
    ) -> Result<WorkflowTransition>;

    // =========================================================================
    // Executor registry
    // =========================================================================

    /// Upsert keyed by instance id; hostname, pid, status, heartbeat,
    /// version, and metadata are overwritten on conflict.
    async fn register_instance(&self, instance: &ExecutorInstance) -> Result<()>;

    /// Refresh last-heartbeat to now. Fails when the instance is absent.
    async fn update_heartbeat(&self, instance_id: &str) -> Result<()>;

    async fn get_instance(&self, instance_id: &str) -> Result<ExecutorInstance>;

    /// Running instances, most-recent heartbeat first.
    async fn get_active_instances(&self) -> Result<Vec<ExecutorInstance>>;

    /// Release claims held by stale or stopped instances and mark stale
    /// ones stopped. Each instance is one idempotent batch; cancellation
    /// between batches yields a partial report.
    async fn cleanup_stale_instances(
        &self,
        threshold_secs: i64,
        cancel: &CancellationToken,
    ) -> Result<CleanupReport>;

    /// Delete old stopped instances, always preserving the `max_to_keep`
    /// most recent. Returns the number deleted.
    async fn delete_old_stopped_instances(
        &self,
        older_than_secs: i64,
        max_to_keep: i64,
    ) -> Result<u64>;

    // =========================================================================
    // Execution state
    // =========================================================================

    /// Atomically claim an open issue for an executor: insert the
    /// execution-state row, move the issue to in_progress, and record the
    /// status change. The uniqueness constraint on the execution-state row
    /// is the sole double-claim gate.
    async fn claim_issue(&self, issue_id: &str, executor_instance_id: &str) -> Result<()>;

    async fn get_execution_state(&self, issue_id: &str) -> Result<Option<IssueExecution>>;

    /// Advance the pipeline with compare-and-swap semantics; concurrent
    /// modification is detected, not overwritten.
    async fn update_execution_state(&self, issue_id: &str, new_state: ExecutionState)
        -> Result<()>;

    async fn save_checkpoint(&self, issue_id: &str, data: &serde_json::Value) -> Result<()>;

    /// The stored checkpoint JSON string.
    async fn get_checkpoint(&self, issue_id: &str) -> Result<String>;

    /// Delete the execution-state row without touching issue status (the
    /// normal-completion path, after a separate close).
    async fn release_issue(&self, issue_id: &str) -> Result<()>;

    /// Error-path release: drop the claim (tolerating its absence), reopen
    /// the issue, and record the error comment plus the fixed retry
    /// status-change event.
    async fn release_and_reopen(
        &self,
        issue_id: &str,
        actor: &str,
        error_comment: &str,
    ) -> Result<()>;

    /// Insert a new attempt (auto-numbered, start time defaulted) or
    /// update the completion fields of an existing one. Returns the
    /// attempt id.
    async fn record_attempt(&self, attempt: &ExecutionAttempt) -> Result<i64>;

    /// Attempts for an issue in chronological order.
    async fn get_execution_history(&self, issue_id: &str) -> Result<Vec<ExecutionAttempt>>;

    // =========================================================================
    // Audit and agent events
    // =========================================================================

    /// Recent audit events for an issue, newest first. `limit <= 0` means
    /// no explicit limit.
    async fn get_events(&self, issue_id: &str, limit: i64) -> Result<Vec<IssueEvent>>;

    /// Append to the agent-event stream; returns the event id.
    async fn record_agent_event(&self, event: &AgentEvent) -> Result<i64>;

    /// Recent agent events for an issue, newest first. `limit <= 0` means
    /// no explicit limit.
    async fn get_agent_events(&self, issue_id: &str, limit: i64) -> Result<Vec<AgentEvent>>;

    /// Enforce the retention policy in batches, checking cancellation
    /// between batches. Critical events survive the cap-based pruning.
    async fn cleanup_agent_events(
        &self,
        retention: &EventRetention,
        cancel: &CancellationToken,
    ) -> Result<RetentionReport>;

    // =========================================================================
    // Config
    // =========================================================================

    async fn get_config(&self, key: &str) -> Result<Option<String>>;

    async fn set_config(&self, key: &str, value: &str) -> Result<()>;
}

/// Validate a label name. Shared by every backend so the rules cannot
/// drift.
pub(crate) fn validate_label(operation: &'static str, label: &str) -> Result<()> {
    if label.trim().is_empty() {
        return Err(CoordinationError::validation(
            operation,
            "label must not be empty",
        ));
    }
    if label.chars().count() > 255 {
        return Err(CoordinationError::validation(
            operation,
            format!("label too long ({} chars, max 255)", label.chars().count()),
        ));
    }
    Ok(())
}

/// Normalize a batch of cycle paths: drop the repeated terminal node,
/// rotate each cycle so its smallest ID leads, dedupe, and order
/// deterministically.
pub(crate) fn normalize_cycles(paths: Vec<Vec<String>>) -> Vec<Vec<String>> {
    use std::collections::BTreeSet;

    let mut seen: BTreeSet<Vec<String>> = BTreeSet::new();
    for mut path in paths {
        // Paths arrive as start .. start; drop the closing repeat.
        if path.len() >= 2 && path.first() == path.last() {
            path.pop();
        }
        if path.is_empty() {
            continue;
        }
        let pivot = path
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        path.rotate_left(pivot);
        seen.insert(path);
    }
    seen.into_iter().collect()
}

/// Split a slice into chunks sized for an `IN (...)` parameter list.
pub(crate) const PARAM_CHUNK: usize = 1000;

/// Fixed status-change message recorded by the error-path release.
pub const REOPEN_MESSAGE: &str = "released due to error and reopened for retry";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_normalization_dedupes_rotations() {
        let paths = vec![
            vec!["b".into(), "c".into(), "a".into(), "b".into()],
            vec!["a".into(), "b".into(), "c".into(), "a".into()],
            vec!["c".into(), "a".into(), "b".into(), "c".into()],
        ];
        let cycles = normalize_cycles(paths);
        assert_eq!(cycles, vec![vec!["a".to_string(), "b".into(), "c".into()]]);
    }

    #[test]
    fn cycle_normalization_orders_deterministically() {
        let paths = vec![
            vec!["z".into(), "y".into(), "z".into()],
            vec!["a".into(), "b".into(), "a".into()],
        ];
        let cycles = normalize_cycles(paths);
        assert_eq!(
            cycles,
            vec![
                vec!["a".to_string(), "b".into()],
                vec!["y".to_string(), "z".into()],
            ]
        );
    }

    #[test]
    fn label_validation() {
        assert!(validate_label("add_label", "task-ready").is_ok());
        assert!(validate_label("add_label", "  ").is_err());
        assert!(validate_label("add_label", &"x".repeat(256)).is_err());
    }
}
