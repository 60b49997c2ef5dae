//! In-memory implementation of CoordinationStore for testing
//!
//! Stores everything behind a single RwLock and reproduces the same
//! observable semantics as the SQL backends, including audit-event rules,
//! counter seeding, and CAS conflicts. Intended as the swap-in test
//! double; nothing here persists.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use taskhive_core::{
    format_issue_id, highest_state_label, parse_issue_suffix, AgentEvent, AgentEventType,
    CoordinationConfig, CoordinationError, Dependency, DependencyType, EventRetention,
    ExecutionAttempt, ExecutionState, ExecutorInstance, ExecutorStatus, Issue, IssueEvent,
    IssueEventType, IssueExecution, IssueStatus, IssueUpdate, Result, Severity, SortPolicy,
    WorkflowTransition, WorkflowTrigger, CONFIG_KEY_ISSUE_PREFIX,
};

use crate::store::{
    normalize_cycles, validate_label, BlockedIssue, CleanupReport, CoordinationStore, IssueFilter,
    ReadyFilter, RetentionReport, Statistics, TreeNode, REOPEN_MESSAGE,
};

#[derive(Default)]
struct Inner {
    issues: HashMap<String, Issue>,
    dependencies: HashMap<(String, String), Dependency>,
    labels: BTreeSet<(String, String)>,
    events: Vec<IssueEvent>,
    next_event_id: i64,
    instances: HashMap<String, ExecutorInstance>,
    executions: HashMap<String, IssueExecution>,
    attempts: Vec<ExecutionAttempt>,
    next_attempt_id: i64,
    agent_events: Vec<AgentEvent>,
    next_agent_event_id: i64,
    counters: HashMap<String, i64>,
    config: HashMap<String, String>,
}

impl Inner {
    fn push_event(
        &mut self,
        issue_id: &str,
        event_type: IssueEventType,
        actor: &str,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
        comment: Option<String>,
    ) {
        self.next_event_id += 1;
        self.events.push(IssueEvent {
            id: self.next_event_id,
            issue_id: issue_id.to_string(),
            event_type,
            actor: actor.to_string(),
            old_value,
            new_value,
            comment,
            created_at: Utc::now(),
        });
    }

    fn push_agent_event(&mut self, mut event: AgentEvent) -> i64 {
        self.next_agent_event_id += 1;
        event.id = Some(self.next_agent_event_id);
        self.agent_events.push(event);
        self.next_agent_event_id
    }

    fn blockers_of(&self, issue_id: &str) -> Vec<String> {
        let mut blockers: Vec<String> = self
            .dependencies
            .values()
            .filter(|d| d.issue_id == issue_id && d.dep_type == DependencyType::Blocks)
            .filter_map(|d| self.issues.get(&d.depends_on_id))
            .filter(|blocker| blocker.status.is_unresolved())
            .map(|blocker| blocker.id.clone())
            .collect();
        blockers.sort();
        blockers
    }

    fn is_ready(&self, issue_id: &str) -> bool {
        self.blockers_of(issue_id).is_empty()
    }

    /// Is there a `blocks` path from `start` to `target`?
    fn blocks_path(&self, start: &str, target: &str) -> Option<Vec<String>> {
        let mut stack = vec![vec![start.to_string()]];
        while let Some(path) = stack.pop() {
            let tail = path.last().cloned().unwrap_or_default();
            for dep in self.dependencies.values() {
                if dep.dep_type != DependencyType::Blocks || dep.issue_id != tail {
                    continue;
                }
                if dep.depends_on_id == target {
                    let mut found = path.clone();
                    found.push(dep.depends_on_id.clone());
                    return Some(found);
                }
                if !path.contains(&dep.depends_on_id) {
                    let mut next = path.clone();
                    next.push(dep.depends_on_id.clone());
                    stack.push(next);
                }
            }
        }
        None
    }
}

/// In-memory store, primarily for tests.
///
/// # Example
///
/// ```
/// use taskhive_storage::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    inner: RwLock<Inner>,
    config: CoordinationConfig,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(CoordinationConfig::default())
    }

    pub fn with_config(config: CoordinationConfig) -> Self {
        MemoryStore {
            inner: RwLock::new(Inner::default()),
            config,
        }
    }

    pub fn issue_count(&self) -> usize {
        self.inner.read().issues.len()
    }

    pub fn agent_event_count(&self) -> usize {
        self.inner.read().agent_events.len()
    }

    /// Clear all data (for testing).
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }

    fn effective_limit(&self, requested: i64) -> usize {
        let cap = self.config.search_cap;
        let limit = if requested <= 0 { cap } else { requested.min(cap) };
        limit as usize
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_issue(&self, issue: &Issue, actor: &str) -> Result<Issue> {
        const OP: &str = "create_issue";
        let mut inner = self.inner.write();
        let now = Utc::now();
        let mut stored = issue.clone();
        stored.created_at = now;
        stored.updated_at = now;
        if stored.status == IssueStatus::Closed && stored.closed_at.is_none() {
            stored.closed_at = Some(now);
        }

        if stored.id.trim().is_empty() {
            let prefix = inner
                .config
                .get(CONFIG_KEY_ISSUE_PREFIX)
                .filter(|p| !p.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| self.config.issue_prefix.clone());
            if !inner.counters.contains_key(&prefix) {
                let mut max_suffix = 0i64;
                for id in inner.issues.keys() {
                    if let Some(n) = parse_issue_suffix(&prefix, id)? {
                        max_suffix = max_suffix.max(n);
                    }
                }
                inner.counters.insert(prefix.clone(), max_suffix);
            }
            let counter = inner.counters.entry(prefix.clone()).or_insert(0);
            *counter += 1;
            stored.id = format_issue_id(&prefix, *counter);
        }
        stored.validate()?;

        if inner.issues.contains_key(&stored.id) {
            return Err(CoordinationError::conflict(
                OP,
                format!("issue {} already exists", stored.id),
            ));
        }
        let snapshot = serde_json::to_value(&stored)
            .map_err(|e| CoordinationError::fatal(OP, e.to_string()))?;
        inner.issues.insert(stored.id.clone(), stored.clone());
        inner.push_event(
            &stored.id,
            IssueEventType::Created,
            actor,
            None,
            Some(snapshot),
            None,
        );
        Ok(stored)
    }

    async fn get_issue(&self, id: &str) -> Result<Issue> {
        self.inner
            .read()
            .issues
            .get(id)
            .cloned()
            .ok_or_else(|| CoordinationError::not_found("issue", id))
    }

    async fn search_issues(&self, query: &str, filter: &IssueFilter) -> Result<Vec<Issue>> {
        let inner = self.inner.read();
        let needle = query.trim().to_lowercase();
        let wanted: BTreeSet<&str> = filter.labels.iter().map(String::as_str).collect();

        let mut matches: Vec<Issue> = inner
            .issues
            .values()
            .filter(|issue| {
                if !needle.is_empty()
                    && !issue.title.to_lowercase().contains(&needle)
                    && !issue.description.to_lowercase().contains(&needle)
                    && !issue.id.to_lowercase().contains(&needle)
                {
                    return false;
                }
                if let Some(status) = filter.status {
                    if issue.status != status {
                        return false;
                    }
                }
                if let Some(priority) = filter.priority {
                    if issue.priority != priority {
                        return false;
                    }
                }
                if let Some(issue_type) = filter.issue_type {
                    if issue.issue_type != issue_type {
                        return false;
                    }
                }
                if let Some(assignee) = &filter.assignee {
                    if issue.assignee.as_deref() != Some(assignee.as_str()) {
                        return false;
                    }
                }
                wanted.iter().all(|label| {
                    inner
                        .labels
                        .contains(&(issue.id.clone(), (*label).to_string()))
                })
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        matches.truncate(self.effective_limit(filter.limit));
        Ok(matches)
    }

    async fn update_issue(&self, id: &str, update: &IssueUpdate, actor: &str) -> Result<Issue> {
        const OP: &str = "update_issue";
        if update.is_empty() {
            return Err(CoordinationError::validation(OP, "no fields to update"));
        }
        let mut inner = self.inner.write();
        let current = inner
            .issues
            .get(id)
            .cloned()
            .ok_or_else(|| CoordinationError::not_found("issue", id))?;

        let now = Utc::now();
        let mut merged = update.apply_to(&current);
        merged.updated_at = now;

        let (event_type, old_value, new_value) = match update.status {
            Some(new_status) if new_status == IssueStatus::Closed => {
                if current.status != IssueStatus::Closed {
                    merged.closed_at = Some(now);
                }
                (
                    IssueEventType::Closed,
                    Some(serde_json::Value::String(current.status.as_str().to_string())),
                    Some(serde_json::Value::String(new_status.as_str().to_string())),
                )
            }
            Some(new_status) => {
                if current.status == IssueStatus::Closed {
                    merged.closed_at = None;
                }
                (
                    IssueEventType::StatusChanged,
                    Some(serde_json::Value::String(current.status.as_str().to_string())),
                    Some(serde_json::Value::String(new_status.as_str().to_string())),
                )
            }
            None => {
                let snapshot = serde_json::to_value(&merged)
                    .map_err(|e| CoordinationError::fatal(OP, e.to_string()))?;
                (IssueEventType::Updated, None, Some(snapshot))
            }
        };
        merged.validate()?;

        inner.issues.insert(id.to_string(), merged.clone());
        inner.push_event(id, event_type, actor, old_value, new_value, None);
        Ok(merged)
    }

    async fn close_issue(&self, id: &str, actor: &str) -> Result<()> {
        const OP: &str = "close_issue";
        let current = self.get_issue(id).await?;
        if current.status == IssueStatus::Closed {
            return Err(CoordinationError::state(
                OP,
                format!("issue {id} is already closed"),
            ));
        }
        let update = IssueUpdate {
            status: Some(IssueStatus::Closed),
            ..Default::default()
        };
        self.update_issue(id, &update, actor).await?;
        Ok(())
    }

    async fn add_dependency(&self, dep: &Dependency, actor: &str) -> Result<()> {
        const OP: &str = "add_dependency";
        dep.validate()?;
        let mut inner = self.inner.write();

        let key = (dep.issue_id.clone(), dep.depends_on_id.clone());
        if inner.dependencies.contains_key(&key) {
            return Err(CoordinationError::conflict(
                OP,
                format!(
                    "dependency {} -> {} already exists",
                    dep.issue_id, dep.depends_on_id
                ),
            ));
        }
        for endpoint in [&dep.issue_id, &dep.depends_on_id] {
            if !inner.issues.contains_key(endpoint.as_str()) {
                return Err(CoordinationError::dependency(
                    OP,
                    format!(
                        "cannot add dependency {} -> {}: issue {endpoint} does not exist",
                        dep.issue_id, dep.depends_on_id
                    ),
                ));
            }
        }
        if dep.dep_type == DependencyType::Blocks {
            if let Some(path) = inner.blocks_path(&dep.depends_on_id, &dep.issue_id) {
                return Err(CoordinationError::dependency(
                    OP,
                    format!(
                        "cannot add dependency {} -> {}: would create a cycle: {} -> {}",
                        dep.issue_id,
                        dep.depends_on_id,
                        dep.issue_id,
                        path.join(" -> ")
                    ),
                ));
            }
        }

        let mut stored = dep.clone();
        stored.created_at = Utc::now();
        inner.dependencies.insert(key, stored);
        let detail = serde_json::json!({
            "depends_on_id": dep.depends_on_id,
            "type": dep.dep_type.as_str(),
        });
        inner.push_event(
            &dep.issue_id,
            IssueEventType::DependencyAdded,
            actor,
            None,
            Some(detail),
            None,
        );
        Ok(())
    }

    async fn remove_dependency(
        &self,
        issue_id: &str,
        depends_on_id: &str,
        actor: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let key = (issue_id.to_string(), depends_on_id.to_string());
        if inner.dependencies.remove(&key).is_none() {
            return Err(CoordinationError::not_found(
                "dependency",
                format!("{issue_id} -> {depends_on_id}"),
            ));
        }
        let detail = serde_json::json!({ "depends_on_id": depends_on_id });
        inner.push_event(
            issue_id,
            IssueEventType::DependencyRemoved,
            actor,
            Some(detail),
            None,
            None,
        );
        Ok(())
    }

    async fn get_dependencies(&self, issue_id: &str) -> Result<Vec<Issue>> {
        let inner = self.inner.read();
        let mut issues: Vec<Issue> = inner
            .dependencies
            .values()
            .filter(|d| d.issue_id == issue_id)
            .filter_map(|d| inner.issues.get(&d.depends_on_id))
            .cloned()
            .collect();
        issues.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(issues)
    }

    async fn get_dependents(&self, issue_id: &str) -> Result<Vec<Issue>> {
        let inner = self.inner.read();
        let mut issues: Vec<Issue> = inner
            .dependencies
            .values()
            .filter(|d| d.depends_on_id == issue_id)
            .filter_map(|d| inner.issues.get(&d.issue_id))
            .cloned()
            .collect();
        issues.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(issues)
    }

    async fn get_dependency_tree(&self, issue_id: &str, max_depth: i64) -> Result<Vec<TreeNode>> {
        const OP: &str = "get_dependency_tree";
        if max_depth <= 0 {
            return Err(CoordinationError::validation(
                OP,
                format!("max depth must be positive, got {max_depth}"),
            ));
        }
        let inner = self.inner.read();
        if !inner.issues.contains_key(issue_id) {
            return Err(CoordinationError::not_found("issue", issue_id));
        }

        let mut depths: HashMap<String, i64> = HashMap::new();
        let mut frontier = vec![(issue_id.to_string(), 0i64, vec![issue_id.to_string()])];
        while let Some((id, depth, path)) = frontier.pop() {
            depths
                .entry(id.clone())
                .and_modify(|d| *d = (*d).min(depth))
                .or_insert(depth);
            if depth >= max_depth {
                continue;
            }
            for dep in inner.dependencies.values() {
                if dep.issue_id == id && !path.contains(&dep.depends_on_id) {
                    let mut next_path = path.clone();
                    next_path.push(dep.depends_on_id.clone());
                    frontier.push((dep.depends_on_id.clone(), depth + 1, next_path));
                }
            }
        }

        let mut nodes: Vec<TreeNode> = Vec::with_capacity(depths.len());
        for (id, depth) in &depths {
            let Some(issue) = inner.issues.get(id) else {
                warn!(issue_id = %id, "dependency tree references missing issue, skipping");
                continue;
            };
            let has_children = inner.dependencies.values().any(|d| &d.issue_id == id);
            nodes.push(TreeNode {
                issue: issue.clone(),
                depth: *depth,
                truncated: *depth == max_depth && has_children,
            });
        }
        nodes.sort_by(|a, b| (a.depth, &a.issue.id).cmp(&(b.depth, &b.issue.id)));
        Ok(nodes)
    }

    async fn detect_cycles(&self) -> Result<Vec<Vec<String>>> {
        let inner = self.inner.read();
        let mut paths: Vec<Vec<String>> = Vec::new();
        let starts: BTreeSet<&String> = inner
            .dependencies
            .values()
            .filter(|d| d.dep_type == DependencyType::Blocks)
            .map(|d| &d.issue_id)
            .collect();
        for start in starts {
            if let Some(mut path) = inner.blocks_path(start, start) {
                if path.first() != path.last() {
                    path.push(start.clone());
                }
                paths.push(path);
            }
        }
        Ok(normalize_cycles(paths))
    }

    async fn get_ready_work(&self, filter: &ReadyFilter) -> Result<Vec<Issue>> {
        let inner = self.inner.read();
        let sort = filter.sort.unwrap_or(self.config.sort_policy);

        let mut ready: Vec<Issue> = inner
            .issues
            .values()
            .filter(|issue| issue.status == filter.status)
            .filter(|issue| {
                filter
                    .assignee
                    .as_ref()
                    .map_or(true, |a| issue.assignee.as_deref() == Some(a.as_str()))
            })
            .filter(|issue| inner.is_ready(&issue.id))
            .cloned()
            .collect();

        ready.sort_by(|a, b| {
            let priority = a.priority.cmp(&b.priority);
            let tie = match sort {
                SortPolicy::Priority => b.created_at.cmp(&a.created_at),
                SortPolicy::Oldest => a.created_at.cmp(&b.created_at),
                SortPolicy::Hybrid => a
                    .updated_at
                    .cmp(&b.updated_at)
                    .then(a.created_at.cmp(&b.created_at)),
            };
            priority.then(tie).then(a.id.cmp(&b.id))
        });
        ready.truncate(self.effective_limit(filter.limit));
        Ok(ready)
    }

    async fn get_blocked_issues(&self) -> Result<Vec<BlockedIssue>> {
        let inner = self.inner.read();
        let mut blocked: Vec<BlockedIssue> = inner
            .issues
            .values()
            .filter(|issue| issue.status.is_unresolved())
            .filter_map(|issue| {
                let blockers = inner.blockers_of(&issue.id);
                if blockers.is_empty() {
                    None
                } else {
                    Some(BlockedIssue {
                        issue: issue.clone(),
                        blocker_ids: blockers,
                    })
                }
            })
            .collect();
        blocked.sort_by(|a, b| a.issue.id.cmp(&b.issue.id));
        Ok(blocked)
    }

    async fn get_statistics(&self) -> Result<Statistics> {
        let inner = self.inner.read();
        let mut stats = Statistics::default();
        let mut lead_hours = 0.0f64;
        let mut closed_with_time = 0i64;

        for issue in inner.issues.values() {
            stats.total += 1;
            match issue.status {
                IssueStatus::Open => stats.open += 1,
                IssueStatus::InProgress => stats.in_progress += 1,
                IssueStatus::Blocked => stats.blocked_status += 1,
                IssueStatus::Closed => stats.closed += 1,
            }
            if issue.status.is_unresolved() && !inner.blockers_of(&issue.id).is_empty() {
                stats.blocked += 1;
            }
            if issue.status == IssueStatus::Open && inner.is_ready(&issue.id) {
                stats.ready += 1;
            }
            if issue.status == IssueStatus::Closed {
                if let Some(closed_at) = issue.closed_at {
                    lead_hours +=
                        (closed_at - issue.created_at).num_milliseconds() as f64 / 3_600_000.0;
                    closed_with_time += 1;
                }
            }
        }
        if closed_with_time > 0 {
            stats.avg_lead_time_hours = lead_hours / closed_with_time as f64;
        }
        Ok(stats)
    }

    async fn add_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<bool> {
        const OP: &str = "add_label";
        validate_label(OP, label)?;
        let mut inner = self.inner.write();
        if !inner.issues.contains_key(issue_id) {
            return Err(CoordinationError::not_found("issue", issue_id));
        }
        let added = inner
            .labels
            .insert((issue_id.to_string(), label.to_string()));
        if added {
            let detail = serde_json::Value::String(label.to_string());
            inner.push_event(issue_id, IssueEventType::LabelAdded, actor, None, Some(detail), None);
        }
        Ok(added)
    }

    async fn remove_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<bool> {
        const OP: &str = "remove_label";
        validate_label(OP, label)?;
        let mut inner = self.inner.write();
        let removed = inner
            .labels
            .remove(&(issue_id.to_string(), label.to_string()));
        if removed {
            let detail = serde_json::Value::String(label.to_string());
            inner.push_event(
                issue_id,
                IssueEventType::LabelRemoved,
                actor,
                Some(detail),
                None,
                None,
            );
        }
        Ok(removed)
    }

    async fn get_labels(&self, issue_id: &str) -> Result<Vec<String>> {
        let inner = self.inner.read();
        Ok(inner
            .labels
            .iter()
            .filter(|(id, _)| id == issue_id)
            .map(|(_, label)| label.clone())
            .collect())
    }

    async fn has_label(&self, issue_id: &str, label: &str) -> Result<bool> {
        let inner = self.inner.read();
        Ok(inner
            .labels
            .contains(&(issue_id.to_string(), label.to_string())))
    }

    async fn get_state_label(&self, issue_id: &str) -> Result<Option<String>> {
        let labels = self.get_labels(issue_id).await?;
        Ok(highest_state_label(labels.iter().map(String::as_str)).map(str::to_string))
    }

    async fn transition_workflow_state(
        &self,
        issue_id: &str,
        from_label: &str,
        to_label: &str,
        trigger: WorkflowTrigger,
        actor: &str,
    ) -> Result<WorkflowTransition> {
        const OP: &str = "transition_workflow_state";
        validate_label(OP, to_label)?;
        let mut inner = self.inner.write();
        if !inner.issues.contains_key(issue_id) {
            return Err(CoordinationError::not_found("issue", issue_id));
        }

        let mut removed = false;
        if !from_label.is_empty() {
            removed = inner
                .labels
                .remove(&(issue_id.to_string(), from_label.to_string()));
            if removed {
                let detail = serde_json::Value::String(from_label.to_string());
                inner.push_event(
                    issue_id,
                    IssueEventType::LabelRemoved,
                    actor,
                    Some(detail),
                    None,
                    None,
                );
            }
        }
        let added = inner
            .labels
            .insert((issue_id.to_string(), to_label.to_string()));
        if added {
            let detail = serde_json::Value::String(to_label.to_string());
            inner.push_event(issue_id, IssueEventType::LabelAdded, actor, None, Some(detail), None);
        }

        let event = AgentEvent {
            id: None,
            event_type: AgentEventType::LabelStateTransition,
            timestamp: Utc::now(),
            issue_id: issue_id.to_string(),
            executor_id: Some(actor.to_string()),
            agent_id: None,
            severity: Severity::Info,
            message: format!(
                "State transition: {from_label} \u{2192} {to_label} (trigger: {trigger})"
            ),
            data: serde_json::json!({
                "from_label": from_label,
                "to_label": to_label,
                "trigger": trigger.as_str(),
                "actor": actor,
            }),
            source_line: None,
        };
        inner.push_agent_event(event);

        Ok(WorkflowTransition {
            removed,
            added,
            event_recorded: true,
        })
    }

    async fn register_instance(&self, instance: &ExecutorInstance) -> Result<()> {
        instance.validate()?;
        let mut inner = self.inner.write();
        match inner.instances.get_mut(&instance.instance_id) {
            Some(existing) => {
                existing.hostname = instance.hostname.clone();
                existing.pid = instance.pid;
                existing.status = instance.status;
                existing.last_heartbeat = instance.last_heartbeat;
                existing.version = instance.version.clone();
                existing.metadata = instance.metadata.clone();
            }
            None => {
                inner
                    .instances
                    .insert(instance.instance_id.clone(), instance.clone());
            }
        }
        Ok(())
    }

    async fn update_heartbeat(&self, instance_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| CoordinationError::not_found("executor instance", instance_id))?;
        instance.last_heartbeat = Utc::now();
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<ExecutorInstance> {
        self.inner
            .read()
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| CoordinationError::not_found("executor instance", instance_id))
    }

    async fn get_active_instances(&self) -> Result<Vec<ExecutorInstance>> {
        let inner = self.inner.read();
        let mut active: Vec<ExecutorInstance> = inner
            .instances
            .values()
            .filter(|i| i.status == ExecutorStatus::Running)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));
        Ok(active)
    }

    async fn cleanup_stale_instances(
        &self,
        threshold_secs: i64,
        cancel: &CancellationToken,
    ) -> Result<CleanupReport> {
        const OP: &str = "cleanup_stale_instances";
        if threshold_secs <= 0 {
            return Err(CoordinationError::validation(
                OP,
                format!("threshold must be positive, got {threshold_secs}"),
            ));
        }
        let cutoff = Utc::now() - chrono::Duration::seconds(threshold_secs);

        let (stale, orphaned) = {
            let inner = self.inner.read();
            let stale: Vec<String> = inner
                .instances
                .values()
                .filter(|i| i.status == ExecutorStatus::Running && i.last_heartbeat < cutoff)
                .map(|i| i.instance_id.clone())
                .collect();
            let orphaned: Vec<String> = inner
                .executions
                .values()
                .map(|e| e.executor_instance_id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .filter(|id| {
                    inner
                        .instances
                        .get(id)
                        .is_some_and(|i| i.status == ExecutorStatus::Stopped)
                })
                .collect();
            (stale, orphaned)
        };

        let mut report = CleanupReport::default();
        let batches = stale
            .iter()
            .map(|id| (id, true))
            .chain(orphaned.iter().map(|id| (id, false)));
        for (instance_id, is_stale) in batches {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let mut inner = self.inner.write();
            let now = Utc::now();
            let owned: Vec<String> = inner
                .executions
                .values()
                .filter(|e| &e.executor_instance_id == instance_id)
                .map(|e| e.issue_id.clone())
                .collect();
            for issue_id in &owned {
                inner.executions.remove(issue_id);
                if let Some(issue) = inner.issues.get_mut(issue_id) {
                    issue.status = IssueStatus::Open;
                    issue.updated_at = now;
                }
                let comment = if is_stale {
                    format!(
                        "released by stale-instance cleanup: executor {instance_id} missed \
                         heartbeats beyond {threshold_secs}s"
                    )
                } else {
                    format!("released orphaned claim held by stopped executor {instance_id}")
                };
                inner.push_event(
                    issue_id,
                    IssueEventType::Commented,
                    "system",
                    None,
                    None,
                    Some(comment),
                );
            }
            if is_stale {
                if let Some(instance) = inner.instances.get_mut(instance_id.as_str()) {
                    instance.status = ExecutorStatus::Stopped;
                }
            }
            report.cleaned += 1;
            debug!(instance_id = %instance_id, released = owned.len(), "cleaned instance");
        }
        Ok(report)
    }

    async fn delete_old_stopped_instances(
        &self,
        older_than_secs: i64,
        max_to_keep: i64,
    ) -> Result<u64> {
        const OP: &str = "delete_old_stopped_instances";
        if older_than_secs <= 0 {
            return Err(CoordinationError::validation(
                OP,
                format!("older_than_secs must be positive, got {older_than_secs}"),
            ));
        }
        if max_to_keep < 0 {
            return Err(CoordinationError::validation(
                OP,
                format!("max_to_keep must be >= 0, got {max_to_keep}"),
            ));
        }
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than_secs);
        let mut inner = self.inner.write();

        let mut stopped: Vec<(String, chrono::DateTime<Utc>)> = inner
            .instances
            .values()
            .filter(|i| i.status == ExecutorStatus::Stopped)
            .map(|i| (i.instance_id.clone(), i.started_at))
            .collect();
        stopped.sort_by(|a, b| b.1.cmp(&a.1));
        let keep: BTreeSet<String> = stopped
            .iter()
            .take(max_to_keep as usize)
            .map(|(id, _)| id.clone())
            .collect();

        let mut deleted = 0u64;
        for (id, started_at) in stopped {
            if started_at < cutoff && !keep.contains(&id) {
                inner.instances.remove(&id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn claim_issue(&self, issue_id: &str, executor_instance_id: &str) -> Result<()> {
        const OP: &str = "claim_issue";
        let mut inner = self.inner.write();
        let issue = inner
            .issues
            .get(issue_id)
            .cloned()
            .ok_or_else(|| CoordinationError::not_found("issue", issue_id))?;

        if inner.executions.contains_key(issue_id) {
            return Err(CoordinationError::conflict(
                OP,
                format!("issue {issue_id} already claimed by another executor"),
            ));
        }
        if issue.status != IssueStatus::Open {
            return Err(CoordinationError::state(
                OP,
                format!("issue {issue_id} is not open (status: {})", issue.status),
            ));
        }
        if !inner.instances.contains_key(executor_instance_id) {
            return Err(CoordinationError::not_found(
                "executor instance",
                executor_instance_id,
            ));
        }

        let now = Utc::now();
        inner.executions.insert(
            issue_id.to_string(),
            IssueExecution {
                issue_id: issue_id.to_string(),
                executor_instance_id: executor_instance_id.to_string(),
                state: ExecutionState::Claimed,
                checkpoint: "{}".to_string(),
                started_at: now,
                updated_at: now,
            },
        );
        if let Some(stored) = inner.issues.get_mut(issue_id) {
            stored.status = IssueStatus::InProgress;
            stored.updated_at = now;
        }
        inner.push_event(
            issue_id,
            IssueEventType::StatusChanged,
            executor_instance_id,
            Some(serde_json::Value::String("open".to_string())),
            Some(serde_json::Value::String("in_progress".to_string())),
            Some(format!("claimed by {executor_instance_id}")),
        );
        Ok(())
    }

    async fn get_execution_state(&self, issue_id: &str) -> Result<Option<IssueExecution>> {
        Ok(self.inner.read().executions.get(issue_id).cloned())
    }

    async fn update_execution_state(
        &self,
        issue_id: &str,
        new_state: ExecutionState,
    ) -> Result<()> {
        const OP: &str = "update_execution_state";
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(issue_id)
            .ok_or_else(|| CoordinationError::not_found("execution state", issue_id))?;
        let current = execution.state;
        if !current.can_transition_to(new_state) {
            return Err(CoordinationError::state(
                OP,
                format!("invalid state transition {current} -> {new_state} for issue {issue_id}"),
            ));
        }
        execution.state = new_state;
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn save_checkpoint(&self, issue_id: &str, data: &serde_json::Value) -> Result<()> {
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(issue_id)
            .ok_or_else(|| CoordinationError::not_found("execution state", issue_id))?;
        execution.checkpoint = data.to_string();
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn get_checkpoint(&self, issue_id: &str) -> Result<String> {
        self.inner
            .read()
            .executions
            .get(issue_id)
            .map(|e| e.checkpoint.clone())
            .ok_or_else(|| CoordinationError::not_found("execution state", issue_id))
    }

    async fn release_issue(&self, issue_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.executions.remove(issue_id).is_none() {
            return Err(CoordinationError::not_found("execution state", issue_id));
        }
        Ok(())
    }

    async fn release_and_reopen(
        &self,
        issue_id: &str,
        actor: &str,
        error_comment: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let old_status = inner
            .issues
            .get(issue_id)
            .map(|i| i.status)
            .ok_or_else(|| CoordinationError::not_found("issue", issue_id))?;

        if inner.executions.remove(issue_id).is_none() {
            warn!(issue_id, "no execution state to release, reopening anyway");
        }
        let now = Utc::now();
        if let Some(issue) = inner.issues.get_mut(issue_id) {
            issue.status = IssueStatus::Open;
            issue.updated_at = now;
        }
        if !error_comment.trim().is_empty() {
            inner.push_event(
                issue_id,
                IssueEventType::Commented,
                actor,
                None,
                None,
                Some(error_comment.to_string()),
            );
        }
        inner.push_event(
            issue_id,
            IssueEventType::StatusChanged,
            actor,
            Some(serde_json::Value::String(old_status.as_str().to_string())),
            Some(serde_json::Value::String("open".to_string())),
            Some(REOPEN_MESSAGE.to_string()),
        );
        Ok(())
    }

    async fn record_attempt(&self, attempt: &ExecutionAttempt) -> Result<i64> {
        let mut inner = self.inner.write();
        match attempt.id {
            None => {
                if !inner.issues.contains_key(&attempt.issue_id) {
                    return Err(CoordinationError::not_found("issue", &attempt.issue_id));
                }
                let next_number = inner
                    .attempts
                    .iter()
                    .filter(|a| a.issue_id == attempt.issue_id)
                    .map(|a| a.attempt_number)
                    .max()
                    .unwrap_or(0)
                    + 1;
                let mut stored = attempt.clone();
                stored.attempt_number = next_number;
                stored.started_at = Some(stored.started_at.unwrap_or_else(Utc::now));
                stored.validate()?;
                inner.next_attempt_id += 1;
                stored.id = Some(inner.next_attempt_id);
                let id = inner.next_attempt_id;
                inner.attempts.push(stored);
                Ok(id)
            }
            Some(id) => {
                let stored = inner
                    .attempts
                    .iter_mut()
                    .find(|a| a.id == Some(id))
                    .ok_or_else(|| {
                        CoordinationError::not_found("execution attempt", id.to_string())
                    })?;
                stored.completed_at = attempt.completed_at;
                stored.success = attempt.success;
                stored.exit_code = attempt.exit_code;
                stored.summary = attempt.summary.clone();
                stored.output_sample = attempt.output_sample.clone();
                stored.error_sample = attempt.error_sample.clone();
                Ok(id)
            }
        }
    }

    async fn get_execution_history(&self, issue_id: &str) -> Result<Vec<ExecutionAttempt>> {
        let inner = self.inner.read();
        let mut attempts: Vec<ExecutionAttempt> = inner
            .attempts
            .iter()
            .filter(|a| a.issue_id == issue_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn get_events(&self, issue_id: &str, limit: i64) -> Result<Vec<IssueEvent>> {
        let inner = self.inner.read();
        let mut events: Vec<IssueEvent> = inner
            .events
            .iter()
            .filter(|e| e.issue_id == issue_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.id.cmp(&a.id));
        if limit > 0 {
            events.truncate(limit as usize);
        }
        Ok(events)
    }

    async fn record_agent_event(&self, event: &AgentEvent) -> Result<i64> {
        const OP: &str = "record_agent_event";
        if event.issue_id.trim().is_empty() {
            return Err(CoordinationError::validation(
                OP,
                "agent event must reference an issue",
            ));
        }
        let mut inner = self.inner.write();
        if !inner.issues.contains_key(&event.issue_id) {
            return Err(CoordinationError::not_found("issue", &event.issue_id));
        }
        Ok(inner.push_agent_event(event.clone()))
    }

    async fn get_agent_events(&self, issue_id: &str, limit: i64) -> Result<Vec<AgentEvent>> {
        let inner = self.inner.read();
        let mut events: Vec<AgentEvent> = inner
            .agent_events
            .iter()
            .filter(|e| e.issue_id == issue_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.id.cmp(&a.id));
        if limit > 0 {
            events.truncate(limit as usize);
        }
        Ok(events)
    }

    async fn cleanup_agent_events(
        &self,
        retention: &EventRetention,
        cancel: &CancellationToken,
    ) -> Result<RetentionReport> {
        retention.validate()?;
        let now = Utc::now();
        let iw_cutoff = now - chrono::Duration::days(retention.info_warning_days);
        let ec_cutoff = now - chrono::Duration::days(retention.error_critical_days);
        let mut report = RetentionReport::default();

        let mut inner = self.inner.write();

        // Age-based passes.
        let before = inner.agent_events.len();
        inner.agent_events.retain(|e| {
            let expired = match e.severity {
                Severity::Info | Severity::Warning => e.timestamp < iw_cutoff,
                Severity::Error | Severity::Critical => e.timestamp < ec_cutoff,
            };
            !expired
        });
        report.deleted += (before - inner.agent_events.len()) as u64;
        if cancel.is_cancelled() {
            report.interrupted = true;
            return Ok(report);
        }

        // Per-issue cap.
        let mut per_issue: HashMap<String, i64> = HashMap::new();
        for event in &inner.agent_events {
            *per_issue.entry(event.issue_id.clone()).or_default() += 1;
        }
        for (issue_id, count) in per_issue {
            if cancel.is_cancelled() {
                report.interrupted = true;
                return Ok(report);
            }
            let mut excess = count - retention.per_issue_limit;
            if excess <= 0 {
                continue;
            }
            let before = inner.agent_events.len();
            inner.agent_events.retain(|e| {
                if excess > 0 && e.issue_id == issue_id && e.severity != Severity::Critical {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
            report.deleted += (before - inner.agent_events.len()) as u64;
        }

        // Global cap.
        let mut excess = inner.agent_events.len() as i64 - retention.global_limit;
        if excess > 0 {
            let before = inner.agent_events.len();
            inner.agent_events.retain(|e| {
                if excess > 0 && e.severity != Severity::Critical {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
            report.deleted += (before - inner.agent_events.len()) as u64;
        }
        Ok(report)
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.read().config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
