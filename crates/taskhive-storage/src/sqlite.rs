//! SQLite implementation of CoordinationStore
//!
//! The embedded single-file backend. WAL journaling and foreign keys are
//! switched on at connect time; claims ride the primary key on
//! `issue_execution_state`, state transitions are compare-and-swap
//! UPDATEs, and multi-statement mutations run under `BEGIN IMMEDIATE` so
//! the write lock is taken before any read that feeds a write.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use taskhive_core::{
    format_issue_id, parse_issue_suffix, AgentEvent, AgentEventType, CoordinationConfig,
    CoordinationError, Dependency, DependencyType, EventRetention, ExecutionAttempt,
    ExecutionState, ExecutorInstance, Issue, IssueEvent, IssueEventType,
    IssueExecution, IssueStatus, IssueUpdate, Result, Severity, SortPolicy, WorkflowTransition,
    WorkflowTrigger, CONFIG_KEY_ISSUE_PREFIX,
};

use crate::rows::{
    issue_columns_for, rows_into_issues, AgentEventRow, AttemptRow, EventRow, ExecutionRow,
    ExecutorRow, IssueRow, AGENT_EVENT_COLUMNS, ATTEMPT_COLUMNS, EVENT_COLUMNS, EXECUTION_COLUMNS,
    EXECUTOR_COLUMNS, ISSUE_COLUMNS,
};
use crate::schema::SQLITE_SCHEMA;
use crate::sqlutil::{db_err, is_fk_violation, is_unique_violation};
use crate::store::{
    normalize_cycles, validate_label, BlockedIssue, CleanupReport, CoordinationStore, IssueFilter,
    ReadyFilter, RetentionReport, Statistics, TreeNode, PARAM_CHUNK, REOPEN_MESSAGE,
};

/// SQLite-backed store.
///
/// # Example
///
/// ```ignore
/// use taskhive_storage::SqliteStore;
/// use taskhive_core::CoordinationConfig;
///
/// let store = SqliteStore::open("taskhive.db", CoordinationConfig::default()).await?;
/// ```
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    config: CoordinationConfig,
}

impl SqliteStore {
    /// Open (creating if missing) a database file and apply the schema.
    pub async fn open(path: impl AsRef<Path>, config: CoordinationConfig) -> Result<Self> {
        const OP: &str = "open_store";
        config.validate()?;

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool.max_connections)
            .min_connections(config.pool.min_connections)
            .max_lifetime(config.pool.max_lifetime)
            .idle_timeout(config.pool.idle_timeout)
            .test_before_acquire(config.pool.test_before_acquire)
            .connect_with(options)
            .await
            .map_err(|e| CoordinationError::fatal(OP, format!("failed to open database: {e}")))?;

        sqlx::raw_sql(SQLITE_SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| CoordinationError::fatal(OP, format!("schema initialization failed: {e}")))?;

        Ok(Self { pool, config })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Acquire a connection and start a write transaction. SQLite
    /// serializes writers; taking the lock up front keeps a read-then-write
    /// transaction from racing another writer between its read and its
    /// write.
    async fn begin_immediate(&self, operation: &'static str) -> Result<PoolConnection<Sqlite>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_err(operation, e))?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| db_err(operation, e))?;
        Ok(conn)
    }

    /// Commit on success, roll back on error, propagating the original
    /// error either way.
    async fn finish<T>(
        &self,
        operation: &'static str,
        mut conn: PoolConnection<Sqlite>,
        result: Result<T>,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| db_err(operation, e))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    error!(operation, error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn effective_limit(&self, requested: i64) -> i64 {
        if requested <= 0 {
            self.config.search_cap
        } else {
            requested.min(self.config.search_cap)
        }
    }

    async fn fetch_issue_on(
        &self,
        operation: &'static str,
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<Issue> {
        let sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?");
        sqlx::query_as::<_, IssueRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| db_err(operation, e))?
            .ok_or_else(|| CoordinationError::not_found("issue", id))?
            .into_issue()
    }

    /// Allocate the next counter value for a prefix inside the current
    /// transaction, seeding a fresh counter from the largest numeric suffix
    /// already stored so out-of-band imports cannot collide.
    async fn next_issue_number(&self, conn: &mut SqliteConnection, prefix: &str) -> Result<i64> {
        const OP: &str = "next_issue_number";
        let bumped = sqlx::query("UPDATE id_counters SET last_value = last_value + 1 WHERE prefix = ?")
            .bind(prefix)
            .execute(&mut *conn)
            .await
            .map_err(|e| db_err(OP, e))?
            .rows_affected();

        if bumped == 0 {
            let ids = sqlx::query_scalar::<_, String>("SELECT id FROM issues WHERE id LIKE ? || '-%'")
                .bind(prefix)
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| db_err(OP, e))?;
            let mut max_suffix = 0i64;
            for id in &ids {
                if let Some(n) = parse_issue_suffix(prefix, id)? {
                    max_suffix = max_suffix.max(n);
                }
            }
            sqlx::query(
                "INSERT INTO id_counters (prefix, last_value) VALUES (?, ?) \
                 ON CONFLICT(prefix) DO UPDATE SET last_value = id_counters.last_value + 1",
            )
            .bind(prefix)
            .bind(max_suffix + 1)
            .execute(&mut *conn)
            .await
            .map_err(|e| db_err(OP, e))?;
        }

        sqlx::query_scalar::<_, i64>("SELECT last_value FROM id_counters WHERE prefix = ?")
            .bind(prefix)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| db_err(OP, e))
    }

    async fn create_issue_on(
        &self,
        conn: &mut SqliteConnection,
        issue: &Issue,
        actor: &str,
    ) -> Result<Issue> {
        const OP: &str = "create_issue";
        let now = Utc::now();
        let mut stored = issue.clone();
        stored.created_at = now;
        stored.updated_at = now;
        if stored.status == IssueStatus::Closed && stored.closed_at.is_none() {
            stored.closed_at = Some(now);
        }

        if stored.id.trim().is_empty() {
            let prefix = match config_value(conn, CONFIG_KEY_ISSUE_PREFIX)
                .await
                .map_err(|e| db_err(OP, e))?
            {
                Some(p) if !p.trim().is_empty() => p,
                _ => self.config.issue_prefix.clone(),
            };
            let n = self.next_issue_number(conn, &prefix).await?;
            stored.id = format_issue_id(&prefix, n);
        }
        stored.validate()?;

        let insert = sqlx::query(
            "INSERT INTO issues (id, title, description, design, acceptance_criteria, notes, \
             status, priority, issue_type, assignee, estimated_minutes, created_at, updated_at, \
             closed_at, approved_at, approved_by) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&stored.id)
        .bind(&stored.title)
        .bind(&stored.description)
        .bind(&stored.design)
        .bind(&stored.acceptance_criteria)
        .bind(&stored.notes)
        .bind(stored.status.as_str())
        .bind(stored.priority.value())
        .bind(stored.issue_type.as_str())
        .bind(&stored.assignee)
        .bind(stored.estimated_minutes)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .bind(stored.closed_at)
        .bind(stored.approved_at)
        .bind(&stored.approved_by)
        .execute(&mut *conn)
        .await;

        match insert {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(CoordinationError::conflict(
                    OP,
                    format!("issue {} already exists", stored.id),
                ));
            }
            Err(e) => return Err(db_err(OP, e)),
        }

        let snapshot = serde_json::to_value(&stored)
            .map_err(|e| CoordinationError::fatal(OP, e.to_string()))?;
        insert_event(
            conn,
            &stored.id,
            IssueEventType::Created,
            actor,
            None,
            Some(&snapshot),
            None,
            now,
        )
        .await
        .map_err(|e| db_err(OP, e))?;

        debug!(issue_id = %stored.id, actor, "created issue");
        Ok(stored)
    }

    async fn update_issue_on(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        update: &IssueUpdate,
        actor: &str,
    ) -> Result<Issue> {
        const OP: &str = "update_issue";
        if update.is_empty() {
            return Err(CoordinationError::validation(OP, "no fields to update"));
        }

        let current = self.fetch_issue_on(OP, conn, id).await?;
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

        sqlx::query(
            "UPDATE issues SET title = ?, description = ?, design = ?, acceptance_criteria = ?, \
             notes = ?, status = ?, priority = ?, issue_type = ?, assignee = ?, \
             estimated_minutes = ?, updated_at = ?, closed_at = ?, approved_at = ?, \
             approved_by = ? WHERE id = ?",
        )
        .bind(&merged.title)
        .bind(&merged.description)
        .bind(&merged.design)
        .bind(&merged.acceptance_criteria)
        .bind(&merged.notes)
        .bind(merged.status.as_str())
        .bind(merged.priority.value())
        .bind(merged.issue_type.as_str())
        .bind(&merged.assignee)
        .bind(merged.estimated_minutes)
        .bind(merged.updated_at)
        .bind(merged.closed_at)
        .bind(merged.approved_at)
        .bind(&merged.approved_by)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_err(OP, e))?;

        insert_event(
            conn,
            id,
            event_type,
            actor,
            old_value.as_ref(),
            new_value.as_ref(),
            None,
            now,
        )
        .await
        .map_err(|e| db_err(OP, e))?;

        debug!(issue_id = %id, event = %event_type, actor, "updated issue");
        Ok(merged)
    }

    async fn add_dependency_on(
        &self,
        conn: &mut SqliteConnection,
        dep: &Dependency,
        actor: &str,
    ) -> Result<()> {
        const OP: &str = "add_dependency";
        dep.validate()?;
        let now = Utc::now();

        let insert = sqlx::query(
            "INSERT INTO dependencies (issue_id, depends_on_id, type, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&dep.issue_id)
        .bind(&dep.depends_on_id)
        .bind(dep.dep_type.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await;

        match insert {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(CoordinationError::conflict(
                    OP,
                    format!(
                        "dependency {} -> {} already exists",
                        dep.issue_id, dep.depends_on_id
                    ),
                ));
            }
            Err(e) if is_fk_violation(&e) => {
                let missing = self
                    .missing_endpoint(conn, &dep.issue_id, &dep.depends_on_id)
                    .await?;
                return Err(CoordinationError::dependency(
                    OP,
                    format!(
                        "cannot add dependency {} -> {}: issue {missing} does not exist",
                        dep.issue_id, dep.depends_on_id
                    ),
                ));
            }
            Err(e) => return Err(db_err(OP, e)),
        }

        // Cycle check runs after the insert so the walk sees a consistent
        // graph; a hit rolls the whole transaction back.
        if dep.dep_type == DependencyType::Blocks {
            if let Some(path) = blocks_path(conn, &dep.depends_on_id, &dep.issue_id)
                .await
                .map_err(|e| db_err(OP, e))?
            {
                return Err(CoordinationError::dependency(
                    OP,
                    format!(
                        "cannot add dependency {} -> {}: would create a cycle: {} -> {path}",
                        dep.issue_id, dep.depends_on_id, dep.issue_id
                    ),
                ));
            }
        }

        let detail = serde_json::json!({
            "depends_on_id": dep.depends_on_id,
            "type": dep.dep_type.as_str(),
        });
        insert_event(
            conn,
            &dep.issue_id,
            IssueEventType::DependencyAdded,
            actor,
            None,
            Some(&detail),
            None,
            now,
        )
        .await
        .map_err(|e| db_err(OP, e))?;

        debug!(issue_id = %dep.issue_id, depends_on = %dep.depends_on_id,
               dep_type = %dep.dep_type, "added dependency");
        Ok(())
    }

    async fn missing_endpoint(
        &self,
        conn: &mut SqliteConnection,
        issue_id: &str,
        depends_on_id: &str,
    ) -> Result<String> {
        const OP: &str = "add_dependency";
        let issue_exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM issues WHERE id = ?)")
            .bind(issue_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| db_err(OP, e))?;
        Ok(if issue_exists {
            depends_on_id.to_string()
        } else {
            issue_id.to_string()
        })
    }

    async fn release_instance_claims(
        &self,
        instance_id: &str,
        is_stale: bool,
        threshold_secs: i64,
    ) -> Result<()> {
        const OP: &str = "cleanup_stale_instances";
        let mut conn = self.begin_immediate(OP).await?;
        let result = async {
            let now = Utc::now();
            let issues = sqlx::query_scalar::<_, String>(
                "SELECT issue_id FROM issue_execution_state WHERE executor_instance_id = ?",
            )
            .bind(instance_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| db_err(OP, e))?;

            for issue_id in &issues {
                sqlx::query("DELETE FROM issue_execution_state WHERE issue_id = ?")
                    .bind(issue_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| db_err(OP, e))?;
                sqlx::query("UPDATE issues SET status = 'open', updated_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(issue_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| db_err(OP, e))?;
                let comment = if is_stale {
                    format!(
                        "released by stale-instance cleanup: executor {instance_id} missed \
                         heartbeats beyond {threshold_secs}s"
                    )
                } else {
                    format!("released orphaned claim held by stopped executor {instance_id}")
                };
                insert_event(
                    &mut conn,
                    issue_id,
                    IssueEventType::Commented,
                    "system",
                    None,
                    None,
                    Some(&comment),
                    now,
                )
                .await
                .map_err(|e| db_err(OP, e))?;
            }

            if is_stale {
                sqlx::query("UPDATE executor_instances SET status = 'stopped' WHERE instance_id = ?")
                    .bind(instance_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| db_err(OP, e))?;
            }

            debug!(instance_id, released = issues.len(), is_stale, "cleaned instance");
            Ok(())
        }
        .await;
        self.finish(OP, conn, result).await
    }
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    #[instrument(skip(self, issue, actor))]
    async fn create_issue(&self, issue: &Issue, actor: &str) -> Result<Issue> {
        const OP: &str = "create_issue";
        let mut conn = self.begin_immediate(OP).await?;
        let result = self.create_issue_on(&mut conn, issue, actor).await;
        self.finish(OP, conn, result).await
    }

    #[instrument(skip(self))]
    async fn get_issue(&self, id: &str) -> Result<Issue> {
        const OP: &str = "get_issue";
        let sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?");
        sqlx::query_as::<_, IssueRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?
            .ok_or_else(|| CoordinationError::not_found("issue", id))?
            .into_issue()
    }

    #[instrument(skip(self, filter))]
    async fn search_issues(&self, query: &str, filter: &IssueFilter) -> Result<Vec<Issue>> {
        const OP: &str = "search_issues";
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ISSUE_COLUMNS} FROM issues i WHERE 1 = 1"));

        if !query.trim().is_empty() {
            let pattern = format!("%{}%", query.trim().to_lowercase());
            qb.push(" AND (LOWER(i.title) LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR LOWER(i.description) LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR LOWER(i.id) LIKE ");
            qb.push_bind(pattern);
            qb.push(")");
        }
        if let Some(status) = filter.status {
            qb.push(" AND i.status = ");
            qb.push_bind(status.as_str());
        }
        if let Some(priority) = filter.priority {
            qb.push(" AND i.priority = ");
            qb.push_bind(priority.value());
        }
        if let Some(issue_type) = filter.issue_type {
            qb.push(" AND i.issue_type = ");
            qb.push_bind(issue_type.as_str());
        }
        if let Some(assignee) = &filter.assignee {
            qb.push(" AND i.assignee = ");
            qb.push_bind(assignee.as_str());
        }
        if !filter.labels.is_empty() {
            let unique: std::collections::BTreeSet<&str> =
                filter.labels.iter().map(String::as_str).collect();
            qb.push(" AND (SELECT COUNT(DISTINCT l.label) FROM labels l WHERE l.issue_id = i.id AND l.label IN (");
            let mut separated = qb.separated(", ");
            for label in &unique {
                separated.push_bind(*label);
            }
            qb.push(")) = ");
            qb.push_bind(unique.len() as i64);
        }

        qb.push(" ORDER BY i.created_at DESC LIMIT ");
        qb.push_bind(self.effective_limit(filter.limit));

        let rows = qb
            .build_query_as::<IssueRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?;
        rows_into_issues(rows)
    }

    #[instrument(skip(self, update, actor))]
    async fn update_issue(&self, id: &str, update: &IssueUpdate, actor: &str) -> Result<Issue> {
        const OP: &str = "update_issue";
        let mut conn = self.begin_immediate(OP).await?;
        let result = self.update_issue_on(&mut conn, id, update, actor).await;
        self.finish(OP, conn, result).await
    }

    #[instrument(skip(self, actor))]
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

    #[instrument(skip(self, dep, actor))]
    async fn add_dependency(&self, dep: &Dependency, actor: &str) -> Result<()> {
        const OP: &str = "add_dependency";
        let mut conn = self.begin_immediate(OP).await?;
        let result = self.add_dependency_on(&mut conn, dep, actor).await;
        self.finish(OP, conn, result).await
    }

    #[instrument(skip(self, actor))]
    async fn remove_dependency(
        &self,
        issue_id: &str,
        depends_on_id: &str,
        actor: &str,
    ) -> Result<()> {
        const OP: &str = "remove_dependency";
        let mut conn = self.begin_immediate(OP).await?;
        let result = async {
            let removed = sqlx::query(
                "DELETE FROM dependencies WHERE issue_id = ? AND depends_on_id = ?",
            )
            .bind(issue_id)
            .bind(depends_on_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| db_err(OP, e))?
            .rows_affected();
            if removed == 0 {
                return Err(CoordinationError::not_found(
                    "dependency",
                    format!("{issue_id} -> {depends_on_id}"),
                ));
            }
            let detail = serde_json::json!({ "depends_on_id": depends_on_id });
            insert_event(
                &mut conn,
                issue_id,
                IssueEventType::DependencyRemoved,
                actor,
                Some(&detail),
                None,
                None,
                Utc::now(),
            )
            .await
            .map_err(|e| db_err(OP, e))?;
            Ok(())
        }
        .await;
        self.finish(OP, conn, result).await
    }

    #[instrument(skip(self))]
    async fn get_dependencies(&self, issue_id: &str) -> Result<Vec<Issue>> {
        const OP: &str = "get_dependencies";
        let sql = format!(
            "SELECT {} FROM issues i \
             JOIN dependencies d ON i.id = d.depends_on_id \
             WHERE d.issue_id = ? ORDER BY i.id",
            issue_columns_for("i")
        );
        let rows = sqlx::query_as::<_, IssueRow>(&sql)
            .bind(issue_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?;
        rows_into_issues(rows)
    }

    #[instrument(skip(self))]
    async fn get_dependents(&self, issue_id: &str) -> Result<Vec<Issue>> {
        const OP: &str = "get_dependents";
        let sql = format!(
            "SELECT {} FROM issues i \
             JOIN dependencies d ON i.id = d.issue_id \
             WHERE d.depends_on_id = ? ORDER BY i.id",
            issue_columns_for("i")
        );
        let rows = sqlx::query_as::<_, IssueRow>(&sql)
            .bind(issue_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?;
        rows_into_issues(rows)
    }

    #[instrument(skip(self))]
    async fn get_dependency_tree(&self, issue_id: &str, max_depth: i64) -> Result<Vec<TreeNode>> {
        const OP: &str = "get_dependency_tree";
        if max_depth <= 0 {
            return Err(CoordinationError::validation(
                OP,
                format!("max depth must be positive, got {max_depth}"),
            ));
        }
        // Root must exist before we walk anything.
        self.get_issue(issue_id).await?;

        let walk = sqlx::query_as::<_, (String, i64)>(
            "WITH RECURSIVE tree(id, depth, path) AS ( \
                 SELECT ?, 0, ',' || ? || ',' \
                 UNION ALL \
                 SELECT d.depends_on_id, t.depth + 1, t.path || d.depends_on_id || ',' \
                 FROM dependencies d \
                 JOIN tree t ON d.issue_id = t.id \
                 WHERE t.depth < ? AND instr(t.path, ',' || d.depends_on_id || ',') = 0 \
             ) \
             SELECT id, depth FROM tree",
        )
        .bind(issue_id)
        .bind(issue_id)
        .bind(max_depth)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?;

        // A diamond reaches the same node along several paths; keep the
        // shallowest occurrence.
        let mut depths: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        for (id, depth) in walk {
            depths
                .entry(id)
                .and_modify(|d| *d = (*d).min(depth))
                .or_insert(depth);
        }

        let ids: Vec<String> = depths.keys().cloned().collect();
        let issues = self.load_issues_chunked(OP, &ids).await?;

        let at_bound: Vec<String> = depths
            .iter()
            .filter(|(_, d)| **d == max_depth)
            .map(|(id, _)| id.clone())
            .collect();
        let has_children = self.ids_with_dependencies(OP, &at_bound).await?;

        let mut nodes: Vec<TreeNode> = Vec::with_capacity(depths.len());
        for (id, depth) in &depths {
            let Some(issue) = issues.get(id) else {
                warn!(issue_id = %id, "dependency tree references missing issue, skipping");
                continue;
            };
            nodes.push(TreeNode {
                issue: issue.clone(),
                depth: *depth,
                truncated: *depth == max_depth && has_children.contains(id),
            });
        }
        nodes.sort_by(|a, b| (a.depth, &a.issue.id).cmp(&(b.depth, &b.issue.id)));
        Ok(nodes)
    }

    #[instrument(skip(self))]
    async fn detect_cycles(&self) -> Result<Vec<Vec<String>>> {
        const OP: &str = "detect_cycles";
        let paths = sqlx::query_scalar::<_, String>(
            "WITH RECURSIVE walk(start_id, id, path, depth) AS ( \
                 SELECT issue_id, depends_on_id, issue_id || ',' || depends_on_id, 1 \
                 FROM dependencies WHERE type = 'blocks' \
                 UNION ALL \
                 SELECT w.start_id, d.depends_on_id, w.path || ',' || d.depends_on_id, w.depth + 1 \
                 FROM dependencies d \
                 JOIN walk w ON d.issue_id = w.id \
                 WHERE d.type = 'blocks' AND w.depth < 100 \
                   AND (instr(',' || w.path || ',', ',' || d.depends_on_id || ',') = 0 \
                        OR d.depends_on_id = w.start_id) \
             ) \
             SELECT path FROM walk WHERE id = start_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?;

        let cycles = normalize_cycles(
            paths
                .into_iter()
                .map(|p| p.split(',').map(str::to_string).collect())
                .collect(),
        );

        // Tolerate cycles that name issues missing from the issue table
        // (out-of-band edits); log and skip rather than failing the pass.
        let mut all_ids: Vec<String> = cycles.iter().flatten().cloned().collect();
        all_ids.sort();
        all_ids.dedup();
        let known = self.load_issues_chunked(OP, &all_ids).await?;
        Ok(cycles
            .into_iter()
            .filter(|cycle| {
                let missing: Vec<&String> =
                    cycle.iter().filter(|id| !known.contains_key(*id)).collect();
                if missing.is_empty() {
                    true
                } else {
                    warn!(?missing, "cycle references missing issues, skipping");
                    false
                }
            })
            .collect())
    }

    #[instrument(skip(self, filter))]
    async fn get_ready_work(&self, filter: &ReadyFilter) -> Result<Vec<Issue>> {
        const OP: &str = "get_ready_work";
        let sort = filter.sort.unwrap_or(self.config.sort_policy);
        let order = match sort {
            SortPolicy::Priority => "i.priority ASC, i.created_at DESC",
            SortPolicy::Oldest => "i.priority ASC, i.created_at ASC",
            SortPolicy::Hybrid => "i.priority ASC, i.updated_at ASC, i.created_at ASC",
        };

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ISSUE_COLUMNS} FROM issues i WHERE i.status = "));
        qb.push_bind(filter.status.as_str());
        qb.push(
            " AND NOT EXISTS ( \
                 SELECT 1 FROM dependencies d \
                 JOIN issues b ON b.id = d.depends_on_id \
                 WHERE d.issue_id = i.id AND d.type = 'blocks' \
                   AND b.status IN ('open', 'in_progress', 'blocked'))",
        );
        if let Some(assignee) = &filter.assignee {
            qb.push(" AND i.assignee = ");
            qb.push_bind(assignee.as_str());
        }
        qb.push(format!(" ORDER BY {order} LIMIT "));
        qb.push_bind(self.effective_limit(filter.limit));

        let rows = qb
            .build_query_as::<IssueRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?;
        rows_into_issues(rows)
    }

    #[instrument(skip(self))]
    async fn get_blocked_issues(&self) -> Result<Vec<BlockedIssue>> {
        const OP: &str = "get_blocked_issues";
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT issue_id, blocker_ids FROM blocked_issues ORDER BY issue_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?;

        let ids: Vec<String> = rows.iter().map(|(id, _)| id.clone()).collect();
        let issues = self.load_issues_chunked(OP, &ids).await?;

        let mut blocked = Vec::with_capacity(rows.len());
        for (issue_id, blocker_ids) in rows {
            let Some(issue) = issues.get(&issue_id) else {
                warn!(issue_id = %issue_id, "blocked view references missing issue, skipping");
                continue;
            };
            let mut blockers: Vec<String> =
                blocker_ids.split(',').map(str::to_string).collect();
            blockers.sort();
            blocked.push(BlockedIssue {
                issue: issue.clone(),
                blocker_ids: blockers,
            });
        }
        Ok(blocked)
    }

    #[instrument(skip(self))]
    async fn get_statistics(&self) -> Result<Statistics> {
        const OP: &str = "get_statistics";
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM issues GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?;

        let mut stats = Statistics::default();
        for (status, count) in counts {
            stats.total += count;
            match status.as_str() {
                "open" => stats.open = count,
                "in_progress" => stats.in_progress = count,
                "blocked" => stats.blocked_status = count,
                "closed" => stats.closed = count,
                other => warn!(status = other, "unknown status in statistics"),
            }
        }

        stats.blocked = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM blocked_issues")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?;
        stats.ready = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM ready_issues")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?;
        stats.avg_lead_time_hours = sqlx::query_scalar::<_, f64>(
            "SELECT COALESCE(AVG((julianday(closed_at) - julianday(created_at)) * 24.0), 0.0) \
             FROM issues WHERE status = 'closed' AND closed_at IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?;

        Ok(stats)
    }

    #[instrument(skip(self, actor))]
    async fn add_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<bool> {
        const OP: &str = "add_label";
        validate_label(OP, label)?;
        let mut conn = self.begin_immediate(OP).await?;
        let result = async {
            let insert = sqlx::query("INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)")
                .bind(issue_id)
                .bind(label)
                .execute(&mut *conn)
                .await;
            let added = match insert {
                Ok(done) => done.rows_affected() == 1,
                Err(e) if is_fk_violation(&e) => {
                    return Err(CoordinationError::not_found("issue", issue_id));
                }
                Err(e) => return Err(db_err(OP, e)),
            };
            if added {
                let detail = serde_json::Value::String(label.to_string());
                insert_event(
                    &mut conn,
                    issue_id,
                    IssueEventType::LabelAdded,
                    actor,
                    None,
                    Some(&detail),
                    None,
                    Utc::now(),
                )
                .await
                .map_err(|e| db_err(OP, e))?;
            }
            Ok(added)
        }
        .await;
        self.finish(OP, conn, result).await
    }

    #[instrument(skip(self, actor))]
    async fn remove_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<bool> {
        const OP: &str = "remove_label";
        validate_label(OP, label)?;
        let mut conn = self.begin_immediate(OP).await?;
        let result = async {
            let removed = sqlx::query("DELETE FROM labels WHERE issue_id = ? AND label = ?")
                .bind(issue_id)
                .bind(label)
                .execute(&mut *conn)
                .await
                .map_err(|e| db_err(OP, e))?
                .rows_affected()
                == 1;
            if removed {
                let detail = serde_json::Value::String(label.to_string());
                insert_event(
                    &mut conn,
                    issue_id,
                    IssueEventType::LabelRemoved,
                    actor,
                    Some(&detail),
                    None,
                    None,
                    Utc::now(),
                )
                .await
                .map_err(|e| db_err(OP, e))?;
            }
            Ok(removed)
        }
        .await;
        self.finish(OP, conn, result).await
    }

    #[instrument(skip(self))]
    async fn get_labels(&self, issue_id: &str) -> Result<Vec<String>> {
        const OP: &str = "get_labels";
        sqlx::query_scalar::<_, String>(
            "SELECT label FROM labels WHERE issue_id = ? ORDER BY label",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))
    }

    #[instrument(skip(self))]
    async fn has_label(&self, issue_id: &str, label: &str) -> Result<bool> {
        const OP: &str = "has_label";
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM labels WHERE issue_id = ? AND label = ?)",
        )
        .bind(issue_id)
        .bind(label)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))
    }

    #[instrument(skip(self))]
    async fn get_state_label(&self, issue_id: &str) -> Result<Option<String>> {
        let labels = self.get_labels(issue_id).await?;
        Ok(taskhive_core::highest_state_label(labels.iter().map(String::as_str))
            .map(str::to_string))
    }

    #[instrument(skip(self, actor))]
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
        let mut conn = self.begin_immediate(OP).await?;
        let result = async {
            let now = Utc::now();
            let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM issues WHERE id = ?)")
                .bind(issue_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| db_err(OP, e))?;
            if !exists {
                return Err(CoordinationError::not_found("issue", issue_id));
            }

            let mut removed = false;
            if !from_label.is_empty() {
                removed = sqlx::query("DELETE FROM labels WHERE issue_id = ? AND label = ?")
                    .bind(issue_id)
                    .bind(from_label)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| db_err(OP, e))?
                    .rows_affected()
                    == 1;
                if removed {
                    let detail = serde_json::Value::String(from_label.to_string());
                    insert_event(
                        &mut conn,
                        issue_id,
                        IssueEventType::LabelRemoved,
                        actor,
                        Some(&detail),
                        None,
                        None,
                        now,
                    )
                    .await
                    .map_err(|e| db_err(OP, e))?;
                }
            }

            let added = sqlx::query("INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)")
                .bind(issue_id)
                .bind(to_label)
                .execute(&mut *conn)
                .await
                .map_err(|e| db_err(OP, e))?
                .rows_affected()
                == 1;
            if added {
                let detail = serde_json::Value::String(to_label.to_string());
                insert_event(
                    &mut conn,
                    issue_id,
                    IssueEventType::LabelAdded,
                    actor,
                    None,
                    Some(&detail),
                    None,
                    now,
                )
                .await
                .map_err(|e| db_err(OP, e))?;
            }

            let event = AgentEvent {
                id: None,
                event_type: AgentEventType::LabelStateTransition,
                timestamp: now,
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
            insert_agent_event(&mut conn, &event)
                .await
                .map_err(|e| db_err(OP, e))?;

            debug!(issue_id, from_label, to_label, trigger = %trigger, "workflow transition");
            Ok(WorkflowTransition {
                removed,
                added,
                event_recorded: true,
            })
        }
        .await;
        self.finish(OP, conn, result).await
    }

    #[instrument(skip(self, instance))]
    async fn register_instance(&self, instance: &ExecutorInstance) -> Result<()> {
        const OP: &str = "register_instance";
        instance.validate()?;
        sqlx::query(
            "INSERT INTO executor_instances (instance_id, hostname, pid, status, started_at, \
             last_heartbeat, version, metadata, self_healing_mode) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(instance_id) DO UPDATE SET \
                 hostname = excluded.hostname, \
                 pid = excluded.pid, \
                 status = excluded.status, \
                 last_heartbeat = excluded.last_heartbeat, \
                 version = excluded.version, \
                 metadata = excluded.metadata",
        )
        .bind(&instance.instance_id)
        .bind(&instance.hostname)
        .bind(instance.pid)
        .bind(instance.status.as_str())
        .bind(instance.started_at)
        .bind(instance.last_heartbeat)
        .bind(&instance.version)
        .bind(&instance.metadata)
        .bind(&instance.self_healing_mode)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?;

        debug!(instance_id = %instance.instance_id, "registered instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_heartbeat(&self, instance_id: &str) -> Result<()> {
        const OP: &str = "update_heartbeat";
        let rows = sqlx::query("UPDATE executor_instances SET last_heartbeat = ? WHERE instance_id = ?")
            .bind(Utc::now())
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?
            .rows_affected();
        if rows == 0 {
            return Err(CoordinationError::not_found("executor instance", instance_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: &str) -> Result<ExecutorInstance> {
        const OP: &str = "get_instance";
        let sql = format!("SELECT {EXECUTOR_COLUMNS} FROM executor_instances WHERE instance_id = ?");
        sqlx::query_as::<_, ExecutorRow>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?
            .ok_or_else(|| CoordinationError::not_found("executor instance", instance_id))?
            .into_instance()
    }

    #[instrument(skip(self))]
    async fn get_active_instances(&self) -> Result<Vec<ExecutorInstance>> {
        const OP: &str = "get_active_instances";
        let sql = format!(
            "SELECT {EXECUTOR_COLUMNS} FROM executor_instances \
             WHERE status = 'running' ORDER BY last_heartbeat DESC"
        );
        let rows = sqlx::query_as::<_, ExecutorRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?;
        rows.into_iter().map(ExecutorRow::into_instance).collect()
    }

    #[instrument(skip(self, cancel))]
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

        let stale = sqlx::query_scalar::<_, String>(
            "SELECT instance_id FROM executor_instances \
             WHERE status = 'running' AND last_heartbeat < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?;

        let orphaned = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT s.executor_instance_id FROM issue_execution_state s \
             JOIN executor_instances e ON e.instance_id = s.executor_instance_id \
             WHERE e.status = 'stopped'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?;

        let mut report = CleanupReport::default();
        let batches = stale
            .iter()
            .map(|id| (id, true))
            .chain(orphaned.iter().map(|id| (id, false)));
        for (instance_id, is_stale) in batches {
            if cancel.is_cancelled() {
                warn!(cleaned = report.cleaned, "stale cleanup cancelled, returning partial count");
                report.interrupted = true;
                break;
            }
            match self
                .release_instance_claims(instance_id, is_stale, threshold_secs)
                .await
            {
                Ok(()) => report.cleaned += 1,
                Err(e) => {
                    // The sweep is idempotent per instance; skip and let
                    // the next pass retry.
                    error!(instance_id = %instance_id, error = %e, "failed to clean instance");
                }
            }
        }
        Ok(report)
    }

    #[instrument(skip(self))]
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
        let deleted = sqlx::query(
            "DELETE FROM executor_instances \
             WHERE status = 'stopped' AND started_at < ? \
               AND instance_id NOT IN ( \
                   SELECT instance_id FROM executor_instances \
                   WHERE status = 'stopped' ORDER BY started_at DESC LIMIT ?)",
        )
        .bind(cutoff)
        .bind(max_to_keep)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?
        .rows_affected();

        if deleted > 0 {
            debug!(deleted, "pruned stopped instances");
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn claim_issue(&self, issue_id: &str, executor_instance_id: &str) -> Result<()> {
        const OP: &str = "claim_issue";
        let mut conn = self.begin_immediate(OP).await?;
        let result = async {
            let now = Utc::now();
            let issue = self.fetch_issue_on(OP, &mut conn, issue_id).await?;

            if issue.status != IssueStatus::Open {
                let already_claimed = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM issue_execution_state WHERE issue_id = ?)",
                )
                .bind(issue_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| db_err(OP, e))?;
                if already_claimed {
                    return Err(CoordinationError::conflict(
                        OP,
                        format!("issue {issue_id} already claimed by another executor"),
                    ));
                }
                return Err(CoordinationError::state(
                    OP,
                    format!("issue {issue_id} is not open (status: {})", issue.status),
                ));
            }

            let executor_exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM executor_instances WHERE instance_id = ?)",
            )
            .bind(executor_instance_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| db_err(OP, e))?;
            if !executor_exists {
                return Err(CoordinationError::not_found(
                    "executor instance",
                    executor_instance_id,
                ));
            }

            let insert = sqlx::query(
                "INSERT INTO issue_execution_state \
                 (issue_id, executor_instance_id, state, checkpoint, started_at, updated_at) \
                 VALUES (?, ?, 'claimed', '{}', ?, ?)",
            )
            .bind(issue_id)
            .bind(executor_instance_id)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await;
            match insert {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(CoordinationError::conflict(
                        OP,
                        format!("issue {issue_id} already claimed by another executor"),
                    ));
                }
                Err(e) => return Err(db_err(OP, e)),
            }

            sqlx::query("UPDATE issues SET status = 'in_progress', updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(issue_id)
                .execute(&mut *conn)
                .await
                .map_err(|e| db_err(OP, e))?;

            insert_event(
                &mut conn,
                issue_id,
                IssueEventType::StatusChanged,
                executor_instance_id,
                Some(&serde_json::Value::String("open".to_string())),
                Some(&serde_json::Value::String("in_progress".to_string())),
                Some(&format!("claimed by {executor_instance_id}")),
                now,
            )
            .await
            .map_err(|e| db_err(OP, e))?;

            debug!(issue_id, executor_instance_id, "claimed issue");
            Ok(())
        }
        .await;
        self.finish(OP, conn, result).await
    }

    #[instrument(skip(self))]
    async fn get_execution_state(&self, issue_id: &str) -> Result<Option<IssueExecution>> {
        const OP: &str = "get_execution_state";
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM issue_execution_state WHERE issue_id = ?");
        sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(issue_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?
            .map(ExecutionRow::into_execution)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn update_execution_state(
        &self,
        issue_id: &str,
        new_state: ExecutionState,
    ) -> Result<()> {
        const OP: &str = "update_execution_state";
        let current_raw = sqlx::query_scalar::<_, String>(
            "SELECT state FROM issue_execution_state WHERE issue_id = ?",
        )
        .bind(issue_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?
        .ok_or_else(|| CoordinationError::not_found("execution state", issue_id))?;
        let current: ExecutionState = current_raw.parse()?;

        if !current.can_transition_to(new_state) {
            return Err(CoordinationError::state(
                OP,
                format!("invalid state transition {current} -> {new_state} for issue {issue_id}"),
            ));
        }

        // Compare-and-swap: the WHERE clause pins the state we just read.
        let rows = sqlx::query(
            "UPDATE issue_execution_state SET state = ?, updated_at = ? \
             WHERE issue_id = ? AND state = ?",
        )
        .bind(new_state.as_str())
        .bind(Utc::now())
        .bind(issue_id)
        .bind(current.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?
        .rows_affected();

        if rows == 0 {
            let observed = sqlx::query_scalar::<_, String>(
                "SELECT state FROM issue_execution_state WHERE issue_id = ?",
            )
            .bind(issue_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?;
            return match observed {
                None => Err(CoordinationError::not_found("execution state", issue_id)),
                Some(observed) => Err(CoordinationError::conflict(
                    OP,
                    format!(
                        "concurrent state modification detected for issue {issue_id}: \
                         expected {current}, observed {observed}"
                    ),
                )),
            };
        }

        debug!(issue_id, from = %current, to = %new_state, "execution state advanced");
        Ok(())
    }

    #[instrument(skip(self, data))]
    async fn save_checkpoint(&self, issue_id: &str, data: &serde_json::Value) -> Result<()> {
        const OP: &str = "save_checkpoint";
        let blob = data.to_string();
        let rows = sqlx::query(
            "UPDATE issue_execution_state SET checkpoint = ?, updated_at = ? WHERE issue_id = ?",
        )
        .bind(&blob)
        .bind(Utc::now())
        .bind(issue_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?
        .rows_affected();
        if rows == 0 {
            return Err(CoordinationError::not_found("execution state", issue_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_checkpoint(&self, issue_id: &str) -> Result<String> {
        const OP: &str = "get_checkpoint";
        sqlx::query_scalar::<_, String>(
            "SELECT checkpoint FROM issue_execution_state WHERE issue_id = ?",
        )
        .bind(issue_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?
        .ok_or_else(|| CoordinationError::not_found("execution state", issue_id))
    }

    #[instrument(skip(self))]
    async fn release_issue(&self, issue_id: &str) -> Result<()> {
        const OP: &str = "release_issue";
        let rows = sqlx::query("DELETE FROM issue_execution_state WHERE issue_id = ?")
            .bind(issue_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?
            .rows_affected();
        if rows == 0 {
            return Err(CoordinationError::not_found("execution state", issue_id));
        }
        debug!(issue_id, "released issue");
        Ok(())
    }

    #[instrument(skip(self, actor, error_comment))]
    async fn release_and_reopen(
        &self,
        issue_id: &str,
        actor: &str,
        error_comment: &str,
    ) -> Result<()> {
        const OP: &str = "release_and_reopen";
        let mut conn = self.begin_immediate(OP).await?;
        let result = async {
            let now = Utc::now();
            let issue = self.fetch_issue_on(OP, &mut conn, issue_id).await?;

            let removed = sqlx::query("DELETE FROM issue_execution_state WHERE issue_id = ?")
                .bind(issue_id)
                .execute(&mut *conn)
                .await
                .map_err(|e| db_err(OP, e))?
                .rows_affected();
            if removed == 0 {
                warn!(issue_id, "no execution state to release, reopening anyway");
            }

            sqlx::query("UPDATE issues SET status = 'open', updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(issue_id)
                .execute(&mut *conn)
                .await
                .map_err(|e| db_err(OP, e))?;

            if !error_comment.trim().is_empty() {
                insert_event(
                    &mut conn,
                    issue_id,
                    IssueEventType::Commented,
                    actor,
                    None,
                    None,
                    Some(error_comment),
                    now,
                )
                .await
                .map_err(|e| db_err(OP, e))?;
            }

            insert_event(
                &mut conn,
                issue_id,
                IssueEventType::StatusChanged,
                actor,
                Some(&serde_json::Value::String(issue.status.as_str().to_string())),
                Some(&serde_json::Value::String("open".to_string())),
                Some(REOPEN_MESSAGE),
                now,
            )
            .await
            .map_err(|e| db_err(OP, e))?;

            debug!(issue_id, actor, "released and reopened");
            Ok(())
        }
        .await;
        self.finish(OP, conn, result).await
    }

    #[instrument(skip(self, attempt))]
    async fn record_attempt(&self, attempt: &ExecutionAttempt) -> Result<i64> {
        const OP: &str = "record_attempt";
        match attempt.id {
            None => {
                let mut conn = self.begin_immediate(OP).await?;
                let result = async {
                    let next = sqlx::query_scalar::<_, i64>(
                        "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM execution_history \
                         WHERE issue_id = ?",
                    )
                    .bind(&attempt.issue_id)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(|e| db_err(OP, e))?;

                    let mut stored = attempt.clone();
                    stored.attempt_number = next;
                    stored.started_at = Some(stored.started_at.unwrap_or_else(Utc::now));
                    stored.validate()?;

                    let insert = sqlx::query_scalar::<_, i64>(
                        "INSERT INTO execution_history (issue_id, attempt_number, started_at, \
                         completed_at, success, exit_code, summary, output_sample, error_sample) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
                    )
                    .bind(&stored.issue_id)
                    .bind(stored.attempt_number)
                    .bind(stored.started_at)
                    .bind(stored.completed_at)
                    .bind(stored.success)
                    .bind(stored.exit_code)
                    .bind(&stored.summary)
                    .bind(&stored.output_sample)
                    .bind(&stored.error_sample)
                    .fetch_one(&mut *conn)
                    .await;
                    match insert {
                        Ok(id) => {
                            debug!(issue_id = %stored.issue_id, attempt = stored.attempt_number,
                                   "recorded attempt");
                            Ok(id)
                        }
                        Err(e) if is_fk_violation(&e) => {
                            Err(CoordinationError::not_found("issue", &attempt.issue_id))
                        }
                        Err(e) => Err(db_err(OP, e)),
                    }
                }
                .await;
                self.finish(OP, conn, result).await
            }
            Some(id) => {
                let rows = sqlx::query(
                    "UPDATE execution_history SET completed_at = ?, success = ?, exit_code = ?, \
                     summary = ?, output_sample = ?, error_sample = ? WHERE id = ?",
                )
                .bind(attempt.completed_at)
                .bind(attempt.success)
                .bind(attempt.exit_code)
                .bind(&attempt.summary)
                .bind(&attempt.output_sample)
                .bind(&attempt.error_sample)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err(OP, e))?
                .rows_affected();
                if rows == 0 {
                    return Err(CoordinationError::not_found(
                        "execution attempt",
                        id.to_string(),
                    ));
                }
                Ok(id)
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_execution_history(&self, issue_id: &str) -> Result<Vec<ExecutionAttempt>> {
        const OP: &str = "get_execution_history";
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM execution_history \
             WHERE issue_id = ? ORDER BY attempt_number ASC"
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(issue_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?;
        Ok(rows.into_iter().map(AttemptRow::into_attempt).collect())
    }

    #[instrument(skip(self))]
    async fn get_events(&self, issue_id: &str, limit: i64) -> Result<Vec<IssueEvent>> {
        const OP: &str = "get_events";
        let mut sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE issue_id = ? \
             ORDER BY created_at DESC, id DESC"
        );
        if limit > 0 {
            sql.push_str(" LIMIT ?");
        }
        let mut query = sqlx::query_as::<_, EventRow>(&sql).bind(issue_id);
        if limit > 0 {
            query = query.bind(limit);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    #[instrument(skip(self, event))]
    async fn record_agent_event(&self, event: &AgentEvent) -> Result<i64> {
        const OP: &str = "record_agent_event";
        if event.issue_id.trim().is_empty() {
            return Err(CoordinationError::validation(
                OP,
                "agent event must reference an issue",
            ));
        }
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_err(OP, e))?;
        match insert_agent_event(&mut conn, event).await {
            Ok(id) => Ok(id),
            Err(e) if is_fk_violation(&e) => {
                Err(CoordinationError::not_found("issue", &event.issue_id))
            }
            Err(e) => Err(db_err(OP, e)),
        }
    }

    #[instrument(skip(self))]
    async fn get_agent_events(&self, issue_id: &str, limit: i64) -> Result<Vec<AgentEvent>> {
        const OP: &str = "get_agent_events";
        let mut sql = format!(
            "SELECT {AGENT_EVENT_COLUMNS} FROM agent_events WHERE issue_id = ? \
             ORDER BY timestamp DESC, id DESC"
        );
        if limit > 0 {
            sql.push_str(" LIMIT ?");
        }
        let mut query = sqlx::query_as::<_, AgentEventRow>(&sql).bind(issue_id);
        if limit > 0 {
            query = query.bind(limit);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?;
        rows.into_iter().map(AgentEventRow::into_event).collect()
    }

    #[instrument(skip(self, retention, cancel))]
    async fn cleanup_agent_events(
        &self,
        retention: &EventRetention,
        cancel: &CancellationToken,
    ) -> Result<RetentionReport> {
        const OP: &str = "cleanup_agent_events";
        retention.validate()?;
        let now = Utc::now();
        let mut report = RetentionReport::default();

        // Age-based passes, one severity band at a time.
        let passes = [
            (
                "DELETE FROM agent_events WHERE id IN ( \
                     SELECT id FROM agent_events \
                     WHERE severity IN ('info', 'warning') AND timestamp < ? LIMIT ?)",
                now - chrono::Duration::days(retention.info_warning_days),
            ),
            (
                "DELETE FROM agent_events WHERE id IN ( \
                     SELECT id FROM agent_events \
                     WHERE severity IN ('error', 'critical') AND timestamp < ? LIMIT ?)",
                now - chrono::Duration::days(retention.error_critical_days),
            ),
        ];
        for (sql, cutoff) in passes {
            loop {
                if cancel.is_cancelled() {
                    report.interrupted = true;
                    return Ok(report);
                }
                let deleted = sqlx::query(sql)
                    .bind(cutoff)
                    .bind(retention.batch_size)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| db_err(OP, e))?
                    .rows_affected();
                report.deleted += deleted;
                if (deleted as i64) < retention.batch_size {
                    break;
                }
            }
        }

        // Per-issue cap: prune oldest non-critical beyond the limit.
        let over_cap = sqlx::query_as::<_, (String, i64)>(
            "SELECT issue_id, COUNT(*) FROM agent_events GROUP BY issue_id HAVING COUNT(*) > ?",
        )
        .bind(retention.per_issue_limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?;
        for (issue_id, count) in over_cap {
            if cancel.is_cancelled() {
                report.interrupted = true;
                return Ok(report);
            }
            let excess = count - retention.per_issue_limit;
            let deleted = sqlx::query(
                "DELETE FROM agent_events WHERE id IN ( \
                     SELECT id FROM agent_events \
                     WHERE issue_id = ? AND severity != 'critical' \
                     ORDER BY timestamp ASC, id ASC LIMIT ?)",
            )
            .bind(&issue_id)
            .bind(excess)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?
            .rows_affected();
            report.deleted += deleted;
        }

        // Global cap: prune oldest non-critical beyond the limit, batched.
        loop {
            if cancel.is_cancelled() {
                report.interrupted = true;
                return Ok(report);
            }
            let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM agent_events")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_err(OP, e))?;
            let excess = total - retention.global_limit;
            if excess <= 0 {
                break;
            }
            let deleted = sqlx::query(
                "DELETE FROM agent_events WHERE id IN ( \
                     SELECT id FROM agent_events WHERE severity != 'critical' \
                     ORDER BY timestamp ASC, id ASC LIMIT ?)",
            )
            .bind(excess.min(retention.batch_size))
            .execute(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))?
            .rows_affected();
            report.deleted += deleted;
            if deleted == 0 {
                // Everything left above the cap is critical.
                break;
            }
        }

        if report.deleted > 0 {
            debug!(deleted = report.deleted, "agent event retention pass complete");
        }
        Ok(report)
    }

    #[instrument(skip(self))]
    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        const OP: &str = "get_config";
        sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err(OP, e))
    }

    #[instrument(skip(self, value))]
    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        const OP: &str = "set_config";
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err(OP, e))?;
        Ok(())
    }
}

impl SqliteStore {
    /// Hydrate issues by ID in chunks sized for the parameter limit,
    /// returning a map. Missing IDs are simply absent; callers decide
    /// whether to log and skip.
    async fn load_issues_chunked(
        &self,
        operation: &'static str,
        ids: &[String],
    ) -> Result<std::collections::HashMap<String, Issue>> {
        let mut issues = std::collections::HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(PARAM_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id IN ("));
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(id.as_str());
            }
            qb.push(")");
            let rows = qb
                .build_query_as::<IssueRow>()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_err(operation, e))?;
            for row in rows {
                let issue = row.into_issue()?;
                issues.insert(issue.id.clone(), issue);
            }
        }
        Ok(issues)
    }

    /// Subset of `ids` that have at least one outgoing dependency.
    async fn ids_with_dependencies(
        &self,
        operation: &'static str,
        ids: &[String],
    ) -> Result<std::collections::HashSet<String>> {
        let mut result = std::collections::HashSet::new();
        for chunk in ids.chunks(PARAM_CHUNK) {
            if chunk.is_empty() {
                continue;
            }
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT DISTINCT issue_id FROM dependencies WHERE issue_id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(id.as_str());
            }
            qb.push(")");
            let rows: Vec<String> = qb
                .build_query_scalar()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_err(operation, e))?;
            result.extend(rows);
        }
        Ok(result)
    }
}

// Helper functions

#[allow(clippy::too_many_arguments)]
async fn insert_event(
    conn: &mut SqliteConnection,
    issue_id: &str,
    event_type: IssueEventType,
    actor: &str,
    old_value: Option<&serde_json::Value>,
    new_value: Option<&serde_json::Value>,
    comment: Option<&str>,
    at: DateTime<Utc>,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO events (issue_id, event_type, actor, old_value, new_value, comment, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(issue_id)
    .bind(event_type.as_str())
    .bind(actor)
    .bind(old_value.map(|v| v.to_string()))
    .bind(new_value.map(|v| v.to_string()))
    .bind(comment)
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_agent_event(
    conn: &mut SqliteConnection,
    event: &AgentEvent,
) -> std::result::Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO agent_events (event_type, timestamp, issue_id, executor_id, agent_id, \
         severity, message, data_json, source_line) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(event.event_type.as_str())
    .bind(event.timestamp)
    .bind(&event.issue_id)
    .bind(&event.executor_id)
    .bind(&event.agent_id)
    .bind(event.severity.as_str())
    .bind(&event.message)
    .bind(event.data.to_string())
    .bind(event.source_line)
    .fetch_one(&mut *conn)
    .await
}

async fn config_value(
    conn: &mut SqliteConnection,
    key: &str,
) -> std::result::Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
}

/// Is there a `blocks` path from `start` to `target`? Returns the path as
/// an arrow-joined ID list when one exists.
async fn blocks_path(
    conn: &mut SqliteConnection,
    start: &str,
    target: &str,
) -> std::result::Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "WITH RECURSIVE walk(id, path, depth) AS ( \
             SELECT depends_on_id, ? || ' -> ' || depends_on_id, 1 \
             FROM dependencies WHERE issue_id = ? AND type = 'blocks' \
             UNION ALL \
             SELECT d.depends_on_id, w.path || ' -> ' || d.depends_on_id, w.depth + 1 \
             FROM dependencies d \
             JOIN walk w ON d.issue_id = w.id \
             WHERE d.type = 'blocks' AND w.depth < 1000 \
         ) \
         SELECT path FROM walk WHERE id = ? LIMIT 1",
    )
    .bind(start)
    .bind(start)
    .bind(target)
    .fetch_optional(&mut *conn)
    .await
}
