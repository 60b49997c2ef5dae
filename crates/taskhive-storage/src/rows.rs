// Database row structs shared by the SQL backends
//
// Rows carry driver-friendly types (strings for enums, TEXT for JSON
// blobs); conversion into domain types is where corrupted stored data
// gets caught.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use taskhive_core::{
    AgentEvent, CoordinationError, ExecutionAttempt, ExecutorInstance, Issue, IssueEvent,
    IssueExecution, Priority, Result,
};

#[derive(Debug, Clone, FromRow)]
pub(crate) struct IssueRow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub design: String,
    pub acceptance_criteria: String,
    pub notes: String,
    pub status: String,
    pub priority: i64,
    pub issue_type: String,
    pub assignee: Option<String>,
    pub estimated_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
}

/// Column list matching [`IssueRow`]; keeps SELECTs consistent across
/// queries.
pub(crate) const ISSUE_COLUMNS: &str = "id, title, description, design, acceptance_criteria, \
     notes, status, priority, issue_type, assignee, estimated_minutes, created_at, updated_at, \
     closed_at, approved_at, approved_by";

/// [`ISSUE_COLUMNS`] qualified with a table alias, for queries that join
/// tables sharing column names.
pub(crate) fn issue_columns_for(alias: &str) -> String {
    ISSUE_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl IssueRow {
    pub fn into_issue(self) -> Result<Issue> {
        Ok(Issue {
            id: self.id,
            title: self.title,
            description: self.description,
            design: self.design,
            acceptance_criteria: self.acceptance_criteria,
            notes: self.notes,
            status: self.status.parse()?,
            priority: Priority::new(self.priority)?,
            issue_type: self.issue_type.parse()?,
            assignee: self.assignee,
            estimated_minutes: self.estimated_minutes,
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at,
            approved_at: self.approved_at,
            approved_by: self.approved_by,
        })
    }
}

pub(crate) fn rows_into_issues(rows: Vec<IssueRow>) -> Result<Vec<Issue>> {
    rows.into_iter().map(IssueRow::into_issue).collect()
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ExecutorRow {
    pub instance_id: String,
    pub hostname: String,
    pub pid: i64,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub version: String,
    pub metadata: String,
    pub self_healing_mode: Option<String>,
}

pub(crate) const EXECUTOR_COLUMNS: &str = "instance_id, hostname, pid, status, started_at, \
     last_heartbeat, version, metadata, self_healing_mode";

impl ExecutorRow {
    pub fn into_instance(self) -> Result<ExecutorInstance> {
        Ok(ExecutorInstance {
            instance_id: self.instance_id,
            hostname: self.hostname,
            pid: self.pid,
            status: self.status.parse()?,
            started_at: self.started_at,
            last_heartbeat: self.last_heartbeat,
            version: self.version,
            metadata: self.metadata,
            self_healing_mode: self.self_healing_mode,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ExecutionRow {
    pub issue_id: String,
    pub executor_instance_id: String,
    pub state: String,
    pub checkpoint: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const EXECUTION_COLUMNS: &str =
    "issue_id, executor_instance_id, state, checkpoint, started_at, updated_at";

impl ExecutionRow {
    pub fn into_execution(self) -> Result<IssueExecution> {
        Ok(IssueExecution {
            issue_id: self.issue_id,
            executor_instance_id: self.executor_instance_id,
            state: self.state.parse()?,
            checkpoint: self.checkpoint,
            started_at: self.started_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct AttemptRow {
    pub id: i64,
    pub issue_id: String,
    pub attempt_number: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub exit_code: Option<i64>,
    pub summary: String,
    pub output_sample: String,
    pub error_sample: String,
}

pub(crate) const ATTEMPT_COLUMNS: &str = "id, issue_id, attempt_number, started_at, \
     completed_at, success, exit_code, summary, output_sample, error_sample";

impl AttemptRow {
    pub fn into_attempt(self) -> ExecutionAttempt {
        ExecutionAttempt {
            id: Some(self.id),
            issue_id: self.issue_id,
            attempt_number: self.attempt_number,
            started_at: Some(self.started_at),
            completed_at: self.completed_at,
            success: self.success,
            exit_code: self.exit_code,
            summary: self.summary,
            output_sample: self.output_sample,
            error_sample: self.error_sample,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct EventRow {
    pub id: i64,
    pub issue_id: String,
    pub event_type: String,
    pub actor: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub(crate) const EVENT_COLUMNS: &str =
    "id, issue_id, event_type, actor, old_value, new_value, comment, created_at";

impl EventRow {
    pub fn into_event(self) -> Result<IssueEvent> {
        Ok(IssueEvent {
            id: self.id,
            issue_id: self.issue_id,
            event_type: self.event_type.parse()?,
            actor: self.actor,
            old_value: parse_value_blob("get_events", self.old_value.as_deref())?,
            new_value: parse_value_blob("get_events", self.new_value.as_deref())?,
            comment: self.comment,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct AgentEventRow {
    pub id: i64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub issue_id: String,
    pub executor_id: Option<String>,
    pub agent_id: Option<String>,
    pub severity: String,
    pub message: String,
    pub data_json: String,
    pub source_line: Option<i64>,
}

pub(crate) const AGENT_EVENT_COLUMNS: &str = "id, event_type, timestamp, issue_id, executor_id, \
     agent_id, severity, message, data_json, source_line";

impl AgentEventRow {
    pub fn into_event(self) -> Result<AgentEvent> {
        let data = serde_json::from_str(&self.data_json).map_err(|e| {
            CoordinationError::fatal(
                "get_agent_events",
                format!("corrupted agent event data for id {}: {e}", self.id),
            )
        })?;
        Ok(AgentEvent {
            id: Some(self.id),
            event_type: self.event_type.parse()?,
            timestamp: self.timestamp,
            issue_id: self.issue_id,
            executor_id: self.executor_id,
            agent_id: self.agent_id,
            severity: self.severity.parse()?,
            message: self.message,
            data,
            source_line: self.source_line,
        })
    }
}

fn parse_value_blob(
    operation: &'static str,
    blob: Option<&str>,
) -> Result<Option<serde_json::Value>> {
    match blob {
        None => Ok(None),
        Some(text) => serde_json::from_str(text).map(Some).map_err(|e| {
            CoordinationError::fatal(operation, format!("corrupted event value blob: {e}"))
        }),
    }
}
