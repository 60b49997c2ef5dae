// Fine-grained agent event stream
//
// Workers publish these while driving an issue through the pipeline; the
// vocabulary is closed so downstream consumers can switch on the type.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventType {
    FileModified,
    TestRun,
    GitOperation,
    BuildOutput,
    LintOutput,
    Progress,
    Error,
    WatchdogAlert,
    IssueClaimed,
    AssessmentStarted,
    AssessmentCompleted,
    AgentSpawned,
    AgentCompleted,
    ResultsProcessingStarted,
    ResultsProcessingCompleted,
    AnalysisStarted,
    AnalysisCompleted,
    QualityGatesStarted,
    QualityGatesCompleted,
    QualityGatesSkipped,
    LabelStateTransition,
}

impl AgentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentEventType::FileModified => "file_modified",
            AgentEventType::TestRun => "test_run",
            AgentEventType::GitOperation => "git_operation",
            AgentEventType::BuildOutput => "build_output",
            AgentEventType::LintOutput => "lint_output",
            AgentEventType::Progress => "progress",
            AgentEventType::Error => "error",
            AgentEventType::WatchdogAlert => "watchdog_alert",
            AgentEventType::IssueClaimed => "issue_claimed",
            AgentEventType::AssessmentStarted => "assessment_started",
            AgentEventType::AssessmentCompleted => "assessment_completed",
            AgentEventType::AgentSpawned => "agent_spawned",
            AgentEventType::AgentCompleted => "agent_completed",
            AgentEventType::ResultsProcessingStarted => "results_processing_started",
            AgentEventType::ResultsProcessingCompleted => "results_processing_completed",
            AgentEventType::AnalysisStarted => "analysis_started",
            AgentEventType::AnalysisCompleted => "analysis_completed",
            AgentEventType::QualityGatesStarted => "quality_gates_started",
            AgentEventType::QualityGatesCompleted => "quality_gates_completed",
            AgentEventType::QualityGatesSkipped => "quality_gates_skipped",
            AgentEventType::LabelStateTransition => "label_state_transition",
        }
    }
}

impl fmt::Display for AgentEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AgentEventType {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file_modified" => Ok(AgentEventType::FileModified),
            "test_run" => Ok(AgentEventType::TestRun),
            "git_operation" => Ok(AgentEventType::GitOperation),
            "build_output" => Ok(AgentEventType::BuildOutput),
            "lint_output" => Ok(AgentEventType::LintOutput),
            "progress" => Ok(AgentEventType::Progress),
            "error" => Ok(AgentEventType::Error),
            "watchdog_alert" => Ok(AgentEventType::WatchdogAlert),
            "issue_claimed" => Ok(AgentEventType::IssueClaimed),
            "assessment_started" => Ok(AgentEventType::AssessmentStarted),
            "assessment_completed" => Ok(AgentEventType::AssessmentCompleted),
            "agent_spawned" => Ok(AgentEventType::AgentSpawned),
            "agent_completed" => Ok(AgentEventType::AgentCompleted),
            "results_processing_started" => Ok(AgentEventType::ResultsProcessingStarted),
            "results_processing_completed" => Ok(AgentEventType::ResultsProcessingCompleted),
            "analysis_started" => Ok(AgentEventType::AnalysisStarted),
            "analysis_completed" => Ok(AgentEventType::AnalysisCompleted),
            "quality_gates_started" => Ok(AgentEventType::QualityGatesStarted),
            "quality_gates_completed" => Ok(AgentEventType::QualityGatesCompleted),
            "quality_gates_skipped" => Ok(AgentEventType::QualityGatesSkipped),
            "label_state_transition" => Ok(AgentEventType::LabelStateTransition),
            _ => Err(CoordinationError::validation(
                "parse_agent_event_type",
                format!("unknown agent event type {s:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            _ => Err(CoordinationError::validation(
                "parse_severity",
                format!("unknown severity {s:?}"),
            )),
        }
    }
}

/// One fine-grained event in the per-issue agent stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Store-assigned; `None` on publish.
    pub id: Option<i64>,
    pub event_type: AgentEventType,
    pub timestamp: DateTime<Utc>,
    pub issue_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_line: Option<i64>,
}

impl AgentEvent {
    pub fn new(
        event_type: AgentEventType,
        issue_id: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        AgentEvent {
            id: None,
            event_type,
            timestamp: Utc::now(),
            issue_id: issue_id.into(),
            executor_id: None,
            agent_id: None,
            severity,
            message: message.into(),
            data: serde_json::Value::Object(serde_json::Map::new()),
            source_line: None,
        }
    }

    pub fn with_executor(mut self, executor_id: impl Into<String>) -> Self {
        self.executor_id = Some(executor_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn type_strings_round_trip() {
        for t in [
            AgentEventType::FileModified,
            AgentEventType::IssueClaimed,
            AgentEventType::QualityGatesSkipped,
            AgentEventType::LabelStateTransition,
        ] {
            assert_eq!(t.as_str().parse::<AgentEventType>().unwrap(), t);
        }
    }
}
