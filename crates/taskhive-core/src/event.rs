// Coarse audit events on issues

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueEventType {
    Created,
    Updated,
    StatusChanged,
    Commented,
    Closed,
    Reopened,
    DependencyAdded,
    DependencyRemoved,
    LabelAdded,
    LabelRemoved,
    Watchdog,
}

impl IssueEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueEventType::Created => "created",
            IssueEventType::Updated => "updated",
            IssueEventType::StatusChanged => "status_changed",
            IssueEventType::Commented => "commented",
            IssueEventType::Closed => "closed",
            IssueEventType::Reopened => "reopened",
            IssueEventType::DependencyAdded => "dependency_added",
            IssueEventType::DependencyRemoved => "dependency_removed",
            IssueEventType::LabelAdded => "label_added",
            IssueEventType::LabelRemoved => "label_removed",
            IssueEventType::Watchdog => "watchdog",
        }
    }
}

impl fmt::Display for IssueEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IssueEventType {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(IssueEventType::Created),
            "updated" => Ok(IssueEventType::Updated),
            "status_changed" => Ok(IssueEventType::StatusChanged),
            "commented" => Ok(IssueEventType::Commented),
            "closed" => Ok(IssueEventType::Closed),
            "reopened" => Ok(IssueEventType::Reopened),
            "dependency_added" => Ok(IssueEventType::DependencyAdded),
            "dependency_removed" => Ok(IssueEventType::DependencyRemoved),
            "label_added" => Ok(IssueEventType::LabelAdded),
            "label_removed" => Ok(IssueEventType::LabelRemoved),
            "watchdog" => Ok(IssueEventType::Watchdog),
            _ => Err(CoordinationError::validation(
                "parse_event_type",
                format!("unknown issue event type {s:?}"),
            )),
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueEvent {
    pub id: i64,
    pub issue_id: String,
    pub event_type: IssueEventType,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}
