// Issue entity and validation

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

/// Workflow status of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    /// Available for claiming once unblocked.
    Open,
    /// Claimed by an executor.
    InProgress,
    /// Explicitly parked behind unresolved blockers.
    Blocked,
    /// Terminal.
    Closed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Blocked => "blocked",
            IssueStatus::Closed => "closed",
        }
    }

    /// Statuses that keep an issue in the dependency picture: an issue in
    /// any of these states still blocks its dependents.
    pub fn is_unresolved(&self) -> bool {
        !matches!(self, IssueStatus::Closed)
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(IssueStatus::Open),
            "in_progress" => Ok(IssueStatus::InProgress),
            "blocked" => Ok(IssueStatus::Blocked),
            "closed" => Ok(IssueStatus::Closed),
            _ => Err(CoordinationError::validation(
                "parse_status",
                format!("unknown issue status {s:?}"),
            )),
        }
    }
}

/// Classification of issues by their nature and scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Bug,
    Feature,
    Task,
    Epic,
    Chore,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Bug => "bug",
            IssueType::Feature => "feature",
            IssueType::Task => "task",
            IssueType::Epic => "epic",
            IssueType::Chore => "chore",
        }
    }

    /// Whether issues of this type require acceptance criteria before they
    /// can be created or reopened. Epics and chores are organizational and
    /// exempt.
    pub fn requires_acceptance_criteria(&self) -> bool {
        matches!(self, IssueType::Bug | IssueType::Feature | IssueType::Task)
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bug" => Ok(IssueType::Bug),
            "feature" => Ok(IssueType::Feature),
            "task" => Ok(IssueType::Task),
            "epic" => Ok(IssueType::Epic),
            "chore" => Ok(IssueType::Chore),
            _ => Err(CoordinationError::validation(
                "parse_issue_type",
                format!("unknown issue type {s:?}"),
            )),
        }
    }
}

/// Priority band, 0 (highest) through 4 (lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(i64);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(2);
    pub const LOWEST: Priority = Priority(4);

    pub fn new(value: i64) -> Result<Self> {
        if (0..=4).contains(&value) {
            Ok(Priority(value))
        } else {
            Err(CoordinationError::validation(
                "priority",
                format!("priority must be in 0..=4, got {value}"),
            ))
        }
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The primary entity representing a tracked work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Unique identifier, `{prefix}-{n}`. Empty on input means "assign one".
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub design: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    #[serde(default)]
    pub notes: String,
    pub status: IssueStatus,
    pub priority: Priority,
    pub issue_type: IssueType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
}

impl Issue {
    /// Construct an open issue with default priority and current timestamps.
    pub fn new(id: impl Into<String>, title: impl Into<String>, issue_type: IssueType) -> Self {
        let now = Utc::now();
        Issue {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            notes: String::new(),
            status: IssueStatus::Open,
            priority: Priority::default(),
            issue_type,
            assignee: None,
            estimated_minutes: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
            approved_at: None,
            approved_by: None,
        }
    }

    /// Validate all field-level invariants.
    ///
    /// The same checks run on create and on the merged result of an update,
    /// so a partial update can never leave an issue invalid.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CoordinationError::validation("issue", "id must not be empty"));
        }
        let title_len = self.title.chars().count();
        if title_len == 0 || title_len > 500 {
            return Err(CoordinationError::validation(
                "issue",
                format!(
                    "title must be 1-500 characters, got {title_len} for {}",
                    self.id
                ),
            ));
        }
        if let Some(minutes) = self.estimated_minutes {
            if minutes < 0 {
                return Err(CoordinationError::validation(
                    "issue",
                    format!("estimated_minutes must be >= 0, got {minutes} for {}", self.id),
                ));
            }
        }
        if self.issue_type.requires_acceptance_criteria()
            && self.acceptance_criteria.trim().is_empty()
        {
            return Err(CoordinationError::validation(
                "issue",
                format!(
                    "issues of type {} require acceptance criteria ({})",
                    self.issue_type, self.id
                ),
            ));
        }
        Ok(())
    }
}

/// Typed partial update for an issue.
///
/// Only `Some` fields are applied; the closed set of updatable columns is
/// the set of fields on this struct.
#[derive(Debug, Clone, Default)]
pub struct IssueUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub design: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub notes: Option<String>,
    pub status: Option<IssueStatus>,
    pub priority: Option<Priority>,
    pub issue_type: Option<IssueType>,
    pub assignee: Option<String>,
    pub estimated_minutes: Option<i64>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
}

impl IssueUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.design.is_none()
            && self.acceptance_criteria.is_none()
            && self.notes.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.issue_type.is_none()
            && self.assignee.is_none()
            && self.estimated_minutes.is_none()
            && self.approved_at.is_none()
            && self.approved_by.is_none()
    }

    /// Apply this update to a copy of `issue`, returning the merged result.
    /// The caller validates the merge and persists it.
    pub fn apply_to(&self, issue: &Issue) -> Issue {
        let mut merged = issue.clone();
        if let Some(v) = &self.title {
            merged.title = v.clone();
        }
        if let Some(v) = &self.description {
            merged.description = v.clone();
        }
        if let Some(v) = &self.design {
            merged.design = v.clone();
        }
        if let Some(v) = &self.acceptance_criteria {
            merged.acceptance_criteria = v.clone();
        }
        if let Some(v) = &self.notes {
            merged.notes = v.clone();
        }
        if let Some(v) = self.status {
            merged.status = v;
        }
        if let Some(v) = self.priority {
            merged.priority = v;
        }
        if let Some(v) = self.issue_type {
            merged.issue_type = v;
        }
        if let Some(v) = &self.assignee {
            merged.assignee = Some(v.clone());
        }
        if let Some(v) = self.estimated_minutes {
            merged.estimated_minutes = Some(v);
        }
        if let Some(v) = self.approved_at {
            merged.approved_at = Some(v);
        }
        if let Some(v) = &self.approved_by {
            merged.approved_by = Some(v.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_task() -> Issue {
        let mut issue = Issue::new("th-1", "wire the widget", IssueType::Task);
        issue.acceptance_criteria = "widget wired".to_string();
        issue
    }

    #[test]
    fn task_requires_acceptance_criteria() {
        let mut issue = valid_task();
        issue.acceptance_criteria = "   ".to_string();
        assert!(issue.validate().is_err());

        issue.issue_type = IssueType::Epic;
        assert!(issue.validate().is_ok());

        issue.issue_type = IssueType::Chore;
        assert!(issue.validate().is_ok());
    }

    #[test]
    fn title_bounds() {
        let mut issue = valid_task();
        issue.title = String::new();
        assert!(issue.validate().is_err());

        issue.title = "x".repeat(501);
        assert!(issue.validate().is_err());

        issue.title = "x".repeat(500);
        assert!(issue.validate().is_ok());
    }

    #[test]
    fn negative_estimate_rejected() {
        let mut issue = valid_task();
        issue.estimated_minutes = Some(-5);
        assert!(issue.validate().is_err());
        issue.estimated_minutes = Some(0);
        assert!(issue.validate().is_ok());
    }

    #[test]
    fn priority_range() {
        assert!(Priority::new(0).is_ok());
        assert!(Priority::new(4).is_ok());
        assert!(Priority::new(5).is_err());
        assert!(Priority::new(-1).is_err());
    }

    #[test]
    fn update_merge_is_partial() {
        let issue = valid_task();
        let update = IssueUpdate {
            priority: Some(Priority::HIGHEST),
            notes: Some("now urgent".to_string()),
            ..Default::default()
        };
        let merged = update.apply_to(&issue);
        assert_eq!(merged.priority, Priority::HIGHEST);
        assert_eq!(merged.notes, "now urgent");
        assert_eq!(merged.title, issue.title);
        assert_eq!(merged.status, issue.status);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            IssueStatus::Open,
            IssueStatus::InProgress,
            IssueStatus::Blocked,
            IssueStatus::Closed,
        ] {
            assert_eq!(status.as_str().parse::<IssueStatus>().unwrap(), status);
        }
        assert!("nope".parse::<IssueStatus>().is_err());
    }
}
