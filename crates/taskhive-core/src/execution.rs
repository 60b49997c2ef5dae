// Execution pipeline state machine and per-attempt history

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

/// Per-issue execution pipeline state.
///
/// The pipeline is `claimed -> assessing -> executing -> analyzing -> gates
/// -> committing -> completed`, with skips for disabled phases and a
/// universal escape to `failed` from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Claimed,
    Assessing,
    Executing,
    Analyzing,
    Gates,
    Committing,
    Completed,
    Failed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Claimed => "claimed",
            ExecutionState::Assessing => "assessing",
            ExecutionState::Executing => "executing",
            ExecutionState::Analyzing => "analyzing",
            ExecutionState::Gates => "gates",
            ExecutionState::Committing => "committing",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Skip edges exist so configurations with assessment, analysis, or
    /// gates disabled remain sound. `-> Failed` is legal from every
    /// non-terminal state.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        if next == ExecutionState::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (ExecutionState::Claimed, ExecutionState::Assessing)
                | (ExecutionState::Claimed, ExecutionState::Executing)
                | (ExecutionState::Claimed, ExecutionState::Completed)
                | (ExecutionState::Assessing, ExecutionState::Executing)
                | (ExecutionState::Executing, ExecutionState::Analyzing)
                | (ExecutionState::Executing, ExecutionState::Gates)
                | (ExecutionState::Executing, ExecutionState::Completed)
                | (ExecutionState::Analyzing, ExecutionState::Gates)
                | (ExecutionState::Analyzing, ExecutionState::Completed)
                | (ExecutionState::Gates, ExecutionState::Completed)
                | (ExecutionState::Committing, ExecutionState::Completed)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "claimed" => Ok(ExecutionState::Claimed),
            "assessing" => Ok(ExecutionState::Assessing),
            "executing" => Ok(ExecutionState::Executing),
            "analyzing" => Ok(ExecutionState::Analyzing),
            "gates" => Ok(ExecutionState::Gates),
            "committing" => Ok(ExecutionState::Committing),
            "completed" => Ok(ExecutionState::Completed),
            "failed" => Ok(ExecutionState::Failed),
            _ => Err(CoordinationError::validation(
                "parse_execution_state",
                format!("unknown execution state {s:?}"),
            )),
        }
    }
}

/// The claim row: exclusive ownership of one issue by one executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueExecution {
    pub issue_id: String,
    pub executor_instance_id: String,
    pub state: ExecutionState,
    /// Opaque JSON blob owned by the current claimer; `{}` when fresh.
    pub checkpoint: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only history row, one per execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    /// Store-assigned id; `None` on first insert.
    pub id: Option<i64>,
    pub issue_id: String,
    /// Auto-assigned as max(existing for the issue) + 1 on insert.
    pub attempt_number: i64,
    /// Defaults to now on insert when unset.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub output_sample: String,
    #[serde(default)]
    pub error_sample: String,
}

impl ExecutionAttempt {
    pub fn new(issue_id: impl Into<String>) -> Self {
        ExecutionAttempt {
            id: None,
            issue_id: issue_id.into(),
            attempt_number: 0,
            started_at: None,
            completed_at: None,
            success: None,
            exit_code: None,
            summary: String::new(),
            output_sample: String::new(),
            error_sample: String::new(),
        }
    }

    /// Validate after the store has auto-assigned attempt number and start
    /// time.
    pub fn validate(&self) -> Result<()> {
        if self.issue_id.trim().is_empty() {
            return Err(CoordinationError::validation(
                "execution_attempt",
                "issue id must not be empty",
            ));
        }
        if self.attempt_number <= 0 {
            return Err(CoordinationError::validation(
                "execution_attempt",
                format!(
                    "attempt number must be positive, got {} for {}",
                    self.attempt_number, self.issue_id
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ExecutionState; 8] = [
        ExecutionState::Claimed,
        ExecutionState::Assessing,
        ExecutionState::Executing,
        ExecutionState::Analyzing,
        ExecutionState::Gates,
        ExecutionState::Committing,
        ExecutionState::Completed,
        ExecutionState::Failed,
    ];

    #[test]
    fn normal_pipeline_is_legal() {
        let path = [
            ExecutionState::Claimed,
            ExecutionState::Assessing,
            ExecutionState::Executing,
            ExecutionState::Analyzing,
            ExecutionState::Gates,
            ExecutionState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn skip_edges_are_legal() {
        assert!(ExecutionState::Claimed.can_transition_to(ExecutionState::Executing));
        assert!(ExecutionState::Claimed.can_transition_to(ExecutionState::Completed));
        assert!(ExecutionState::Executing.can_transition_to(ExecutionState::Gates));
        assert!(ExecutionState::Executing.can_transition_to(ExecutionState::Completed));
        assert!(ExecutionState::Analyzing.can_transition_to(ExecutionState::Completed));
    }

    #[test]
    fn failed_reachable_from_all_non_terminal_states() {
        for state in ALL {
            assert_eq!(
                state.can_transition_to(ExecutionState::Failed),
                !state.is_terminal(),
                "{state}"
            );
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for next in ALL {
            assert!(!ExecutionState::Completed.can_transition_to(next));
            assert!(!ExecutionState::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn backward_edges_are_illegal() {
        assert!(!ExecutionState::Executing.can_transition_to(ExecutionState::Assessing));
        assert!(!ExecutionState::Gates.can_transition_to(ExecutionState::Analyzing));
        assert!(!ExecutionState::Analyzing.can_transition_to(ExecutionState::Executing));
        assert!(!ExecutionState::Assessing.can_transition_to(ExecutionState::Claimed));
        // gates never feeds back into the active pipeline
        assert!(!ExecutionState::Gates.can_transition_to(ExecutionState::Committing));
    }

    #[test]
    fn attempt_validation() {
        let mut attempt = ExecutionAttempt::new("th-1");
        attempt.attempt_number = 1;
        assert!(attempt.validate().is_ok());
        attempt.attempt_number = 0;
        assert!(attempt.validate().is_err());
        attempt.issue_id = String::new();
        assert!(attempt.validate().is_err());
    }
}
