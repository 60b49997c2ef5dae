// Workflow label overlay
//
// A coarser state machine than the execution pipeline, expressed as the
// presence of exactly one reserved label per issue. It models hand-offs
// between code workers, QA workers, reviewers, human approvers, and
// mergers. The store records transitions; orchestrators decide which
// trigger fires when.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

/// Reserved workflow labels, ordered by pipeline position.
pub const LABEL_TASK_READY: &str = "task-ready";
pub const LABEL_NEEDS_QUALITY_GATES: &str = "needs-quality-gates";
pub const LABEL_NEEDS_REVIEW: &str = "needs-review";
pub const LABEL_NEEDS_HUMAN_APPROVAL: &str = "needs-human-approval";
pub const LABEL_APPROVED: &str = "approved";

/// Transient sublabels of the quality-gates stage.
pub const LABEL_GATES_RUNNING: &str = "gates-running";
pub const LABEL_GATES_FAILED: &str = "gates-failed";

/// Reserved labels in descending priority order: when more than one is
/// present, `get_state_label` reports the furthest-along one.
pub const STATE_LABEL_PRIORITY: [&str; 5] = [
    LABEL_APPROVED,
    LABEL_NEEDS_HUMAN_APPROVAL,
    LABEL_NEEDS_REVIEW,
    LABEL_NEEDS_QUALITY_GATES,
    LABEL_TASK_READY,
];

/// Whether a label belongs to the reserved workflow set.
pub fn is_state_label(label: &str) -> bool {
    STATE_LABEL_PRIORITY.contains(&label)
}

/// Pick the highest-priority reserved label out of an arbitrary label set.
/// Non-reserved labels are ignored; returns `None` when no reserved label
/// is present.
pub fn highest_state_label<'a, I>(labels: I) -> Option<&'static str>
where
    I: IntoIterator<Item = &'a str>,
{
    let present: Vec<&str> = labels.into_iter().collect();
    STATE_LABEL_PRIORITY
        .iter()
        .find(|candidate| present.contains(*candidate))
        .copied()
}

/// Named triggers that move an issue between workflow labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowTrigger {
    TaskCompleted,
    EpicCompleted,
    GatesPassed,
    ReviewCompleted,
    HumanApproval,
}

impl WorkflowTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowTrigger::TaskCompleted => "task_completed",
            WorkflowTrigger::EpicCompleted => "epic_completed",
            WorkflowTrigger::GatesPassed => "gates_passed",
            WorkflowTrigger::ReviewCompleted => "review_completed",
            WorkflowTrigger::HumanApproval => "human_approval",
        }
    }
}

impl fmt::Display for WorkflowTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkflowTrigger {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "task_completed" => Ok(WorkflowTrigger::TaskCompleted),
            "epic_completed" => Ok(WorkflowTrigger::EpicCompleted),
            "gates_passed" => Ok(WorkflowTrigger::GatesPassed),
            "review_completed" => Ok(WorkflowTrigger::ReviewCompleted),
            "human_approval" => Ok(WorkflowTrigger::HumanApproval),
            _ => Err(CoordinationError::validation(
                "parse_workflow_trigger",
                format!("unknown workflow trigger {s:?}"),
            )),
        }
    }
}

/// Outcome of a workflow label transition.
///
/// No-op halves of a transition are reported, not errored: re-running a
/// transition is safe and only the effective parts emit audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowTransition {
    /// The from-label was present and has been removed.
    pub removed: bool,
    /// The to-label was absent and has been added.
    pub added: bool,
    /// The `label_state_transition` agent event landed.
    pub event_recorded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert_eq!(
            highest_state_label(vec![LABEL_TASK_READY, LABEL_NEEDS_REVIEW]),
            Some(LABEL_NEEDS_REVIEW)
        );
        assert_eq!(
            highest_state_label(vec![LABEL_APPROVED, LABEL_TASK_READY, "misc"]),
            Some(LABEL_APPROVED)
        );
        assert_eq!(highest_state_label(vec!["misc", "urgent"]), None);
        assert_eq!(highest_state_label(Vec::<&str>::new()), None);
    }

    #[test]
    fn sublabels_are_not_state_labels() {
        assert!(is_state_label(LABEL_NEEDS_QUALITY_GATES));
        assert!(!is_state_label(LABEL_GATES_RUNNING));
        assert!(!is_state_label(LABEL_GATES_FAILED));
    }

    #[test]
    fn trigger_strings_round_trip() {
        for t in [
            WorkflowTrigger::TaskCompleted,
            WorkflowTrigger::EpicCompleted,
            WorkflowTrigger::GatesPassed,
            WorkflowTrigger::ReviewCompleted,
            WorkflowTrigger::HumanApproval,
        ] {
            assert_eq!(t.as_str().parse::<WorkflowTrigger>().unwrap(), t);
        }
    }
}
