//! # taskhive-core
//!
//! Domain model for the taskhive coordination core: issues with
//! dependencies and labels, executor instances with heartbeats, the
//! per-issue execution pipeline, the audit and agent event vocabularies,
//! and the workflow label overlay.
//!
//! This crate is storage-agnostic. Persistence lives in
//! `taskhive-storage`; worker loops live in `taskhive-worker`.

pub mod agent_event;
pub mod config;
pub mod dependency;
pub mod error;
pub mod event;
pub mod execution;
pub mod executor;
pub mod id;
pub mod issue;
pub mod workflow;

pub use agent_event::{AgentEvent, AgentEventType, Severity};
pub use config::{
    CoordinationConfig, EventRetention, PoolConfig, SortPolicy, StoppedRetention,
    CONFIG_KEY_ISSUE_PREFIX,
};
pub use dependency::{Dependency, DependencyType};
pub use error::{CoordinationError, Result};
pub use event::{IssueEvent, IssueEventType};
pub use execution::{ExecutionAttempt, ExecutionState, IssueExecution};
pub use executor::{ExecutorInstance, ExecutorStatus};
pub use id::{format_issue_id, parse_issue_suffix};
pub use issue::{Issue, IssueStatus, IssueType, IssueUpdate, Priority};
pub use workflow::{
    highest_state_label, is_state_label, WorkflowTransition, WorkflowTrigger, LABEL_APPROVED,
    LABEL_GATES_FAILED, LABEL_GATES_RUNNING, LABEL_NEEDS_HUMAN_APPROVAL, LABEL_NEEDS_QUALITY_GATES,
    LABEL_NEEDS_REVIEW, LABEL_TASK_READY, STATE_LABEL_PRIORITY,
};
