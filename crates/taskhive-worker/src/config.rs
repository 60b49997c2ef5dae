// Worker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use taskhive_core::{
    CoordinationConfig, WorkflowTrigger, LABEL_NEEDS_QUALITY_GATES, LABEL_TASK_READY,
};

/// Workflow label swap performed after a successful execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelHandoff {
    pub from: String,
    pub to: String,
    pub trigger: WorkflowTrigger,
}

impl Default for LabelHandoff {
    fn default() -> Self {
        LabelHandoff {
            from: LABEL_TASK_READY.to_string(),
            to: LABEL_NEEDS_QUALITY_GATES.to_string(),
            trigger: WorkflowTrigger::TaskCompleted,
        }
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub coordination: CoordinationConfig,

    /// Reported in the executor registry.
    pub version: String,

    /// Minimum poll interval (when work was just found).
    pub min_poll_interval: Duration,

    /// Maximum poll interval (when idle).
    pub max_poll_interval: Duration,

    /// Backoff multiplier applied while no work is found.
    pub backoff_multiplier: f64,

    /// How many ready issues to fetch per poll; claims race peers so
    /// fetching a few spares a round trip after losing one.
    pub poll_batch: i64,

    pub heartbeat_interval: Duration,

    /// How often the janitor sweeps stale instances, stopped-instance
    /// retention, and agent-event retention.
    pub janitor_interval: Duration,

    /// Workflow hand-off fired after a successful execution; `None`
    /// leaves labels to an external orchestrator.
    pub success_handoff: Option<LabelHandoff>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            coordination: CoordinationConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            min_poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            poll_batch: 5,
            heartbeat_interval: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(60),
            success_handoff: Some(LabelHandoff::default()),
        }
    }
}

impl WorkerConfig {
    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = interval;
        self
    }

    pub fn with_success_handoff(mut self, handoff: Option<LabelHandoff>) -> Self {
        self.success_handoff = handoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = WorkerConfig::default();
        assert!(config.min_poll_interval < config.max_poll_interval);
        assert!(config.backoff_multiplier >= 1.0);
        assert!(config.poll_batch > 0);
        assert_eq!(
            config.success_handoff,
            Some(LabelHandoff {
                from: LABEL_TASK_READY.to_string(),
                to: LABEL_NEEDS_QUALITY_GATES.to_string(),
                trigger: WorkflowTrigger::TaskCompleted,
            })
        );
    }

    #[test]
    fn builder_overrides() {
        let config = WorkerConfig::default()
            .with_min_poll_interval(Duration::from_millis(10))
            .with_heartbeat_interval(Duration::from_secs(5))
            .with_success_handoff(None);
        assert_eq!(config.min_poll_interval, Duration::from_millis(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert!(config.success_handoff.is_none());
    }
}
