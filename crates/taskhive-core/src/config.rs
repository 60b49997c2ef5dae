// Coordination configuration
//
// Everything tunable by an embedder, with the reference defaults. The
// constructors validate ranges so an invalid configuration never reaches
// the store.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

/// Config-table key that overrides [`CoordinationConfig::issue_prefix`].
pub const CONFIG_KEY_ISSUE_PREFIX: &str = "issue_prefix";

/// Ordering applied to ready work after the priority sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortPolicy {
    /// Stalest-first within a priority band.
    Hybrid,
    /// Newest-first within a priority band. Default for autonomous
    /// execution.
    Priority,
    /// Oldest-first within a priority band.
    Oldest,
}

impl Default for SortPolicy {
    fn default() -> Self {
        SortPolicy::Priority
    }
}

/// Retention policy for the agent-event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRetention {
    /// Info/warning events older than this many days are deleted.
    pub info_warning_days: i64,
    /// Error/critical events older than this many days are deleted.
    /// Must be >= `info_warning_days`.
    pub error_critical_days: i64,
    /// Per-issue cap beyond which oldest non-critical events are pruned.
    pub per_issue_limit: i64,
    /// Global cap beyond which oldest non-critical events are pruned.
    pub global_limit: i64,
    /// Rows deleted per batch; cancellation is checked between batches.
    pub batch_size: i64,
}

impl Default for EventRetention {
    fn default() -> Self {
        EventRetention {
            info_warning_days: 30,
            error_critical_days: 90,
            per_issue_limit: 1_000,
            global_limit: 100_000,
            batch_size: 500,
        }
    }
}

impl EventRetention {
    pub fn validate(&self) -> Result<()> {
        if self.info_warning_days <= 0 || self.error_critical_days <= 0 {
            return Err(CoordinationError::validation(
                "event_retention",
                "retention day thresholds must be positive",
            ));
        }
        if self.error_critical_days < self.info_warning_days {
            return Err(CoordinationError::validation(
                "event_retention",
                format!(
                    "error/critical retention ({} days) must not be shorter than info/warning retention ({} days)",
                    self.error_critical_days, self.info_warning_days
                ),
            ));
        }
        if self.per_issue_limit <= 0 || self.global_limit <= 0 {
            return Err(CoordinationError::validation(
                "event_retention",
                "event caps must be positive",
            ));
        }
        if !(100..=1_000).contains(&self.batch_size) {
            return Err(CoordinationError::validation(
                "event_retention",
                format!("batch size must be in 100..=1000, got {}", self.batch_size),
            ));
        }
        Ok(())
    }
}

/// Retention policy for stopped executor instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoppedRetention {
    /// Stopped instances started earlier than this are eligible for
    /// deletion.
    pub older_than_secs: i64,
    /// Always keep this many most-recent stopped instances. Zero keeps
    /// none.
    pub max_to_keep: i64,
}

impl Default for StoppedRetention {
    fn default() -> Self {
        StoppedRetention {
            older_than_secs: 7 * 24 * 3600,
            max_to_keep: 10,
        }
    }
}

impl StoppedRetention {
    pub fn validate(&self) -> Result<()> {
        if self.older_than_secs <= 0 {
            return Err(CoordinationError::validation(
                "stopped_retention",
                format!("older_than_secs must be positive, got {}", self.older_than_secs),
            ));
        }
        if self.max_to_keep < 0 {
            return Err(CoordinationError::validation(
                "stopped_retention",
                format!("max_to_keep must be >= 0, got {}", self.max_to_keep),
            ));
        }
        Ok(())
    }
}

/// Connection-pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    /// Ping connections on checkout.
    pub test_before_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: 25,
            min_connections: 5,
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(1800),
            test_before_acquire: true,
        }
    }
}

/// Top-level configuration for the coordination core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Prefix for generated issue IDs. May be overridden per database via
    /// the `issue_prefix` config key.
    pub issue_prefix: String,
    /// A running instance whose heartbeat is older than this is stale.
    pub stale_threshold_secs: i64,
    pub stopped_retention: StoppedRetention,
    pub event_retention: EventRetention,
    pub pool: PoolConfig,
    pub sort_policy: SortPolicy,
    /// Depth bound for dependency-tree walks.
    pub max_tree_depth: i64,
    /// Protective cap applied to searches, including "unlimited" ones.
    pub search_cap: i64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        CoordinationConfig {
            issue_prefix: "th".to_string(),
            stale_threshold_secs: 300,
            stopped_retention: StoppedRetention::default(),
            event_retention: EventRetention::default(),
            pool: PoolConfig::default(),
            sort_policy: SortPolicy::default(),
            max_tree_depth: 50,
            search_cap: 10_000,
        }
    }
}

impl CoordinationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.issue_prefix.trim().is_empty() {
            return Err(CoordinationError::validation(
                "config",
                "issue prefix must not be empty",
            ));
        }
        if self.stale_threshold_secs <= 0 {
            return Err(CoordinationError::validation(
                "config",
                format!(
                    "stale threshold must be positive, got {}",
                    self.stale_threshold_secs
                ),
            ));
        }
        if self.max_tree_depth <= 0 {
            return Err(CoordinationError::validation(
                "config",
                format!("max tree depth must be positive, got {}", self.max_tree_depth),
            ));
        }
        if self.search_cap <= 0 {
            return Err(CoordinationError::validation(
                "config",
                format!("search cap must be positive, got {}", self.search_cap),
            ));
        }
        self.stopped_retention.validate()?;
        self.event_retention.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(CoordinationConfig::default().validate().is_ok());
    }

    #[test]
    fn retention_ordering_enforced() {
        let retention = EventRetention {
            info_warning_days: 90,
            error_critical_days: 30,
            ..Default::default()
        };
        assert!(retention.validate().is_err());
    }

    #[test]
    fn batch_size_bounds() {
        let mut retention = EventRetention::default();
        retention.batch_size = 50;
        assert!(retention.validate().is_err());
        retention.batch_size = 2_000;
        assert!(retention.validate().is_err());
        retention.batch_size = 100;
        assert!(retention.validate().is_ok());
    }

    #[test]
    fn stopped_retention_bounds() {
        let retention = StoppedRetention {
            older_than_secs: 0,
            max_to_keep: 0,
        };
        assert!(retention.validate().is_err());
        let retention = StoppedRetention {
            older_than_secs: 60,
            max_to_keep: 0,
        };
        assert!(retention.validate().is_ok());
    }
}
