// Executor instance registry entities

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Running,
    Stopped,
}

impl ExecutorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorStatus::Running => "running",
            ExecutorStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExecutorStatus {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(ExecutorStatus::Running),
            "stopped" => Ok(ExecutorStatus::Stopped),
            _ => Err(CoordinationError::validation(
                "parse_executor_status",
                format!("unknown executor status {s:?}"),
            )),
        }
    }
}

/// One long-running worker process, registered by instance id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInstance {
    pub instance_id: String,
    pub hostname: String,
    pub pid: i64,
    pub status: ExecutorStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub version: String,
    /// Opaque metadata. Must parse as JSON; `{}` when unused.
    pub metadata: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_healing_mode: Option<String>,
}

impl ExecutorInstance {
    pub fn new(
        instance_id: impl Into<String>,
        hostname: impl Into<String>,
        pid: i64,
        version: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        ExecutorInstance {
            instance_id: instance_id.into(),
            hostname: hostname.into(),
            pid,
            status: ExecutorStatus::Running,
            started_at: now,
            last_heartbeat: now,
            version: version.into(),
            metadata: "{}".to_string(),
            self_healing_mode: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(CoordinationError::validation(
                "executor_instance",
                "instance id must not be empty",
            ));
        }
        if self.hostname.trim().is_empty() {
            return Err(CoordinationError::validation(
                "executor_instance",
                format!("hostname must not be empty ({})", self.instance_id),
            ));
        }
        if self.pid <= 0 {
            return Err(CoordinationError::validation(
                "executor_instance",
                format!("pid must be positive, got {} ({})", self.pid, self.instance_id),
            ));
        }
        if serde_json::from_str::<serde_json::Value>(&self.metadata).is_err() {
            return Err(CoordinationError::validation(
                "executor_instance",
                format!("metadata must be valid JSON ({})", self.instance_id),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_instance_passes() {
        let instance = ExecutorInstance::new("host-1-100-abc", "host-1", 100, "0.2.0");
        assert!(instance.validate().is_ok());
    }

    #[test]
    fn invalid_fields_rejected() {
        let mut instance = ExecutorInstance::new("", "host-1", 100, "0.2.0");
        assert!(instance.validate().is_err());

        instance = ExecutorInstance::new("exec-1", "", 100, "0.2.0");
        assert!(instance.validate().is_err());

        instance = ExecutorInstance::new("exec-1", "host-1", 0, "0.2.0");
        assert!(instance.validate().is_err());

        instance = ExecutorInstance::new("exec-1", "host-1", 100, "0.2.0");
        instance.metadata = "not json".to_string();
        assert!(instance.validate().is_err());
    }
}
