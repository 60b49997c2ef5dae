// Error taxonomy for the coordination core
//
// Every error carries the originating operation so callers (and logs) can
// tell which store entry point failed without unwinding the stack.

use thiserror::Error;

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Errors surfaced by the coordination core
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Field missing, out of range, or otherwise invalid
    #[error("{operation}: validation failed: {message}")]
    Validation { operation: String, message: String },

    /// Uniqueness violation (duplicate claim) or CAS mismatch
    #[error("{operation}: {message}")]
    Conflict { operation: String, message: String },

    /// Target entity absent
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Foreign-key violation or would-be cycle
    #[error("{operation}: {message}")]
    Dependency { operation: String, message: String },

    /// Illegal workflow or execution-state transition
    #[error("{operation}: {message}")]
    State { operation: String, message: String },

    /// Underlying transaction failure or cancellation; retryable
    #[error("{operation}: transient failure: {message}")]
    Transient { operation: String, message: String },

    /// Schema initialization failure or corrupted stored data
    #[error("{operation}: fatal: {message}")]
    Fatal { operation: String, message: String },
}

impl CoordinationError {
    pub fn validation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CoordinationError::Validation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CoordinationError::Conflict {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoordinationError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn dependency(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CoordinationError::Dependency {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn state(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CoordinationError::State {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CoordinationError::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn fatal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CoordinationError::Fatal {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether a caller may retry the operation after re-reading state
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Conflict { .. } | CoordinationError::Transient { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(CoordinationError::conflict("claim_issue", "already claimed").is_retryable());
        assert!(CoordinationError::transient("create_issue", "db locked").is_retryable());
        assert!(!CoordinationError::not_found("issue", "th-1").is_retryable());
        assert!(!CoordinationError::validation("create_issue", "empty title").is_retryable());
    }

    #[test]
    fn messages_carry_operation_context() {
        let err = CoordinationError::state("claim_issue", "issue th-3 is not open (status: closed)");
        assert!(err.to_string().contains("claim_issue"));
        assert!(err.to_string().contains("not open"));
    }
}
