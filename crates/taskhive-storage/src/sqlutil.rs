// Driver-error classification shared by the SQL backends

use taskhive_core::CoordinationError;
use tracing::error;

pub(crate) fn db_err(operation: &'static str, e: sqlx::Error) -> CoordinationError {
    error!(operation, error = %e, "database operation failed");
    CoordinationError::transient(operation, e.to_string())
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation)
}

pub(crate) fn is_fk_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::ForeignKeyViolation)
}
