//! Ledger storage errors

use thiserror::Error;

use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};

/// SQLSTATE raised by the audit_logs triggers (`restrict_violation`)
pub const APPEND_ONLY_SQLSTATE: &str = "23001";
const UNIQUE_VIOLATION_SQLSTATE: &str = "23505";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} was modified concurrently (expected version {expected_version})")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected_version: i64,
    },

    #[error("duplicate key: {0}")]
    UniqueViolation(String),

    #[error("{table} is append-only: {message}")]
    AppendOnly { table: &'static str, message: String },

    #[error("database connection error: {0}")]
    Connection(String),

    #[error("database query error: {0}")]
    Query(String),

    #[error("stored row could not be decoded: {0}")]
    Decode(String),

    #[error("migration failed: {0}")]
    Migration(String),
}

impl DatabaseError {
    /// Connection-level failures may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, DatabaseError::Connection(_))
    }

    #[cfg(feature = "database")]
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound {
                entity: "row",
                id: String::new(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::Connection(err.to_string())
            }
            sqlx::Error::Database(ref db_err) => match db_err.code().as_deref() {
                Some(APPEND_ONLY_SQLSTATE) => DatabaseError::AppendOnly {
                    table: "audit_logs",
                    message: db_err.message().to_string(),
                },
                Some(UNIQUE_VIOLATION_SQLSTATE) => {
                    DatabaseError::UniqueViolation(db_err.message().to_string())
                }
                _ => DatabaseError::Query(err.to_string()),
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DatabaseError::Decode(err.to_string())
            }
            other => DatabaseError::Query(other.to_string()),
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::Migration(err.to_string())
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let kind = match err {
            DatabaseError::NotFound { entity: "refund", id } => {
                AppErrorKind::Domain(DomainError::RefundNotFound { refund_id: id })
            }
            DatabaseError::NotFound { id, .. } => {
                AppErrorKind::Domain(DomainError::TransactionNotFound { transaction_id: id })
            }
            DatabaseError::VersionConflict { id, .. } => {
                AppErrorKind::Domain(DomainError::ConcurrentModification { transaction_id: id })
            }
            other => AppErrorKind::Infrastructure(InfrastructureError::Database {
                is_retryable: other.is_retryable(),
                message: other.to_string(),
            }),
        };
        AppError::new(kind)
    }
}

pub type DbResult<T> = Result<T, DatabaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_maps_to_conflict_status() {
        let err: AppError = DatabaseError::VersionConflict {
            entity: "transaction",
            id: "abc".to_string(),
            expected_version: 3,
        }
        .into();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn append_only_maps_to_internal_error() {
        let err: AppError = DatabaseError::AppendOnly {
            table: "audit_logs",
            message: "update rejected".to_string(),
        }
        .into();
        assert_eq!(err.status_code(), 500);
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_refund_maps_to_not_found() {
        let err: AppError = DatabaseError::NotFound {
            entity: "refund",
            id: "r1".to_string(),
        }
        .into();
        assert_eq!(err.status_code(), 404);
    }
}
