//! Storage Error Types
//!
//! One taxonomy for every ledger operation. Callers branch on the variant
//! (or on [`StoreError::code`]) to tell business rejections from storage
//! failures, and storage failures from the fatal "outcome unknown" case.

use thiserror::Error;

/// SQLSTATE for `unique_violation`
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for `foreign_key_violation`
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
/// SQLSTATE for `lock_not_available`, raised when `lock_timeout` expires
pub const LOCK_NOT_AVAILABLE: &str = "55P03";
/// SQLSTATE for `query_canceled`, raised when `statement_timeout` expires
pub const QUERY_CANCELED: &str = "57014";

#[derive(Error, Debug)]
pub enum StoreError {
    // === Business / Validation ===
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Insufficient funds in account {account_id}: balance {balance}, requested {amount}")]
    InsufficientFunds {
        account_id: i64,
        balance: i64,
        amount: i64,
    },

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Source and destination accounts are the same")]
    SameAccount,

    // === Constraint Violations ===
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Foreign key constraint violated: {0}")]
    ForeignKeyViolation(String),

    // === System ===
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Transaction cancelled: deadline exceeded")]
    Cancelled,

    #[error("After-create hook failed: {0}")]
    Hook(String),

    /// The unit of work failed and the rollback failed too. The transaction
    /// outcome is unknown.
    #[error("transaction err: {source}, rollback err: {rollback}")]
    RollbackFailed {
        source: Box<StoreError>,
        rollback: Box<StoreError>,
    },
}

impl StoreError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            StoreError::InvalidAmount => "INVALID_AMOUNT",
            StoreError::SameAccount => "SAME_ACCOUNT",
            StoreError::UniqueViolation(_) => "UNIQUE_VIOLATION",
            StoreError::ForeignKeyViolation(_) => "FOREIGN_KEY_VIOLATION",
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::Cancelled => "CANCELLED",
            StoreError::Hook(_) => "HOOK_FAILED",
            StoreError::RollbackFailed { .. } => "ROLLBACK_FAILED",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => 404,
            StoreError::InvalidAmount | StoreError::SameAccount => 400,
            StoreError::UniqueViolation(_) | StoreError::ForeignKeyViolation(_) => 403,
            StoreError::InsufficientFunds { .. } => 422,
            StoreError::Cancelled => 504,
            StoreError::Database(_) | StoreError::Hook(_) | StoreError::RollbackFailed { .. } => {
                500
            }
        }
    }

    /// Whether re-running the whole operation may succeed. Transfers are not
    /// idempotent: a retry after an ambiguous failure can create a duplicate.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Cancelled)
    }

    /// The transaction may have been left in an unknown state; alert.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::RollbackFailed { .. })
    }

    /// The wrapped SQLSTATE, if this came from a PostgreSQL error
    pub fn sql_state(&self) -> Option<&'static str> {
        match self {
            StoreError::UniqueViolation(_) => Some(UNIQUE_VIOLATION),
            StoreError::ForeignKeyViolation(_) => Some(FOREIGN_KEY_VIOLATION),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("no rows in result set".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::UniqueViolation(db_err.message().to_string())
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                StoreError::ForeignKeyViolation(db_err.message().to_string())
            }
            sqlx::Error::Database(db_err)
                if matches!(
                    db_err.code().as_deref(),
                    Some(LOCK_NOT_AVAILABLE | QUERY_CANCELED)
                ) =>
            {
                StoreError::Cancelled
            }
            other => StoreError::Database(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::fmt;

    #[derive(Debug)]
    struct SqlStateError(&'static str);

    impl fmt::Display for SqlStateError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "error with SQLSTATE {}", self.0)
        }
    }

    impl std::error::Error for SqlStateError {}

    impl sqlx::error::DatabaseError for SqlStateError {
        fn message(&self) -> &str {
            "canceling statement"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn db_error(code: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(SqlStateError(code)))
    }

    #[test]
    fn test_server_side_timeouts_map_to_cancelled() {
        for code in [LOCK_NOT_AVAILABLE, QUERY_CANCELED] {
            let err = StoreError::from(db_error(code));
            assert!(matches!(err, StoreError::Cancelled), "{code}: got {err:?}");
            assert!(err.is_retryable());
        }
        // Anything else stays a plain storage failure
        let err = StoreError::from(db_error("40P01"));
        assert!(matches!(err, StoreError::Database(_)), "got {err:?}");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(StoreError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(
            StoreError::InsufficientFunds {
                account_id: 1,
                balance: 10,
                amount: 20
            }
            .code(),
            "INSUFFICIENT_FUNDS"
        );
        assert_eq!(StoreError::Cancelled.code(), "CANCELLED");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(StoreError::NotFound("x".into()).http_status(), 404);
        assert_eq!(StoreError::SameAccount.http_status(), 400);
        assert_eq!(
            StoreError::ForeignKeyViolation("fk".into()).http_status(),
            403
        );
        assert_eq!(StoreError::Hook("mail".into()).http_status(), 500);
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rollback_failure_is_fatal_and_keeps_both_causes() {
        let err = StoreError::RollbackFailed {
            source: Box::new(StoreError::InsufficientFunds {
                account_id: 7,
                balance: 10,
                amount: 20,
            }),
            rollback: Box::new(StoreError::Database(sqlx::Error::PoolClosed)),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("Insufficient funds in account 7"));
        assert!(msg.contains("rollback err"));
    }

    #[test]
    fn test_business_errors_are_not_fatal() {
        assert!(!StoreError::InvalidAmount.is_fatal());
        assert!(StoreError::Cancelled.is_retryable());
        assert_eq!(
            StoreError::UniqueViolation("dup".into()).sql_state(),
            Some(UNIQUE_VIOLATION)
        );
    }
}
