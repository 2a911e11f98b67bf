//! Error types for the transaction coordinator
//!
//! Driver failures are reported through [`DriverError`]; everything the
//! coordinator itself decides is reported through [`TransactionError`].

use std::fmt;

use crate::value::StatementKey;

/// Result type alias for coordinator operations
pub type TxResult<T> = Result<T, TransactionError>;

/// Result type alias for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors raised by a connection factory or a connection
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Connection is closed")]
    Closed,
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Io(err.to_string())
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io) => DriverError::Io(io.to_string()),
            sqlx::Error::PoolClosed => DriverError::Closed,
            other => DriverError::Driver(other.to_string()),
        }
    }
}

/// Which cleanup step failed for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    Commit,
    Rollback,
    RestoreAutoCommit,
    Close,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            CleanupStep::Commit => "commit",
            CleanupStep::Rollback => "rollback",
            CleanupStep::RestoreAutoCommit => "restore auto-commit",
            CleanupStep::Close => "close",
        };
        write!(f, "{}", step)
    }
}

/// A single failure recorded while ending or rolling back a resource
#[derive(Debug, Clone)]
pub struct CleanupFailure {
    pub factory: String,
    pub step: CleanupStep,
    pub error: DriverError,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed on '{}': {}", self.step, self.factory, self.error)
    }
}

/// Errors raised by the transaction coordinator
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Illegal transaction state: {0}")]
    IllegalState(String),

    #[error("Failed to acquire connection from '{factory}': {source}")]
    Acquire {
        factory: String,
        #[source]
        source: DriverError,
    },

    #[error("Statement '{statement}' failed on '{factory}': {source}")]
    Execution {
        factory: String,
        statement: StatementKey,
        #[source]
        source: DriverError,
    },

    #[error("Savepoint error: {0}")]
    Savepoint(String),

    #[error("Invalid savepoint: {0}")]
    InvalidSavepoint(String),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Cleanup failed for {} step(s): {}", .0.len(), join_failures(.0))]
    Cleanup(Vec<CleanupFailure>),

    #[error("Transaction was marked rollback-only and has been rolled back")]
    UnexpectedRollback,
}

fn join_failures(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl TransactionError {
    /// The statement identity carried by an execution failure
    pub fn statement(&self) -> Option<&StatementKey> {
        match self {
            TransactionError::Execution { statement, .. } => Some(statement),
            _ => None,
        }
    }

    /// The factory name carried by acquire and execution failures
    pub fn factory(&self) -> Option<&str> {
        match self {
            TransactionError::Acquire { factory, .. }
            | TransactionError::Execution { factory, .. } => Some(factory),
            _ => None,
        }
    }
}

/// Error types for coordinator configuration
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {field}, expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

impl From<ConfigError> for TransactionError {
    fn from(err: ConfigError) -> Self {
        TransactionError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_error_lists_every_failure() {
        let err = TransactionError::Cleanup(vec![
            CleanupFailure {
                factory: "orders".to_string(),
                step: CleanupStep::Commit,
                error: DriverError::Driver("disk full".to_string()),
            },
            CleanupFailure {
                factory: "audit".to_string(),
                step: CleanupStep::Close,
                error: DriverError::Closed,
            },
        ]);

        let msg = err.to_string();
        assert!(msg.contains("2 step(s)"));
        assert!(msg.contains("commit failed on 'orders'"));
        assert!(msg.contains("close failed on 'audit'"));
    }

    #[test]
    fn test_execution_error_exposes_statement() {
        let err = TransactionError::Execution {
            factory: "orders".to_string(),
            statement: StatementKey::new("INSERT INTO t VALUES ($1)|int32"),
            source: DriverError::Driver("constraint".to_string()),
        };

        assert_eq!(err.statement().map(|s| s.as_str()), Some("INSERT INTO t VALUES ($1)|int32"));
        assert_eq!(err.factory(), Some("orders"));
    }

    #[test]
    fn test_config_error_converts_to_configuration() {
        let err: TransactionError = ConfigError::InvalidValue {
            field: "propagation".to_string(),
            value: "SOMETIMES".to_string(),
            expected: "a propagation name".to_string(),
        }
        .into();

        assert!(matches!(err, TransactionError::Configuration(_)));
    }
}
