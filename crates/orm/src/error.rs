//! Error types for the database layer
//!
//! A single closed set of error kinds covers configuration problems,
//! misuse of query runners and transactions, and failures reported by the
//! backends themselves. Errors raised by migration code are propagated as-is.

use thiserror::Error;

/// Result type alias for database layer operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for database layer operations
#[derive(Debug, Clone, Error)]
pub enum OrmError {
    /// Invalid configuration: duplicate migration names, malformed timestamp
    /// suffixes, ledger entries without a matching migration, bad options
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation invoked before the connection was established
    #[error("Connection is not established; call connect() first")]
    NotConnected,

    /// Operation invoked on a query runner that was already released
    #[error("Query runner has already been released and cannot be used")]
    QueryRunnerReleased,

    /// Commit or rollback invoked while no transaction is active
    #[error("Transaction is not started")]
    TransactionNotStarted,

    /// The backend failed to begin, commit or roll back a transaction
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Database connection or pool error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Statement execution error
    #[error("Query error: {0}")]
    Query(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Database(String),

    /// Error reported by a migration's own logic
    #[error("Migration error: {0}")]
    Migration(String),

    /// Row value encoding/decoding error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrmError {
    /// Whether this error was raised while validating configuration, i.e.
    /// before anything touched the database
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, OrmError::Configuration(_))
    }

    /// Whether this error signals API misuse rather than a database failure
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            OrmError::NotConnected | OrmError::QueryRunnerReleased | OrmError::TransactionNotStarted
        )
    }
}

impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                OrmError::Connection(err.to_string())
            }
            _ => OrmError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OrmError {
    fn from(err: serde_yaml::Error) -> Self {
        OrmError::Configuration(format!("Invalid YAML configuration: {}", err))
    }
}

// Migrations written against anyhow can use `?` directly
impl From<anyhow::Error> for OrmError {
    fn from(err: anyhow::Error) -> Self {
        OrmError::Migration(err.to_string())
    }
}
