//! Database Backend Abstractions
//!
//! This module provides database backend abstractions to support multiple
//! database types through common traits and interfaces. The backend is picked
//! from the URL scheme at connection construction time.

use std::sync::Arc;

pub mod core;
pub mod memory;
pub mod postgres;
pub mod sql;
pub mod sqlite;

pub use self::core::*;
pub use memory::{MemoryDatabase, MemoryDriver};
pub use postgres::PostgresDriver;
pub use sql::SqlDialect;
pub use sqlite::SqliteDriver;

use crate::config::ConnectionOptions;
use crate::error::{OrmError, OrmResult};

/// Database backend type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    PostgreSQL,
    SQLite,
    Memory,
}

impl DatabaseBackendType {
    /// Detect the backend type from a database URL
    pub fn from_url(url: &str) -> OrmResult<Self> {
        if url.starts_with("postgresql://") || url.starts_with("postgres://") {
            Ok(DatabaseBackendType::PostgreSQL)
        } else if url.starts_with("sqlite:") {
            Ok(DatabaseBackendType::SQLite)
        } else if url.starts_with("memory:") {
            Ok(DatabaseBackendType::Memory)
        } else {
            Err(OrmError::Configuration(format!(
                "Unable to detect database backend from URL: {}",
                url
            )))
        }
    }
}

impl std::fmt::Display for DatabaseBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseBackendType::PostgreSQL => write!(f, "postgresql"),
            DatabaseBackendType::SQLite => write!(f, "sqlite"),
            DatabaseBackendType::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for DatabaseBackendType {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseBackendType::PostgreSQL),
            "sqlite" => Ok(DatabaseBackendType::SQLite),
            "memory" => Ok(DatabaseBackendType::Memory),
            _ => Err(OrmError::Configuration(format!(
                "Unsupported database backend: {}",
                s
            ))),
        }
    }
}

/// Build the driver selected by the options' URL. The driver is not connected yet.
pub fn create_driver(options: &ConnectionOptions) -> OrmResult<Arc<dyn DatabaseDriver>> {
    let driver: Arc<dyn DatabaseDriver> = match DatabaseBackendType::from_url(&options.database_url)? {
        DatabaseBackendType::PostgreSQL => Arc::new(PostgresDriver::new(
            &options.database_url,
            options.pool.clone(),
        )?),
        DatabaseBackendType::SQLite => Arc::new(SqliteDriver::new(
            &options.database_url,
            options.pool.clone(),
        )),
        DatabaseBackendType::Memory => Arc::new(MemoryDriver::from_url(&options.database_url)?),
    };
    Ok(driver)
}
