//! Connection configuration
//!
//! Options can be built programmatically, loaded from environment variables,
//! or parsed from a YAML document.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{OrmError, OrmResult};

static TABLE_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*\.)?[A-Za-z_][A-Za-z0-9_]*$")
        .expect("table name pattern is valid")
});

/// How many transactions wrap a batch of migrations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    /// One transaction wraps every pending migration
    #[default]
    All,
    /// Each migration runs in its own transaction
    Each,
    /// Migrations manage their own transactions
    None,
}

impl FromStr for TransactionMode {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(TransactionMode::All),
            "each" => Ok(TransactionMode::Each),
            "none" => Ok(TransactionMode::None),
            _ => Err(invalid_value("migrations_transaction_mode", s, "all, each, or none")),
        }
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            TransactionMode::All => "all",
            TransactionMode::Each => "each",
            TransactionMode::None => "none",
        };
        write!(f, "{}", mode)
    }
}

/// Connection pool sizing for pooled backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 30,
        }
    }
}

/// Options for a [`Connection`](crate::connection::Connection)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Backend URL; the scheme selects the driver
    pub database_url: String,
    /// Name of the table recording applied migrations
    pub migrations_table_name: String,
    /// Default transaction mode for migration runs
    pub migrations_transaction_mode: TransactionMode,
    /// Reject pending migrations older than the last executed one
    pub enforce_timestamp_order: bool,
    /// Run pending migrations as part of `connect()`
    pub migrations_run: bool,
    pub pool: PoolOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            database_url: "memory://".to_string(),
            migrations_table_name: "migrations".to_string(),
            migrations_transaction_mode: TransactionMode::All,
            enforce_timestamp_order: false,
            migrations_run: false,
            pool: PoolOptions::default(),
        }
    }
}

impl ConnectionOptions {
    /// Create options for the given database URL with defaults elsewhere
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    pub fn migrations_table_name(mut self, name: impl Into<String>) -> Self {
        self.migrations_table_name = name.into();
        self
    }

    pub fn migrations_transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.migrations_transaction_mode = mode;
        self
    }

    pub fn enforce_timestamp_order(mut self, enforce: bool) -> Self {
        self.enforce_timestamp_order = enforce;
        self
    }

    pub fn migrations_run(mut self, run: bool) -> Self {
        self.migrations_run = run;
        self
    }

    /// Load configuration from `KEEL_*` environment variables
    pub fn from_env() -> OrmResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> OrmResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(url) = lookup("KEEL_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            options.database_url = url;
        }
        if let Some(table) = lookup("KEEL_MIGRATIONS_TABLE") {
            options.migrations_table_name = table;
        }
        if let Some(mode) = lookup("KEEL_MIGRATIONS_TRANSACTION_MODE") {
            options.migrations_transaction_mode = mode.parse()?;
        }
        if let Some(flag) = lookup("KEEL_MIGRATIONS_ENFORCE_ORDER") {
            options.enforce_timestamp_order = parse_bool("enforce_timestamp_order", &flag)?;
        }
        if let Some(flag) = lookup("KEEL_MIGRATIONS_RUN") {
            options.migrations_run = parse_bool("migrations_run", &flag)?;
        }
        if let Some(max) = lookup("KEEL_POOL_MAX_CONNECTIONS") {
            options.pool.max_connections = max
                .trim()
                .parse()
                .map_err(|_| invalid_value("pool.max_connections", &max, "a positive integer"))?;
        }

        options.validate()?;
        Ok(options)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml(source: &str) -> OrmResult<Self> {
        let options: Self = serde_yaml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    /// Validate the configuration
    pub fn validate(&self) -> OrmResult<()> {
        if self.database_url.trim().is_empty() {
            return Err(OrmError::Configuration(
                "database_url must not be empty".to_string(),
            ));
        }

        if !TABLE_NAME_PATTERN.is_match(&self.migrations_table_name) {
            return Err(invalid_value(
                "migrations_table_name",
                &self.migrations_table_name,
                "a plain identifier, optionally prefixed with a schema name",
            ));
        }

        if self.pool.max_connections == 0 {
            return Err(invalid_value("pool.max_connections", "0", "a positive integer"));
        }

        if self.pool.min_connections > self.pool.max_connections {
            return Err(OrmError::Configuration(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }

        Ok(())
    }
}

fn invalid_value(field: &str, value: &str, expected: &str) -> OrmError {
    OrmError::Configuration(format!(
        "Invalid value for field '{}': '{}'. Expected: {}",
        field, value, expected
    ))
}

fn parse_bool(field: &str, value: &str) -> OrmResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid_value(field, value, "true or false")),
    }
}
