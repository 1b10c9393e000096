//! Migration Definitions - Core types of the migration system
//!
//! Defines the [`Migration`] trait implemented by schema changes, the
//! [`MigrationUnit`] the executor schedules, and the [`LedgerEntry`] rows that
//! record which units were applied.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backends::{DatabaseRow, QueryRunner};
use crate::error::OrmResult;

/// A versioned schema change
///
/// The name must end with a 13-digit millisecond timestamp, for example
/// `CreateUsers1700000000000`; that suffix orders migrations.
#[async_trait]
pub trait Migration: Send + Sync {
    fn name(&self) -> &str;

    /// Per-migration transaction override
    ///
    /// `None` follows the run's transaction mode. `Some(false)` opts out of
    /// the per-migration transaction in `each` mode; `Some(true)` asks for
    /// one in `none` mode.
    fn transaction(&self) -> Option<bool> {
        None
    }

    /// Apply the change
    async fn up(&self, runner: &mut dyn QueryRunner) -> OrmResult<()>;

    /// Revert the change
    async fn down(&self, runner: &mut dyn QueryRunner) -> OrmResult<()>;
}

/// A configured migration together with its ordering key
#[derive(Clone)]
pub struct MigrationUnit {
    /// Ledger row id, known once the unit was recorded
    pub id: Option<i64>,
    /// Millisecond timestamp parsed from the name
    pub timestamp: i64,
    pub name: String,
    pub instance: Arc<dyn Migration>,
}

impl MigrationUnit {
    pub fn new(timestamp: i64, name: impl Into<String>, instance: Arc<dyn Migration>) -> Self {
        Self {
            id: None,
            timestamp,
            name: name.into(),
            instance,
        }
    }

    pub fn transaction_override(&self) -> Option<bool> {
        self.instance.transaction()
    }
}

impl fmt::Debug for MigrationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationUnit")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("name", &self.name)
            .field("transaction", &self.instance.transaction())
            .finish()
    }
}

/// A row of the migrations ledger table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Option<i64>,
    pub timestamp: i64,
    pub name: String,
}

impl LedgerEntry {
    pub fn from_row(row: &DatabaseRow) -> OrmResult<Self> {
        let id = match row.get_by_name("id") {
            Ok(value) if !value.is_null() => Some(row.get("id")?),
            _ => None,
        };

        Ok(Self {
            id,
            timestamp: row.get("timestamp")?,
            name: row.get("name")?,
        })
    }

    /// When the migration was created, according to its timestamp
    pub fn executed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}
