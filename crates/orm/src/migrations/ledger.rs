//! The migrations ledger table
//!
//! One row per applied migration. The table is created on demand; schemaless
//! backends skip the DDL and get their collection on first insert.

use super::definitions::{LedgerEntry, MigrationUnit};
use crate::backends::{QueryRunner, SortOrder};
use crate::error::OrmResult;
use crate::logging::MigrationLogger;
use crate::schema::{ColumnDefinition, LogicalType, TableDefinition};

/// Reads and writes the ledger through a query runner
#[derive(Debug, Clone)]
pub struct LedgerTable {
    table_name: String,
}

impl LedgerTable {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Structure of the ledger table
    pub fn definition(table_name: &str) -> TableDefinition {
        TableDefinition::new(table_name)
            .column(ColumnDefinition::increments("id", LogicalType::MigrationId))
            .column(ColumnDefinition::new("timestamp", LogicalType::MigrationTimestamp).not_null())
            .column(ColumnDefinition::new("name", LogicalType::MigrationName).not_null())
    }

    /// Create the ledger table unless it exists
    pub async fn ensure(&self, runner: &mut dyn QueryRunner, logger: &dyn MigrationLogger) -> OrmResult<()> {
        if runner.capabilities().schemaless {
            return Ok(());
        }

        if runner.has_table(&self.table_name).await? {
            return Ok(());
        }

        logger.log_schema_build(&format!(
            "Migrations table \"{}\" was not found, creating it.",
            self.table_name
        ));
        runner.create_table(&Self::definition(&self.table_name)).await?;
        logger.log_schema_build(&format!("Migrations table \"{}\" was created.", self.table_name));
        Ok(())
    }

    /// Executed migrations, most recently recorded first
    pub async fn load(&self, runner: &mut dyn QueryRunner) -> OrmResult<Vec<LedgerEntry>> {
        runner
            .select(&self.table_name, Some(("id", SortOrder::Desc)))
            .await?
            .iter()
            .map(LedgerEntry::from_row)
            .collect()
    }

    /// Record a unit as applied, storing the generated id on it
    pub async fn insert(&self, runner: &mut dyn QueryRunner, unit: &mut MigrationUnit) -> OrmResult<()> {
        let id = runner
            .insert(
                &self.table_name,
                &[
                    ("timestamp", unit.timestamp.into()),
                    ("name", unit.name.as_str().into()),
                ],
                Some("id"),
            )
            .await?;

        if id.is_some() {
            unit.id = id;
        }
        Ok(())
    }

    /// Remove the record of a reverted unit
    pub async fn delete(&self, runner: &mut dyn QueryRunner, unit: &MigrationUnit) -> OrmResult<()> {
        runner
            .delete(
                &self.table_name,
                &[
                    ("timestamp", unit.timestamp.into()),
                    ("name", unit.name.as_str().into()),
                ],
            )
            .await?;
        Ok(())
    }
}
