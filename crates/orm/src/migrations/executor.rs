//! Migration Executor - applies pending migrations and reverts the latest one
//!
//! The executor works on a single query runner. It either borrows one from
//! the caller, in which case the runner is handed back untouched and never
//! released, or creates its own from the driver and releases it when the
//! operation ends. Only transactions the executor opened itself are ever
//! committed or rolled back by it.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use super::definitions::{LedgerEntry, Migration, MigrationUnit};
use super::ledger::LedgerTable;
use super::loader::load_units;
use crate::backends::{DatabaseDriver, QueryRunner};
use crate::config::{ConnectionOptions, TransactionMode};
use crate::error::{OrmError, OrmResult};
use crate::logging::{default_logger, MigrationLogger};

/// The runner an operation works on
enum RunnerHandle<'r> {
    Owned(Box<dyn QueryRunner>),
    Supplied(&'r mut dyn QueryRunner),
}

impl RunnerHandle<'_> {
    fn runner(&mut self) -> &mut dyn QueryRunner {
        match self {
            RunnerHandle::Owned(runner) => runner.as_mut(),
            RunnerHandle::Supplied(runner) => &mut **runner,
        }
    }
}

/// Executes migrations against one database
pub struct MigrationExecutor<'r> {
    driver: Arc<dyn DatabaseDriver>,
    runner: Option<&'r mut dyn QueryRunner>,
    migrations: Vec<Arc<dyn Migration>>,
    ledger: LedgerTable,
    transaction: TransactionMode,
    enforce_timestamp_order: bool,
    fake: bool,
    logger: Arc<dyn MigrationLogger>,
}

impl<'r> MigrationExecutor<'r> {
    /// Create an executor using the ledger table, transaction mode and order
    /// check configured in `options`
    pub fn new(
        driver: Arc<dyn DatabaseDriver>,
        migrations: Vec<Arc<dyn Migration>>,
        options: &ConnectionOptions,
    ) -> Self {
        Self {
            driver,
            runner: None,
            migrations,
            ledger: LedgerTable::new(options.migrations_table_name.clone()),
            transaction: options.migrations_transaction_mode,
            enforce_timestamp_order: options.enforce_timestamp_order,
            fake: false,
            logger: default_logger(),
        }
    }

    /// Work on a caller-owned runner; it is never released by the executor
    pub fn with_query_runner(mut self, runner: &'r mut dyn QueryRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn transaction(mut self, mode: TransactionMode) -> Self {
        self.transaction = mode;
        self
    }

    /// Record and remove ledger rows without running `up`/`down`
    pub fn fake(mut self, fake: bool) -> Self {
        self.fake = fake;
        self
    }

    pub fn enforce_timestamp_order(mut self, enforce: bool) -> Self {
        self.enforce_timestamp_order = enforce;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn MigrationLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn transaction_mode(&self) -> TransactionMode {
        self.transaction
    }

    pub fn ledger(&self) -> &LedgerTable {
        &self.ledger
    }

    /// Every configured migration, ascending by timestamp
    pub fn get_all_migrations(&self) -> OrmResult<Vec<MigrationUnit>> {
        load_units(&self.migrations)
    }

    /// Ledger entries, most recently executed first
    pub async fn get_executed_migrations(&mut self) -> OrmResult<Vec<LedgerEntry>> {
        let (_, executed) = self.read_state().await?;
        Ok(executed)
    }

    /// Configured migrations missing from the ledger, ascending by timestamp
    pub async fn get_pending_migrations(&mut self) -> OrmResult<Vec<MigrationUnit>> {
        let (units, executed) = self.read_state().await?;
        Ok(pending_units(units, &executed))
    }

    pub async fn has_pending_migrations(&mut self) -> OrmResult<bool> {
        Ok(!self.get_pending_migrations().await?.is_empty())
    }

    /// The most recently executed ledger entry
    pub async fn last_executed_migration(&mut self) -> OrmResult<Option<LedgerEntry>> {
        let (_, executed) = self.read_state().await?;
        Ok(executed.into_iter().next())
    }

    /// Log a `[X]`/`[ ]` checklist of every configured migration
    ///
    /// Returns whether any migration is still unapplied.
    pub async fn show_migrations(&mut self) -> OrmResult<bool> {
        let (units, executed) = self.read_state().await?;

        let mut has_unapplied = false;
        for unit in &units {
            match executed.iter().find(|entry| entry.name == unit.name) {
                Some(entry) => {
                    let id = entry.id.map(|id| id.to_string()).unwrap_or_default();
                    self.logger
                        .log_schema_build(&format!(" [X] {} {}", id, unit.name));
                }
                None => {
                    has_unapplied = true;
                    self.logger.log_schema_build(&format!(" [ ] {}", unit.name));
                }
            }
        }

        Ok(has_unapplied)
    }

    /// Apply every pending migration in timestamp order
    ///
    /// Returns the applied units in execution order; empty when nothing was
    /// pending.
    pub async fn execute_pending_migrations(&mut self) -> OrmResult<Vec<MigrationUnit>> {
        // Configuration is checked before a runner is acquired
        let units = load_units(&self.migrations)?;

        let mut handle = self.acquire().await?;
        let result = self.run_pending(handle.runner(), units).await;
        self.finish(handle, result).await
    }

    /// Revert the most recently executed migration
    ///
    /// Returns the reverted unit, or `None` when the ledger is empty.
    pub async fn undo_last_migration(&mut self) -> OrmResult<Option<MigrationUnit>> {
        let units = load_units(&self.migrations)?;

        let mut handle = self.acquire().await?;
        let result = self.run_undo(handle.runner(), units).await;
        self.finish(handle, result).await
    }

    async fn acquire(&mut self) -> OrmResult<RunnerHandle<'r>> {
        match self.runner.take() {
            Some(runner) => Ok(RunnerHandle::Supplied(runner)),
            None => {
                let runner = self.driver.create_query_runner().await?;
                Ok(RunnerHandle::Owned(runner))
            }
        }
    }

    /// Hand a supplied runner back or release an owned one. A release
    /// failure is only logged; the operation's own outcome is returned.
    async fn finish<T>(&mut self, handle: RunnerHandle<'r>, result: OrmResult<T>) -> OrmResult<T> {
        let released = match handle {
            RunnerHandle::Supplied(runner) => {
                self.runner = Some(runner);
                Ok(())
            }
            RunnerHandle::Owned(mut runner) => runner.release().await,
        };

        if let Err(release_error) = released {
            warn!("Failed to release query runner: {}", release_error);
        }
        result
    }

    async fn read_state(&mut self) -> OrmResult<(Vec<MigrationUnit>, Vec<LedgerEntry>)> {
        let units = load_units(&self.migrations)?;

        let mut handle = self.acquire().await?;
        let result = self.load_executed(handle.runner()).await;
        let executed = self.finish(handle, result).await?;
        Ok((units, executed))
    }

    async fn load_executed(&self, runner: &mut dyn QueryRunner) -> OrmResult<Vec<LedgerEntry>> {
        self.ledger.ensure(runner, self.logger.as_ref()).await?;
        self.ledger.load(runner).await
    }

    async fn run_pending(
        &self,
        runner: &mut dyn QueryRunner,
        units: Vec<MigrationUnit>,
    ) -> OrmResult<Vec<MigrationUnit>> {
        let executed = self.load_executed(runner).await?;

        self.logger.log_schema_build(&format!(
            "{} migrations are already loaded in the database.",
            executed.len()
        ));
        self.logger.log_schema_build(&format!(
            "{} migrations were found in the source code.",
            units.len()
        ));
        if let Some(last) = executed.first() {
            self.log_last_executed(last);
        }

        let pending = pending_units(units, &executed);
        self.logger.log_schema_build(&format!(
            "{} migrations are new migrations must be executed.",
            pending.len()
        ));

        if pending.is_empty() {
            self.logger.log_schema_build("No migrations are pending");
            return Ok(Vec::new());
        }

        self.check_timestamp_order(&pending, executed.first())?;
        for unit in &pending {
            self.check_transaction_override(unit)?;
        }

        let mut started_by_us = false;
        match self.apply_pending(runner, pending, &mut started_by_us).await {
            Ok(applied) => Ok(applied),
            Err(error) => {
                if started_by_us {
                    rollback_quietly(runner).await;
                }
                Err(error)
            }
        }
    }

    async fn apply_pending(
        &self,
        runner: &mut dyn QueryRunner,
        pending: Vec<MigrationUnit>,
        started_by_us: &mut bool,
    ) -> OrmResult<Vec<MigrationUnit>> {
        if self.transaction == TransactionMode::All && !runner.is_transaction_active() {
            runner.start_transaction().await?;
            *started_by_us = true;
        }

        let mut applied = Vec::with_capacity(pending.len());
        for mut unit in pending {
            let opened_here = self.wants_own_transaction(&unit) && !runner.is_transaction_active();
            if opened_here {
                runner.start_transaction().await?;
                *started_by_us = true;
            }

            if !self.fake {
                if let Err(error) = unit.instance.up(runner).await {
                    self.logger.log_migration_error(&format!(
                        "Migration \"{}\" failed, error: {}",
                        unit.name, error
                    ));
                    return Err(error);
                }
            }

            self.ledger.insert(runner, &mut unit).await?;

            if opened_here {
                runner.commit_transaction().await?;
                *started_by_us = false;
            }

            self.logger.log_migration(&format!(
                "Migration {} has been {}executed successfully.",
                unit.name,
                self.fake_marker()
            ));
            applied.push(unit);
        }

        if self.transaction == TransactionMode::All && *started_by_us {
            runner.commit_transaction().await?;
            *started_by_us = false;
        }

        Ok(applied)
    }

    async fn run_undo(
        &self,
        runner: &mut dyn QueryRunner,
        units: Vec<MigrationUnit>,
    ) -> OrmResult<Option<MigrationUnit>> {
        let executed = self.load_executed(runner).await?;

        let Some(last) = executed.first() else {
            self.logger
                .log_schema_build("No migrations were found in the database. Nothing to revert!");
            return Ok(None);
        };

        let mut unit = units
            .into_iter()
            .find(|unit| unit.name == last.name)
            .ok_or_else(|| {
                OrmError::Configuration(format!(
                    "No migration {} was found in the source code. Make sure the migration is \
                     still configured on the connection.",
                    last.name
                ))
            })?;
        unit.id = last.id;
        self.check_transaction_override(&unit)?;

        self.logger.log_schema_build(&format!(
            "{} migrations are already loaded in the database.",
            executed.len()
        ));
        self.log_last_executed(last);
        self.logger.log_schema_build("Now reverting it...");

        let started_by_us = self.wants_own_transaction(&unit) && !runner.is_transaction_active();
        if started_by_us {
            runner.start_transaction().await?;
        }

        match self.revert(runner, &unit, started_by_us).await {
            Ok(()) => {
                self.logger.log_migration(&format!(
                    "Migration {} has been {}reverted successfully.",
                    unit.name,
                    self.fake_marker()
                ));
                Ok(Some(unit))
            }
            Err(error) => {
                if started_by_us {
                    rollback_quietly(runner).await;
                }
                Err(error)
            }
        }
    }

    async fn revert(&self, runner: &mut dyn QueryRunner, unit: &MigrationUnit, commit: bool) -> OrmResult<()> {
        if !self.fake {
            if let Err(error) = unit.instance.down(runner).await {
                self.logger.log_migration_error(&format!(
                    "Migration \"{}\" failed, error: {}",
                    unit.name, error
                ));
                return Err(error);
            }
        }

        self.ledger.delete(runner, unit).await?;

        if commit {
            runner.commit_transaction().await?;
        }
        Ok(())
    }

    /// Whether a unit runs inside a transaction of its own
    fn wants_own_transaction(&self, unit: &MigrationUnit) -> bool {
        match self.transaction {
            // undo wraps the single reverted unit; run_pending opens one up front
            TransactionMode::All => true,
            TransactionMode::Each => unit.transaction_override() != Some(false),
            TransactionMode::None => unit.transaction_override() == Some(true),
        }
    }

    fn check_transaction_override(&self, unit: &MigrationUnit) -> OrmResult<()> {
        match (self.transaction, unit.transaction_override()) {
            (TransactionMode::All, Some(requested)) => Err(OrmError::Configuration(format!(
                "Migration \"{}\" sets transaction = {}, which cannot be honored in transaction mode \"all\"; \
                 use \"each\" or \"none\" instead",
                unit.name, requested
            ))),
            _ => Ok(()),
        }
    }

    fn check_timestamp_order(&self, pending: &[MigrationUnit], last: Option<&LedgerEntry>) -> OrmResult<()> {
        let Some(last) = last.filter(|_| self.enforce_timestamp_order) else {
            return Ok(());
        };

        match pending.iter().find(|unit| unit.timestamp < last.timestamp) {
            Some(unit) => Err(OrmError::Configuration(format!(
                "New migration found: {}, however its timestamp is older than the last executed \
                 migration {}. Migration timestamps must not be older than migrations already \
                 executed in the database.",
                unit.name, last.name
            ))),
            None => Ok(()),
        }
    }

    fn log_last_executed(&self, last: &LedgerEntry) {
        let executed_on = last
            .executed_at()
            .map(|at| at.to_rfc2822())
            .unwrap_or_else(|| last.timestamp.to_string());
        self.logger.log_schema_build(&format!(
            "{} is the last executed migration. It was executed on {}.",
            last.name, executed_on
        ));
    }

    fn fake_marker(&self) -> &'static str {
        if self.fake {
            "(fake) "
        } else {
            ""
        }
    }
}

/// Units whose name has no ledger entry, keeping their order
fn pending_units(units: Vec<MigrationUnit>, executed: &[LedgerEntry]) -> Vec<MigrationUnit> {
    let executed_names: HashSet<&str> = executed.iter().map(|entry| entry.name.as_str()).collect();
    units
        .into_iter()
        .filter(|unit| !executed_names.contains(unit.name.as_str()))
        .collect()
}

/// Roll back a transaction opened by the executor; the original error wins
async fn rollback_quietly(runner: &mut dyn QueryRunner) {
    if let Err(error) = runner.rollback_transaction().await {
        warn!("Rollback after failed migration also failed: {}", error);
    }
}
