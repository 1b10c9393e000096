//! Connection Management
//!
//! [`Connection`] ties together the configured options, the backend driver
//! selected from the database URL, the configured migrations and the logger
//! handle. It is the application-facing entry point for running, reverting
//! and listing migrations.

use std::sync::Arc;

use tracing::info;

use crate::backends::{create_driver, DatabaseDriver, QueryRunner};
use crate::config::{ConnectionOptions, TransactionMode};
use crate::error::{OrmError, OrmResult};
use crate::logging::{default_logger, MigrationLogger};
use crate::migrations::{load_units, Migration, MigrationExecutor, MigrationUnit};

/// Options for [`Connection::run_migrations`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMigrationsOptions {
    /// Overrides the connection's configured transaction mode
    pub transaction: Option<TransactionMode>,
    /// Record migrations in the ledger without running them
    pub fake: bool,
}

impl RunMigrationsOptions {
    pub fn transaction(mode: TransactionMode) -> Self {
        Self {
            transaction: Some(mode),
            ..Self::default()
        }
    }

    pub fn fake(mut self, fake: bool) -> Self {
        self.fake = fake;
        self
    }
}

/// Options for [`Connection::undo_last_migration`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UndoMigrationOptions {
    /// Overrides the connection's configured transaction mode
    pub transaction: Option<TransactionMode>,
    /// Remove the ledger row without running the migration's `down`
    pub fake: bool,
}

impl UndoMigrationOptions {
    pub fn transaction(mode: TransactionMode) -> Self {
        Self {
            transaction: Some(mode),
            ..Self::default()
        }
    }

    pub fn fake(mut self, fake: bool) -> Self {
        self.fake = fake;
        self
    }
}

/// A configured database connection
pub struct Connection {
    options: ConnectionOptions,
    driver: Arc<dyn DatabaseDriver>,
    migrations: Vec<Arc<dyn Migration>>,
    logger: Arc<dyn MigrationLogger>,
}

impl Connection {
    /// Create a connection whose driver is picked from the database URL
    pub fn new(options: ConnectionOptions) -> OrmResult<Self> {
        options.validate()?;
        let driver = create_driver(&options)?;
        Ok(Self::build(options, driver))
    }

    /// Create a connection over an existing driver
    pub fn with_driver(options: ConnectionOptions, driver: Arc<dyn DatabaseDriver>) -> OrmResult<Self> {
        options.validate()?;
        Ok(Self::build(options, driver))
    }

    /// Create a connection from `KEEL_*` environment variables
    pub fn from_env() -> OrmResult<Self> {
        Self::new(ConnectionOptions::from_env()?)
    }

    fn build(options: ConnectionOptions, driver: Arc<dyn DatabaseDriver>) -> Self {
        Self {
            options,
            driver,
            migrations: Vec::new(),
            logger: default_logger(),
        }
    }

    pub fn with_migrations(mut self, migrations: Vec<Arc<dyn Migration>>) -> Self {
        self.migrations = migrations;
        self
    }

    /// Add a single migration
    pub fn migration(mut self, migration: impl Migration + 'static) -> Self {
        self.migrations.push(Arc::new(migration));
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn MigrationLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn driver(&self) -> Arc<dyn DatabaseDriver> {
        Arc::clone(&self.driver)
    }

    pub fn migrations(&self) -> &[Arc<dyn Migration>] {
        &self.migrations
    }

    /// Open the connection
    ///
    /// Configured migrations are validated first. With `migrations_run`
    /// enabled, pending migrations are applied; if that fails the connection
    /// is closed again and the error returned.
    pub async fn connect(&self) -> OrmResult<()> {
        load_units(&self.migrations)?;

        self.driver.connect().await?;
        info!("Connected to {} database", self.driver.backend_type());

        if self.options.migrations_run {
            if let Err(error) = self.run_migrations(RunMigrationsOptions::default()).await {
                if let Err(close_error) = self.driver.disconnect().await {
                    tracing::warn!("Failed to close connection: {}", close_error);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> OrmResult<()> {
        self.driver.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.driver.is_connected()
    }

    /// Create a query runner on the master connection
    pub async fn create_query_runner(&self) -> OrmResult<Box<dyn QueryRunner>> {
        self.ensure_connected()?;
        self.driver.create_query_runner().await
    }

    /// Apply every pending migration; returns the applied units in order
    pub async fn run_migrations(&self, options: RunMigrationsOptions) -> OrmResult<Vec<MigrationUnit>> {
        self.ensure_connected()?;
        self.executor(options.transaction, options.fake)
            .execute_pending_migrations()
            .await
    }

    /// Apply pending migrations on a caller-owned runner, which stays open
    pub async fn run_migrations_with(
        &self,
        runner: &mut dyn QueryRunner,
        options: RunMigrationsOptions,
    ) -> OrmResult<Vec<MigrationUnit>> {
        self.ensure_connected()?;
        self.executor(options.transaction, options.fake)
            .with_query_runner(runner)
            .execute_pending_migrations()
            .await
    }

    /// Revert the last executed migration; `None` when nothing was executed
    pub async fn undo_last_migration(&self, options: UndoMigrationOptions) -> OrmResult<Option<MigrationUnit>> {
        self.ensure_connected()?;
        self.executor(options.transaction, options.fake)
            .undo_last_migration()
            .await
    }

    /// Revert the last executed migration on a caller-owned runner
    pub async fn undo_last_migration_with(
        &self,
        runner: &mut dyn QueryRunner,
        options: UndoMigrationOptions,
    ) -> OrmResult<Option<MigrationUnit>> {
        self.ensure_connected()?;
        self.executor(options.transaction, options.fake)
            .with_query_runner(runner)
            .undo_last_migration()
            .await
    }

    /// Log the migration checklist; true if any migration is unapplied
    pub async fn show_migrations(&self) -> OrmResult<bool> {
        self.ensure_connected()?;
        self.executor(None, false).show_migrations().await
    }

    pub async fn has_pending_migrations(&self) -> OrmResult<bool> {
        self.ensure_connected()?;
        self.executor(None, false).has_pending_migrations().await
    }

    fn ensure_connected(&self) -> OrmResult<()> {
        if self.driver.is_connected() {
            Ok(())
        } else {
            Err(OrmError::NotConnected)
        }
    }

    fn executor<'r>(&self, transaction: Option<TransactionMode>, fake: bool) -> MigrationExecutor<'r> {
        MigrationExecutor::new(Arc::clone(&self.driver), self.migrations.clone(), &self.options)
            .transaction(transaction.unwrap_or(self.options.migrations_transaction_mode))
            .fake(fake)
            .logger(Arc::clone(&self.logger))
    }
}
