//! Scenario tests for the migration engine
//!
//! Connections run against the memory backend so transaction boundaries,
//! ledger rows and query runner lifecycles can be observed directly.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backends::{DatabaseDriver, MemoryDatabase, MemoryDriver, QueryRunner};
use crate::config::{ConnectionOptions, TransactionMode};
use crate::connection::{Connection, RunMigrationsOptions, UndoMigrationOptions};
use crate::error::{OrmError, OrmResult};
use crate::logging::testing::CapturingLogger;
use crate::migrations::{LedgerEntry, Migration, MigrationExecutor};
use crate::schema::{ColumnDefinition, LogicalType, TableDefinition};


/// Migration creating one table, optionally failing after doing so
struct CreateTable {
    name: &'static str,
    table: &'static str,
    fail_up: bool,
    fail_down: bool,
    transaction: Option<bool>,
}

impl CreateTable {
    fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            fail_up: false,
            fail_down: false,
            transaction: None,
        }
    }

    fn failing(mut self) -> Self {
        self.fail_up = true;
        self
    }

    fn failing_down(mut self) -> Self {
        self.fail_down = true;
        self
    }

    fn transaction(mut self, transaction: bool) -> Self {
        self.transaction = Some(transaction);
        self
    }

    fn shared(self) -> Arc<dyn Migration> {
        Arc::new(self)
    }
}

#[async_trait]
impl Migration for CreateTable {
    fn name(&self) -> &str {
        self.name
    }

    fn transaction(&self) -> Option<bool> {
        self.transaction
    }

    async fn up(&self, runner: &mut dyn QueryRunner) -> OrmResult<()> {
        runner
            .create_table(
                &TableDefinition::new(self.table)
                    .column(ColumnDefinition::increments("id", LogicalType::Integer)),
            )
            .await?;
        if self.fail_up {
            return Err(OrmError::Migration(format!("{} exploded", self.name)));
        }
        Ok(())
    }

    async fn down(&self, runner: &mut dyn QueryRunner) -> OrmResult<()> {
        runner.drop_table(self.table).await?;
        if self.fail_down {
            return Err(OrmError::Migration(format!("{} refused to revert", self.name)));
        }
        Ok(())
    }
}

/// The two-step schema from the worked example: a table, then an index on it
struct Init;
struct AddIndex;

#[async_trait]
impl Migration for Init {
    fn name(&self) -> &str {
        "Init1700000000000"
    }

    async fn up(&self, runner: &mut dyn QueryRunner) -> OrmResult<()> {
        runner
            .create_table(
                &TableDefinition::new("users")
                    .column(ColumnDefinition::increments("id", LogicalType::Integer))
                    .column(ColumnDefinition::new("email", LogicalType::Text).not_null()),
            )
            .await
    }

    async fn down(&self, runner: &mut dyn QueryRunner) -> OrmResult<()> {
        runner.drop_table("users").await
    }
}

#[async_trait]
impl Migration for AddIndex {
    fn name(&self) -> &str {
        "AddIndex1700000100000"
    }

    async fn up(&self, runner: &mut dyn QueryRunner) -> OrmResult<()> {
        runner
            .execute("CREATE INDEX idx_users_email ON users (email)", &[])
            .await?;
        Ok(())
    }

    async fn down(&self, runner: &mut dyn QueryRunner) -> OrmResult<()> {
        runner.execute("DROP INDEX idx_users_email", &[]).await?;
        Ok(())
    }
}

struct Fixture {
    connection: Connection,
    database: Arc<MemoryDatabase>,
    logger: Arc<CapturingLogger>,
}

async fn fixture(url: &str, migrations: Vec<Arc<dyn Migration>>) -> Fixture {
    fixture_with(ConnectionOptions::new(url), migrations).await
}

async fn fixture_with(options: ConnectionOptions, migrations: Vec<Arc<dyn Migration>>) -> Fixture {
    let driver = MemoryDriver::from_url(&options.database_url).unwrap();
    let database = driver.database();
    let logger = Arc::new(CapturingLogger::default());

    let connection = Connection::with_driver(options, Arc::new(driver))
        .unwrap()
        .with_migrations(migrations)
        .with_logger(logger.clone());
    connection.connect().await.unwrap();

    Fixture {
        connection,
        database,
        logger,
    }
}

fn ledger_names(database: &MemoryDatabase) -> Vec<String> {
    database
        .rows("migrations")
        .iter()
        .map(|row| row.get::<String>("name").unwrap())
        .collect()
}

fn three_units_failing_second() -> Vec<Arc<dyn Migration>> {
    vec![
        CreateTable::new("Users1700000000001", "users").shared(),
        CreateTable::new("Posts1700000000002", "posts").failing().shared(),
        CreateTable::new("Tags1700000000003", "tags").shared(),
    ]
}

#[tokio::test]
async fn test_example_run_then_undo() {
    let f = fixture("memory://", vec![Arc::new(AddIndex), Arc::new(Init)]).await;

    let applied = f
        .connection
        .run_migrations(RunMigrationsOptions::transaction(TransactionMode::All))
        .await
        .unwrap();

    let names: Vec<_> = applied.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["Init1700000000000", "AddIndex1700000100000"]);
    assert_eq!(f.database.journal_count("BEGIN"), 1);
    assert_eq!(f.database.journal_count("COMMIT"), 1);

    let journal = f.database.journal();
    let position = |entry: &str| journal.iter().position(|e| e == entry).unwrap();
    assert!(position("BEGIN") < position("CREATE TABLE users"));
    assert!(position("CREATE TABLE users") < position("CREATE INDEX idx_users_email ON users (email)"));
    assert!(position("CREATE INDEX idx_users_email ON users (email)") < position("COMMIT"));

    let rows = f.database.rows("migrations");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get::<i64>("timestamp").unwrap(), 1700000000000);
    assert_eq!(rows[1].get::<String>("name").unwrap(), "AddIndex1700000100000");

    let reverted = f
        .connection
        .undo_last_migration(UndoMigrationOptions::default())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reverted.name, "AddIndex1700000100000");
    assert_eq!(reverted.id, Some(2));
    assert!(f.database.journal().contains(&"DROP INDEX idx_users_email".to_string()));
    assert_eq!(ledger_names(&f.database), vec!["Init1700000000000"]);
    assert!(f.database.has_table("users"));
}

#[tokio::test]
async fn test_progress_is_logged() {
    let f = fixture("memory://", vec![Arc::new(Init), Arc::new(AddIndex)]).await;

    f.connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();
    assert!(f.logger.contains("Migrations table \"migrations\" was created."));
    assert!(f.logger.contains("0 migrations are already loaded in the database."));
    assert!(f.logger.contains("2 migrations were found in the source code."));
    assert!(f.logger.contains("2 migrations are new migrations must be executed."));
    assert!(f.logger.contains("Migration Init1700000000000 has been executed successfully."));

    f.connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();
    assert!(f.logger.contains("AddIndex1700000100000 is the last executed migration."));
    assert!(f.logger.contains("No migrations are pending"));
}

#[tokio::test]
async fn test_duplicate_names_fail_before_any_runner_exists() {
    let driver = Arc::new(MemoryDriver::new());
    driver.connect().await.unwrap();
    let database = driver.database();

    let migrations = vec![
        CreateTable::new("Users1700000000001", "users").shared(),
        CreateTable::new("Users1700000000001", "people").shared(),
    ];
    let err = MigrationExecutor::new(driver.clone(), migrations.clone(), &ConnectionOptions::default())
        .execute_pending_migrations()
        .await
        .unwrap_err();

    assert!(err.is_configuration_error());
    assert!(err.to_string().contains("Users1700000000001"));
    assert_eq!(database.runners_created(), 0);

    let connection = Connection::with_driver(ConnectionOptions::default(), Arc::new(MemoryDriver::new()))
        .unwrap()
        .with_migrations(migrations);
    assert!(connection.connect().await.unwrap_err().is_configuration_error());
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_second_run_applies_nothing() {
    let f = fixture(
        "memory://",
        vec![
            CreateTable::new("Users1700000000001", "users").shared(),
            CreateTable::new("Posts1700000000002", "posts").shared(),
        ],
    )
    .await;

    let first = f
        .connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(f.database.rows("migrations").len(), 2);

    f.database.clear_journal();
    let second = f
        .connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();

    assert!(second.is_empty());
    assert_eq!(f.database.rows("migrations").len(), 2);
    assert_eq!(f.database.journal_count("BEGIN"), 0);
    assert_eq!(f.database.journal_count("INSERT INTO migrations"), 0);
}

#[tokio::test]
async fn test_all_mode_failure_rolls_back_everything() {
    let f = fixture("memory://", three_units_failing_second()).await;

    let err = f
        .connection
        .run_migrations(RunMigrationsOptions::transaction(TransactionMode::All))
        .await
        .unwrap_err();

    assert!(matches!(err, OrmError::Migration(ref m) if m == "Posts1700000000002 exploded"));
    assert!(f.database.rows("migrations").is_empty());
    assert!(!f.database.has_table("users"));
    assert!(!f.database.has_table("posts"));
    assert_eq!(f.database.journal_count("ROLLBACK"), 1);
    assert!(f.logger.contains("Migration \"Posts1700000000002\" failed, error:"));
    assert!(!f.logger.contains("Tags1700000000003"));
}

#[tokio::test]
async fn test_each_mode_failure_keeps_earlier_units() {
    let f = fixture("memory://", three_units_failing_second()).await;

    let err = f
        .connection
        .run_migrations(RunMigrationsOptions::transaction(TransactionMode::Each))
        .await
        .unwrap_err();

    assert!(matches!(err, OrmError::Migration(_)));
    assert_eq!(ledger_names(&f.database), vec!["Users1700000000001"]);
    assert!(f.database.has_table("users"));
    assert!(!f.database.has_table("posts"));
    assert!(!f.database.has_table("tags"));
    assert_eq!(f.database.journal_count("COMMIT"), 1);
    assert_eq!(f.database.journal_count("ROLLBACK"), 1);
}

#[tokio::test]
async fn test_backend_without_transactions_keeps_partial_work() {
    let f = fixture("memory://?transactions=none", three_units_failing_second()).await;

    assert!(f
        .connection
        .run_migrations(RunMigrationsOptions::transaction(TransactionMode::All))
        .await
        .is_err());

    assert_eq!(ledger_names(&f.database), vec!["Users1700000000001"]);
    assert!(f.database.has_table("posts"));
    assert_eq!(f.database.journal_count("BEGIN"), 0);
    assert_eq!(f.database.journal_count("ROLLBACK"), 0);
}

#[tokio::test]
async fn test_undo_reverts_latest_only() {
    let f = fixture(
        "memory://",
        vec![
            CreateTable::new("A0000000000100", "alpha").shared(),
            CreateTable::new("B0000000000200", "beta").shared(),
        ],
    )
    .await;
    f.connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();

    let reverted = f
        .connection
        .undo_last_migration(UndoMigrationOptions::default())
        .await
        .unwrap();
    assert_eq!(reverted.unwrap().name, "B0000000000200");
    assert_eq!(ledger_names(&f.database), vec!["A0000000000100"]);
    assert!(f.database.has_table("alpha"));
    assert!(!f.database.has_table("beta"));

    let reverted = f
        .connection
        .undo_last_migration(UndoMigrationOptions::default())
        .await
        .unwrap();
    assert_eq!(reverted.unwrap().name, "A0000000000100");
    assert!(f.database.rows("migrations").is_empty());

    let reverted = f
        .connection
        .undo_last_migration(UndoMigrationOptions::default())
        .await
        .unwrap();
    assert!(reverted.is_none());
    assert!(f.logger.contains("No migrations were found in the database. Nothing to revert!"));
}

#[tokio::test]
async fn test_undo_latest_by_id_not_timestamp() {
    let f = fixture("memory://", vec![CreateTable::new("B0000000000200", "beta").shared()]).await;
    f.connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();

    let later = Connection::with_driver(ConnectionOptions::default(), f.connection.driver())
        .unwrap()
        .with_migrations(vec![
            CreateTable::new("A0000000000100", "alpha").shared(),
            CreateTable::new("B0000000000200", "beta").shared(),
        ]);
    later
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();

    let reverted = later
        .undo_last_migration(UndoMigrationOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reverted.name, "A0000000000100");
    assert_eq!(ledger_names(&f.database), vec!["B0000000000200"]);
}

#[tokio::test]
async fn test_undo_with_missing_source_fails_without_mutation() {
    let f = fixture("memory://", vec![CreateTable::new("Gone1700000000009", "gone").shared()]).await;
    f.connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();

    let trimmed = Connection::with_driver(ConnectionOptions::default(), f.connection.driver())
        .unwrap()
        .with_migrations(vec![CreateTable::new("Kept1700000000001", "kept").shared()]);

    f.database.clear_journal();
    let err = trimmed
        .undo_last_migration(UndoMigrationOptions::default())
        .await
        .unwrap_err();

    assert!(err.is_configuration_error());
    assert!(err.to_string().contains("Gone1700000000009"));
    assert_eq!(ledger_names(&f.database), vec!["Gone1700000000009"]);
    assert!(f.database.has_table("gone"));
    assert_eq!(f.database.journal_count("BEGIN"), 0);
    assert!(!f.database.journal().iter().any(|e| e.starts_with("DROP TABLE")));
}

#[tokio::test]
async fn test_revert_failure_rolls_back_and_keeps_ledger_row() {
    let f = fixture(
        "memory://",
        vec![CreateTable::new("Stubborn1700000000001", "stubborn").failing_down().shared()],
    )
    .await;
    f.connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();

    let err = f
        .connection
        .undo_last_migration(UndoMigrationOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, OrmError::Migration(_)));
    assert_eq!(ledger_names(&f.database), vec!["Stubborn1700000000001"]);
    assert!(f.database.has_table("stubborn"));
    assert_eq!(f.database.journal_count("ROLLBACK"), 1);
}

#[tokio::test]
async fn test_ledger_failure_propagates_unmodified() {
    let f = fixture("memory://", vec![CreateTable::new("Users1700000000001", "users").shared()]).await;
    f.database.fail_on("INSERT INTO migrations");

    let err = f
        .connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, OrmError::Query(ref m) if m.contains("INSERT INTO migrations")));
    assert!(!f.database.has_table("users"));
    assert_eq!(f.database.journal_count("ROLLBACK"), 1);
    assert_eq!(f.database.runners_open(), 0);
}

#[tokio::test]
async fn test_supplied_runner_is_never_released() {
    let f = fixture("memory://", three_units_failing_second()).await;
    let mut runner = f.connection.create_query_runner().await.unwrap();

    let result = f
        .connection
        .run_migrations_with(runner.as_mut(), RunMigrationsOptions::transaction(TransactionMode::Each))
        .await;
    assert!(result.is_err());
    assert!(!runner.is_released());
    assert!(!runner.is_transaction_active());
    assert_eq!(f.database.runners_created(), 1);

    let reverted = f
        .connection
        .undo_last_migration_with(runner.as_mut(), UndoMigrationOptions::default())
        .await
        .unwrap();
    assert_eq!(reverted.unwrap().name, "Users1700000000001");
    assert!(!runner.is_released());
    assert_eq!(f.database.runners_created(), 1);

    runner.release().await.unwrap();
    assert_eq!(f.database.runners_open(), 0);
}

#[tokio::test]
async fn test_owned_runners_are_released() {
    let f = fixture("memory://", three_units_failing_second()).await;

    assert!(f
        .connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .is_err());
    f.connection.show_migrations().await.unwrap();
    f.connection
        .undo_last_migration(UndoMigrationOptions::default())
        .await
        .unwrap();

    assert_eq!(f.database.runners_created(), 3);
    assert_eq!(f.database.runners_open(), 0);
}

#[tokio::test]
async fn test_caller_transaction_is_left_to_the_caller() {
    let f = fixture(
        "memory://",
        vec![CreateTable::new("Users1700000000001", "users").shared()],
    )
    .await;
    let mut runner = f.connection.create_query_runner().await.unwrap();
    runner.start_transaction().await.unwrap();

    let applied = f
        .connection
        .run_migrations_with(runner.as_mut(), RunMigrationsOptions::transaction(TransactionMode::All))
        .await
        .unwrap();

    assert_eq!(applied.len(), 1);
    assert!(runner.is_transaction_active());
    assert_eq!(runner.transaction_depth(), 1);
    assert_eq!(f.database.journal_count("BEGIN"), 1);
    assert_eq!(f.database.journal_count("COMMIT"), 0);

    runner.rollback_transaction().await.unwrap();
    runner.release().await.unwrap();
    assert!(f.database.rows("migrations").is_empty());
    assert!(!f.database.has_table("users"));
}

#[tokio::test]
async fn test_nothing_pending_opens_no_transaction() {
    let f = fixture("memory://", vec![CreateTable::new("Users1700000000001", "users").shared()]).await;
    f.connection
        .run_migrations(RunMigrationsOptions::transaction(TransactionMode::Each))
        .await
        .unwrap();

    f.database.clear_journal();
    for mode in [TransactionMode::All, TransactionMode::Each, TransactionMode::None] {
        let applied = f
            .connection
            .run_migrations(RunMigrationsOptions::transaction(mode))
            .await
            .unwrap();
        assert!(applied.is_empty());
    }
    assert_eq!(f.database.journal_count("BEGIN"), 0);
    assert_eq!(f.database.journal_count("COMMIT"), 0);
}

#[tokio::test]
async fn test_none_mode_runs_without_transactions() {
    let f = fixture("memory://", three_units_failing_second()).await;

    assert!(f
        .connection
        .run_migrations(RunMigrationsOptions::transaction(TransactionMode::None))
        .await
        .is_err());
    assert_eq!(f.database.journal_count("BEGIN"), 0);
    assert_eq!(ledger_names(&f.database), vec!["Users1700000000001"]);
    assert!(f.database.has_table("posts"));

    f.database.clear_journal();
    f.connection
        .undo_last_migration(UndoMigrationOptions::transaction(TransactionMode::None))
        .await
        .unwrap();
    assert_eq!(f.database.journal_count("BEGIN"), 0);
    assert!(f.database.rows("migrations").is_empty());
}

#[tokio::test]
async fn test_simple_backend_wraps_batch_in_one_transaction() {
    let f = fixture(
        "memory://?transactions=simple",
        vec![
            CreateTable::new("Users1700000000001", "users").shared(),
            CreateTable::new("Posts1700000000002", "posts").shared(),
        ],
    )
    .await;

    f.connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();
    assert_eq!(f.database.journal_count("BEGIN"), 1);
    assert_eq!(f.database.journal_count("COMMIT"), 1);
    assert!(!f.database.journal().iter().any(|e| e.starts_with("SAVEPOINT")));
    assert_eq!(f.database.rows("migrations").len(), 2);
}

#[tokio::test]
async fn test_schemaless_backend_keeps_ledger_without_ddl() {
    let f = fixture(
        "memory://?schemaless=true",
        vec![
            CreateTable::new("Users1700000000001", "users").shared(),
            CreateTable::new("Posts1700000000002", "posts").shared(),
        ],
    )
    .await;

    let applied = f
        .connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(f.database.journal_count("CREATE TABLE migrations"), 0);
    assert_eq!(f.database.rows("migrations").len(), 2);
    assert!(!f.logger.contains("Migrations table"));

    f.connection
        .undo_last_migration(UndoMigrationOptions::default())
        .await
        .unwrap();
    assert_eq!(ledger_names(&f.database), vec!["Users1700000000001"]);
}

#[tokio::test]
async fn test_show_migrations_reports_unapplied() {
    let f = fixture(
        "memory://",
        vec![
            CreateTable::new("Users1700000000001", "users").shared(),
            CreateTable::new("Posts1700000000002", "posts").failing().shared(),
        ],
    )
    .await;
    assert!(f.connection.show_migrations().await.unwrap());
    assert!(f.logger.contains(" [ ] Users1700000000001"));

    let _ = f
        .connection
        .run_migrations(RunMigrationsOptions::transaction(TransactionMode::Each))
        .await;
    assert!(f.connection.show_migrations().await.unwrap());
    assert!(f.logger.contains(" [X] 1 Users1700000000001"));
    assert!(f.logger.contains(" [ ] Posts1700000000002"));
    assert!(f.connection.has_pending_migrations().await.unwrap());
}

#[tokio::test]
async fn test_show_migrations_all_applied() {
    let f = fixture("memory://", vec![CreateTable::new("Users1700000000001", "users").shared()]).await;
    f.connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();
    assert!(!f.connection.show_migrations().await.unwrap());
    assert!(!f.connection.has_pending_migrations().await.unwrap());
}

#[tokio::test]
async fn test_transaction_override_in_each_mode() {
    let f = fixture(
        "memory://",
        vec![
            CreateTable::new("Users1700000000001", "users").shared(),
            CreateTable::new("Concurrent1700000000002", "concurrent")
                .transaction(false)
                .shared(),
        ],
    )
    .await;

    f.connection
        .run_migrations(RunMigrationsOptions::transaction(TransactionMode::Each))
        .await
        .unwrap();
    assert_eq!(f.database.journal_count("BEGIN"), 1);

    f.database.clear_journal();
    f.connection
        .undo_last_migration(UndoMigrationOptions::transaction(TransactionMode::Each))
        .await
        .unwrap();
    assert_eq!(f.database.journal_count("BEGIN"), 0);
    assert!(!f.database.has_table("concurrent"));

    let reverted = f
        .connection
        .undo_last_migration(UndoMigrationOptions::transaction(TransactionMode::All))
        .await
        .unwrap();
    assert_eq!(reverted.unwrap().name, "Users1700000000001");
}

#[tokio::test]
async fn test_override_rejected_in_all_mode() {
    let f = fixture(
        "memory://",
        vec![CreateTable::new("Concurrent1700000000002", "concurrent")
            .transaction(false)
            .shared()],
    )
    .await;

    let err = f
        .connection
        .run_migrations(RunMigrationsOptions::transaction(TransactionMode::All))
        .await
        .unwrap_err();
    assert!(err.is_configuration_error());
    assert!(!f.database.has_table("concurrent"));
    assert!(f.database.rows("migrations").is_empty());
}

#[tokio::test]
async fn test_fake_run_and_undo() {
    let f = fixture("memory://", vec![CreateTable::new("Users1700000000001", "users").shared()]).await;

    let applied = f
        .connection
        .run_migrations(RunMigrationsOptions::default().fake(true))
        .await
        .unwrap();
    assert_eq!(applied.len(), 1);
    assert!(!f.database.has_table("users"));
    assert_eq!(ledger_names(&f.database), vec!["Users1700000000001"]);

    f.connection
        .undo_last_migration(UndoMigrationOptions::default().fake(true))
        .await
        .unwrap();
    assert!(f.database.rows("migrations").is_empty());
    assert!(f.logger.contains("Migration Users1700000000001 has been (fake) reverted successfully."));
}

#[tokio::test]
async fn test_timestamp_order_enforcement() {
    let options = ConnectionOptions::new("memory://").enforce_timestamp_order(true);
    let f = fixture_with(options, vec![CreateTable::new("B0000000000200", "beta").shared()]).await;
    f.connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();

    let strict = Connection::with_driver(
        ConnectionOptions::new("memory://").enforce_timestamp_order(true),
        f.connection.driver(),
    )
    .unwrap()
    .with_migrations(vec![
        CreateTable::new("A0000000000100", "alpha").shared(),
        CreateTable::new("B0000000000200", "beta").shared(),
        CreateTable::new("C0000000000300", "gamma").shared(),
    ]);

    let err = strict
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_configuration_error());
    assert!(err.to_string().contains("A0000000000100"));
    assert!(!f.database.has_table("gamma"));
    assert_eq!(ledger_names(&f.database), vec!["B0000000000200"]);
}

#[tokio::test]
async fn test_custom_ledger_table_name() {
    let options = ConnectionOptions::new("memory://").migrations_table_name("schema_history");
    let f = fixture_with(options, vec![CreateTable::new("Users1700000000001", "users").shared()]).await;

    f.connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();
    assert!(f.database.has_table("schema_history"));
    assert!(!f.database.has_table("migrations"));
    assert_eq!(f.database.rows("schema_history").len(), 1);
}

#[tokio::test]
async fn test_migrations_run_on_connect() {
    let options = ConnectionOptions::new("memory://").migrations_run(true);
    let f = fixture_with(options, vec![CreateTable::new("Users1700000000001", "users").shared()]).await;

    assert!(f.database.has_table("users"));
    assert!(!f.connection.has_pending_migrations().await.unwrap());

    let driver = Arc::new(MemoryDriver::new());
    let failing = Connection::with_driver(ConnectionOptions::new("memory://").migrations_run(true), driver.clone())
        .unwrap()
        .with_migrations(vec![CreateTable::new("Users1700000000001", "users").failing().shared()]);
    assert!(failing.connect().await.is_err());
    assert!(!driver.is_connected());
}

#[tokio::test]
async fn test_executed_entries_most_recent_first() {
    let f = fixture(
        "memory://",
        vec![
            CreateTable::new("A0000000000100", "alpha").shared(),
            CreateTable::new("B0000000000200", "beta").shared(),
        ],
    )
    .await;
    f.connection
        .run_migrations(RunMigrationsOptions::default())
        .await
        .unwrap();

    let mut executor = MigrationExecutor::new(
        f.connection.driver(),
        f.connection.migrations().to_vec(),
        f.connection.options(),
    );
    let executed = executor.get_executed_migrations().await.unwrap();
    assert_eq!(
        executed,
        vec![
            LedgerEntry {
                id: Some(2),
                timestamp: 200,
                name: "B0000000000200".to_string()
            },
            LedgerEntry {
                id: Some(1),
                timestamp: 100,
                name: "A0000000000100".to_string()
            },
        ]
    );
    assert!(executor.get_pending_migrations().await.unwrap().is_empty());
}
