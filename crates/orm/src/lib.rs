//! # keel-orm: Database access layer with schema migrations
//!
//! A driver abstraction over SQL and document-style backends, plus a
//! migration engine that tracks applied schema changes in a ledger table and
//! applies or reverts them under transactions matched to what each backend
//! supports.
//!
//! ```no_run
//! use keel_orm::{Connection, ConnectionOptions, RunMigrationsOptions, SqlMigration};
//!
//! # async fn run() -> keel_orm::OrmResult<()> {
//! let connection = Connection::new(ConnectionOptions::new("sqlite::memory:"))?
//!     .migration(SqlMigration::new(
//!         "CreateUsers1700000000000",
//!         "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL)",
//!         "DROP TABLE users",
//!     ));
//!
//! connection.connect().await?;
//! let applied = connection.run_migrations(RunMigrationsOptions::default()).await?;
//! println!("{} migrations applied", applied.len());
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod migrations;
pub mod schema;
pub mod transactions;

#[cfg(test)]
mod tests;

// Re-export core traits and types
pub use backends::{
    create_driver, DatabaseBackendType, DatabaseDriver, DatabaseRow, DatabaseValue, DriverCapabilities,
    MemoryDriver, PostgresDriver, QueryRunner, SortOrder, SqliteDriver, TransactionSupport,
};
pub use config::{ConnectionOptions, PoolOptions, TransactionMode};
pub use connection::{Connection, RunMigrationsOptions, UndoMigrationOptions};
pub use error::{OrmError, OrmResult};
pub use logging::{init_tracing, MigrationLogger, TracingLogger};
pub use migrations::{
    LedgerEntry, LedgerTable, Migration, MigrationExecutor, MigrationUnit, SqlMigration,
};
pub use schema::{ColumnDefinition, LogicalType, TableDefinition};
pub use transactions::{TransactionCoordinator, TransactionStep};
