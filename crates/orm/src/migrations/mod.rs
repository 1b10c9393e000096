//! Migration System
//!
//! Versioned schema changes, the ledger recording which of them ran, and the
//! executor applying and reverting them under the configured transaction
//! mode.

pub mod definitions;
pub mod executor;
pub mod ledger;
pub mod loader;
pub mod sql_file;

pub use definitions::{LedgerEntry, Migration, MigrationUnit};
pub use executor::MigrationExecutor;
pub use ledger::LedgerTable;
pub use loader::{load_units, parse_timestamp, TIMESTAMP_SUFFIX_LEN};
pub use sql_file::{load_sql_migrations, split_sql_statements, SqlMigration};
