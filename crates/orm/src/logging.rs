//! Logging handles
//!
//! Migration progress is reported through an explicit [`MigrationLogger`]
//! handle rather than a process-wide logger, so callers can route or capture
//! it. The default implementation forwards to `tracing`.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

/// Receiver of human-readable migration progress lines
pub trait MigrationLogger: Send + Sync {
    /// Schema bookkeeping: ledger table checks, migration counts, checklists
    fn log_schema_build(&self, message: &str);

    /// Per-migration progress
    fn log_migration(&self, message: &str);

    /// A migration failed; the error is still propagated to the caller
    fn log_migration_error(&self, message: &str) {
        self.log_migration(message);
    }
}

/// Logger forwarding to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl MigrationLogger for TracingLogger {
    fn log_schema_build(&self, message: &str) {
        tracing::info!(target: "keel::schema", "{}", message);
    }

    fn log_migration(&self, message: &str) {
        tracing::info!(target: "keel::migration", "{}", message);
    }

    fn log_migration_error(&self, message: &str) {
        tracing::error!(target: "keel::migration", "{}", message);
    }
}

/// Shared default logger handle
pub fn default_logger() -> Arc<dyn MigrationLogger> {
    Arc::new(TracingLogger)
}

/// Install a console subscriber honoring `RUST_LOG`, falling back to `default_filter`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
