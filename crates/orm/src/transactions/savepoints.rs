//! Transaction Savepoints
//!
//! Savepoint naming and statements for nested transactions.

use crate::backends::SqlDialect;

use super::TransactionStep;

/// Name of the savepoint guarding transaction level `depth` (2 and deeper)
pub fn savepoint_name(depth: u32) -> String {
    format!("keel_sp_{}", depth)
}

/// Statement implementing a transaction step, if the step needs one
pub fn step_sql(dialect: SqlDialect, step: &TransactionStep) -> Option<String> {
    match step {
        TransactionStep::Begin => Some(dialect.begin_transaction().to_string()),
        TransactionStep::Commit => Some("COMMIT".to_string()),
        TransactionStep::Rollback => Some("ROLLBACK".to_string()),
        TransactionStep::Savepoint(name) => Some(format!("SAVEPOINT {}", name)),
        TransactionStep::ReleaseSavepoint(name) => Some(format!("RELEASE SAVEPOINT {}", name)),
        TransactionStep::RollbackToSavepoint(name) => {
            Some(format!("ROLLBACK TO SAVEPOINT {}", name))
        }
        TransactionStep::Absorb => None,
    }
}
