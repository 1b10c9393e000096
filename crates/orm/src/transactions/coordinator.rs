//! Transaction depth tracking
//!
//! [`TransactionCoordinator`] is a pure state machine. A query runner asks it
//! what a begin/commit/rollback request means for its backend, performs the
//! returned [`TransactionStep`], and reports a failed begin back.

use tracing::debug;

use super::savepoints::savepoint_name;
use crate::backends::TransactionSupport;
use crate::error::{OrmError, OrmResult};

/// What a runner must do to honor a transaction request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStep {
    /// Start a backend transaction
    Begin,
    /// Open a savepoint for a nested level
    Savepoint(String),
    /// Nothing to send to the backend
    Absorb,
    /// Commit the backend transaction
    Commit,
    /// Release the savepoint of a nested level
    ReleaseSavepoint(String),
    /// Roll back the whole backend transaction
    Rollback,
    /// Roll back to the savepoint of a nested level
    RollbackToSavepoint(String),
}

impl TransactionStep {
    pub fn is_absorbed(&self) -> bool {
        matches!(self, TransactionStep::Absorb)
    }
}

/// Tracks transaction depth for one query runner
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    support: TransactionSupport,
    depth: u32,
}

impl TransactionCoordinator {
    pub fn new(support: TransactionSupport) -> Self {
        Self { support, depth: 0 }
    }

    pub fn support(&self) -> TransactionSupport {
        self.support
    }

    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Enter one transaction level
    pub fn begin(&mut self) -> TransactionStep {
        self.depth += 1;

        let step = match (self.depth, self.support) {
            (_, TransactionSupport::None) => TransactionStep::Absorb,
            (1, _) => TransactionStep::Begin,
            (depth, TransactionSupport::Nested) => TransactionStep::Savepoint(savepoint_name(depth)),
            (_, TransactionSupport::Simple) => TransactionStep::Absorb,
        };

        debug!("Transaction begin at depth {}: {:?}", self.depth, step);
        step
    }

    /// Undo the bookkeeping of a `begin` whose step failed on the backend
    pub fn begin_failed(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Leave one transaction level, committing when the outermost one closes
    pub fn commit(&mut self) -> OrmResult<TransactionStep> {
        if self.depth == 0 {
            return Err(OrmError::TransactionNotStarted);
        }

        let step = match (self.depth, self.support) {
            (_, TransactionSupport::None) => TransactionStep::Absorb,
            (1, _) => TransactionStep::Commit,
            (depth, TransactionSupport::Nested) => {
                TransactionStep::ReleaseSavepoint(savepoint_name(depth))
            }
            (_, TransactionSupport::Simple) => TransactionStep::Absorb,
        };
        self.depth -= 1;

        debug!("Transaction commit, depth now {}: {:?}", self.depth, step);
        Ok(step)
    }

    /// Roll back one level with savepoints, otherwise the whole transaction
    pub fn rollback(&mut self) -> OrmResult<TransactionStep> {
        if self.depth == 0 {
            return Err(OrmError::TransactionNotStarted);
        }

        let step = match (self.depth, self.support) {
            (depth, TransactionSupport::Nested) if depth > 1 => {
                self.depth -= 1;
                TransactionStep::RollbackToSavepoint(savepoint_name(depth))
            }
            (_, TransactionSupport::None) => {
                self.depth = 0;
                TransactionStep::Absorb
            }
            _ => {
                self.depth = 0;
                TransactionStep::Rollback
            }
        };

        debug!("Transaction rollback, depth now {}: {:?}", self.depth, step);
        Ok(step)
    }

    /// Forget all transaction state (connection returned or lost)
    pub fn reset(&mut self) {
        self.depth = 0;
    }
}
