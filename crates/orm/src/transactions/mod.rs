//! Transaction Management
//!
//! Capability-aware transaction bookkeeping shared by every query runner:
//! the coordinator decides whether a begin/commit/rollback request maps to a
//! real transaction, a savepoint, or nothing at all.

pub mod coordinator;
pub mod savepoints;

pub use coordinator::{TransactionCoordinator, TransactionStep};
pub use savepoints::savepoint_name;
