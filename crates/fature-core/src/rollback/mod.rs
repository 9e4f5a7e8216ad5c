//! Snapshots, rollback procedures and their audit trail.
//!
//! Every rollback step is appended to the `rollback_log` table as it
//! moves through pending, started and completed or failed. A step never
//! runs before the previous transition is durable.

pub mod backup;
pub mod health;
pub mod orchestrator;
pub mod report;
pub mod step;

use thiserror::Error;

use crate::error::StoreError;

pub use backup::{BackupManager, BackupReport};
pub use health::{HealthCheck, HealthReport};
pub use orchestrator::{RollbackOrchestrator, RollbackOutcome};
pub use report::RollbackReport;
pub use step::{RollbackStep, StepLog, StepRecord, StepStatus};

/// Rollback and backup errors.
#[derive(Debug, Error)]
pub enum RollbackError {
    /// The pre-migration snapshot of the primary table does not exist.
    /// Nothing was modified.
    #[error("backup snapshot {0} does not exist, refusing to roll back")]
    MissingBackup(&'static str),

    /// A step that the rest of the procedure depends on failed.
    #[error("rollback step {step} failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: StoreError,
    },

    /// Referential integrity could not be switched back on. The
    /// connection must not be reused for writes.
    #[error("constraints were not re-enabled: {source}")]
    ConstraintsNotRestored {
        #[source]
        source: StoreError,
    },

    /// The audit log could not be written.
    #[error("rollback audit log write failed: {0}")]
    Audit(#[source] StoreError),

    /// A required table has no data to snapshot.
    #[error("table {0} does not exist, cannot create its backup")]
    MissingSourceTable(&'static str),

    /// Snapshot of a required table failed.
    #[error("backup of {table} failed: {source}")]
    BackupFailed {
        table: &'static str,
        #[source]
        source: StoreError,
    },

    /// Other store error.
    #[error(transparent)]
    Store(#[from] StoreError),
}
