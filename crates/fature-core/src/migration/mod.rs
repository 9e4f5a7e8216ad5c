//! Bulk copy of source entities into the derived schema.
//!
//! [`BatchMigrator`] walks the source identifier range in fixed windows,
//! one transaction per window and one savepoint per record.
//! [`MigrationPipeline`] wraps it with backups, index build and validation.

pub mod batch;
pub mod pipeline;

use std::time::Duration;
use thiserror::Error;

use crate::entity::{EntityId, SourceBounds};
use crate::error::StoreError;
use crate::store::RecordFailure;

pub use batch::BatchMigrator;
pub use pipeline::{MigrationPipeline, PipelineReport};

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A window could not be committed. The window's transaction was
    /// rolled back; earlier windows stay committed.
    #[error("batch ({window_start}..={window_end}) failed after {attempts} attempt(s): {source}")]
    BatchFailed {
        window_start: EntityId,
        window_end: EntityId,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// Store error outside a batch window.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// First identifier covered by the window (inclusive).
    pub window_start: EntityId,
    /// Last identifier covered by the window (inclusive).
    pub window_end: EntityId,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub failures: Vec<RecordFailure>,
}

impl BatchResult {
    pub(crate) fn new(window_start: EntityId, window_end: EntityId) -> Self {
        Self {
            window_start,
            window_end,
            ..Default::default()
        }
    }

    pub(crate) fn record_failure(&mut self, failure: RecordFailure) {
        self.failed += 1;
        self.failures.push(failure);
    }
}

/// Totals for a whole migration run.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Source bounds captured at start.
    pub source: SourceBounds,
    pub batches: Vec<BatchResult>,
    pub total_processed: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub elapsed: Duration,
}

impl MigrationReport {
    pub(crate) fn new(source: SourceBounds) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    pub(crate) fn push(&mut self, batch: BatchResult) {
        self.total_processed += batch.processed;
        self.total_succeeded += batch.succeeded;
        self.total_failed += batch.failed;
        self.batches.push(batch);
    }

    /// Whether every processed record landed in the target.
    pub fn is_clean(&self) -> bool {
        self.total_failed == 0
    }

    /// Per-record failures across all batches.
    pub fn failures(&self) -> impl Iterator<Item = &RecordFailure> {
        self.batches.iter().flat_map(|batch| batch.failures.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_totals() {
        let mut report = MigrationReport::new(SourceBounds::EMPTY);
        let mut first = BatchResult::new(1, 2);
        first.processed = 2;
        first.succeeded = 1;
        first.record_failure(RecordFailure {
            id: 2,
            reason: "bad status".into(),
        });
        report.push(first);

        let mut second = BatchResult::new(3, 4);
        second.processed = 1;
        second.succeeded = 1;
        report.push(second);

        assert_eq!(report.total_processed, 3);
        assert_eq!(report.total_succeeded, 2);
        assert_eq!(report.total_failed, 1);
        assert!(!report.is_clean());
        assert_eq!(report.failures().map(|f| f.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_batch_failed_display() {
        let err = MigrationError::BatchFailed {
            window_start: 1,
            window_end: 5000,
            attempts: 3,
            source: StoreError::Connection("reset by peer".into()),
        };
        assert_eq!(
            err.to_string(),
            "batch (1..=5000) failed after 3 attempt(s): connection error: reset by peer"
        );
    }
}
