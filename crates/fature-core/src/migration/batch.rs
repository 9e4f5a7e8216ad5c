//! Windowed, resumable-by-range batch copy.

use std::thread;
use std::time::Instant;

use super::{BatchResult, MigrationError, MigrationReport};
use crate::config::MigrationConfig;
use crate::entity::EntityId;
use crate::error::StoreError;
use crate::store::{RecordFailure, Store};

/// Copies source entities into the derived entity table.
///
/// The source range is captured once; entities inserted into the source
/// after that are not picked up by the run.
#[derive(Debug, Clone)]
pub struct BatchMigrator {
    config: MigrationConfig,
}

impl BatchMigrator {
    pub fn new(config: MigrationConfig) -> Self {
        Self { config }
    }

    /// Run the migration to completion.
    ///
    /// Per-record failures are counted and skipped. A window that cannot be
    /// committed aborts the run with [`MigrationError::BatchFailed`]; windows
    /// committed before it stay in the target.
    pub fn run(&self, store: &mut dyn Store) -> Result<MigrationReport, MigrationError> {
        let started = Instant::now();
        let bounds = store.source_bounds()?;
        let mut report = MigrationReport::new(bounds);

        let Some((min_id, max_id)) = bounds.range() else {
            tracing::info!("source entity table is empty, nothing to migrate");
            report.elapsed = started.elapsed();
            return Ok(report);
        };

        let window = self.config.batch_size.max(1);
        tracing::info!(
            total = bounds.count,
            min_id,
            max_id,
            batch_size = window,
            backend = store.backend_name(),
            "starting batch migration"
        );

        let mut cursor = min_id.saturating_sub(1);
        while cursor < max_id {
            let up_to = cursor.saturating_add(window);
            let batch = self.run_window(store, cursor, up_to)?;

            if batch.processed > 0 {
                let processed = report.total_processed + batch.processed;
                let progress = if bounds.count == 0 {
                    100.0
                } else {
                    processed as f64 / bounds.count as f64 * 100.0
                };
                tracing::info!(
                    window_start = batch.window_start,
                    window_end = batch.window_end,
                    succeeded = batch.succeeded,
                    failed = batch.failed,
                    processed,
                    total = bounds.count,
                    progress = %format!("{progress:.1}%"),
                    "batch committed"
                );
            }
            report.push(batch);

            cursor = up_to;
            let delay = self.config.batch_delay();
            if cursor < max_id && !delay.is_zero() {
                thread::sleep(delay);
            }
        }

        report.elapsed = started.elapsed();
        tracing::info!(
            processed = report.total_processed,
            succeeded = report.total_succeeded,
            failed = report.total_failed,
            batches = report.batches.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch migration finished"
        );
        Ok(report)
    }

    /// Migrate one window, retrying transient failures if configured.
    fn run_window(
        &self,
        store: &mut dyn Store,
        after: EntityId,
        up_to: EntityId,
    ) -> Result<BatchResult, MigrationError> {
        let mut attempt: u32 = 0;
        loop {
            match self.migrate_window(store, after, up_to) {
                Ok(batch) => return Ok(batch),
                Err(err) if err.is_transient() && attempt < self.config.max_batch_retries => {
                    attempt += 1;
                    let backoff = self.config.retry_backoff() * attempt;
                    tracing::warn!(
                        window_start = after + 1,
                        window_end = up_to,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient batch failure, retrying window"
                    );
                    thread::sleep(backoff);
                }
                Err(err) => {
                    tracing::error!(
                        window_start = after + 1,
                        window_end = up_to,
                        error = %err,
                        "batch failed, aborting migration"
                    );
                    return Err(MigrationError::BatchFailed {
                        window_start: after + 1,
                        window_end: up_to,
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }

    fn migrate_window(
        &self,
        store: &mut dyn Store,
        after: EntityId,
        up_to: EntityId,
    ) -> Result<BatchResult, StoreError> {
        let entities = store.fetch_source_window(after, up_to)?;
        let mut batch = BatchResult::new(after + 1, up_to);
        batch.processed = entities.len() as u64;
        if entities.is_empty() {
            return Ok(batch);
        }

        let mut valid = Vec::with_capacity(entities.len());
        for entity in entities {
            match entity.validate() {
                Ok(()) => valid.push(entity),
                Err(violation) => {
                    tracing::warn!(entity_id = entity.id, error = %violation, "record rejected");
                    batch.record_failure(RecordFailure {
                        id: entity.id,
                        reason: violation.to_string(),
                    });
                }
            }
        }

        if !valid.is_empty() {
            let write = store.insert_batch(&valid)?;
            batch.succeeded = write.inserted;
            for failure in write.failures {
                tracing::warn!(entity_id = failure.id, error = %failure.reason, "insert rejected");
                batch.record_failure(failure);
            }
        }

        debug_assert_eq!(batch.processed, batch.succeeded + batch.failed);
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::store::SqliteStore;
    use crate::testing::{chain_store, seeded_store};
    use std::time::Duration;

    fn migrator(batch_size: i64) -> BatchMigrator {
        BatchMigrator::new(
            MigrationConfig::default()
                .with_batch_size(batch_size)
                .with_batch_delay(Duration::ZERO),
        )
    }

    #[test]
    fn test_windows_advance_by_batch_size() {
        let mut store = chain_store();
        let report = migrator(2).run(&mut store).unwrap();

        let windows: Vec<_> = report
            .batches
            .iter()
            .map(|b| (b.window_start, b.window_end, b.processed))
            .collect();
        assert_eq!(windows, vec![(1, 2, 2), (3, 4, 1)]);
        assert_eq!(report.total_succeeded, 3);
        assert!(report.is_clean());
        assert_eq!(store.target_entity_count().unwrap(), 3);
    }

    #[test]
    fn test_sparse_ids_produce_empty_windows() {
        let mut store = seeded_store(&[(10, None), (95, Some(10))]);
        let report = migrator(10).run(&mut store).unwrap();

        // (9, 19], (19, 29], ... (89, 99]
        assert_eq!(report.batches.len(), 9);
        assert_eq!(report.batches.iter().filter(|b| b.processed > 0).count(), 2);
        assert_eq!(report.total_succeeded, 2);
    }

    #[test]
    fn test_empty_source() {
        let mut store = seeded_store(&[]);
        let report = migrator(5000).run(&mut store).unwrap();
        assert!(report.batches.is_empty());
        assert_eq!(report.total_processed, 0);
    }

    #[test]
    fn test_invalid_status_is_per_record() {
        let mut store = seeded_store(&[(1, None)]);
        store
            .insert_source_entity(&Entity::new(2, Some(1), "legacy").with_status("archived"))
            .unwrap();
        store
            .insert_source_entity(&Entity::new(3, Some(1), "fine"))
            .unwrap();

        let report = migrator(5000).run(&mut store).unwrap();
        let batch = &report.batches[0];
        assert_eq!(batch.processed, 3);
        assert_eq!(batch.succeeded, 2);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.failures[0].id, 2);
        assert_eq!(store.target_entity_count().unwrap(), 2);
    }

    #[test]
    fn test_already_migrated_record_fails_alone() {
        let mut store = chain_store();
        store.insert_batch(&[Entity::new(2, Some(1), "early")]).unwrap();

        let report = migrator(5000).run(&mut store).unwrap();
        assert_eq!(report.total_succeeded, 2);
        assert_eq!(report.total_failed, 1);
        assert_eq!(report.failures().next().map(|f| f.id), Some(2));
    }

    #[test]
    fn test_missing_target_is_fatal() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.bootstrap_source_schema().unwrap();
        store
            .insert_source_entity(&Entity::new(1, None, "root"))
            .unwrap();

        let err = migrator(5000)
            .with_retries_for_test(2)
            .run(&mut store)
            .unwrap_err();
        match err {
            MigrationError::BatchFailed {
                window_start,
                attempts,
                ..
            } => {
                assert_eq!(window_start, 1);
                // not transient, so never retried
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    impl BatchMigrator {
        fn with_retries_for_test(mut self, retries: u32) -> Self {
            self.config = self.config.with_batch_retries(retries, Duration::ZERO);
            self
        }
    }
}
