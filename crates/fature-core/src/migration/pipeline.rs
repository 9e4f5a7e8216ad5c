//! End-to-end migration: backups, schema, copy, index, validation.

use std::time::{Duration, Instant};

use super::{BatchMigrator, MigrationReport};
use crate::config::Config;
use crate::error::Result;
use crate::hierarchy::{HierarchyIndexBuilder, IndexStats};
use crate::rollback::{BackupManager, BackupReport};
use crate::store::Store;
use crate::validation::{ConsistencyValidator, ValidationReport};

/// Everything a pipeline run produced.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// `None` when backups were disabled.
    pub backups: Option<BackupReport>,
    pub migration: MigrationReport,
    pub index: IndexStats,
    pub validation: ValidationReport,
    pub elapsed: Duration,
}

impl PipelineReport {
    /// The migrated data passed every consistency check.
    pub fn succeeded(&self) -> bool {
        self.validation.passed()
    }
}

/// Drives a complete migration run.
#[derive(Debug, Clone)]
pub struct MigrationPipeline {
    config: Config,
}

impl MigrationPipeline {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn run(&self, store: &mut dyn Store) -> Result<PipelineReport> {
        let started = Instant::now();

        let backups = if self.config.migration.backup_before_migrate {
            Some(BackupManager::new().create_backups(store)?)
        } else {
            tracing::warn!("backups disabled, a failed migration cannot be rolled back");
            None
        };

        store.create_derived_schema()?;

        let migration = BatchMigrator::new(self.config.migration.clone()).run(store)?;
        let index = HierarchyIndexBuilder::from_config(&self.config.migration).build(store)?;
        let validation = ConsistencyValidator::from_config(&self.config.validation).validate(store)?;

        let report = PipelineReport {
            backups,
            migration,
            index,
            validation,
            elapsed: started.elapsed(),
        };
        if report.succeeded() {
            tracing::info!(elapsed_ms = report.elapsed.as_millis() as u64, "migration completed");
        } else {
            tracing::error!(
                failed_records = report.migration.total_failed,
                "migration finished but validation failed"
            );
        }
        Ok(report)
    }
}
