//! Pre-migration snapshots.

use super::RollbackError;
use crate::registry::all_snapshotted_tables;
use crate::store::{SnapshotOutcome, Store};

/// What [`BackupManager::create_backups`] did, per table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    /// Snapshots created now, with their row counts.
    pub created: Vec<(&'static str, u64)>,
    /// Snapshots that already existed and were kept.
    pub kept: Vec<&'static str>,
    /// Optional tables that do not exist.
    pub absent: Vec<&'static str>,
    /// Optional tables whose snapshot failed.
    pub failed: Vec<(&'static str, String)>,
}

/// Creates and deletes the `<table>_backup_pre_v2` snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackupManager;

impl BackupManager {
    pub fn new() -> Self {
        Self
    }

    /// Snapshot every registered table that has no snapshot yet.
    ///
    /// Existing snapshots are never replaced. The primary table is
    /// required; secondary tables are best effort. Also makes sure the
    /// rollback audit table exists.
    pub fn create_backups(&self, store: &mut dyn Store) -> Result<BackupReport, RollbackError> {
        store.ensure_rollback_log()?;

        let mut report = BackupReport::default();
        for table in all_snapshotted_tables() {
            match store.create_snapshot(table) {
                Ok(SnapshotOutcome::Created { rows }) => {
                    tracing::info!(table = table.name, snapshot = table.snapshot, rows, "backup created");
                    report.created.push((table.name, rows));
                }
                Ok(SnapshotOutcome::AlreadyExists) => {
                    tracing::info!(snapshot = table.snapshot, "backup already exists, keeping it");
                    report.kept.push(table.name);
                }
                Ok(SnapshotOutcome::SourceMissing) if table.required => {
                    return Err(RollbackError::MissingSourceTable(table.name));
                }
                Ok(SnapshotOutcome::SourceMissing) => {
                    tracing::debug!(table = table.name, "table absent, no backup needed");
                    report.absent.push(table.name);
                }
                Err(source) if table.required => {
                    return Err(RollbackError::BackupFailed {
                        table: table.name,
                        source,
                    });
                }
                Err(err) => {
                    tracing::warn!(table = table.name, error = %err, "optional backup failed");
                    report.failed.push((table.name, err.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Drop every snapshot. Returns the tables whose snapshot existed.
    pub fn delete_backups(&self, store: &mut dyn Store) -> Result<Vec<&'static str>, RollbackError> {
        let mut dropped = Vec::new();
        for table in all_snapshotted_tables() {
            if store.drop_snapshot(table)? {
                tracing::warn!(snapshot = table.snapshot, "backup deleted");
                dropped.push(table.name);
            }
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::registry::{PRIMARY_TABLE, ROLLBACK_LOG};
    use crate::store::SqliteStore;
    use crate::testing::chain_store;

    #[test]
    fn test_create_backups() {
        let mut store = chain_store();
        let report = BackupManager::new().create_backups(&mut store).unwrap();

        assert_eq!(report.created[0], ("affiliates", 3));
        assert!(report.created.iter().any(|(name, _)| *name == "transactions"));
        assert_eq!(report.absent, vec!["payments"]);
        assert!(store.table_exists(ROLLBACK_LOG).unwrap());
        assert!(store.table_exists(PRIMARY_TABLE.snapshot).unwrap());
    }

    #[test]
    fn test_existing_backup_is_kept() {
        let mut store = chain_store();
        let manager = BackupManager::new();
        manager.create_backups(&mut store).unwrap();

        store
            .insert_source_entity(&Entity::new(4, Some(3), "late"))
            .unwrap();
        let report = manager.create_backups(&mut store).unwrap();
        assert!(report.created.is_empty());
        assert!(report.kept.contains(&"affiliates"));

        // the snapshot still holds the original three rows
        store.restore_from_snapshot(&PRIMARY_TABLE).unwrap();
        assert_eq!(store.source_entity_count().unwrap(), 3);
    }

    #[test]
    fn test_missing_primary_table_is_fatal() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let err = BackupManager::new().create_backups(&mut store).unwrap_err();
        assert!(matches!(err, RollbackError::MissingSourceTable("affiliates")));
    }

    #[test]
    fn test_delete_backups() {
        let mut store = chain_store();
        let manager = BackupManager::new();
        manager.create_backups(&mut store).unwrap();

        let dropped = manager.delete_backups(&mut store).unwrap();
        assert_eq!(dropped, vec!["affiliates", "transactions", "commissions"]);
        assert!(!store.table_exists(PRIMARY_TABLE.snapshot).unwrap());
        assert!(manager.delete_backups(&mut store).unwrap().is_empty());
    }
}
