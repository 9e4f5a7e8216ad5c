//! Rollback procedures.
//!
//! A full rollback restores the original tables from their pre-migration
//! snapshots and then drops the derived schema. The lighter procedures
//! only drop the derived schema, or only its triggers.

use super::step::{RollbackStep, StepLog, StepRecord, StepStatus};
use super::RollbackError;
use crate::config::RollbackConfig;
use crate::error::StoreError;
use crate::registry::{secondary_restore_plan, PRIMARY_TABLE, ROLLBACK_SAFETY_SNAPSHOT};
use crate::store::Store;

const SKIPPED_NO_SNAPSHOT: &str = "skipped: no backup snapshot present";

/// Result of a rollback procedure that ran to the end.
#[derive(Debug, Clone, Default)]
pub struct RollbackOutcome {
    /// Every audit row written, in order.
    pub steps: Vec<StepRecord>,
    /// Restored tables with their row counts.
    pub restored: Vec<(&'static str, u64)>,
    /// Secondary restore steps that failed.
    pub failed_steps: Vec<String>,
    /// Error from dropping the derived schema, if that failed.
    pub cleanup_error: Option<String>,
}

impl RollbackOutcome {
    /// Whether every restore step succeeded.
    ///
    /// A cleanup failure does not count: the restored data stands.
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

/// Runs rollback procedures against a store.
#[derive(Debug, Clone, Default)]
pub struct RollbackOrchestrator {
    config: RollbackConfig,
}

impl RollbackOrchestrator {
    pub fn new(config: RollbackConfig) -> Self {
        Self { config }
    }

    /// Steps of a full rollback, in execution order.
    pub fn plan(&self) -> Vec<RollbackStep> {
        let mut plan = vec![
            RollbackStep::CheckBackup,
            RollbackStep::BackupCurrentState,
            RollbackStep::DisableConstraints,
            RollbackStep::RestorePrimary,
        ];
        plan.extend(
            secondary_restore_plan()
                .into_iter()
                .map(RollbackStep::RestoreSecondary),
        );
        plan.push(RollbackStep::EnableConstraints);
        if self.config.drop_derived_schema {
            plan.push(RollbackStep::CleanupDerived);
        }
        plan
    }

    /// Restore the original tables from their snapshots.
    ///
    /// Aborts with [`RollbackError::MissingBackup`] before touching any
    /// data if the primary snapshot is absent.
    pub fn full_rollback(&self, store: &mut dyn Store) -> Result<RollbackOutcome, RollbackError> {
        tracing::warn!(backend = store.backend_name(), "starting full rollback");
        store.ensure_rollback_log().map_err(RollbackError::Audit)?;

        let mut log = StepLog::new();
        for step in self.plan() {
            log.record(store, StepRecord::new(&step, StepStatus::Pending))
                .map_err(RollbackError::Audit)?;
        }

        let mut outcome = RollbackOutcome::default();
        match self.run_full(store, &mut log, &mut outcome) {
            Ok(()) => {
                outcome.steps = log.into_records();
                tracing::warn!(
                    restored = outcome.restored.len(),
                    failed = outcome.failed_steps.len(),
                    cleanup_failed = outcome.cleanup_error.is_some(),
                    "full rollback finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(error = %err, "full rollback aborted");
                if !matches!(err, RollbackError::Audit(_)) {
                    let aborted = StepRecord::new(&RollbackStep::Aborted, StepStatus::Failed)
                        .with_error(err.to_string());
                    if let Err(audit) = log.record(store, aborted) {
                        tracing::error!(error = %audit, "could not record rollback abort");
                    }
                }
                Err(err)
            }
        }
    }

    fn run_full(
        &self,
        store: &mut dyn Store,
        log: &mut StepLog,
        outcome: &mut RollbackOutcome,
    ) -> Result<(), RollbackError> {
        check_backup(store, log)?;

        run_step(store, log, RollbackStep::BackupCurrentState, |store| {
            if !store.derived_schema_exists()? {
                return Ok("skipped: derived schema absent".to_string());
            }
            let rows = store.snapshot_derived_entities()?;
            Ok(format!("saved {rows} rows to {ROLLBACK_SAFETY_SNAPSHOT}"))
        })?
        .map_err(|source| step_failed(RollbackStep::BackupCurrentState, source))?;

        with_constraints_suspended(store, log, |store, log| {
            run_step(store, log, RollbackStep::RestorePrimary, |store| {
                let rows = store.restore_from_snapshot(&PRIMARY_TABLE)?;
                outcome.restored.push((PRIMARY_TABLE.name, rows));
                Ok(format!("restored {rows} rows"))
            })?
            .map_err(|source| step_failed(RollbackStep::RestorePrimary, source))?;

            for table in secondary_restore_plan() {
                let step = RollbackStep::RestoreSecondary(table);
                let result = run_step(store, log, step, |store| {
                    if !store.table_exists(table.snapshot)? {
                        return Ok(SKIPPED_NO_SNAPSHOT.to_string());
                    }
                    let rows = store.restore_from_snapshot(table)?;
                    outcome.restored.push((table.name, rows));
                    Ok(format!("restored {rows} rows"))
                })?;
                if result.is_err() {
                    outcome.failed_steps.push(step.name());
                }
            }
            Ok(())
        })?;

        if self.config.drop_derived_schema {
            let cleanup = run_step(store, log, RollbackStep::CleanupDerived, |store| {
                store.drop_derived_schema()?;
                Ok("derived schema dropped".to_string())
            })?;
            if let Err(err) = cleanup {
                outcome.cleanup_error = Some(err.to_string());
            }
        }
        Ok(())
    }

    /// Drop the derived schema and leave the original tables untouched.
    pub fn rollback_schema_only(
        &self,
        store: &mut dyn Store,
    ) -> Result<RollbackOutcome, RollbackError> {
        tracing::warn!("dropping derived schema");
        self.single_step(store, RollbackStep::SchemaOnly, |store| {
            store.drop_derived_schema()?;
            Ok("derived schema dropped".to_string())
        })
    }

    /// Drop the derived schema's triggers and keep all data.
    pub fn rollback_triggers_only(
        &self,
        store: &mut dyn Store,
    ) -> Result<RollbackOutcome, RollbackError> {
        tracing::warn!("dropping derived schema triggers");
        self.single_step(store, RollbackStep::TriggersOnly, |store| {
            let triggers = store.derived_triggers()?;
            for trigger in &triggers {
                store.drop_derived_trigger(trigger)?;
                tracing::info!(trigger = %trigger.name, table = %trigger.table, "trigger dropped");
            }
            let names: Vec<&str> = triggers.iter().map(|t| t.name.as_str()).collect();
            Ok(format!("dropped {} trigger(s): {}", triggers.len(), names.join(", ")))
        })
    }

    fn single_step(
        &self,
        store: &mut dyn Store,
        step: RollbackStep,
        action: impl FnOnce(&mut dyn Store) -> Result<String, StoreError>,
    ) -> Result<RollbackOutcome, RollbackError> {
        store.ensure_rollback_log().map_err(RollbackError::Audit)?;
        let mut log = StepLog::new();
        log.record(store, StepRecord::new(&step, StepStatus::Pending))
            .map_err(RollbackError::Audit)?;
        run_step(store, &mut log, step, action)?.map_err(|source| step_failed(step, source))?;
        Ok(RollbackOutcome {
            steps: log.into_records(),
            ..Default::default()
        })
    }
}

fn step_failed(step: RollbackStep, source: StoreError) -> RollbackError {
    RollbackError::StepFailed {
        step: step.name(),
        source,
    }
}

/// Record `started`, run `action`, then record `completed` with its
/// details or `failed` with its error.
///
/// The outer `Result` carries audit failures, which are always fatal. The
/// inner one is the action's own outcome for the caller to judge.
fn run_step(
    store: &mut dyn Store,
    log: &mut StepLog,
    step: RollbackStep,
    action: impl FnOnce(&mut dyn Store) -> Result<String, StoreError>,
) -> Result<Result<(), StoreError>, RollbackError> {
    log.record(store, StepRecord::new(&step, StepStatus::Started))
        .map_err(RollbackError::Audit)?;

    match action(store) {
        Ok(details) => {
            tracing::info!(step = %step, %details, "rollback step completed");
            log.record(
                store,
                StepRecord::new(&step, StepStatus::Completed).with_details(details),
            )
            .map_err(RollbackError::Audit)?;
            Ok(Ok(()))
        }
        Err(err) => {
            tracing::error!(step = %step, error = %err, "rollback step failed");
            log.record(
                store,
                StepRecord::new(&step, StepStatus::Failed).with_error(err.to_string()),
            )
            .map_err(RollbackError::Audit)?;
            Ok(Err(err))
        }
    }
}

fn check_backup(store: &mut dyn Store, log: &mut StepLog) -> Result<(), RollbackError> {
    let step = RollbackStep::CheckBackup;
    log.record(store, StepRecord::new(&step, StepStatus::Started))
        .map_err(RollbackError::Audit)?;

    let found = match store.table_exists(PRIMARY_TABLE.snapshot) {
        Ok(found) => found,
        Err(err) => {
            log.record(
                store,
                StepRecord::new(&step, StepStatus::Failed).with_error(err.to_string()),
            )
            .map_err(RollbackError::Audit)?;
            return Err(step_failed(step, err));
        }
    };

    if !found {
        let err = RollbackError::MissingBackup(PRIMARY_TABLE.snapshot);
        log.record(
            store,
            StepRecord::new(&step, StepStatus::Failed).with_error(err.to_string()),
        )
        .map_err(RollbackError::Audit)?;
        return Err(err);
    }

    log.record(
        store,
        StepRecord::new(&step, StepStatus::Completed)
            .with_details(format!("found {}", PRIMARY_TABLE.snapshot)),
    )
    .map_err(RollbackError::Audit)
}

/// Run `body` with referential integrity off, and switch it back on
/// whatever `body` returns.
///
/// A failure to re-enable wins over any error from `body` and is
/// reported as [`RollbackError::ConstraintsNotRestored`].
pub(crate) fn with_constraints_suspended<T>(
    store: &mut dyn Store,
    log: &mut StepLog,
    body: impl FnOnce(&mut dyn Store, &mut StepLog) -> Result<T, RollbackError>,
) -> Result<T, RollbackError> {
    let disable = RollbackStep::DisableConstraints;
    log.record(store, StepRecord::new(&disable, StepStatus::Started))
        .map_err(RollbackError::Audit)?;
    if let Err(err) = store.set_constraints_enabled(false) {
        log.record(
            store,
            StepRecord::new(&disable, StepStatus::Failed).with_error(err.to_string()),
        )
        .map_err(RollbackError::Audit)?;
        return Err(step_failed(disable, err));
    }

    // Constraints are off from here on; every path below re-enables them.
    let result = log
        .record(
            store,
            StepRecord::new(&disable, StepStatus::Completed)
                .with_details("referential integrity suspended"),
        )
        .map_err(RollbackError::Audit)
        .and_then(|()| body(&mut *store, &mut *log));

    let enable = RollbackStep::EnableConstraints;
    let started = log.record(store, StepRecord::new(&enable, StepStatus::Started));
    let enabled = store.set_constraints_enabled(true);
    let finished = match &enabled {
        Ok(()) => log.record(
            store,
            StepRecord::new(&enable, StepStatus::Completed)
                .with_details("referential integrity restored"),
        ),
        Err(err) => log.record(
            store,
            StepRecord::new(&enable, StepStatus::Failed).with_error(err.to_string()),
        ),
    };

    if let Err(source) = enabled {
        tracing::error!(error = %source, "constraints could not be re-enabled");
        if let Err(err) = &result {
            tracing::error!(error = %err, "rollback body also failed");
        }
        return Err(RollbackError::ConstraintsNotRestored { source });
    }
    let value = result?;
    started.and(finished).map_err(RollbackError::Audit)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::BackupManager;
    use crate::store::SqliteStore;
    use crate::testing::chain_store;

    fn statuses(outcome: &RollbackOutcome, step: &str) -> Vec<StepStatus> {
        outcome
            .steps
            .iter()
            .filter(|r| r.step == step)
            .map(|r| r.status)
            .collect()
    }

    #[test]
    fn test_plan_order() {
        let names: Vec<_> = RollbackOrchestrator::default()
            .plan()
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(
            names,
            vec![
                "check_backup",
                "backup_current_state",
                "disable_constraints",
                "restore_primary_entity_table",
                "restore_transactions",
                "restore_commissions",
                "restore_payments",
                "enable_constraints",
                "cleanup_v2",
            ]
        );

        let keep_schema = RollbackOrchestrator::new(RollbackConfig {
            drop_derived_schema: false,
            ..Default::default()
        });
        assert_eq!(keep_schema.plan().last(), Some(&RollbackStep::EnableConstraints));
    }

    #[test]
    fn test_full_rollback_logs_every_transition() {
        let mut store = chain_store();
        BackupManager::new().create_backups(&mut store).unwrap();

        let outcome = RollbackOrchestrator::default()
            .full_rollback(&mut store)
            .unwrap();

        assert!(outcome.is_clean());
        assert_eq!(outcome.restored[0], ("affiliates", 3));
        assert_eq!(
            statuses(&outcome, "restore_primary_entity_table"),
            vec![StepStatus::Pending, StepStatus::Started, StepStatus::Completed]
        );
        let payments = outcome
            .steps
            .iter()
            .rfind(|r| r.step == "restore_payments")
            .unwrap();
        assert_eq!(payments.status, StepStatus::Completed);
        assert_eq!(payments.details.as_deref(), Some(SKIPPED_NO_SNAPSHOT));
        assert!(!store.derived_schema_exists().unwrap());
        assert!(store.foreign_keys_enabled().unwrap());

        let persisted = store.recent_rollback_steps(100).unwrap();
        assert_eq!(persisted.len(), outcome.steps.len());
    }

    #[test]
    fn test_missing_backup_modifies_nothing() {
        let mut store = chain_store();
        let err = RollbackOrchestrator::default()
            .full_rollback(&mut store)
            .unwrap_err();

        assert!(matches!(err, RollbackError::MissingBackup(_)));
        assert!(store.derived_schema_exists().unwrap());
        assert_eq!(store.source_entity_count().unwrap(), 3);
        let latest = &store.recent_rollback_steps(1).unwrap()[0];
        assert_eq!(latest.step, "rollback_failed");
    }

    #[test]
    fn test_constraints_restored_when_body_fails() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.ensure_rollback_log().unwrap();
        let mut log = StepLog::new();

        let result: Result<(), _> = with_constraints_suspended(&mut store, &mut log, |_, _| {
            Err(RollbackError::MissingBackup("nothing"))
        });

        assert!(matches!(result, Err(RollbackError::MissingBackup(_))));
        assert!(store.foreign_keys_enabled().unwrap());
        assert_eq!(
            log.status_of(&RollbackStep::EnableConstraints),
            Some(StepStatus::Completed)
        );
    }

    #[test]
    fn test_triggers_only_keeps_data() {
        let mut store = chain_store();
        let outcome = RollbackOrchestrator::default()
            .rollback_triggers_only(&mut store)
            .unwrap();

        assert!(store.derived_triggers().unwrap().is_empty());
        assert!(store.derived_schema_exists().unwrap());
        let done = outcome.steps.last().unwrap();
        assert_eq!(done.step, "rollback_triggers_only");
        assert!(done.details.as_deref().unwrap().starts_with("dropped 1 trigger(s)"));
    }

    #[test]
    fn test_schema_only() {
        let mut store = chain_store();
        RollbackOrchestrator::default()
            .rollback_schema_only(&mut store)
            .unwrap();
        assert!(!store.derived_schema_exists().unwrap());
        assert_eq!(store.source_entity_count().unwrap(), 3);
    }
}
