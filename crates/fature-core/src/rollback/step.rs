//! Rollback steps and their append-only audit records.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;
use crate::registry::TableSpec;
use crate::store::Store;

/// Status of one step transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepStatus {
    /// Planned, not yet attempted.
    Pending,
    /// Attempt began.
    Started,
    /// Attempt finished successfully.
    Completed,
    /// Attempt failed.
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Started => "started",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "started" => Ok(StepStatus::Started),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(StoreError::InvalidData(format!(
                "unknown rollback step status '{other}'"
            ))),
        }
    }
}

/// A step of the rollback procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStep {
    CheckBackup,
    BackupCurrentState,
    DisableConstraints,
    RestorePrimary,
    RestoreSecondary(&'static TableSpec),
    EnableConstraints,
    CleanupDerived,
    SchemaOnly,
    TriggersOnly,
    /// Recorded when a full rollback aborts on a fatal error.
    Aborted,
}

impl RollbackStep {
    /// Name written to the audit log.
    pub fn name(&self) -> String {
        match self {
            RollbackStep::CheckBackup => "check_backup".to_string(),
            RollbackStep::BackupCurrentState => "backup_current_state".to_string(),
            RollbackStep::DisableConstraints => "disable_constraints".to_string(),
            RollbackStep::RestorePrimary => "restore_primary_entity_table".to_string(),
            RollbackStep::RestoreSecondary(table) => format!("restore_{}", table.name),
            RollbackStep::EnableConstraints => "enable_constraints".to_string(),
            RollbackStep::CleanupDerived => "cleanup_v2".to_string(),
            RollbackStep::SchemaOnly => "rollback_schema_only".to_string(),
            RollbackStep::TriggersOnly => "rollback_triggers_only".to_string(),
            RollbackStep::Aborted => "rollback_failed".to_string(),
        }
    }
}

impl fmt::Display for RollbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// One row of the rollback audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: String,
    pub status: StepStatus,
    pub executed_at: DateTime<Utc>,
    pub details: Option<String>,
    pub error: Option<String>,
}

impl StepRecord {
    pub fn new(step: &RollbackStep, status: StepStatus) -> Self {
        Self {
            step: step.name(),
            status,
            executed_at: Utc::now(),
            details: None,
            error: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Writes step transitions to the store's audit table and keeps an
/// in-memory copy for the caller's report.
#[derive(Debug, Default)]
pub struct StepLog {
    records: Vec<StepRecord>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transition. The record is durable when this returns `Ok`.
    pub fn record(&mut self, store: &mut dyn Store, record: StepRecord) -> Result<(), StoreError> {
        tracing::debug!(
            step = %record.step,
            status = %record.status,
            details = ?record.details,
            error = ?record.error,
            "rollback step transition"
        );
        store.append_rollback_step(&record)?;
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StepRecord> {
        self.records
    }

    /// Latest status recorded for a step.
    pub fn status_of(&self, step: &RollbackStep) -> Option<StepStatus> {
        let name = step.name();
        self.records
            .iter()
            .rev()
            .find(|record| record.step == name)
            .map(|record| record.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SECONDARY_TABLES;

    #[test]
    fn test_step_names() {
        assert_eq!(RollbackStep::CheckBackup.name(), "check_backup");
        assert_eq!(RollbackStep::CleanupDerived.name(), "cleanup_v2");
        assert_eq!(
            RollbackStep::RestoreSecondary(&SECONDARY_TABLES[0]).name(),
            "restore_transactions"
        );
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            StepStatus::Pending,
            StepStatus::Started,
            StepStatus::Completed,
            StepStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<StepStatus>().unwrap(), status);
        }
        assert!("skipped".parse::<StepStatus>().is_err());
    }
}
