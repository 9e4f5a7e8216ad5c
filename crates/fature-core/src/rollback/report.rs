//! Rollback audit report.

use std::fmt;

use super::step::StepRecord;
use crate::error::StoreError;
use crate::store::Store;

/// The most recent audit rows, newest first.
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    pub records: Vec<StepRecord>,
}

impl RollbackReport {
    pub fn load(store: &mut dyn Store, limit: u32) -> Result<Self, StoreError> {
        Ok(Self {
            records: store.recent_rollback_steps(limit)?,
        })
    }
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.records.is_empty() {
            return write!(f, "no rollback activity recorded");
        }
        writeln!(f, "=== ROLLBACK LOG ===")?;
        for record in &self.records {
            write!(
                f,
                "{} {:<10} {}",
                record.executed_at.format("%Y-%m-%d %H:%M:%S"),
                record.status.as_str().to_uppercase(),
                record.step
            )?;
            if let Some(details) = &record.details {
                write!(f, " - {details}")?;
            }
            if let Some(error) = &record.error {
                write!(f, " [error: {error}]")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::{RollbackOrchestrator, RollbackStep, StepStatus};
    use crate::testing::chain_store;

    #[test]
    fn test_empty_report() {
        let mut store = chain_store();
        let report = RollbackReport::load(&mut store, 50).unwrap();
        assert_eq!(report.to_string(), "no rollback activity recorded");
    }

    #[test]
    fn test_newest_first_and_limited() {
        let mut store = chain_store();
        RollbackOrchestrator::default()
            .rollback_triggers_only(&mut store)
            .unwrap();

        let report = RollbackReport::load(&mut store, 2).unwrap();
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].status, StepStatus::Completed);
        assert_eq!(report.records[1].status, StepStatus::Started);
        assert_eq!(report.records[0].step, RollbackStep::TriggersOnly.name());

        let text = report.to_string();
        assert!(text.contains("COMPLETED  rollback_triggers_only - dropped 1 trigger(s)"));
    }
}
