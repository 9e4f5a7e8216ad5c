//! Read-only health check of the live system.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::RollbackConfig;
use crate::error::StoreError;
use crate::registry::PRIMARY_TABLE;
use crate::store::Store;

/// Observations of one health check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub derived_schema_exists: bool,
    /// Derived and original entity counts, when the derived schema exists.
    pub entity_counts: Option<(u64, u64)>,
    pub primary_backup_exists: bool,
    /// Latency of the representative query, when it ran.
    #[serde(skip)]
    pub query_latency: Option<Duration>,
    pub critical_errors: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.critical_errors.is_empty()
    }

    pub fn data_consistent(&self) -> bool {
        matches!(self.entity_counts, Some((derived, original)) if derived == original)
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let yes_no = |flag: bool| if flag { "yes" } else { "no" };
        writeln!(f, "derived schema exists:  {}", yes_no(self.derived_schema_exists))?;
        match self.entity_counts {
            Some((derived, original)) => writeln!(
                f,
                "entity counts:          derived={derived}, original={original}"
            )?,
            None => writeln!(f, "entity counts:          n/a")?,
        }
        writeln!(f, "primary backup exists:  {}", yes_no(self.primary_backup_exists))?;
        if let Some(latency) = self.query_latency {
            writeln!(f, "query latency:          {}ms", latency.as_millis())?;
        }
        for error in &self.critical_errors {
            writeln!(f, "CRITICAL: {error}")?;
        }
        write!(
            f,
            "status:                 {}",
            if self.is_healthy() { "HEALTHY" } else { "UNHEALTHY" }
        )
    }
}

/// Checks whether the derived system is fit to keep serving.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    max_latency: Duration,
}

impl HealthCheck {
    pub fn new(max_latency: Duration) -> Self {
        Self { max_latency }
    }

    pub fn from_config(config: &RollbackConfig) -> Self {
        Self::new(config.health_latency())
    }

    /// Run the check. Store errors become critical errors in the report.
    pub fn check(&self, store: &mut dyn Store) -> HealthReport {
        let mut report = HealthReport::default();
        if let Err(err) = self.observe(store, &mut report) {
            tracing::error!(error = %err, "health check could not complete");
            report.critical_errors.push(format!("health check failed: {err}"));
        }
        tracing::info!(
            healthy = report.is_healthy(),
            critical_errors = report.critical_errors.len(),
            "health check finished"
        );
        report
    }

    fn observe(&self, store: &mut dyn Store, report: &mut HealthReport) -> Result<(), StoreError> {
        report.derived_schema_exists = store.derived_schema_exists()?;

        if report.derived_schema_exists {
            let derived = store.target_entity_count()?;
            let original = store.source_entity_count()?;
            report.entity_counts = Some((derived, original));
            if derived != original {
                report.critical_errors.push(format!(
                    "entity count mismatch: original={original}, derived={derived}"
                ));
            }
        }

        report.primary_backup_exists = store.table_exists(PRIMARY_TABLE.snapshot)?;

        if report.derived_schema_exists {
            let started = Instant::now();
            store.active_target_count()?;
            let latency = started.elapsed();
            report.query_latency = Some(latency);
            if latency >= self.max_latency {
                report.critical_errors.push(format!(
                    "degraded performance: {}ms for a basic query",
                    latency.as_millis()
                ));
            }
        }
        Ok(())
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::from_config(&RollbackConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::BatchMigrator;
    use crate::config::MigrationConfig;
    use crate::testing::chain_store;

    #[test]
    fn test_healthy_after_migration() {
        let mut store = chain_store();
        BatchMigrator::new(MigrationConfig::default().with_batch_delay(Duration::ZERO))
            .run(&mut store)
            .unwrap();

        let report = HealthCheck::default().check(&mut store);
        assert!(report.is_healthy(), "{report}");
        assert!(report.data_consistent());
        assert!(!report.primary_backup_exists);
    }

    #[test]
    fn test_count_mismatch_is_critical() {
        let mut store = chain_store();
        let report = HealthCheck::default().check(&mut store);
        assert!(!report.is_healthy());
        assert_eq!(report.entity_counts, Some((0, 3)));
        assert!(report.critical_errors[0].contains("count mismatch"));
    }

    #[test]
    fn test_without_derived_schema() {
        let mut store = crate::store::SqliteStore::open_in_memory().unwrap();
        store.bootstrap_source_schema().unwrap();
        let report = HealthCheck::default().check(&mut store);
        assert!(!report.derived_schema_exists);
        assert_eq!(report.entity_counts, None);
        assert!(report.is_healthy());
    }
}
