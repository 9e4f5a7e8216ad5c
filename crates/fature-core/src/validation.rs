//! Post-migration consistency checks.
//!
//! All checks are read-only and reported individually; a failing check
//! never stops the others from running.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ValidationConfig;
use crate::error::StoreError;
use crate::store::Store;

/// Outcome of one named check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    /// Observed values, for operators.
    pub detail: String,
}

impl CheckResult {
    fn new(name: &'static str, passed: bool, detail: String) -> Self {
        if passed {
            tracing::info!(check = name, %detail, "check passed");
        } else {
            tracing::warn!(check = name, %detail, "check failed");
        }
        Self {
            name,
            passed,
            detail,
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "PASS" } else { "FAIL" };
        write!(f, "{:<20} {verdict} ({})", self.name, self.detail)
    }
}

/// Result of a full validation run.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub count_parity: CheckResult,
    pub hierarchy_integrity: CheckResult,
    pub referral_counts: CheckResult,
    pub index_integrity: CheckResult,
    pub performance: CheckResult,
    #[serde(skip)]
    pub query_latency: Duration,
}

impl ValidationReport {
    /// All checks in reporting order.
    pub fn checks(&self) -> [&CheckResult; 5] {
        [
            &self.count_parity,
            &self.hierarchy_integrity,
            &self.referral_counts,
            &self.index_integrity,
            &self.performance,
        ]
    }

    pub fn passed(&self) -> bool {
        self.checks().iter().all(|check| check.passed)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in self.checks() {
            writeln!(f, "{check}")?;
        }
        write!(
            f,
            "overall              {}",
            if self.passed() { "PASS" } else { "FAIL" }
        )
    }
}

/// Certifies a migrated target against its source.
#[derive(Debug, Clone)]
pub struct ConsistencyValidator {
    max_query_latency: Duration,
}

impl ConsistencyValidator {
    pub fn new(max_query_latency: Duration) -> Self {
        Self { max_query_latency }
    }

    pub fn from_config(config: &ValidationConfig) -> Self {
        Self::new(config.max_query_latency())
    }

    pub fn validate(&self, store: &mut dyn Store) -> Result<ValidationReport, StoreError> {
        tracing::info!(backend = store.backend_name(), "validating migration");

        let source = store.source_entity_count()?;
        let target = store.target_entity_count()?;
        let count_parity = CheckResult::new(
            "count_parity",
            source == target,
            format!("source={source}, target={target}"),
        );

        let orphaned = store.orphaned_entity_count()?;
        let hierarchy_integrity = CheckResult::new(
            "hierarchy_integrity",
            orphaned == 0,
            format!("orphaned entities={orphaned}"),
        );

        let mismatches = store.referral_count_mismatches()?;
        let referral_counts = CheckResult::new(
            "referral_counts",
            mismatches == 0,
            format!("mismatched counters={mismatches}"),
        );

        let orphaned_edges = store.orphaned_edge_count()?;
        let index_integrity = CheckResult::new(
            "index_integrity",
            orphaned_edges == 0,
            format!("orphaned edges={orphaned_edges}"),
        );

        let started = Instant::now();
        let direct = store.edges_at_level(1)?;
        let query_latency = started.elapsed();
        let performance = CheckResult::new(
            "performance",
            query_latency < self.max_query_latency,
            format!(
                "{}ms for {direct} direct edges, limit {}ms",
                query_latency.as_millis(),
                self.max_query_latency.as_millis()
            ),
        );

        let report = ValidationReport {
            count_parity,
            hierarchy_integrity,
            referral_counts,
            index_integrity,
            performance,
            query_latency,
        };
        tracing::info!(passed = report.passed(), "validation finished");
        Ok(report)
    }
}

impl Default for ConsistencyValidator {
    fn default() -> Self {
        Self::from_config(&ValidationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::hierarchy::{HierarchyIndexBuilder, StoreClosure};
    use crate::testing::chain_store;

    #[test]
    fn test_unmigrated_target_fails_parity_only() {
        let mut store = chain_store();
        let report = ConsistencyValidator::default().validate(&mut store).unwrap();

        assert!(!report.count_parity.passed);
        assert_eq!(report.count_parity.detail, "source=3, target=0");
        assert!(report.hierarchy_integrity.passed);
        assert!(report.referral_counts.passed);
        assert!(report.index_integrity.passed);
        assert!(!report.passed());
    }

    #[test]
    fn test_orphan_and_stale_counters_are_detected() {
        let mut store = chain_store();
        // 2 is missing, so 3 is orphaned
        store
            .insert_batch(&[Entity::new(1, None, "root"), Entity::new(3, Some(2), "leaf")])
            .unwrap();
        HierarchyIndexBuilder::new(Box::new(StoreClosure), None)
            .build(&mut store)
            .unwrap();
        store
            .connection()
            .execute(
                "UPDATE fature_v2.affiliates_optimized SET direct_referrals_count = 5 \
                 WHERE affiliate_id = 1",
                [],
            )
            .unwrap();

        let report = ConsistencyValidator::default().validate(&mut store).unwrap();
        assert!(!report.hierarchy_integrity.passed);
        assert!(!report.referral_counts.passed);
        assert!(report.index_integrity.passed);
    }

    #[test]
    fn test_zero_latency_budget_fails_performance() {
        let mut store = chain_store();
        let report = ConsistencyValidator::new(Duration::ZERO)
            .validate(&mut store)
            .unwrap();
        assert!(!report.performance.passed);
    }

    #[test]
    fn test_report_display() {
        let mut store = chain_store();
        let report = ConsistencyValidator::default().validate(&mut store).unwrap();
        let text = report.to_string();
        assert!(text.contains("count_parity"));
        assert!(text.ends_with("FAIL"));
    }
}
