//! Metrics snapshot and collector.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::StoreError;
use crate::store::{MetricsWindow, Store};

/// Entity population and hierarchy shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityMetrics {
    pub total: u64,
    pub active: u64,
    pub max_level: i64,
    pub avg_level: f64,
    pub with_referrals: u64,
    pub total_direct_referrals: i64,
    pub total_network_size: i64,
}

/// Transaction volume over the trailing 24 hours. Amounts in cents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionMetrics {
    pub count_24h: u64,
    pub volume_24h: i64,
    pub avg_amount: f64,
    pub processed_commissions: u64,
    pub last_hour: u64,
}

/// Commission backlog and throughput. Amounts in cents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommissionMetrics {
    pub total_24h: u64,
    pub amount_24h: i64,
    /// Pending commissions regardless of age.
    pub pending: u64,
    pub paid_24h: u64,
    pub avg_amount: f64,
    pub last_hour: u64,
}

/// Query performance log over the trailing hour.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub queries_last_hour: u64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: i64,
    pub slow_queries: u64,
    pub unique_query_types: u64,
}

/// Storage footprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub database_size_bytes: u64,
    pub hierarchy_relationships: u64,
    pub active_cache_entries: u64,
}

/// One monitoring sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub collected_at: DateTime<Utc>,
    pub entities: EntityMetrics,
    pub transactions: TransactionMetrics,
    pub commissions: CommissionMetrics,
    pub performance: PerformanceMetrics,
    pub system: SystemMetrics,
}

impl Metrics {
    /// An all-zero sample taken at `collected_at`.
    pub fn empty(collected_at: DateTime<Utc>) -> Self {
        Self {
            collected_at,
            entities: EntityMetrics::default(),
            transactions: TransactionMetrics::default(),
            commissions: CommissionMetrics::default(),
            performance: PerformanceMetrics::default(),
            system: SystemMetrics::default(),
        }
    }

    /// Transactions per second over the trailing hour.
    pub fn throughput_per_second(&self) -> f64 {
        self.transactions.last_hour as f64 / 3600.0
    }
}

fn cents(amount: i64) -> String {
    format!("{}.{:02}", amount / 100, (amount % 100).abs())
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== FATURE STATUS REPORT ===")?;
        writeln!(f, "Collected at: {}", self.collected_at.to_rfc3339())?;
        writeln!(f)?;
        writeln!(f, "AFFILIATES")?;
        writeln!(f, "- total: {}", self.entities.total)?;
        writeln!(f, "- active: {}", self.entities.active)?;
        writeln!(f, "- with referrals: {}", self.entities.with_referrals)?;
        writeln!(f, "- max level: {}", self.entities.max_level)?;
        writeln!(f, "- network size: {}", self.entities.total_network_size)?;
        writeln!(f)?;
        writeln!(f, "TRANSACTIONS (24h)")?;
        writeln!(f, "- count: {}", self.transactions.count_24h)?;
        writeln!(f, "- volume: {}", cents(self.transactions.volume_24h))?;
        writeln!(f, "- average: {:.2}", self.transactions.avg_amount / 100.0)?;
        writeln!(f, "- last hour: {}", self.transactions.last_hour)?;
        writeln!(f)?;
        writeln!(f, "COMMISSIONS")?;
        writeln!(f, "- created (24h): {}", self.commissions.total_24h)?;
        writeln!(f, "- amount (24h): {}", cents(self.commissions.amount_24h))?;
        writeln!(f, "- pending: {}", self.commissions.pending)?;
        writeln!(f, "- paid (24h): {}", self.commissions.paid_24h)?;
        writeln!(f)?;
        writeln!(f, "PERFORMANCE (1h)")?;
        writeln!(f, "- queries: {}", self.performance.queries_last_hour)?;
        writeln!(f, "- avg duration: {:.1}ms", self.performance.avg_duration_ms)?;
        writeln!(f, "- slow queries: {}", self.performance.slow_queries)?;
        writeln!(f)?;
        writeln!(f, "SYSTEM")?;
        writeln!(
            f,
            "- database size: {:.2} GB",
            self.system.database_size_bytes as f64 / 1024.0 / 1024.0 / 1024.0
        )?;
        writeln!(f, "- relationships: {}", self.system.hierarchy_relationships)?;
        write!(f, "- active cache entries: {}", self.system.active_cache_entries)
    }
}

/// Collects one [`Metrics`] sample per call.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    slow_query_ms: u64,
}

impl MetricsCollector {
    pub fn new(slow_query_ms: u64) -> Self {
        Self { slow_query_ms }
    }

    pub fn collect(
        &self,
        store: &mut dyn Store,
        now: DateTime<Utc>,
    ) -> Result<Metrics, StoreError> {
        let window = MetricsWindow {
            now,
            slow_query_ms: self.slow_query_ms,
        };
        let metrics = store.collect_metrics(&window)?;
        tracing::debug!(
            entities = metrics.entities.total,
            transactions_24h = metrics.transactions.count_24h,
            pending_commissions = metrics.commissions.pending,
            slow_queries = metrics.performance.slow_queries,
            database_size_bytes = metrics.system.database_size_bytes,
            "metrics collected"
        );
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput() {
        let mut metrics = Metrics::empty(Utc::now());
        metrics.transactions.last_hour = 7200;
        assert_eq!(metrics.throughput_per_second(), 2.0);
    }

    #[test]
    fn test_report_formats_cents() {
        let mut metrics = Metrics::empty(Utc::now());
        metrics.transactions.volume_24h = 123_456;
        metrics.commissions.pending = 42;
        let report = metrics.to_string();
        assert!(report.contains("- volume: 1234.56"));
        assert!(report.contains("- pending: 42"));
    }
}
