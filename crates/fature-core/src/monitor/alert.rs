//! Threshold evaluation and alert cooldown state.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::Metrics;
use crate::config::AlertThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlowQueries,
    CommissionBacklog,
    LowThroughput,
    DatabaseGrowth,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::SlowQueries => "slow_queries",
            AlertKind::CommissionBacklog => "commission_backlog",
            AlertKind::LowThroughput => "low_throughput",
            AlertKind::DatabaseGrowth => "database_growth",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A threshold breach found in one sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub message: String,
    pub observed: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}

/// Turns a metrics sample into alerts.
#[derive(Debug, Clone, Default)]
pub struct AlertEvaluator {
    thresholds: AlertThresholds,
}

impl AlertEvaluator {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    /// Evaluate `current`. Growth is only checked against a previous
    /// sample with a non-zero size.
    pub fn evaluate(&self, current: &Metrics, previous: Option<&Metrics>) -> Vec<Alert> {
        let t = &self.thresholds;
        let at = current.collected_at;
        let mut alerts = Vec::new();

        let slow = current.performance.slow_queries;
        if slow > t.max_slow_queries {
            alerts.push(Alert {
                kind: AlertKind::SlowQueries,
                level: AlertLevel::Warning,
                message: format!("{slow} slow queries in the last hour"),
                observed: slow as f64,
                threshold: t.max_slow_queries as f64,
                raised_at: at,
            });
        }

        let pending = current.commissions.pending;
        if pending > t.max_pending_commissions {
            let critical = t.max_pending_commissions.saturating_mul(t.critical_backlog_multiple);
            let level = if pending > critical {
                AlertLevel::Critical
            } else {
                AlertLevel::Warning
            };
            alerts.push(Alert {
                kind: AlertKind::CommissionBacklog,
                level,
                message: format!("{pending} commissions pending"),
                observed: pending as f64,
                threshold: t.max_pending_commissions as f64,
                raised_at: at,
            });
        }

        let throughput = current.throughput_per_second();
        if throughput < t.min_throughput_per_second {
            alerts.push(Alert {
                kind: AlertKind::LowThroughput,
                level: AlertLevel::Warning,
                message: format!("low throughput: {throughput:.2} transactions/second"),
                observed: throughput,
                threshold: t.min_throughput_per_second,
                raised_at: at,
            });
        }

        if let Some(previous) = previous {
            let before = previous.system.database_size_bytes;
            let now = current.system.database_size_bytes;
            if before > 0 {
                let growth = (now as f64 - before as f64) / before as f64;
                if growth > t.max_growth_ratio {
                    alerts.push(Alert {
                        kind: AlertKind::DatabaseGrowth,
                        level: AlertLevel::Warning,
                        message: format!(
                            "database grew {:.1}% since the last sample",
                            growth * 100.0
                        ),
                        observed: growth * 100.0,
                        threshold: t.max_growth_ratio * 100.0,
                        raised_at: at,
                    });
                }
            }
        }

        alerts
    }
}

/// State carried from one monitoring cycle to the next.
#[derive(Debug, Clone, Default)]
pub struct AlertState {
    /// Last successful delivery per alert kind.
    pub cooldowns: HashMap<AlertKind, DateTime<Utc>>,
    /// Sample of the previous successful cycle.
    pub previous: Option<Metrics>,
}

impl AlertState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `kind` was delivered less than `cooldown` before `now`.
    pub fn in_cooldown(&self, kind: AlertKind, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.cooldowns
            .get(&kind)
            .is_some_and(|last| now - *last < cooldown)
    }

    pub fn record_delivery(&mut self, kind: AlertKind, at: DateTime<Utc>) {
        self.cooldowns.insert(kind, at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A sample that raises nothing under default thresholds.
    fn quiet(at: DateTime<Utc>) -> Metrics {
        let mut metrics = Metrics::empty(at);
        metrics.transactions.last_hour = 3600 * 200;
        metrics.system.database_size_bytes = 1_000_000;
        metrics
    }

    #[test]
    fn test_quiet_sample_raises_nothing() {
        let now = Utc::now();
        let alerts = AlertEvaluator::default().evaluate(&quiet(now), Some(&quiet(now)));
        assert!(alerts.is_empty(), "{alerts:?}");
    }

    #[test]
    fn test_backlog_levels() {
        let evaluator = AlertEvaluator::default();
        let mut metrics = quiet(Utc::now());

        metrics.commissions.pending = 1000;
        assert!(evaluator.evaluate(&metrics, None).is_empty());

        metrics.commissions.pending = 1001;
        assert_eq!(evaluator.evaluate(&metrics, None)[0].level, AlertLevel::Warning);

        metrics.commissions.pending = 10_001;
        let alert = &evaluator.evaluate(&metrics, None)[0];
        assert_eq!(alert.kind, AlertKind::CommissionBacklog);
        assert_eq!(alert.level, AlertLevel::Critical);
        assert_eq!(alert.threshold, 1000.0);
    }

    #[test]
    fn test_slow_queries_and_throughput() {
        let mut metrics = quiet(Utc::now());
        metrics.performance.slow_queries = 11;
        metrics.transactions.last_hour = 3600;

        let kinds: Vec<_> = AlertEvaluator::default()
            .evaluate(&metrics, None)
            .into_iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(kinds, vec![AlertKind::SlowQueries, AlertKind::LowThroughput]);
    }

    #[test]
    fn test_growth_needs_previous_non_zero_sample() {
        let evaluator = AlertEvaluator::default();
        let now = Utc::now();
        let mut current = quiet(now);
        current.system.database_size_bytes = 2_000_000;

        assert!(evaluator.evaluate(&current, None).is_empty());

        let mut empty = quiet(now);
        empty.system.database_size_bytes = 0;
        assert!(evaluator.evaluate(&current, Some(&empty)).is_empty());

        let alerts = evaluator.evaluate(&current, Some(&quiet(now)));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::DatabaseGrowth);
        assert_eq!(alerts[0].observed, 100.0);
    }

    #[test]
    fn test_cooldown_window() {
        let t0 = Utc::now();
        let mut state = AlertState::new();
        let cooldown = Duration::minutes(15);

        assert!(!state.in_cooldown(AlertKind::SlowQueries, t0, cooldown));
        state.record_delivery(AlertKind::SlowQueries, t0);
        assert!(state.in_cooldown(AlertKind::SlowQueries, t0 + Duration::minutes(14), cooldown));
        assert!(!state.in_cooldown(AlertKind::SlowQueries, t0 + Duration::minutes(15), cooldown));
        assert!(!state.in_cooldown(AlertKind::LowThroughput, t0, cooldown));
    }
}
