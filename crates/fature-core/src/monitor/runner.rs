//! The monitoring loop.

use std::sync::mpsc::{Receiver, RecvTimeoutError};

use chrono::{DateTime, Utc};

use super::{
    notifier_for, Alert, AlertEvaluator, AlertKind, AlertState, Metrics, MetricsCollector,
    MonitorError, Notifier,
};
use crate::config::MonitorConfig;
use crate::store::Store;

/// Result of one monitoring cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub metrics: Metrics,
    pub alerts: Vec<Alert>,
    /// Kinds delivered by the notifier this cycle.
    pub dispatched: Vec<AlertKind>,
    /// Kinds skipped because they were still cooling down.
    pub suppressed: Vec<AlertKind>,
    /// Kinds whose delivery failed. Retried next cycle.
    pub failed: Vec<AlertKind>,
    /// State to feed into the next cycle.
    pub next_state: AlertState,
}

impl CycleOutcome {
    pub fn is_healthy(&self) -> bool {
        self.alerts.is_empty()
    }
}

/// Collects metrics, raises alerts and reports status on an interval.
pub struct Monitor {
    config: MonitorConfig,
    collector: MetricsCollector,
    evaluator: AlertEvaluator,
    notifier: Box<dyn Notifier>,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        let notifier = notifier_for(&config);
        Self {
            collector: MetricsCollector::new(config.thresholds.slow_query_ms),
            evaluator: AlertEvaluator::new(config.thresholds.clone()),
            notifier,
            config,
        }
    }

    /// Replace the notifier chosen from the configuration.
    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Run one cycle at `now` against the state left by the previous one.
    ///
    /// A collection failure leaves `state` untouched; the caller keeps using
    /// it for the next attempt.
    pub fn run_cycle(
        &self,
        store: &mut dyn Store,
        state: &AlertState,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, MonitorError> {
        let metrics = self.collector.collect(store, now)?;
        let alerts = self.evaluator.evaluate(&metrics, state.previous.as_ref());

        let cooldown = self.config.alert_cooldown();
        let mut next_state = state.clone();
        let mut dispatched = Vec::new();
        let mut suppressed = Vec::new();
        let mut failed = Vec::new();

        for alert in &alerts {
            if next_state.in_cooldown(alert.kind, now, cooldown) {
                tracing::debug!(kind = %alert.kind, "alert suppressed by cooldown");
                suppressed.push(alert.kind);
                continue;
            }
            match self.notifier.notify(alert) {
                Ok(()) => {
                    tracing::info!(
                        kind = %alert.kind,
                        level = %alert.level,
                        notifier = self.notifier.name(),
                        "alert sent"
                    );
                    next_state.record_delivery(alert.kind, now);
                    dispatched.push(alert.kind);
                }
                Err(err) => {
                    tracing::error!(
                        kind = %alert.kind,
                        notifier = self.notifier.name(),
                        error = %err,
                        "alert delivery failed"
                    );
                    failed.push(alert.kind);
                }
            }
        }

        tracing::info!("\n{metrics}");
        if alerts.is_empty() {
            tracing::info!("system healthy");
        } else {
            tracing::warn!(alerts = alerts.len(), "thresholds exceeded");
        }

        next_state.previous = Some(metrics.clone());
        Ok(CycleOutcome {
            metrics,
            alerts,
            dispatched,
            suppressed,
            failed,
            next_state,
        })
    }

    /// A single cycle from a fresh state.
    pub fn run_once(&self, store: &mut dyn Store) -> Result<CycleOutcome, MonitorError> {
        self.run_cycle(store, &AlertState::new(), Utc::now())
    }

    /// Run cycles until `shutdown` receives a message or its sender is
    /// dropped. Failed cycles are logged and retried after the error backoff.
    pub fn run_continuous(&self, store: &mut dyn Store, shutdown: &Receiver<()>) -> AlertState {
        tracing::info!(
            interval_secs = self.config.interval_secs,
            notifier = self.notifier.name(),
            "continuous monitoring started"
        );
        let mut state = AlertState::new();
        loop {
            let wait = match self.run_cycle(store, &state, Utc::now()) {
                Ok(outcome) => {
                    state = outcome.next_state;
                    self.config.interval()
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        backoff_secs = self.config.error_backoff_secs,
                        "monitoring cycle failed"
                    );
                    self.config.error_backoff()
                }
            };
            match shutdown.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::info!("monitoring stopped");
        state
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("config", &self.config)
            .field("notifier", &self.notifier.name())
            .finish()
    }
}
