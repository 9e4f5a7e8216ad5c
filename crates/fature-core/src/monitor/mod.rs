//! Periodic health monitoring and alerting.
//!
//! Each cycle collects a [`Metrics`] sample, evaluates thresholds into
//! [`Alert`]s, dispatches them through a [`Notifier`] subject to a per-kind
//! cooldown, and logs a status report. Cycle state lives in an explicit
//! [`AlertState`] value.

pub mod alert;
pub mod metrics;
pub mod notifier;
pub mod runner;

use thiserror::Error;

use crate::error::StoreError;

pub use alert::{Alert, AlertEvaluator, AlertKind, AlertLevel, AlertState};
pub use metrics::{
    CommissionMetrics, EntityMetrics, Metrics, MetricsCollector, PerformanceMetrics,
    SystemMetrics, TransactionMetrics,
};
pub use notifier::{notifier_for, LogNotifier, Notifier, WebhookNotifier, WebhookPayload};
pub use runner::{CycleOutcome, Monitor};

/// A monitoring cycle could not complete.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("metrics collection failed: {0}")]
    Collect(#[from] StoreError),
}

/// Alert delivery failures. Logged, never fatal to the loop.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook responded with status {status}")]
    Status { status: u16 },

    #[error("webhook transport error: {0}")]
    Transport(String),

    #[error("failed to encode alert payload: {0}")]
    Encode(#[from] serde_json::Error),
}
