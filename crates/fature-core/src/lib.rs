//! Fature core - migration, hierarchy indexing, validation, rollback and
//! monitoring for the affiliate store.
//!
//! Components never talk to a database directly; they borrow a
//! [`Store`](store::Store) for the duration of an operation.

pub mod config;
pub mod entity;
pub mod error;
pub mod hierarchy;
pub mod migration;
pub mod monitor;
pub mod registry;
pub mod rollback;
pub mod store;
pub mod validation;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{
    AlertThresholds, Config, ConfigError, DatabaseConfig, MigrationConfig, MonitorConfig,
    RollbackConfig, ValidationConfig,
};
pub use entity::{
    Entity, EntityId, EntityStatus, HierarchyCounters, HierarchyEdge, MonetaryTotals,
    ParentLink, RecordViolation, SourceBounds,
};
pub use error::{Error, Result, StoreError};
pub use hierarchy::{
    ClosureStrategy, HierarchyIndexBuilder, InProcessClosure, IndexStats, StoreClosure,
};
pub use migration::{
    BatchMigrator, BatchResult, MigrationError, MigrationPipeline, MigrationReport,
    PipelineReport,
};
pub use monitor::{
    Alert, AlertEvaluator, AlertKind, AlertLevel, AlertState, CycleOutcome, LogNotifier,
    Metrics, MetricsCollector, Monitor, MonitorError, Notifier, NotifyError, WebhookNotifier,
    WebhookPayload,
};
pub use rollback::{
    BackupManager, BackupReport, HealthCheck, HealthReport, RollbackError, RollbackOrchestrator,
    RollbackOutcome, RollbackReport, RollbackStep, StepRecord, StepStatus,
};
pub use store::{open_store, SqliteStore, Store};
pub use validation::{CheckResult, ConsistencyValidator, ValidationReport};

#[cfg(feature = "postgres")]
pub use store::PgStore;
