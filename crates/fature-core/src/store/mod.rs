//! Entity store access.
//!
//! The [`Store`] trait is the only way components touch the database. Its
//! methods are shaped after what the migration, validation, rollback and
//! monitoring components need, so each adapter owns its SQL dialect.
//!
//! Two adapters are provided:
//! - [`SqliteStore`]: the original schema is the `main` database and the
//!   derived schema is an attached database named `fature_v2`.
//! - `PgStore` (feature `postgres`): schemas `public` and `fature_v2` on one
//!   session connection.

pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

use chrono::{DateTime, Utc};

use crate::config::DatabaseConfig;
use crate::entity::{
    Entity, EntityId, HierarchyCounters, HierarchyEdge, ParentLink, SourceBounds,
};
use crate::error::StoreError;
use crate::monitor::Metrics;
use crate::registry::TableSpec;
use crate::rollback::StepRecord;

pub use sqlite::SqliteStore;

#[cfg(feature = "postgres")]
pub use postgres::PgStore;

/// A record the store refused inside an otherwise committed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub id: EntityId,
    pub reason: String,
}

/// Outcome of one batch transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWrite {
    pub inserted: u64,
    pub failures: Vec<RecordFailure>,
}

/// Aggregate view of the derived hierarchy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HierarchySummary {
    pub entities: u64,
    pub edges: u64,
    pub max_depth: u32,
}

/// Result of a snapshot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Snapshot created with this many rows.
    Created { rows: u64 },
    /// A snapshot already exists and was left untouched.
    AlreadyExists,
    /// The table to snapshot does not exist.
    SourceMissing,
}

/// A trigger defined in the derived schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRef {
    pub name: String,
    pub table: String,
}

/// Time window parameters for metrics collection.
#[derive(Debug, Clone, Copy)]
pub struct MetricsWindow {
    pub now: DateTime<Utc>,
    pub slow_query_ms: u64,
}

impl MetricsWindow {
    pub fn last_hour(&self) -> DateTime<Utc> {
        self.now - chrono::Duration::hours(1)
    }

    pub fn last_day(&self) -> DateTime<Utc> {
        self.now - chrono::Duration::hours(24)
    }
}

/// Query/execute capability against the original and derived schemas.
pub trait Store {
    /// Adapter name for logs.
    fn backend_name(&self) -> &'static str;

    // ---------------------------------------------------------------------
    // Derived schema lifecycle
    // ---------------------------------------------------------------------

    fn derived_schema_exists(&mut self) -> Result<bool, StoreError>;

    /// Create the derived schema and its tables if absent.
    fn create_derived_schema(&mut self) -> Result<(), StoreError>;

    /// Drop the derived schema and everything in it. Idempotent.
    fn drop_derived_schema(&mut self) -> Result<(), StoreError>;

    fn derived_triggers(&mut self) -> Result<Vec<TriggerRef>, StoreError>;

    fn drop_derived_trigger(&mut self, trigger: &TriggerRef) -> Result<(), StoreError>;

    // ---------------------------------------------------------------------
    // Migration
    // ---------------------------------------------------------------------

    /// Count and identifier range of the source entity table.
    fn source_bounds(&mut self) -> Result<SourceBounds, StoreError>;

    /// Source entities with `after < id <= up_to`, ordered by id.
    fn fetch_source_window(
        &mut self,
        after: EntityId,
        up_to: EntityId,
    ) -> Result<Vec<Entity>, StoreError>;

    /// Insert entities into the derived table in one transaction.
    ///
    /// Each insert runs under its own savepoint: a record the store rejects
    /// is rolled back alone and reported in [`BatchWrite::failures`]. An
    /// `Err` means the whole transaction was rolled back.
    fn insert_batch(&mut self, entities: &[Entity]) -> Result<BatchWrite, StoreError>;

    // ---------------------------------------------------------------------
    // Hierarchy index
    // ---------------------------------------------------------------------

    fn target_parent_links(&mut self) -> Result<Vec<ParentLink>, StoreError>;

    /// Replace the whole index with `edges` in one transaction.
    fn replace_hierarchy_index(&mut self, edges: &[HierarchyEdge]) -> Result<u64, StoreError>;

    /// Recompute the whole index with a store-side recursive query.
    fn rebuild_hierarchy_index(&mut self, max_depth: Option<u32>) -> Result<u64, StoreError>;

    /// Recompute direct-child count, network size and level from the index.
    fn refresh_hierarchy_counters(&mut self) -> Result<(), StoreError>;

    fn hierarchy_summary(&mut self) -> Result<HierarchySummary, StoreError>;

    fn hierarchy_edges(&mut self) -> Result<Vec<HierarchyEdge>, StoreError>;

    fn hierarchy_counters(
        &mut self,
        id: EntityId,
    ) -> Result<Option<HierarchyCounters>, StoreError>;

    // ---------------------------------------------------------------------
    // Validation (read-only)
    // ---------------------------------------------------------------------

    fn source_entity_count(&mut self) -> Result<u64, StoreError>;

    fn target_entity_count(&mut self) -> Result<u64, StoreError>;

    /// Target entities whose non-null parent is not a target entity.
    fn orphaned_entity_count(&mut self) -> Result<u64, StoreError>;

    /// Target entities whose stored direct-child counter disagrees with the
    /// number of target entities naming them as parent.
    fn referral_count_mismatches(&mut self) -> Result<u64, StoreError>;

    /// Index edges whose ancestor or descendant is not a target entity.
    fn orphaned_edge_count(&mut self) -> Result<u64, StoreError>;

    fn edges_at_level(&mut self, level: u32) -> Result<u64, StoreError>;

    fn active_target_count(&mut self) -> Result<u64, StoreError>;

    // ---------------------------------------------------------------------
    // Snapshots and restore
    // ---------------------------------------------------------------------

    /// Whether a table exists in the original schema.
    fn table_exists(&mut self, table: &'static str) -> Result<bool, StoreError>;

    /// Create the table's snapshot unless one already exists.
    fn create_snapshot(&mut self, table: &TableSpec) -> Result<SnapshotOutcome, StoreError>;

    /// Drop the table's snapshot. Returns whether one existed.
    fn drop_snapshot(&mut self, table: &TableSpec) -> Result<bool, StoreError>;

    /// Replace the rollback safety snapshot with the derived entity table.
    fn snapshot_derived_entities(&mut self) -> Result<u64, StoreError>;

    /// Delete the table's rows and reload them from its snapshot, atomically.
    fn restore_from_snapshot(&mut self, table: &TableSpec) -> Result<u64, StoreError>;

    /// Connection-scoped referential integrity switch.
    fn set_constraints_enabled(&mut self, enabled: bool) -> Result<(), StoreError>;

    // ---------------------------------------------------------------------
    // Rollback audit log
    // ---------------------------------------------------------------------

    fn ensure_rollback_log(&mut self) -> Result<(), StoreError>;

    /// Append one row and make it durable before returning.
    fn append_rollback_step(&mut self, record: &StepRecord) -> Result<(), StoreError>;

    /// Most recent rows first.
    fn recent_rollback_steps(&mut self, limit: u32) -> Result<Vec<StepRecord>, StoreError>;

    // ---------------------------------------------------------------------
    // Monitoring
    // ---------------------------------------------------------------------

    fn collect_metrics(&mut self, window: &MetricsWindow) -> Result<Metrics, StoreError>;
}

/// Open the store described by `config`.
pub fn open_store(config: &DatabaseConfig) -> Result<Box<dyn Store>, StoreError> {
    match config {
        DatabaseConfig::Sqlite { path, derived_path } => {
            let derived = derived_path
                .clone()
                .unwrap_or_else(|| sqlite::default_derived_path(path));
            Ok(Box::new(SqliteStore::open(path, derived)?))
        }
        #[cfg(feature = "postgres")]
        DatabaseConfig::Postgres {
            statement_timeout_ms,
            ..
        } => {
            let url = config
                .postgres_url()
                .ok_or_else(|| StoreError::Connection("missing postgres settings".into()))?;
            Ok(Box::new(PgStore::connect(&url, *statement_timeout_ms)?))
        }
        #[cfg(not(feature = "postgres"))]
        DatabaseConfig::Postgres { .. } => Err(StoreError::Connection(
            "postgres backend requires the `postgres` feature".to_string(),
        )),
    }
}

/// Quote an identifier that did not come from the table registry.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
