//! SQLite store adapter.
//!
//! The original schema is the connection's `main` database. The derived
//! schema is a second database attached under [`DERIVED_SCHEMA`]; it is
//! file backed next to the main database, or in-memory for
//! [`SqliteStore::open_in_memory`].

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::{Path, PathBuf};

use super::{
    quote_ident, BatchWrite, HierarchySummary, MetricsWindow, RecordFailure, SnapshotOutcome,
    Store, TriggerRef,
};
use crate::entity::{
    Entity, EntityId, HierarchyCounters, HierarchyEdge, MonetaryTotals, ParentLink, SourceBounds,
};
use crate::error::StoreError;
use crate::monitor::{
    CommissionMetrics, EntityMetrics, Metrics, PerformanceMetrics, SystemMetrics,
    TransactionMetrics,
};
use crate::registry::{
    TableSpec, DERIVED_COMMISSIONS, DERIVED_ENTITIES, DERIVED_SCHEMA, DERIVED_TRANSACTIONS,
    HIERARCHY_INDEX, PERFORMANCE_CACHE, PRIMARY_TABLE, QUERY_PERFORMANCE_LOG,
    ROLLBACK_LOG, ROLLBACK_SAFETY_SNAPSHOT,
};
use crate::rollback::StepRecord;

/// Default location of the derived database for a main database at `path`.
pub fn default_derived_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".");
    os.push(DERIVED_SCHEMA);
    PathBuf::from(os)
}

/// Columns read from the source entity table, in [`entity_from_row`] order.
const ENTITY_COLUMNS: &str = "affiliate_id, parent_affiliate_id, external_id, name, status, \
     registration_date, total_deposits, total_bets, total_withdrawals, total_cpa_earned, \
     total_rev_earned, total_commissions_paid, created_at";

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    conn: Connection,
    /// `None` attaches the derived schema in memory.
    derived_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open a file-backed store. The derived database is attached if its
    /// file already exists.
    pub fn open(path: impl AsRef<Path>, derived_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        let mut store = Self {
            conn,
            derived_path: Some(derived_path.into()),
        };
        store.configure()?;
        if store.derived_path.as_ref().is_some_and(|p| p.exists()) {
            store.attach_derived()?;
        }
        tracing::debug!(path = %path.as_ref().display(), "sqlite store opened");
        Ok(store)
    }

    /// Open an in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self {
            conn,
            derived_path: None,
        };
        store.configure()?;
        Ok(store)
    }

    fn configure(&mut self) -> Result<(), StoreError> {
        self.conn.pragma_update(None, "foreign_keys", true)?;
        Ok(())
    }

    /// Create the legacy original-schema tables if absent.
    ///
    /// Production databases already carry these; fresh installs and tests
    /// need them created.
    pub fn bootstrap_source_schema(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS main.{affiliates} (
                affiliate_id INTEGER PRIMARY KEY,
                parent_affiliate_id INTEGER,
                external_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                registration_date TEXT,
                total_deposits INTEGER NOT NULL DEFAULT 0,
                total_bets INTEGER NOT NULL DEFAULT 0,
                total_withdrawals INTEGER NOT NULL DEFAULT 0,
                total_cpa_earned INTEGER NOT NULL DEFAULT 0,
                total_rev_earned INTEGER NOT NULL DEFAULT 0,
                total_commissions_paid INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS main.transactions (
                transaction_id INTEGER PRIMARY KEY,
                affiliate_id INTEGER NOT NULL REFERENCES {affiliates}(affiliate_id),
                amount INTEGER NOT NULL,
                transaction_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS main.commissions (
                commission_id INTEGER PRIMARY KEY,
                affiliate_id INTEGER NOT NULL REFERENCES {affiliates}(affiliate_id),
                commission_amount INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
            affiliates = PRIMARY_TABLE.name,
        ))?;
        Ok(())
    }

    /// Insert a row into the source entity table.
    pub fn insert_source_entity(&mut self, entity: &Entity) -> Result<(), StoreError> {
        self.conn.execute(
            &format!(
                "INSERT INTO main.{} ({ENTITY_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                PRIMARY_TABLE.name
            ),
            params![
                entity.id,
                entity.parent_id,
                entity.external_id,
                entity.name,
                entity.status,
                entity.registered_at,
                entity.totals.deposits,
                entity.totals.bets,
                entity.totals.withdrawals,
                entity.totals.cpa_earned,
                entity.totals.rev_earned,
                entity.totals.commissions_paid,
                entity.created_at,
            ],
        )?;
        Ok(())
    }

    /// Whether foreign key enforcement is on for this connection.
    pub fn foreign_keys_enabled(&self) -> Result<bool, StoreError> {
        let enabled: i64 = self
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        Ok(enabled != 0)
    }

    /// Raw connection, for fixtures that populate tables outside the
    /// store's vocabulary.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn is_attached(&self) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pragma_database_list WHERE name = ?1",
            params![DERIVED_SCHEMA],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn attach_derived(&mut self) -> Result<(), StoreError> {
        let target = match &self.derived_path {
            Some(path) => path.to_string_lossy().into_owned(),
            None => ":memory:".to_string(),
        };
        self.conn.execute(
            &format!("ATTACH DATABASE ?1 AS {DERIVED_SCHEMA}"),
            params![target],
        )?;
        tracing::debug!(target = %target, schema = DERIVED_SCHEMA, "derived database attached");
        Ok(())
    }

    fn require_derived(&self) -> Result<(), StoreError> {
        if self.is_attached()? {
            Ok(())
        } else {
            Err(StoreError::MissingSchema(DERIVED_SCHEMA))
        }
    }

    fn count(&self, sql: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn main_table_exists(&self, name: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM main.sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn schema_size_bytes(&self, schema: &str) -> Result<u64, StoreError> {
        let pages: i64 = self
            .conn
            .query_row(&format!("PRAGMA {schema}.page_count"), [], |row| row.get(0))?;
        let page_size: i64 = self
            .conn
            .query_row(&format!("PRAGMA {schema}.page_size"), [], |row| row.get(0))?;
        Ok((pages * page_size).max(0) as u64)
    }
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        external_id: row.get(2)?,
        name: row.get(3)?,
        status: row.get(4)?,
        registered_at: row.get(5)?,
        totals: MonetaryTotals {
            deposits: row.get(6)?,
            bets: row.get(7)?,
            withdrawals: row.get(8)?,
            cpa_earned: row.get(9)?,
            rev_earned: row.get(10)?,
            commissions_paid: row.get(11)?,
        },
        created_at: row.get(12)?,
    })
}

fn get_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    row.get::<_, i64>(idx).map(|value| value.max(0) as u64)
}

/// Whether an insert error concerns only the record being inserted.
fn is_record_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => matches!(
            failure.code,
            ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig
        ),
        rusqlite::Error::ToSqlConversionFailure(_) => true,
        _ => false,
    }
}

impl Store for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn derived_schema_exists(&mut self) -> Result<bool, StoreError> {
        if !self.is_attached()? {
            return Ok(false);
        }
        let tables = self.count(&format!(
            "SELECT COUNT(*) FROM {DERIVED_SCHEMA}.sqlite_master WHERE type = 'table'"
        ))?;
        Ok(tables > 0)
    }

    fn create_derived_schema(&mut self) -> Result<(), StoreError> {
        if !self.is_attached()? {
            self.attach_derived()?;
        }
        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {s}.{entities} (
                affiliate_id INTEGER PRIMARY KEY,
                parent_affiliate_id INTEGER,
                external_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('active', 'inactive', 'suspended', 'pending', 'blocked')),
                registration_date TEXT,
                total_deposits INTEGER NOT NULL DEFAULT 0,
                total_bets INTEGER NOT NULL DEFAULT 0,
                total_withdrawals INTEGER NOT NULL DEFAULT 0,
                total_cpa_earned INTEGER NOT NULL DEFAULT 0,
                total_rev_earned INTEGER NOT NULL DEFAULT 0,
                total_commissions_paid INTEGER NOT NULL DEFAULT 0,
                direct_referrals_count INTEGER NOT NULL DEFAULT 0,
                total_network_size INTEGER NOT NULL DEFAULT 0,
                hierarchy_level INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT
            );
            CREATE INDEX IF NOT EXISTS {s}.idx_{entities}_parent
                ON {entities}(parent_affiliate_id);
            CREATE INDEX IF NOT EXISTS {s}.idx_{entities}_status ON {entities}(status);

            CREATE TABLE IF NOT EXISTS {s}.{index} (
                ancestor_id INTEGER NOT NULL,
                descendant_id INTEGER NOT NULL,
                level_distance INTEGER NOT NULL CHECK (level_distance >= 1),
                PRIMARY KEY (ancestor_id, descendant_id)
            );
            CREATE INDEX IF NOT EXISTS {s}.idx_{index}_descendant ON {index}(descendant_id);
            CREATE INDEX IF NOT EXISTS {s}.idx_{index}_level ON {index}(level_distance);

            CREATE TABLE IF NOT EXISTS {s}.{transactions} (
                transaction_id INTEGER PRIMARY KEY,
                affiliate_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                commission_processed INTEGER NOT NULL DEFAULT 0,
                transaction_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {s}.{commissions} (
                commission_id INTEGER PRIMARY KEY,
                affiliate_id INTEGER NOT NULL,
                commission_amount INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {s}.{query_log} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                query_type TEXT NOT NULL,
                query_duration_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {s}.{cache} (
                cache_key TEXT PRIMARY KEY,
                payload TEXT,
                expires_at TEXT NOT NULL
            );

            CREATE TRIGGER IF NOT EXISTS {s}.trg_{entities}_touch
                AFTER UPDATE OF status, name ON {entities}
            BEGIN
                UPDATE {entities} SET updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
                WHERE affiliate_id = NEW.affiliate_id;
            END;
            "#,
            s = DERIVED_SCHEMA,
            entities = DERIVED_ENTITIES,
            index = HIERARCHY_INDEX,
            transactions = DERIVED_TRANSACTIONS,
            commissions = DERIVED_COMMISSIONS,
            query_log = QUERY_PERFORMANCE_LOG,
            cache = PERFORMANCE_CACHE,
        ))?;
        tracing::info!(schema = DERIVED_SCHEMA, "derived schema ready");
        Ok(())
    }

    fn drop_derived_schema(&mut self) -> Result<(), StoreError> {
        if !self.is_attached()? {
            return Ok(());
        }
        let tables: Vec<String> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT name FROM {DERIVED_SCHEMA}.sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'"
            ))?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for table in &tables {
            self.conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {DERIVED_SCHEMA}.{}",
                quote_ident(table)
            ))?;
        }

        self.conn.flush_prepared_statement_cache();
        self.conn
            .execute_batch(&format!("DETACH DATABASE {DERIVED_SCHEMA}"))?;
        if let Some(path) = &self.derived_path {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        tracing::info!(schema = DERIVED_SCHEMA, tables = tables.len(), "derived schema dropped");
        Ok(())
    }

    fn derived_triggers(&mut self) -> Result<Vec<TriggerRef>, StoreError> {
        if !self.is_attached()? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT name, tbl_name FROM {DERIVED_SCHEMA}.sqlite_master \
             WHERE type = 'trigger' ORDER BY name"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(TriggerRef {
                name: row.get(0)?,
                table: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn drop_derived_trigger(&mut self, trigger: &TriggerRef) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS {DERIVED_SCHEMA}.{}",
            quote_ident(&trigger.name)
        ))?;
        Ok(())
    }

    fn source_bounds(&mut self) -> Result<SourceBounds, StoreError> {
        let bounds = self.conn.query_row(
            &format!(
                "SELECT COUNT(*), MIN(affiliate_id), MAX(affiliate_id) FROM main.{}",
                PRIMARY_TABLE.name
            ),
            [],
            |row| {
                Ok(SourceBounds {
                    count: get_u64(row, 0)?,
                    min_id: row.get(1)?,
                    max_id: row.get(2)?,
                })
            },
        )?;
        Ok(bounds)
    }

    fn fetch_source_window(
        &mut self,
        after: EntityId,
        up_to: EntityId,
    ) -> Result<Vec<Entity>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {ENTITY_COLUMNS} FROM main.{} \
             WHERE affiliate_id > ?1 AND affiliate_id <= ?2 ORDER BY affiliate_id",
            PRIMARY_TABLE.name
        ))?;
        let rows = stmt.query_map(params![after, up_to], entity_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn insert_batch(&mut self, entities: &[Entity]) -> Result<BatchWrite, StoreError> {
        let sql = format!(
            "INSERT INTO {DERIVED_SCHEMA}.{DERIVED_ENTITIES} ({ENTITY_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        );
        let mut write = BatchWrite::default();
        let mut tx = self.conn.transaction()?;

        for entity in entities {
            let sp = tx.savepoint()?;
            let result = sp.execute(
                &sql,
                params![
                    entity.id,
                    entity.parent_id,
                    entity.external_id,
                    entity.name,
                    entity.status,
                    entity.registered_at,
                    entity.totals.deposits,
                    entity.totals.bets,
                    entity.totals.withdrawals,
                    entity.totals.cpa_earned,
                    entity.totals.rev_earned,
                    entity.totals.commissions_paid,
                    entity.created_at,
                ],
            );
            match result {
                Ok(_) => {
                    sp.commit()?;
                    write.inserted += 1;
                }
                Err(err) if is_record_error(&err) => {
                    // Dropping the savepoint rolls back this record only.
                    drop(sp);
                    write.failures.push(RecordFailure {
                        id: entity.id,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        tx.commit()?;
        Ok(write)
    }

    fn target_parent_links(&mut self) -> Result<Vec<ParentLink>, StoreError> {
        self.require_derived()?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT affiliate_id, parent_affiliate_id FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES} \
             ORDER BY affiliate_id"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(ParentLink {
                id: row.get(0)?,
                parent_id: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn replace_hierarchy_index(&mut self, edges: &[HierarchyEdge]) -> Result<u64, StoreError> {
        self.require_derived()?;
        let tx = self.conn.transaction()?;
        tx.execute(&format!("DELETE FROM {DERIVED_SCHEMA}.{HIERARCHY_INDEX}"), [])?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {DERIVED_SCHEMA}.{HIERARCHY_INDEX} \
                 (ancestor_id, descendant_id, level_distance) VALUES (?1, ?2, ?3)"
            ))?;
            for edge in edges {
                stmt.execute(params![edge.ancestor_id, edge.descendant_id, edge.level_distance])?;
            }
        }
        tx.commit()?;
        Ok(edges.len() as u64)
    }

    fn rebuild_hierarchy_index(&mut self, max_depth: Option<u32>) -> Result<u64, StoreError> {
        self.require_derived()?;
        let tx = self.conn.transaction()?;
        tx.execute(&format!("DELETE FROM {DERIVED_SCHEMA}.{HIERARCHY_INDEX}"), [])?;
        let inserted = tx.execute(
            &format!(
                r#"
                WITH RECURSIVE closure(ancestor_id, descendant_id, level_distance) AS (
                    SELECT p.affiliate_id, c.affiliate_id, 1
                    FROM {s}.{e} c
                    JOIN {s}.{e} p ON p.affiliate_id = c.parent_affiliate_id
                    WHERE c.affiliate_id <> p.affiliate_id
                    UNION
                    SELECT cl.ancestor_id, c.affiliate_id, cl.level_distance + 1
                    FROM closure cl
                    JOIN {s}.{e} c ON c.parent_affiliate_id = cl.descendant_id
                    WHERE (?1 IS NULL OR cl.level_distance < ?1)
                      AND c.affiliate_id <> cl.ancestor_id
                )
                INSERT INTO {s}.{i} (ancestor_id, descendant_id, level_distance)
                SELECT ancestor_id, descendant_id, MIN(level_distance)
                FROM closure
                GROUP BY ancestor_id, descendant_id
                "#,
                s = DERIVED_SCHEMA,
                e = DERIVED_ENTITIES,
                i = HIERARCHY_INDEX,
            ),
            params![max_depth.map(i64::from)],
        )?;
        tx.commit()?;
        Ok(inserted as u64)
    }

    fn refresh_hierarchy_counters(&mut self) -> Result<(), StoreError> {
        self.require_derived()?;
        self.conn.execute(
            &format!(
                r#"
                UPDATE {s}.{e} AS a SET
                    direct_referrals_count = (
                        SELECT COUNT(*) FROM {s}.{i} h
                        WHERE h.ancestor_id = a.affiliate_id AND h.level_distance = 1
                    ),
                    total_network_size = (
                        SELECT COUNT(*) FROM {s}.{i} h WHERE h.ancestor_id = a.affiliate_id
                    ),
                    hierarchy_level = (
                        SELECT COALESCE(MAX(h.level_distance), 0) FROM {s}.{i} h
                        WHERE h.descendant_id = a.affiliate_id
                    )
                "#,
                s = DERIVED_SCHEMA,
                e = DERIVED_ENTITIES,
                i = HIERARCHY_INDEX,
            ),
            [],
        )?;
        Ok(())
    }

    fn hierarchy_summary(&mut self) -> Result<HierarchySummary, StoreError> {
        self.require_derived()?;
        let summary = self.conn.query_row(
            &format!(
                "SELECT (SELECT COUNT(*) FROM {s}.{e}), COUNT(*), COALESCE(MAX(level_distance), 0) \
                 FROM {s}.{i}",
                s = DERIVED_SCHEMA,
                e = DERIVED_ENTITIES,
                i = HIERARCHY_INDEX,
            ),
            [],
            |row| {
                Ok(HierarchySummary {
                    entities: get_u64(row, 0)?,
                    edges: get_u64(row, 1)?,
                    max_depth: row.get(2)?,
                })
            },
        )?;
        Ok(summary)
    }

    fn hierarchy_edges(&mut self) -> Result<Vec<HierarchyEdge>, StoreError> {
        self.require_derived()?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT ancestor_id, descendant_id, level_distance FROM {DERIVED_SCHEMA}.{HIERARCHY_INDEX} \
             ORDER BY ancestor_id, descendant_id"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(HierarchyEdge::new(row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn hierarchy_counters(
        &mut self,
        id: EntityId,
    ) -> Result<Option<HierarchyCounters>, StoreError> {
        self.require_derived()?;
        let counters = self
            .conn
            .query_row(
                &format!(
                    "SELECT direct_referrals_count, total_network_size, hierarchy_level \
                     FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES} WHERE affiliate_id = ?1"
                ),
                params![id],
                |row| {
                    Ok(HierarchyCounters {
                        direct_referrals: row.get(0)?,
                        network_size: row.get(1)?,
                        hierarchy_level: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(counters)
    }

    fn source_entity_count(&mut self) -> Result<u64, StoreError> {
        self.count(&format!("SELECT COUNT(*) FROM main.{}", PRIMARY_TABLE.name))
    }

    fn target_entity_count(&mut self) -> Result<u64, StoreError> {
        self.require_derived()?;
        self.count(&format!(
            "SELECT COUNT(*) FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES}"
        ))
    }

    fn orphaned_entity_count(&mut self) -> Result<u64, StoreError> {
        self.require_derived()?;
        self.count(&format!(
            r#"
            SELECT COUNT(*) FROM {s}.{e} a
            WHERE a.parent_affiliate_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM {s}.{e} p WHERE p.affiliate_id = a.parent_affiliate_id
              )
            "#,
            s = DERIVED_SCHEMA,
            e = DERIVED_ENTITIES,
        ))
    }

    fn referral_count_mismatches(&mut self) -> Result<u64, StoreError> {
        self.require_derived()?;
        self.count(&format!(
            r#"
            SELECT COUNT(*) FROM (
                SELECT a.affiliate_id, a.direct_referrals_count, COUNT(c.affiliate_id) AS actual
                FROM {s}.{e} a
                LEFT JOIN {s}.{e} c ON c.parent_affiliate_id = a.affiliate_id
                GROUP BY a.affiliate_id, a.direct_referrals_count
            ) counts
            WHERE counts.direct_referrals_count <> counts.actual
            "#,
            s = DERIVED_SCHEMA,
            e = DERIVED_ENTITIES,
        ))
    }

    fn orphaned_edge_count(&mut self) -> Result<u64, StoreError> {
        self.require_derived()?;
        self.count(&format!(
            r#"
            SELECT COUNT(*) FROM {s}.{i} h
            WHERE NOT EXISTS (SELECT 1 FROM {s}.{e} a WHERE a.affiliate_id = h.ancestor_id)
               OR NOT EXISTS (SELECT 1 FROM {s}.{e} d WHERE d.affiliate_id = h.descendant_id)
            "#,
            s = DERIVED_SCHEMA,
            e = DERIVED_ENTITIES,
            i = HIERARCHY_INDEX,
        ))
    }

    fn edges_at_level(&mut self, level: u32) -> Result<u64, StoreError> {
        self.require_derived()?;
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {DERIVED_SCHEMA}.{HIERARCHY_INDEX} WHERE level_distance = ?1"
            ),
            params![level],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn active_target_count(&mut self) -> Result<u64, StoreError> {
        self.require_derived()?;
        self.count(&format!(
            "SELECT COUNT(*) FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES} WHERE status = 'active'"
        ))
    }

    fn table_exists(&mut self, table: &'static str) -> Result<bool, StoreError> {
        self.main_table_exists(table)
    }

    fn create_snapshot(&mut self, table: &TableSpec) -> Result<SnapshotOutcome, StoreError> {
        if self.main_table_exists(table.snapshot)? {
            return Ok(SnapshotOutcome::AlreadyExists);
        }
        if !self.main_table_exists(table.name)? {
            return Ok(SnapshotOutcome::SourceMissing);
        }
        self.conn.execute_batch(&format!(
            "CREATE TABLE main.{} AS SELECT * FROM main.{}",
            table.snapshot, table.name
        ))?;
        let rows = self.count(&format!("SELECT COUNT(*) FROM main.{}", table.snapshot))?;
        Ok(SnapshotOutcome::Created { rows })
    }

    fn drop_snapshot(&mut self, table: &TableSpec) -> Result<bool, StoreError> {
        if !self.main_table_exists(table.snapshot)? {
            return Ok(false);
        }
        self.conn
            .execute_batch(&format!("DROP TABLE main.{}", table.snapshot))?;
        Ok(true)
    }

    fn snapshot_derived_entities(&mut self) -> Result<u64, StoreError> {
        self.require_derived()?;
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS main.{snap}; \
             CREATE TABLE main.{snap} AS SELECT * FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES};",
            snap = ROLLBACK_SAFETY_SNAPSHOT,
        ))?;
        let rows: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM main.{ROLLBACK_SAFETY_SNAPSHOT}"),
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(rows.max(0) as u64)
    }

    fn restore_from_snapshot(&mut self, table: &TableSpec) -> Result<u64, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(&format!("DELETE FROM main.{}", table.name), [])?;
        tx.execute(
            &format!(
                "INSERT INTO main.{} SELECT * FROM main.{}",
                table.name, table.snapshot
            ),
            [],
        )?;
        let rows: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM main.{}", table.name),
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(rows.max(0) as u64)
    }

    fn set_constraints_enabled(&mut self, enabled: bool) -> Result<(), StoreError> {
        self.conn.pragma_update(None, "foreign_keys", enabled)?;
        Ok(())
    }

    fn ensure_rollback_log(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS main.{ROLLBACK_LOG} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                step_name TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                details TEXT,
                error_message TEXT
            );
            "#
        ))?;
        Ok(())
    }

    fn append_rollback_step(&mut self, record: &StepRecord) -> Result<(), StoreError> {
        self.conn.execute(
            &format!(
                "INSERT INTO main.{ROLLBACK_LOG} (step_name, executed_at, status, details, error_message) \
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                record.step,
                record.executed_at,
                record.status.as_str(),
                record.details,
                record.error,
            ],
        )?;
        Ok(())
    }

    fn recent_rollback_steps(&mut self, limit: u32) -> Result<Vec<StepRecord>, StoreError> {
        if !self.main_table_exists(ROLLBACK_LOG)? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT step_name, status, executed_at, details, error_message \
             FROM main.{ROLLBACK_LOG} ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], |row| {
            let status: String = row.get(1)?;
            let executed_at: DateTime<Utc> = row.get(2)?;
            Ok((row.get::<_, String>(0)?, status, executed_at, row.get(3)?, row.get(4)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (step, status, executed_at, details, error) = row?;
            records.push(StepRecord {
                step,
                status: status.parse()?,
                executed_at,
                details,
                error,
            });
        }
        Ok(records)
    }

    fn collect_metrics(&mut self, window: &MetricsWindow) -> Result<Metrics, StoreError> {
        self.require_derived()?;
        let last_hour = window.last_hour();
        let last_day = window.last_day();

        let entities = self.conn.query_row(
            &format!(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0),
                       COALESCE(MAX(hierarchy_level), 0),
                       COALESCE(AVG(hierarchy_level), 0.0),
                       COALESCE(SUM(CASE WHEN direct_referrals_count > 0 THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(direct_referrals_count), 0),
                       COALESCE(SUM(total_network_size), 0)
                FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES}
                "#
            ),
            [],
            |row| {
                Ok(EntityMetrics {
                    total: get_u64(row, 0)?,
                    active: get_u64(row, 1)?,
                    max_level: row.get(2)?,
                    avg_level: row.get(3)?,
                    with_referrals: get_u64(row, 4)?,
                    total_direct_referrals: row.get(5)?,
                    total_network_size: row.get(6)?,
                })
            },
        )?;

        let transactions = self.conn.query_row(
            &format!(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(amount), 0),
                       COALESCE(AVG(amount), 0.0),
                       COALESCE(SUM(CASE WHEN commission_processed <> 0 THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN transaction_date >= ?2 THEN 1 ELSE 0 END), 0)
                FROM {DERIVED_SCHEMA}.{DERIVED_TRANSACTIONS}
                WHERE transaction_date >= ?1
                "#
            ),
            params![last_day, last_hour],
            |row| {
                Ok(TransactionMetrics {
                    count_24h: get_u64(row, 0)?,
                    volume_24h: row.get(1)?,
                    avg_amount: row.get(2)?,
                    processed_commissions: get_u64(row, 3)?,
                    last_hour: get_u64(row, 4)?,
                })
            },
        )?;

        let commissions = self.conn.query_row(
            &format!(
                r#"
                SELECT COALESCE(SUM(CASE WHEN created_at >= ?1 THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN created_at >= ?1 THEN commission_amount ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN status = 'paid' AND created_at >= ?1 THEN 1 ELSE 0 END), 0),
                       COALESCE(AVG(CASE WHEN created_at >= ?1 THEN commission_amount END), 0.0),
                       COALESCE(SUM(CASE WHEN created_at >= ?2 THEN 1 ELSE 0 END), 0)
                FROM {DERIVED_SCHEMA}.{DERIVED_COMMISSIONS}
                "#
            ),
            params![last_day, last_hour],
            |row| {
                Ok(CommissionMetrics {
                    total_24h: get_u64(row, 0)?,
                    amount_24h: row.get(1)?,
                    pending: get_u64(row, 2)?,
                    paid_24h: get_u64(row, 3)?,
                    avg_amount: row.get(4)?,
                    last_hour: get_u64(row, 5)?,
                })
            },
        )?;

        let performance = self.conn.query_row(
            &format!(
                r#"
                SELECT COUNT(*),
                       COALESCE(AVG(query_duration_ms), 0.0),
                       COALESCE(MAX(query_duration_ms), 0),
                       COALESCE(SUM(CASE WHEN query_duration_ms > ?2 THEN 1 ELSE 0 END), 0),
                       COUNT(DISTINCT query_type)
                FROM {DERIVED_SCHEMA}.{QUERY_PERFORMANCE_LOG}
                WHERE created_at >= ?1
                "#
            ),
            params![last_hour, window.slow_query_ms as i64],
            |row| {
                Ok(PerformanceMetrics {
                    queries_last_hour: get_u64(row, 0)?,
                    avg_duration_ms: row.get(1)?,
                    max_duration_ms: row.get(2)?,
                    slow_queries: get_u64(row, 3)?,
                    unique_query_types: get_u64(row, 4)?,
                })
            },
        )?;

        let hierarchy_relationships =
            self.count(&format!("SELECT COUNT(*) FROM {DERIVED_SCHEMA}.{HIERARCHY_INDEX}"))?;
        let active_cache_entries: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {DERIVED_SCHEMA}.{PERFORMANCE_CACHE} WHERE expires_at > ?1"),
            params![window.now],
            |row| row.get(0),
        )?;
        let database_size_bytes =
            self.schema_size_bytes("main")? + self.schema_size_bytes(DERIVED_SCHEMA)?;

        Ok(Metrics {
            collected_at: window.now,
            entities,
            transactions,
            commissions,
            performance,
            system: SystemMetrics {
                database_size_bytes,
                hierarchy_relationships,
                active_cache_entries: active_cache_entries.max(0) as u64,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SECONDARY_TABLES;

    fn seeded_store() -> SqliteStore {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.bootstrap_source_schema().unwrap();
        store.create_derived_schema().unwrap();
        for entity in [
            Entity::new(1, None, "root"),
            Entity::new(2, Some(1), "child"),
            Entity::new(3, Some(2), "grandchild"),
        ] {
            store.insert_source_entity(&entity).unwrap();
        }
        store
    }

    #[test]
    fn test_source_bounds_and_window() {
        let mut store = seeded_store();
        let bounds = store.source_bounds().unwrap();
        assert_eq!(bounds.count, 3);
        assert_eq!(bounds.range(), Some((1, 3)));

        let window = store.fetch_source_window(0, 2).unwrap();
        let ids: Vec<_> = window.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(window[1].parent_id, Some(1));
    }

    #[test]
    fn test_insert_batch_isolates_record_failures() {
        let mut store = seeded_store();
        let batch = vec![
            Entity::new(1, None, "root"),
            Entity::new(2, Some(1), "bad").with_status("archived"),
            Entity::new(1, None, "duplicate"),
            Entity::new(3, Some(2), "fine"),
        ];
        let write = store.insert_batch(&batch).unwrap();
        assert_eq!(write.inserted, 2);
        let failed: Vec<_> = write.failures.iter().map(|f| f.id).collect();
        assert_eq!(failed, vec![2, 1]);
        assert_eq!(store.target_entity_count().unwrap(), 2);
    }

    #[test]
    fn test_insert_without_derived_schema_is_fatal() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let err = store.insert_batch(&[Entity::new(1, None, "root")]).unwrap_err();
        assert!(!matches!(err, StoreError::MissingSchema(_)));
        assert!(!store.derived_schema_exists().unwrap());
    }

    #[test]
    fn test_store_side_closure() {
        let mut store = seeded_store();
        let entities = store.fetch_source_window(0, 3).unwrap();
        store.insert_batch(&entities).unwrap();

        assert_eq!(store.rebuild_hierarchy_index(Some(1)).unwrap(), 2);
        assert_eq!(store.rebuild_hierarchy_index(None).unwrap(), 3);
        assert_eq!(
            store.hierarchy_edges().unwrap(),
            vec![
                HierarchyEdge::new(1, 2, 1),
                HierarchyEdge::new(1, 3, 2),
                HierarchyEdge::new(2, 3, 1),
            ]
        );

        store.refresh_hierarchy_counters().unwrap();
        let root = store.hierarchy_counters(1).unwrap().unwrap();
        assert_eq!(root.direct_referrals, 1);
        assert_eq!(root.network_size, 2);
        assert_eq!(store.hierarchy_counters(3).unwrap().unwrap().hierarchy_level, 2);
        assert_eq!(store.hierarchy_counters(99).unwrap(), None);
    }

    #[test]
    fn test_snapshot_is_never_overwritten() {
        let mut store = seeded_store();
        assert_eq!(
            store.create_snapshot(&PRIMARY_TABLE).unwrap(),
            SnapshotOutcome::Created { rows: 3 }
        );
        store
            .insert_source_entity(&Entity::new(4, Some(1), "late"))
            .unwrap();
        assert_eq!(
            store.create_snapshot(&PRIMARY_TABLE).unwrap(),
            SnapshotOutcome::AlreadyExists
        );
        // payments is not part of the legacy fixture
        assert_eq!(
            store.create_snapshot(&SECONDARY_TABLES[2]).unwrap(),
            SnapshotOutcome::SourceMissing
        );

        store.restore_from_snapshot(&PRIMARY_TABLE).unwrap();
        assert_eq!(store.source_entity_count().unwrap(), 3);
    }

    #[test]
    fn test_file_backed_schema_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("fature.db");
        let derived = default_derived_path(&main);

        {
            let mut store = SqliteStore::open(&main, &derived).unwrap();
            assert!(!store.derived_schema_exists().unwrap());
            store.create_derived_schema().unwrap();
            assert!(store.derived_schema_exists().unwrap());
        }

        let mut store = SqliteStore::open(&main, &derived).unwrap();
        assert!(store.derived_schema_exists().unwrap());
        assert_eq!(store.derived_triggers().unwrap().len(), 1);

        store.drop_derived_schema().unwrap();
        assert!(!store.derived_schema_exists().unwrap());
        assert!(!derived.exists());
        store.drop_derived_schema().unwrap();
    }

    #[test]
    fn test_foreign_key_switch() {
        let mut store = seeded_store();
        assert!(store.foreign_keys_enabled().unwrap());
        store.set_constraints_enabled(false).unwrap();
        assert!(!store.foreign_keys_enabled().unwrap());
        store.set_constraints_enabled(true).unwrap();
        assert!(store.foreign_keys_enabled().unwrap());
    }
}
