//! PostgreSQL store adapter.
//!
//! Holds a single session connection driven by an owned runtime, so
//! session settings such as `session_replication_role` apply to every
//! statement issued by the store.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Connection, Row};
use tokio::runtime::Runtime;

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
    HIERARCHY_INDEX, PERFORMANCE_CACHE, PRIMARY_TABLE, QUERY_PERFORMANCE_LOG, ROLLBACK_LOG,
    ROLLBACK_SAFETY_SNAPSHOT,
};
use crate::rollback::StepRecord;

const ENTITY_COLUMNS: &str = "affiliate_id, parent_affiliate_id, external_id, name, status, \
     registration_date, total_deposits, total_bets, total_withdrawals, total_cpa_earned, \
     total_rev_earned, total_commissions_paid, created_at";

/// PostgreSQL-backed [`Store`].
pub struct PgStore {
    rt: Runtime,
    conn: PgConnection,
}

impl PgStore {
    /// Connect and apply the session statement timeout.
    pub fn connect(url: &str, statement_timeout_ms: u64) -> Result<Self, StoreError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let conn = rt
            .block_on(async {
                let mut conn = PgConnection::connect(url).await?;
                let timeout = format!("SET statement_timeout = {statement_timeout_ms}");
                sqlx::query(&timeout).execute(&mut conn).await?;
                Ok::<_, sqlx::Error>(conn)
            })
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::debug!(statement_timeout_ms, "postgres store connected");
        Ok(Self { rt, conn })
    }

    /// Create the legacy original-schema tables if absent.
    pub fn bootstrap_source_schema(&mut self) -> Result<(), StoreError> {
        let Self { rt, conn } = self;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS public.{affiliates} (
                affiliate_id BIGINT PRIMARY KEY,
                parent_affiliate_id BIGINT,
                external_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                registration_date TIMESTAMPTZ,
                total_deposits BIGINT NOT NULL DEFAULT 0,
                total_bets BIGINT NOT NULL DEFAULT 0,
                total_withdrawals BIGINT NOT NULL DEFAULT 0,
                total_cpa_earned BIGINT NOT NULL DEFAULT 0,
                total_rev_earned BIGINT NOT NULL DEFAULT 0,
                total_commissions_paid BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ
            );
            CREATE TABLE IF NOT EXISTS public.transactions (
                transaction_id BIGINT PRIMARY KEY,
                affiliate_id BIGINT NOT NULL REFERENCES public.{affiliates}(affiliate_id),
                amount BIGINT NOT NULL,
                transaction_date TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE IF NOT EXISTS public.commissions (
                commission_id BIGINT PRIMARY KEY,
                affiliate_id BIGINT NOT NULL REFERENCES public.{affiliates}(affiliate_id),
                commission_amount BIGINT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            "#,
            affiliates = PRIMARY_TABLE.name,
        );
        rt.block_on(sqlx::raw_sql(&ddl).execute(&mut *conn))?;
        Ok(())
    }
}

fn entity_from_row(row: &PgRow) -> Result<Entity, sqlx::Error> {
    Ok(Entity {
        id: row.try_get("affiliate_id")?,
        parent_id: row.try_get("parent_affiliate_id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        status: row.try_get("status")?,
        registered_at: row.try_get("registration_date")?,
        totals: MonetaryTotals {
            deposits: row.try_get("total_deposits")?,
            bets: row.try_get("total_bets")?,
            withdrawals: row.try_get("total_withdrawals")?,
            cpa_earned: row.try_get("total_cpa_earned")?,
            rev_earned: row.try_get("total_rev_earned")?,
            commissions_paid: row.try_get("total_commissions_paid")?,
        },
        created_at: row.try_get("created_at")?,
    })
}

fn u64_at(row: &PgRow, idx: usize) -> Result<u64, sqlx::Error> {
    row.try_get::<i64, _>(idx).map(|value| value.max(0) as u64)
}

async fn count(conn: &mut PgConnection, sql: &str) -> Result<u64, sqlx::Error> {
    let value: i64 = sqlx::query_scalar(sql).fetch_one(conn).await?;
    Ok(value.max(0) as u64)
}

async fn public_table_exists(conn: &mut PgConnection, name: &str) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_name = $1)",
    )
    .bind(name)
    .fetch_one(conn)
    .await
}

async fn derived_schema_present(conn: &mut PgConnection) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
    )
    .bind(DERIVED_SCHEMA)
    .fetch_one(conn)
    .await
}

impl Store for PgStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn derived_schema_exists(&mut self) -> Result<bool, StoreError> {
        let Self { rt, conn } = self;
        Ok(rt.block_on(derived_schema_present(conn))?)
    }

    fn create_derived_schema(&mut self) -> Result<(), StoreError> {
        let Self { rt, conn } = self;
        let ddl = format!(
            r#"
            CREATE SCHEMA IF NOT EXISTS {s};

            CREATE TABLE IF NOT EXISTS {s}.{entities} (
                affiliate_id BIGINT PRIMARY KEY,
                parent_affiliate_id BIGINT,
                external_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('active', 'inactive', 'suspended', 'pending', 'blocked')),
                registration_date TIMESTAMPTZ,
                total_deposits BIGINT NOT NULL DEFAULT 0,
                total_bets BIGINT NOT NULL DEFAULT 0,
                total_withdrawals BIGINT NOT NULL DEFAULT 0,
                total_cpa_earned BIGINT NOT NULL DEFAULT 0,
                total_rev_earned BIGINT NOT NULL DEFAULT 0,
                total_commissions_paid BIGINT NOT NULL DEFAULT 0,
                direct_referrals_count BIGINT NOT NULL DEFAULT 0,
                total_network_size BIGINT NOT NULL DEFAULT 0,
                hierarchy_level BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS idx_{entities}_parent
                ON {s}.{entities}(parent_affiliate_id);
            CREATE INDEX IF NOT EXISTS idx_{entities}_status ON {s}.{entities}(status);

            CREATE TABLE IF NOT EXISTS {s}.{index} (
                ancestor_id BIGINT NOT NULL,
                descendant_id BIGINT NOT NULL,
                level_distance INTEGER NOT NULL CHECK (level_distance >= 1),
                PRIMARY KEY (ancestor_id, descendant_id)
            );
            CREATE INDEX IF NOT EXISTS idx_{index}_descendant ON {s}.{index}(descendant_id);
            CREATE INDEX IF NOT EXISTS idx_{index}_level ON {s}.{index}(level_distance);

            CREATE TABLE IF NOT EXISTS {s}.{transactions} (
                transaction_id BIGINT PRIMARY KEY,
                affiliate_id BIGINT NOT NULL,
                amount BIGINT NOT NULL,
                commission_processed BOOLEAN NOT NULL DEFAULT FALSE,
                transaction_date TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {s}.{commissions} (
                commission_id BIGINT PRIMARY KEY,
                affiliate_id BIGINT NOT NULL,
                commission_amount BIGINT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {s}.{query_log} (
                id BIGSERIAL PRIMARY KEY,
                query_type TEXT NOT NULL,
                query_duration_ms BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {s}.{cache} (
                cache_key TEXT PRIMARY KEY,
                payload JSONB,
                expires_at TIMESTAMPTZ NOT NULL
            );

            CREATE OR REPLACE FUNCTION {s}.touch_updated_at() RETURNS trigger AS $$
            BEGIN
                NEW.updated_at = now();
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS trg_{entities}_touch ON {s}.{entities};
            CREATE TRIGGER trg_{entities}_touch
                BEFORE UPDATE OF status, name ON {s}.{entities}
                FOR EACH ROW EXECUTE FUNCTION {s}.touch_updated_at();
            "#,
            s = DERIVED_SCHEMA,
            entities = DERIVED_ENTITIES,
            index = HIERARCHY_INDEX,
            transactions = DERIVED_TRANSACTIONS,
            commissions = DERIVED_COMMISSIONS,
            query_log = QUERY_PERFORMANCE_LOG,
            cache = PERFORMANCE_CACHE,
        );
        rt.block_on(sqlx::raw_sql(&ddl).execute(&mut *conn))?;
        tracing::info!(schema = DERIVED_SCHEMA, "derived schema ready");
        Ok(())
    }

    fn drop_derived_schema(&mut self) -> Result<(), StoreError> {
        let Self { rt, conn } = self;
        let sql = format!("DROP SCHEMA IF EXISTS {DERIVED_SCHEMA} CASCADE");
        rt.block_on(sqlx::query(&sql).execute(&mut *conn))?;
        tracing::info!(schema = DERIVED_SCHEMA, "derived schema dropped");
        Ok(())
    }

    fn derived_triggers(&mut self) -> Result<Vec<TriggerRef>, StoreError> {
        let Self { rt, conn } = self;
        let rows = rt.block_on(
            sqlx::query(
                "SELECT DISTINCT trigger_name, event_object_table FROM information_schema.triggers \
                 WHERE trigger_schema = $1 ORDER BY trigger_name",
            )
            .bind(DERIVED_SCHEMA)
            .fetch_all(&mut *conn),
        )?;
        let triggers = rows
            .iter()
            .map(|row| {
                Ok(TriggerRef {
                    name: row.try_get(0)?,
                    table: row.try_get(1)?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()?;
        Ok(triggers)
    }

    fn drop_derived_trigger(&mut self, trigger: &TriggerRef) -> Result<(), StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "DROP TRIGGER IF EXISTS {} ON {DERIVED_SCHEMA}.{}",
            quote_ident(&trigger.name),
            quote_ident(&trigger.table)
        );
        rt.block_on(sqlx::query(&sql).execute(&mut *conn))?;
        Ok(())
    }

    fn source_bounds(&mut self) -> Result<SourceBounds, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "SELECT COUNT(*), MIN(affiliate_id), MAX(affiliate_id) FROM public.{}",
            PRIMARY_TABLE.name
        );
        let row = rt.block_on(sqlx::query(&sql).fetch_one(&mut *conn))?;
        Ok(SourceBounds {
            count: u64_at(&row, 0)?,
            min_id: row.try_get(1)?,
            max_id: row.try_get(2)?,
        })
    }

    fn fetch_source_window(
        &mut self,
        after: EntityId,
        up_to: EntityId,
    ) -> Result<Vec<Entity>, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM public.{} \
             WHERE affiliate_id > $1 AND affiliate_id <= $2 ORDER BY affiliate_id",
            PRIMARY_TABLE.name
        );
        let rows = rt.block_on(
            sqlx::query(&sql)
                .bind(after)
                .bind(up_to)
                .fetch_all(&mut *conn),
        )?;
        Ok(rows
            .iter()
            .map(entity_from_row)
            .collect::<Result<_, _>>()?)
    }

    fn insert_batch(&mut self, entities: &[Entity]) -> Result<BatchWrite, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "INSERT INTO {DERIVED_SCHEMA}.{DERIVED_ENTITIES} ({ENTITY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        );

        let write = rt.block_on(async {
            let mut write = BatchWrite::default();
            let mut tx = conn.begin().await?;

            for entity in entities {
                sqlx::query("SAVEPOINT fature_record")
                    .execute(&mut *tx)
                    .await?;
                let result = sqlx::query(&sql)
                    .bind(entity.id)
                    .bind(entity.parent_id)
                    .bind(&entity.external_id)
                    .bind(&entity.name)
                    .bind(&entity.status)
                    .bind(entity.registered_at)
                    .bind(entity.totals.deposits)
                    .bind(entity.totals.bets)
                    .bind(entity.totals.withdrawals)
                    .bind(entity.totals.cpa_earned)
                    .bind(entity.totals.rev_earned)
                    .bind(entity.totals.commissions_paid)
                    .bind(entity.created_at)
                    .execute(&mut *tx)
                    .await;

                match result {
                    Ok(_) => {
                        sqlx::query("RELEASE SAVEPOINT fature_record")
                            .execute(&mut *tx)
                            .await?;
                        write.inserted += 1;
                    }
                    Err(sqlx::Error::Database(err)) => {
                        sqlx::query("ROLLBACK TO SAVEPOINT fature_record")
                            .execute(&mut *tx)
                            .await?;
                        write.failures.push(RecordFailure {
                            id: entity.id,
                            reason: err.to_string(),
                        });
                    }
                    Err(err) => return Err(err),
                }
            }

            tx.commit().await?;
            Ok::<_, sqlx::Error>(write)
        })?;
        Ok(write)
    }

    fn target_parent_links(&mut self) -> Result<Vec<ParentLink>, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "SELECT affiliate_id, parent_affiliate_id FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES} \
             ORDER BY affiliate_id"
        );
        let rows = rt.block_on(sqlx::query(&sql).fetch_all(&mut *conn))?;
        let links = rows
            .iter()
            .map(|row| {
                Ok(ParentLink {
                    id: row.try_get(0)?,
                    parent_id: row.try_get(1)?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()?;
        Ok(links)
    }

    fn replace_hierarchy_index(&mut self, edges: &[HierarchyEdge]) -> Result<u64, StoreError> {
        let Self { rt, conn } = self;
        let delete = format!("DELETE FROM {DERIVED_SCHEMA}.{HIERARCHY_INDEX}");
        let insert = format!(
            "INSERT INTO {DERIVED_SCHEMA}.{HIERARCHY_INDEX} \
             (ancestor_id, descendant_id, level_distance) VALUES ($1, $2, $3)"
        );
        rt.block_on(async {
            let mut tx = conn.begin().await?;
            sqlx::query(&delete).execute(&mut *tx).await?;
            for edge in edges {
                sqlx::query(&insert)
                    .bind(edge.ancestor_id)
                    .bind(edge.descendant_id)
                    .bind(edge.level_distance as i32)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })?;
        Ok(edges.len() as u64)
    }

    fn rebuild_hierarchy_index(&mut self, max_depth: Option<u32>) -> Result<u64, StoreError> {
        let Self { rt, conn } = self;
        let delete = format!("DELETE FROM {DERIVED_SCHEMA}.{HIERARCHY_INDEX}");
        let insert = format!(
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
                WHERE ($1::INT IS NULL OR cl.level_distance < $1)
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
        );
        let inserted = rt.block_on(async {
            let mut tx = conn.begin().await?;
            sqlx::query(&delete).execute(&mut *tx).await?;
            let done = sqlx::query(&insert)
                .bind(max_depth.map(|cap| cap.min(i32::MAX as u32) as i32))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(done.rows_affected())
        })?;
        Ok(inserted)
    }

    fn refresh_hierarchy_counters(&mut self) -> Result<(), StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
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
        );
        rt.block_on(sqlx::query(&sql).execute(&mut *conn))?;
        Ok(())
    }

    fn hierarchy_summary(&mut self) -> Result<HierarchySummary, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "SELECT (SELECT COUNT(*) FROM {s}.{e}), COUNT(*), COALESCE(MAX(level_distance), 0) \
             FROM {s}.{i}",
            s = DERIVED_SCHEMA,
            e = DERIVED_ENTITIES,
            i = HIERARCHY_INDEX,
        );
        let row = rt.block_on(sqlx::query(&sql).fetch_one(&mut *conn))?;
        Ok(HierarchySummary {
            entities: u64_at(&row, 0)?,
            edges: u64_at(&row, 1)?,
            max_depth: row.try_get::<i32, _>(2)?.max(0) as u32,
        })
    }

    fn hierarchy_edges(&mut self) -> Result<Vec<HierarchyEdge>, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "SELECT ancestor_id, descendant_id, level_distance \
             FROM {DERIVED_SCHEMA}.{HIERARCHY_INDEX} ORDER BY ancestor_id, descendant_id"
        );
        let rows = rt.block_on(sqlx::query(&sql).fetch_all(&mut *conn))?;
        let edges = rows
            .iter()
            .map(|row| {
                Ok(HierarchyEdge::new(
                    row.try_get(0)?,
                    row.try_get(1)?,
                    row.try_get::<i32, _>(2)?.max(0) as u32,
                ))
            })
            .collect::<Result<_, sqlx::Error>>()?;
        Ok(edges)
    }

    fn hierarchy_counters(
        &mut self,
        id: EntityId,
    ) -> Result<Option<HierarchyCounters>, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "SELECT direct_referrals_count, total_network_size, hierarchy_level \
             FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES} WHERE affiliate_id = $1"
        );
        let row = rt.block_on(sqlx::query(&sql).bind(id).fetch_optional(&mut *conn))?;
        let counters = row
            .map(|row| {
                Ok::<_, sqlx::Error>(HierarchyCounters {
                    direct_referrals: row.try_get(0)?,
                    network_size: row.try_get(1)?,
                    hierarchy_level: row.try_get(2)?,
                })
            })
            .transpose()?;
        Ok(counters)
    }

    fn source_entity_count(&mut self) -> Result<u64, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!("SELECT COUNT(*) FROM public.{}", PRIMARY_TABLE.name);
        Ok(rt.block_on(count(conn, &sql))?)
    }

    fn target_entity_count(&mut self) -> Result<u64, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!("SELECT COUNT(*) FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES}");
        Ok(rt.block_on(count(conn, &sql))?)
    }

    fn orphaned_entity_count(&mut self) -> Result<u64, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            r#"
            SELECT COUNT(*) FROM {s}.{e} a
            WHERE a.parent_affiliate_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM {s}.{e} p WHERE p.affiliate_id = a.parent_affiliate_id
              )
            "#,
            s = DERIVED_SCHEMA,
            e = DERIVED_ENTITIES,
        );
        Ok(rt.block_on(count(conn, &sql))?)
    }

    fn referral_count_mismatches(&mut self) -> Result<u64, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
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
        );
        Ok(rt.block_on(count(conn, &sql))?)
    }

    fn orphaned_edge_count(&mut self) -> Result<u64, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            r#"
            SELECT COUNT(*) FROM {s}.{i} h
            WHERE NOT EXISTS (SELECT 1 FROM {s}.{e} a WHERE a.affiliate_id = h.ancestor_id)
               OR NOT EXISTS (SELECT 1 FROM {s}.{e} d WHERE d.affiliate_id = h.descendant_id)
            "#,
            s = DERIVED_SCHEMA,
            e = DERIVED_ENTITIES,
            i = HIERARCHY_INDEX,
        );
        Ok(rt.block_on(count(conn, &sql))?)
    }

    fn edges_at_level(&mut self, level: u32) -> Result<u64, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "SELECT COUNT(*) FROM {DERIVED_SCHEMA}.{HIERARCHY_INDEX} WHERE level_distance = $1"
        );
        let value: i64 = rt.block_on(
            sqlx::query_scalar(&sql)
                .bind(level as i32)
                .fetch_one(&mut *conn),
        )?;
        Ok(value.max(0) as u64)
    }

    fn active_target_count(&mut self) -> Result<u64, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "SELECT COUNT(*) FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES} WHERE status = 'active'"
        );
        Ok(rt.block_on(count(conn, &sql))?)
    }

    fn table_exists(&mut self, table: &'static str) -> Result<bool, StoreError> {
        let Self { rt, conn } = self;
        Ok(rt.block_on(public_table_exists(conn, table))?)
    }

    fn create_snapshot(&mut self, table: &TableSpec) -> Result<SnapshotOutcome, StoreError> {
        let Self { rt, conn } = self;
        let create = format!(
            "CREATE TABLE public.{} AS SELECT * FROM public.{}",
            table.snapshot, table.name
        );
        let rows = format!("SELECT COUNT(*) FROM public.{}", table.snapshot);
        let outcome = rt.block_on(async {
            if public_table_exists(&mut *conn, table.snapshot).await? {
                return Ok(SnapshotOutcome::AlreadyExists);
            }
            if !public_table_exists(&mut *conn, table.name).await? {
                return Ok(SnapshotOutcome::SourceMissing);
            }
            sqlx::query(&create).execute(&mut *conn).await?;
            let rows = count(&mut *conn, &rows).await?;
            Ok::<_, sqlx::Error>(SnapshotOutcome::Created { rows })
        })?;
        Ok(outcome)
    }

    fn drop_snapshot(&mut self, table: &TableSpec) -> Result<bool, StoreError> {
        let Self { rt, conn } = self;
        let drop = format!("DROP TABLE public.{}", table.snapshot);
        let existed = rt.block_on(async {
            if !public_table_exists(&mut *conn, table.snapshot).await? {
                return Ok(false);
            }
            sqlx::query(&drop).execute(&mut *conn).await?;
            Ok::<_, sqlx::Error>(true)
        })?;
        Ok(existed)
    }

    fn snapshot_derived_entities(&mut self) -> Result<u64, StoreError> {
        let Self { rt, conn } = self;
        let drop = format!("DROP TABLE IF EXISTS public.{ROLLBACK_SAFETY_SNAPSHOT}");
        let create = format!(
            "CREATE TABLE public.{ROLLBACK_SAFETY_SNAPSHOT} AS \
             SELECT * FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES}"
        );
        let rows = format!("SELECT COUNT(*) FROM public.{ROLLBACK_SAFETY_SNAPSHOT}");
        let rows = rt.block_on(async {
            let mut tx = conn.begin().await?;
            sqlx::query(&drop).execute(&mut *tx).await?;
            sqlx::query(&create).execute(&mut *tx).await?;
            let rows = count(&mut *tx, &rows).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(rows)
        })?;
        Ok(rows)
    }

    fn restore_from_snapshot(&mut self, table: &TableSpec) -> Result<u64, StoreError> {
        let Self { rt, conn } = self;
        // DELETE rather than TRUNCATE: TRUNCATE ignores session_replication_role.
        let delete = format!("DELETE FROM public.{}", table.name);
        let insert = format!(
            "INSERT INTO public.{} SELECT * FROM public.{}",
            table.name, table.snapshot
        );
        let rows = format!("SELECT COUNT(*) FROM public.{}", table.name);
        let rows = rt.block_on(async {
            let mut tx = conn.begin().await?;
            sqlx::query(&delete).execute(&mut *tx).await?;
            sqlx::query(&insert).execute(&mut *tx).await?;
            let rows = count(&mut *tx, &rows).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(rows)
        })?;
        Ok(rows)
    }

    fn set_constraints_enabled(&mut self, enabled: bool) -> Result<(), StoreError> {
        let Self { rt, conn } = self;
        let sql = if enabled {
            "SET session_replication_role = DEFAULT"
        } else {
            "SET session_replication_role = replica"
        };
        rt.block_on(sqlx::query(sql).execute(&mut *conn))?;
        Ok(())
    }

    fn ensure_rollback_log(&mut self) -> Result<(), StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS public.{ROLLBACK_LOG} (
                id BIGSERIAL PRIMARY KEY,
                step_name TEXT NOT NULL,
                executed_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                details TEXT,
                error_message TEXT
            )
            "#
        );
        rt.block_on(sqlx::query(&sql).execute(&mut *conn))?;
        Ok(())
    }

    fn append_rollback_step(&mut self, record: &StepRecord) -> Result<(), StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "INSERT INTO public.{ROLLBACK_LOG} (step_name, executed_at, status, details, error_message) \
             VALUES ($1, $2, $3, $4, $5)"
        );
        rt.block_on(
            sqlx::query(&sql)
                .bind(&record.step)
                .bind(record.executed_at)
                .bind(record.status.as_str())
                .bind(&record.details)
                .bind(&record.error)
                .execute(&mut *conn),
        )?;
        Ok(())
    }

    fn recent_rollback_steps(&mut self, limit: u32) -> Result<Vec<StepRecord>, StoreError> {
        let Self { rt, conn } = self;
        let sql = format!(
            "SELECT step_name, status, executed_at, details, error_message \
             FROM public.{ROLLBACK_LOG} ORDER BY id DESC LIMIT $1"
        );
        let rows = rt.block_on(async {
            if !public_table_exists(&mut *conn, ROLLBACK_LOG).await? {
                return Ok(Vec::new());
            }
            sqlx::query(&sql)
                .bind(i64::from(limit))
                .fetch_all(&mut *conn)
                .await
        })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status")?;
            let executed_at: DateTime<Utc> = row.try_get("executed_at")?;
            records.push(StepRecord {
                step: row.try_get("step_name")?,
                status: status.parse()?,
                executed_at,
                details: row.try_get("details")?,
                error: row.try_get("error_message")?,
            });
        }
        Ok(records)
    }

    fn collect_metrics(&mut self, window: &MetricsWindow) -> Result<Metrics, StoreError> {
        let Self { rt, conn } = self;
        let last_hour = window.last_hour();
        let last_day = window.last_day();

        let entities_sql = format!(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE status = 'active'),
                   COALESCE(MAX(hierarchy_level), 0)::BIGINT,
                   COALESCE(AVG(hierarchy_level), 0)::FLOAT8,
                   COUNT(*) FILTER (WHERE direct_referrals_count > 0),
                   COALESCE(SUM(direct_referrals_count), 0)::BIGINT,
                   COALESCE(SUM(total_network_size), 0)::BIGINT
            FROM {DERIVED_SCHEMA}.{DERIVED_ENTITIES}
            "#
        );
        let transactions_sql = format!(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(amount), 0)::BIGINT,
                   COALESCE(AVG(amount), 0)::FLOAT8,
                   COUNT(*) FILTER (WHERE commission_processed),
                   COUNT(*) FILTER (WHERE transaction_date >= $2)
            FROM {DERIVED_SCHEMA}.{DERIVED_TRANSACTIONS}
            WHERE transaction_date >= $1
            "#
        );
        let commissions_sql = format!(
            r#"
            SELECT COUNT(*) FILTER (WHERE created_at >= $1),
                   COALESCE(SUM(commission_amount) FILTER (WHERE created_at >= $1), 0)::BIGINT,
                   COUNT(*) FILTER (WHERE status = 'pending'),
                   COUNT(*) FILTER (WHERE status = 'paid' AND created_at >= $1),
                   COALESCE(AVG(commission_amount) FILTER (WHERE created_at >= $1), 0)::FLOAT8,
                   COUNT(*) FILTER (WHERE created_at >= $2)
            FROM {DERIVED_SCHEMA}.{DERIVED_COMMISSIONS}
            "#
        );
        let performance_sql = format!(
            r#"
            SELECT COUNT(*),
                   COALESCE(AVG(query_duration_ms), 0)::FLOAT8,
                   COALESCE(MAX(query_duration_ms), 0)::BIGINT,
                   COUNT(*) FILTER (WHERE query_duration_ms > $2),
                   COUNT(DISTINCT query_type)
            FROM {DERIVED_SCHEMA}.{QUERY_PERFORMANCE_LOG}
            WHERE created_at >= $1
            "#
        );
        let relationships_sql = format!("SELECT COUNT(*) FROM {DERIVED_SCHEMA}.{HIERARCHY_INDEX}");
        let cache_sql = format!(
            "SELECT COUNT(*) FROM {DERIVED_SCHEMA}.{PERFORMANCE_CACHE} WHERE expires_at > $1"
        );

        let metrics = rt.block_on(async {
            if !derived_schema_present(&mut *conn).await? {
                return Ok(None);
            }

            let row = sqlx::query(&entities_sql).fetch_one(&mut *conn).await?;
            let entities = EntityMetrics {
                total: u64_at(&row, 0)?,
                active: u64_at(&row, 1)?,
                max_level: row.try_get(2)?,
                avg_level: row.try_get(3)?,
                with_referrals: u64_at(&row, 4)?,
                total_direct_referrals: row.try_get(5)?,
                total_network_size: row.try_get(6)?,
            };

            let row = sqlx::query(&transactions_sql)
                .bind(last_day)
                .bind(last_hour)
                .fetch_one(&mut *conn)
                .await?;
            let transactions = TransactionMetrics {
                count_24h: u64_at(&row, 0)?,
                volume_24h: row.try_get(1)?,
                avg_amount: row.try_get(2)?,
                processed_commissions: u64_at(&row, 3)?,
                last_hour: u64_at(&row, 4)?,
            };

            let row = sqlx::query(&commissions_sql)
                .bind(last_day)
                .bind(last_hour)
                .fetch_one(&mut *conn)
                .await?;
            let commissions = CommissionMetrics {
                total_24h: u64_at(&row, 0)?,
                amount_24h: row.try_get(1)?,
                pending: u64_at(&row, 2)?,
                paid_24h: u64_at(&row, 3)?,
                avg_amount: row.try_get(4)?,
                last_hour: u64_at(&row, 5)?,
            };

            let row = sqlx::query(&performance_sql)
                .bind(last_hour)
                .bind(window.slow_query_ms as i64)
                .fetch_one(&mut *conn)
                .await?;
            let performance = PerformanceMetrics {
                queries_last_hour: u64_at(&row, 0)?,
                avg_duration_ms: row.try_get(1)?,
                max_duration_ms: row.try_get(2)?,
                slow_queries: u64_at(&row, 3)?,
                unique_query_types: u64_at(&row, 4)?,
            };

            let database_size: i64 =
                sqlx::query_scalar("SELECT pg_database_size(current_database())")
                    .fetch_one(&mut *conn)
                    .await?;
            let hierarchy_relationships = count(&mut *conn, &relationships_sql).await?;
            let active_cache: i64 = sqlx::query_scalar(&cache_sql)
                .bind(window.now)
                .fetch_one(&mut *conn)
                .await?;

            Ok::<_, sqlx::Error>(Some(Metrics {
                collected_at: window.now,
                entities,
                transactions,
                commissions,
                performance,
                system: SystemMetrics {
                    database_size_bytes: database_size.max(0) as u64,
                    hierarchy_relationships,
                    active_cache_entries: active_cache.max(0) as u64,
                },
            }))
        })?;

        metrics.ok_or(StoreError::MissingSchema(DERIVED_SCHEMA))
    }
}
