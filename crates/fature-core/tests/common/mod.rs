//! Shared fixtures for integration tests.
#![allow(dead_code)]

use chrono::Utc;
use fature_core::{Entity, EntityId, MigrationConfig, SqliteStore};
use rusqlite::params;
use std::time::Duration;

/// In-memory store whose legacy tables hold `(id, parent)` affiliates.
pub fn legacy_store(links: &[(EntityId, Option<EntityId>)]) -> SqliteStore {
    let mut store = SqliteStore::open_in_memory().unwrap();
    store.bootstrap_source_schema().unwrap();
    for (id, parent) in links {
        store
            .insert_source_entity(&Entity::new(*id, *parent, format!("affiliate {id}")))
            .unwrap();
    }
    store
}

/// Root 1 with children 2 and 3, grandchild 4 under 2.
pub fn small_tree() -> SqliteStore {
    legacy_store(&[(1, None), (2, Some(1)), (3, Some(1)), (4, Some(2))])
}

/// Add a legacy transaction row for `affiliate`.
pub fn add_legacy_transaction(store: &SqliteStore, id: i64, affiliate: EntityId, amount: i64) {
    store
        .connection()
        .execute(
            "INSERT INTO main.transactions (transaction_id, affiliate_id, amount, transaction_date) \
             VALUES (?1, ?2, ?3, ?4)",
            params![id, affiliate, amount, Utc::now()],
        )
        .unwrap();
}

/// Add `count` pending commissions to the derived schema.
pub fn add_pending_commissions(store: &SqliteStore, count: i64) {
    let conn = store.connection();
    let now = Utc::now();
    for id in 1..=count {
        conn.execute(
            "INSERT INTO fature_v2.commissions (commission_id, affiliate_id, commission_amount, status, created_at) \
             VALUES (?1, 1, 500, 'pending', ?2)",
            params![id, now],
        )
        .unwrap();
    }
}

/// Legacy affiliate names, ordered by id.
pub fn legacy_names(store: &SqliteStore) -> Vec<String> {
    let mut stmt = store
        .connection()
        .prepare("SELECT name FROM main.affiliates ORDER BY affiliate_id")
        .unwrap();
    stmt.query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

/// Migration settings without pacing.
pub fn fast_migration(batch_size: i64) -> MigrationConfig {
    MigrationConfig::default()
        .with_batch_size(batch_size)
        .with_batch_delay(Duration::ZERO)
}
