//! Fixtures shared by unit tests.

use crate::entity::{Entity, EntityId};
use crate::store::{SqliteStore, Store};

/// In-memory store with the legacy tables populated from `(id, parent)`
/// pairs and an empty derived schema.
pub(crate) fn seeded_store(links: &[(EntityId, Option<EntityId>)]) -> SqliteStore {
    let mut store = SqliteStore::open_in_memory().unwrap();
    store.bootstrap_source_schema().unwrap();
    for (id, parent) in links {
        store
            .insert_source_entity(&Entity::new(*id, *parent, format!("affiliate {id}")))
            .unwrap();
    }
    store.create_derived_schema().unwrap();
    store
}

/// The three-level chain `1 <- 2 <- 3`.
pub(crate) fn chain_store() -> SqliteStore {
    seeded_store(&[(1, None), (2, Some(1)), (3, Some(2))])
}
