//! Transitive closure strategies.

use std::collections::{HashMap, HashSet};

use crate::entity::{EntityId, HierarchyEdge, ParentLink};
use crate::error::StoreError;
use crate::store::Store;

/// How the hierarchy index is recomputed.
///
/// Implementations replace the whole index and return the number of
/// edges written. All implementations must produce the same edge set for
/// the same entities.
pub trait ClosureStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn rebuild(&self, store: &mut dyn Store, max_depth: Option<u32>) -> Result<u64, StoreError>;
}

/// Loads parent links and expands the closure level by level in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessClosure;

impl ClosureStrategy for InProcessClosure {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn rebuild(&self, store: &mut dyn Store, max_depth: Option<u32>) -> Result<u64, StoreError> {
        let links = store.target_parent_links()?;
        let edges = compute_closure(&links, max_depth);
        tracing::debug!(links = links.len(), edges = edges.len(), "closure computed in-process");
        store.replace_hierarchy_index(&edges)
    }
}

/// Delegates to the store's recursive query.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreClosure;

impl ClosureStrategy for StoreClosure {
    fn name(&self) -> &'static str {
        "store"
    }

    fn rebuild(&self, store: &mut dyn Store, max_depth: Option<u32>) -> Result<u64, StoreError> {
        store.rebuild_hierarchy_index(max_depth)
    }
}

/// Compute every (ancestor, descendant, distance) triple reachable through
/// parent links.
///
/// Parents that are not themselves in `links` are ignored. A walk stops
/// when it returns to its ancestor, so parent cycles never yield
/// self-edges. With `max_depth` set, distances above it are not produced.
/// The result is sorted by ancestor, then descendant.
pub fn compute_closure(links: &[ParentLink], max_depth: Option<u32>) -> Vec<HierarchyEdge> {
    let ids: HashSet<EntityId> = links.iter().map(|link| link.id).collect();
    let mut children: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
    for link in links {
        if let Some(parent) = link.parent_id {
            if parent != link.id && ids.contains(&parent) {
                children.entry(parent).or_default().push(link.id);
            }
        }
    }

    let mut seen: HashSet<(EntityId, EntityId)> = HashSet::new();
    let mut frontier: Vec<(EntityId, EntityId)> = Vec::new();
    for (&parent, kids) in &children {
        for &kid in kids {
            if seen.insert((parent, kid)) {
                frontier.push((parent, kid));
            }
        }
    }

    let mut edges = Vec::new();
    let mut level: u32 = 1;
    while !frontier.is_empty() && !max_depth.is_some_and(|cap| level > cap) {
        edges.extend(
            frontier
                .iter()
                .map(|&(ancestor, descendant)| HierarchyEdge::new(ancestor, descendant, level)),
        );

        let mut next = Vec::new();
        for &(ancestor, descendant) in &frontier {
            let Some(kids) = children.get(&descendant) else {
                continue;
            };
            for &kid in kids {
                if kid != ancestor && seen.insert((ancestor, kid)) {
                    next.push((ancestor, kid));
                }
            }
        }
        frontier = next;
        level += 1;
    }

    edges.sort_unstable();
    edges
}
