//! Materialized ancestor/descendant index.
//!
//! The index is rebuilt from scratch after migration and the maintained
//! counters on the derived entity table are refreshed from it.

mod closure;

pub use closure::{compute_closure, ClosureStrategy, InProcessClosure, StoreClosure};

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::config::MigrationConfig;
use crate::error::StoreError;
use crate::store::Store;

/// Statistics of one index build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub entities_indexed: u64,
    pub edges_created: u64,
    /// Deepest distance present in the index.
    pub max_depth: u32,
    /// The depth cap cut off ancestors of at least one entity.
    pub truncated: bool,
    pub elapsed: Duration,
}

/// Rebuilds the hierarchy index and the counters derived from it.
pub struct HierarchyIndexBuilder {
    strategy: Box<dyn ClosureStrategy>,
    max_depth: Option<u32>,
}

impl HierarchyIndexBuilder {
    /// Builder for `strategy`. `None` indexes every ancestor.
    pub fn new(strategy: Box<dyn ClosureStrategy>, max_depth: Option<u32>) -> Self {
        Self {
            strategy,
            max_depth: max_depth.map(|cap| cap.max(1)),
        }
    }

    /// Builder with the strategy and depth cap selected by `config`.
    pub fn from_config(config: &MigrationConfig) -> Self {
        let strategy: Box<dyn ClosureStrategy> = if config.in_process_closure {
            Box::new(InProcessClosure)
        } else {
            Box::new(StoreClosure)
        };
        Self::new(strategy, config.max_hierarchy_depth)
    }

    /// Replace the index and refresh the maintained counters. Idempotent.
    pub fn build(&self, store: &mut dyn Store) -> Result<IndexStats, StoreError> {
        let started = Instant::now();
        tracing::info!(
            strategy = self.strategy.name(),
            max_depth = ?self.max_depth,
            "building hierarchy index"
        );

        let edges_created = self.strategy.rebuild(store, self.max_depth)?;
        store.refresh_hierarchy_counters()?;
        let summary = store.hierarchy_summary()?;

        let truncated = match self.max_depth {
            Some(cap) if summary.max_depth >= cap => cut_at(store, cap)?,
            _ => false,
        };
        let stats = IndexStats {
            entities_indexed: summary.entities,
            edges_created,
            max_depth: summary.max_depth,
            truncated,
            elapsed: started.elapsed(),
        };

        if stats.truncated {
            tracing::warn!(
                max_depth = ?self.max_depth,
                "hierarchy is deeper than the depth cap, distant ancestors were not indexed"
            );
        }
        tracing::info!(
            entities = stats.entities_indexed,
            edges = stats.edges_created,
            max_depth = stats.max_depth,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "hierarchy index built"
        );
        Ok(stats)
    }
}

/// Whether some entity indexed at distance `cap` from an ancestor still has
/// children of its own, so their ancestors at `cap + 1` were dropped.
fn cut_at(store: &mut dyn Store, cap: u32) -> Result<bool, StoreError> {
    let at_cap: HashSet<_> = store
        .hierarchy_edges()?
        .into_iter()
        .filter(|edge| edge.level_distance == cap)
        .map(|edge| edge.descendant_id)
        .collect();
    if at_cap.is_empty() {
        return Ok(false);
    }
    Ok(store.target_parent_links()?.iter().any(|link| {
        link.parent_id
            .is_some_and(|parent| parent != link.id && at_cap.contains(&parent))
    }))
}

impl std::fmt::Debug for HierarchyIndexBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyIndexBuilder")
            .field("strategy", &self.strategy.name())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::HierarchyCounters;
    use crate::migration::BatchMigrator;
    use crate::testing::seeded_store;

    fn migrated(links: &[(i64, Option<i64>)]) -> crate::store::SqliteStore {
        let mut store = seeded_store(links);
        BatchMigrator::new(MigrationConfig::default().with_batch_delay(Duration::ZERO))
            .run(&mut store)
            .unwrap();
        store
    }

    #[test]
    fn test_build_refreshes_counters() {
        // 1 has children 2 and 3; 4 is a grandchild through 2
        let mut store = migrated(&[(1, None), (2, Some(1)), (3, Some(1)), (4, Some(2))]);
        let stats = HierarchyIndexBuilder::new(Box::new(StoreClosure), None)
            .build(&mut store)
            .unwrap();

        assert_eq!(stats.entities_indexed, 4);
        assert_eq!(stats.edges_created, 4);
        assert_eq!(stats.max_depth, 2);
        assert_eq!(
            store.hierarchy_counters(1).unwrap(),
            Some(HierarchyCounters {
                direct_referrals: 2,
                network_size: 3,
                hierarchy_level: 0,
            })
        );
        assert_eq!(store.hierarchy_counters(4).unwrap().unwrap().hierarchy_level, 2);
    }

    #[test]
    fn test_strategies_agree_with_orphans_and_cycles() {
        // 10 -> 11 -> 12 -> 10 is a cycle; 20's parent was never migrated
        let links = [
            (1, None),
            (2, Some(1)),
            (3, Some(2)),
            (10, Some(12)),
            (11, Some(10)),
            (12, Some(11)),
            (20, Some(99)),
            (21, Some(20)),
        ];
        let mut in_process = migrated(&links);
        let mut store_side = migrated(&links);

        HierarchyIndexBuilder::new(Box::new(InProcessClosure), None)
            .build(&mut in_process)
            .unwrap();
        HierarchyIndexBuilder::new(Box::new(StoreClosure), None)
            .build(&mut store_side)
            .unwrap();

        let edges = in_process.hierarchy_edges().unwrap();
        assert_eq!(edges, store_side.hierarchy_edges().unwrap());
        assert!(edges.iter().all(|e| e.ancestor_id != e.descendant_id));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let mut store = migrated(&[(1, None), (2, Some(1)), (3, Some(2))]);
        let builder = HierarchyIndexBuilder::new(Box::new(InProcessClosure), None);
        let first = builder.build(&mut store).unwrap();
        let edges = store.hierarchy_edges().unwrap();
        let second = builder.build(&mut store).unwrap();

        assert_eq!(first.edges_created, second.edges_created);
        assert_eq!(edges, store.hierarchy_edges().unwrap());
    }

    #[test]
    fn test_long_chain_is_fully_indexed() {
        let links: Vec<_> = (1..=70)
            .map(|id| (id, if id == 1 { None } else { Some(id - 1) }))
            .collect();
        let mut store = migrated(&links);
        let stats = HierarchyIndexBuilder::from_config(&MigrationConfig::default())
            .build(&mut store)
            .unwrap();

        assert_eq!(stats.edges_created, 2415);
        assert_eq!(stats.max_depth, 69);
        assert!(!stats.truncated);
        assert_eq!(store.hierarchy_counters(70).unwrap().unwrap().hierarchy_level, 69);
    }

    #[test]
    fn test_cap_reports_truncation_only_when_entities_sit_below_it() {
        // 1 <- 2 <- 3 <- 4: deepest distance is exactly 3
        let chain = [(1, None), (2, Some(1)), (3, Some(2)), (4, Some(3))];
        for strategy in [
            Box::new(InProcessClosure) as Box<dyn ClosureStrategy>,
            Box::new(StoreClosure),
        ] {
            let mut store = migrated(&chain);
            let stats = HierarchyIndexBuilder::new(strategy, Some(3))
                .build(&mut store)
                .unwrap();
            assert_eq!(stats.max_depth, 3);
            assert!(!stats.truncated);
        }

        let mut store = migrated(&chain);
        let stats = HierarchyIndexBuilder::new(Box::new(StoreClosure), Some(2))
            .build(&mut store)
            .unwrap();
        assert_eq!(stats.max_depth, 2);
        assert_eq!(stats.edges_created, 5);
        assert!(stats.truncated);
    }
}
