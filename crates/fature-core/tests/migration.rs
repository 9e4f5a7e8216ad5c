mod common;

use common::{fast_migration, legacy_store, small_tree};
use fature_core::{
    BatchMigrator, Config, ConsistencyValidator, Entity, HierarchyCounters, HierarchyEdge,
    HierarchyIndexBuilder, MigrationPipeline, SqliteStore, Store,
};

fn pipeline_config(batch_size: i64) -> Config {
    Config {
        migration: fast_migration(batch_size),
        ..Default::default()
    }
}

#[test]
fn test_three_entity_chain() {
    let mut store = legacy_store(&[(1, None), (2, Some(1)), (3, Some(2))]);
    let report = MigrationPipeline::new(pipeline_config(2))
        .run(&mut store)
        .unwrap();

    let processed: Vec<u64> = report.migration.batches.iter().map(|b| b.processed).collect();
    assert_eq!(processed, vec![2, 1]);
    assert!(report.migration.is_clean());

    assert_eq!(
        store.hierarchy_edges().unwrap(),
        vec![
            HierarchyEdge::new(1, 2, 1),
            HierarchyEdge::new(1, 3, 2),
            HierarchyEdge::new(2, 3, 1),
        ]
    );
    assert_eq!(report.index.max_depth, 2);
    assert!(report.validation.checks().iter().all(|c| c.passed), "{}", report.validation);
}

#[test]
fn test_long_chain_is_indexed_to_the_root() {
    let links: Vec<_> = (1..=70)
        .map(|id| (id, if id == 1 { None } else { Some(id - 1) }))
        .collect();

    for in_process in [false, true] {
        let mut store = legacy_store(&links);
        let mut config = pipeline_config(25);
        config.migration.in_process_closure = in_process;
        let report = MigrationPipeline::new(config).run(&mut store).unwrap();

        assert_eq!(report.index.edges_created, 2415);
        assert_eq!(report.index.max_depth, 69);
        assert!(!report.index.truncated);
        assert!(store.hierarchy_edges().unwrap().contains(&HierarchyEdge::new(1, 70, 69)));
        assert_eq!(store.hierarchy_counters(1).unwrap().unwrap().network_size, 69);
        assert!(report.validation.passed(), "{}", report.validation);
    }
}

#[test]
fn test_counters_follow_the_tree() {
    let mut store = small_tree();
    MigrationPipeline::new(pipeline_config(3))
        .run(&mut store)
        .unwrap();

    assert_eq!(
        store.hierarchy_counters(1).unwrap(),
        Some(HierarchyCounters {
            direct_referrals: 2,
            network_size: 3,
            hierarchy_level: 0,
        })
    );
    assert_eq!(
        store.hierarchy_counters(4).unwrap(),
        Some(HierarchyCounters {
            direct_referrals: 0,
            network_size: 0,
            hierarchy_level: 2,
        })
    );
}

#[test]
fn test_bad_record_fails_count_parity_only() {
    let mut store = small_tree();
    store
        .insert_source_entity(&Entity::new(5, Some(1), "legacy oddity").with_status("archived"))
        .unwrap();
    store.create_derived_schema().unwrap();

    let migration = BatchMigrator::new(fast_migration(10)).run(&mut store).unwrap();
    assert_eq!(migration.total_processed, 5);
    assert_eq!(migration.total_failed, 1);
    assert_eq!(migration.failures().next().map(|f| f.id), Some(5));

    HierarchyIndexBuilder::from_config(&fast_migration(10))
        .build(&mut store)
        .unwrap();
    let report = ConsistencyValidator::default().validate(&mut store).unwrap();
    assert!(!report.count_parity.passed);
    assert_eq!(report.count_parity.detail, "source=5, target=4");
    assert!(report.hierarchy_integrity.passed);
    assert!(report.referral_counts.passed);
    assert!(!report.passed());
}

#[test]
fn test_rerun_pipeline_is_idempotent() {
    let mut store = small_tree();
    let pipeline = MigrationPipeline::new(pipeline_config(2));
    let first = pipeline.run(&mut store).unwrap();
    let second = pipeline.run(&mut store).unwrap();

    assert_eq!(first.index.edges_created, second.index.edges_created);
    assert_eq!(second.migration.total_failed, 4, "already migrated rows are rejected");
    assert!(second.validation.passed(), "{}", second.validation);
}

#[test]
fn test_file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fature.db");
    let derived = dir.path().join("fature.db.fature_v2");

    {
        let mut store = SqliteStore::open(&path, &derived).unwrap();
        store.bootstrap_source_schema().unwrap();
        for (id, parent) in [(1, None), (2, Some(1))] {
            store
                .insert_source_entity(&Entity::new(id, parent, format!("affiliate {id}")))
                .unwrap();
        }
        MigrationPipeline::new(pipeline_config(100))
            .run(&mut store)
            .unwrap();
    }

    let mut reopened = SqliteStore::open(&path, &derived).unwrap();
    assert!(reopened.derived_schema_exists().unwrap());
    assert_eq!(reopened.target_entity_count().unwrap(), 2);
    assert!(ConsistencyValidator::default()
        .validate(&mut reopened)
        .unwrap()
        .passed());
}
