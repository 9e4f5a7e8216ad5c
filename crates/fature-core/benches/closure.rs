//! Hierarchy closure benchmarks.
//!
//! Compares the in-process closure against the store-side recursive query
//! on random forests of increasing size.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fature_core::hierarchy::compute_closure;
use fature_core::{
    Entity, HierarchyIndexBuilder, InProcessClosure, ParentLink, SqliteStore, Store, StoreClosure,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Random forest: each entity picks a parent among the previous ones, or
/// none with probability 1/20.
fn random_links(size: i64, seed: u64) -> Vec<ParentLink> {
    let mut rng = StdRng::seed_from_u64(seed);
    (1..=size)
        .map(|id| {
            let parent_id = if id == 1 || rng.gen_ratio(1, 20) {
                None
            } else {
                Some(rng.gen_range(1..id))
            };
            ParentLink { id, parent_id }
        })
        .collect()
}

fn migrated_store(links: &[ParentLink]) -> SqliteStore {
    let mut store = SqliteStore::open_in_memory().unwrap();
    store.bootstrap_source_schema().unwrap();
    store.create_derived_schema().unwrap();
    let entities: Vec<Entity> = links
        .iter()
        .map(|link| Entity::new(link.id, link.parent_id, format!("affiliate {}", link.id)))
        .collect();
    store.insert_batch(&entities).unwrap();
    store
}

fn bench_compute_closure(c: &mut Criterion) {
    let mut group = c.benchmark_group("closure/compute");

    for size in [1_000, 10_000, 50_000] {
        let links = random_links(size, 7);
        group.bench_with_input(BenchmarkId::from_parameter(size), &links, |b, links| {
            b.iter(|| black_box(compute_closure(links, None)));
        });
    }

    group.finish();
}

fn bench_index_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("closure/build");
    group.sample_size(10);

    for size in [1_000, 10_000] {
        let links = random_links(size, 11);

        group.bench_with_input(BenchmarkId::new("in_process", size), &links, |b, links| {
            let mut store = migrated_store(links);
            let builder = HierarchyIndexBuilder::new(Box::new(InProcessClosure), None);
            b.iter(|| black_box(builder.build(&mut store).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("store", size), &links, |b, links| {
            let mut store = migrated_store(links);
            let builder = HierarchyIndexBuilder::new(Box::new(StoreClosure), None);
            b.iter(|| black_box(builder.build(&mut store).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compute_closure, bench_index_build);
criterion_main!(benches);
