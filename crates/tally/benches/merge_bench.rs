//! 🧪 How fast do sub-batch results fold together? The merge runs once per
//! sub-batch on a single owner, so it sits on the critical path of every run.

use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use rand::{Rng, SeedableRng, rngs::StdRng};

use tally::aggregate::{GroupCounts, MergedAggregateMap, normalize_key};

const GROUPS: usize = 5_000;
const SUB_BATCHES: usize = 24;

// -- 🎲 each sub-batch touches a random 60% of the groups, like a real split would
fn make_partials() -> Vec<Vec<(String, GroupCounts)>> {
    let mut rng = StdRng::seed_from_u64(0xC0FF_EE00_DADA_BEEF);
    (0..SUB_BATCHES)
        .map(|_| {
            (0..GROUPS)
                .filter(|_| rng.random_bool(0.6))
                .map(|g| {
                    let total = rng.random_range(1..100u64);
                    (
                        format!("{g:08x}-0000-4000-8000-000000000000"),
                        GroupCounts::new(Some(format!("Group {g}")), total, total / 2, total / 3),
                    )
                })
                .collect()
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let partials = make_partials();

    c.bench_function("merge/fold_sub_batches", |b| {
        b.iter_batched(
            || partials.clone(),
            |partials| {
                let mut merged = MergedAggregateMap::new();
                for partial in partials {
                    merged.merge(partial.into_iter().collect());
                }
                black_box(merged.len());
            },
            BatchSize::LargeInput,
        );
    });

    let raw_keys: Vec<serde_json::Value> = (0..GROUPS)
        .map(|g| serde_json::json!(format!("{g:08X}-0000-4000-8000-000000000000")))
        .collect();
    c.bench_function("merge/normalize_keys", |b| {
        b.iter(|| {
            for key in &raw_keys {
                black_box(normalize_key(key));
            }
        });
    });
}

criterion_group!(benches, bench_merge);
criterion_main!(benches);
