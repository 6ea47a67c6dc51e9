//! Benchmarks for the data-structure hot paths: Fenwick updates and
//! weighted search, copy-on-write map divergence, and systematic
//! resampling.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use taraka_slam::{Bitree, CowMap, ParticleFilter};

fn bench_bitree(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitree");

    group.bench_function("set_1k", |b| {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut tree = Bitree::new();
        for _ in 0..1000 {
            tree.push_back(rng.gen::<f64>());
        }
        b.iter(|| {
            let i = rng.gen_range(0..1000);
            tree.set(i, rng.gen::<f64>());
            black_box(tree.accumulate());
        });
    });

    group.bench_function("binary_search_1k", |b| {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut tree = Bitree::new();
        for _ in 0..1000 {
            tree.push_back(rng.gen::<f64>());
        }
        let total = tree.accumulate();
        b.iter(|| black_box(tree.binary_search(rng.gen::<f64>() * total)));
    });

    group.finish();
}

fn bench_cowmap(c: &mut Criterion) {
    c.bench_function("cowmap_insert_into_1k_clone", |b| {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut map = CowMap::new();
        for _ in 0..1000 {
            let k = rng.gen::<u64>();
            map.insert(k, k);
        }
        b.iter(|| {
            let mut fork = map.clone();
            fork.insert(rng.gen::<u64>(), 0);
            black_box(fork.len());
        });
    });
}

fn bench_resample(c: &mut Criterion) {
    c.bench_function("systematic_resample_1k", |b| {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        b.iter(|| {
            let mut filter = ParticleFilter::initialize(1000, 0u64);
            filter.update(|_| rng.gen::<f64>());
            filter.resample(&mut rng, 1000).unwrap();
            black_box(filter.effective_size());
        });
    });
}

criterion_group!(benches, bench_bitree, bench_cowmap, bench_resample);
criterion_main!(benches);
