use criterion::{criterion_group, criterion_main, Criterion};
use rand::SeedableRng;
use sysfuzz::{gen::ArgGen, resources::Resources, syscall::Registry, RngType};

pub fn bench_gen(c: &mut Criterion) {
    let registry = Registry::builtin().unwrap();
    let mut rng = RngType::seed_from_u64(0);
    let res = Resources::new(&mut rng).unwrap();
    let mut idx = 0;
    c.bench_function("Gen", |b| {
        b.iter(|| {
            idx = (idx + 1) % registry.len();
            let entry = registry.get(idx).entry();
            ArgGen::new(&mut rng, &res, 0.1).generate(idx, entry)
        })
    });
}

criterion_group!(benches, bench_gen);
criterion_main!(benches);
