use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use fake::{Fake, Faker};

use beetree::{MemoryLog, RangeOptions, Tree, TreeConfig};

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("large-tree");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(15));

    group.bench_function("insert 10.000 strings", |b| {
        let n_entries = 10_000;
        let name_faker = fake::faker::name::en::Name();
        // Create some random strings to insert
        let mut entries: Vec<(String, String)> = Vec::with_capacity(n_entries);
        for _ in 0..n_entries {
            entries.push((Faker.fake::<String>(), name_faker.fake()))
        }

        b.iter(|| {
            let tree = Tree::new(MemoryLog::new(), TreeConfig::default());
            let mut batch = tree.batch();
            for e in &entries {
                batch.put(e.0.as_bytes(), e.1.as_bytes()).unwrap();
            }
            batch.flush().unwrap();
        })
    });

    group.bench_function("search existing string", |b| {
        let n_entries = 10_000;
        let name_faker = fake::faker::name::en::Name();

        let search_key = Faker.fake::<String>();
        let search_value: String = name_faker.fake();

        let mut tree = Tree::new(MemoryLog::new(), TreeConfig::default());
        tree.put(search_key.as_bytes(), search_value.as_bytes())
            .unwrap();

        // Create some more random strings
        for _ in 1..n_entries {
            let key: String = Faker.fake();
            let value: String = name_faker.fake();
            tree.put(key.as_bytes(), value.as_bytes()).unwrap();
        }
        b.iter(|| {
            let found = tree.get(search_key.as_bytes()).unwrap().unwrap();
            assert_eq!(search_value.as_bytes(), &found.value[..]);
        })
    });

    group.bench_function("scan 1.000 entries", |b| {
        let mut tree = Tree::new(MemoryLog::new(), TreeConfig::default());
        for i in 0..1_000 {
            let key = format!("{:04}", i);
            tree.put(key.as_bytes(), key.as_bytes()).unwrap();
        }
        b.iter(|| {
            let count = tree.range(RangeOptions::default()).unwrap().count();
            assert_eq!(1_000, count);
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
