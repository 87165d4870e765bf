use criterion::{self, criterion_group, criterion_main, BenchmarkId};

use murmur::{ConfigStore, NodeMetadata};

fn filled_store(n: usize) -> ConfigStore {
    let store = ConfigStore::new(NodeMetadata::new());
    for i in 0..n {
        store.put(format!("key{i}"), format!("value{i}"));
    }
    store
}

fn write_direct(c: &mut criterion::Criterion) {
    let store = ConfigStore::new(NodeMetadata::new());

    c.bench_with_input(BenchmarkId::new("put", "store"), &store, |b, s| {
        b.iter(|| s.put("key".to_string(), "value".to_string()))
    });
}

fn read_direct(c: &mut criterion::Criterion) {
    let store = filled_store(1_000);

    c.bench_with_input(BenchmarkId::new("get", "store"), &store, |b, s| {
        b.iter(|| assert_eq!(s.get("key500"), "value500"))
    });
}

fn merge_remote(c: &mut criterion::Criterion) {
    let mut group = c.benchmark_group("merge_remote_state");
    for size in [10, 100, 1_000] {
        let remote = filled_store(size)
            .encode_local_state()
            .expect("encode remote state");
        let local = ConfigStore::new(NodeMetadata::new());
        group.bench_with_input(BenchmarkId::from_parameter(size), &remote, |b, buf| {
            b.iter(|| local.merge_remote_state(buf).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, write_direct, read_direct, merge_remote);
criterion_main!(benches);
