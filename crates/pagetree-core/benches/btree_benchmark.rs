//! Criterion micro-benchmarks for the tree over the in-memory store.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use pagetree_core::{BTree, MemoryPageStore};

fn populated(n: u32) -> BTree<MemoryPageStore> {
    let mut tree = BTree::new(MemoryPageStore::new(), 4).expect("order 4 encodes");
    for i in 0..n {
        // big-endian keys keep byte order equal to numeric order
        tree.insert(&i.to_be_bytes(), &i.to_le_bytes()).expect("insert");
    }
    tree
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert_1k_sequential", |b| b.iter(|| populated(1_000)));
}

fn bench_search(c: &mut Criterion) {
    let tree = populated(10_000);
    let mut i = 0u32;
    c.bench_function("search_hit", |b| {
        b.iter(|| {
            i = (i + 7_919) % 10_000;
            black_box(tree.search(&i.to_be_bytes()).expect("search"))
        });
    });
}

fn bench_delete(c: &mut Criterion) {
    c.bench_function("fill_then_drain_1k", |b| {
        b.iter(|| {
            let mut tree = populated(1_000);
            for i in 0..1_000u32 {
                tree.delete(&i.to_be_bytes()).expect("delete");
            }
            tree
        });
    });
}

criterion_group!(benches, bench_insert, bench_search, bench_delete);
criterion_main!(benches);
