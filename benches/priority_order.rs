//! Order-maintenance microbenchmarks: insertion patterns that do and do
//! not trigger tag-range relabeling, plus raw comparison cost.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chronon::Priority;

fn bench_insert_append(c: &mut Criterion) {
    c.bench_function("priority_insert_append_1k", |b| {
        b.iter(|| {
            let mut p = Priority::new_base();
            for _ in 0..1000 {
                p = p.insert_after().unwrap();
            }
            black_box(p)
        })
    });
}

fn bench_insert_same_point(c: &mut Criterion) {
    // Repeated insertion after the same node exhausts the local gap fast
    // and keeps the relabeling path hot.
    c.bench_function("priority_insert_same_point_1k", |b| {
        b.iter(|| {
            let base = Priority::new_base();
            let mut keep = Vec::with_capacity(1000);
            for _ in 0..1000 {
                keep.push(base.insert_after().unwrap());
            }
            black_box(keep)
        })
    });
}

fn bench_compare(c: &mut Criterion) {
    let a = Priority::new_base();
    let b2 = a.insert_after().unwrap();
    c.bench_function("priority_compare", |b| {
        b.iter(|| black_box(black_box(&a) < black_box(&b2)))
    });
}

criterion_group!(benches, bench_insert_append, bench_insert_same_point, bench_compare);
criterion_main!(benches);
