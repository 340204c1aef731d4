use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::Array2;

use distributed_pod::partition::{partition_rows, split_rows};
use distributed_pod::{run_group, tsqr_svd, ProcessGroup, SerialGroup};

fn bench_tsqr_svd(c: &mut Criterion) {
    let snapshots =
        Array2::from_shape_fn((4096, 16), |(i, j)| ((i * 31 + j * 17) % 97) as f64 / 97.0);

    c.bench_function("tsqr_svd_serial_4096x16", |b| {
        b.iter(|| tsqr_svd(black_box(snapshots.view()), &SerialGroup).unwrap())
    });

    let slices = partition_rows(snapshots.nrows(), 4).unwrap();
    let blocks = split_rows(&snapshots, &slices).unwrap();
    c.bench_function("tsqr_svd_4_workers_4096x16", |b| {
        b.iter(|| run_group(4, |group| tsqr_svd(blocks[group.rank()].view(), &group).unwrap()))
    });
}

criterion_group!(benches, bench_tsqr_svd);
criterion_main!(benches);
