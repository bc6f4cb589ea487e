use std::hint::black_box;

use divan::Bencher;
use linattn_nn::kernels::{
    chunk_common::CheckpointLevel,
    chunk_retention::{chunk_retention_backward, chunk_retention_forward},
};

#[path = "../../common/mod.rs"]
mod common;

type B = common::BenchBackend;

fn bench_backward(bencher: Bencher<'_, '_>, case: &common::ChunkCase, checkpoint: CheckpointLevel) {
    let device = common::bench_device();
    let input = common::random_input::<B>(case, &device);
    let config = case.config(checkpoint);
    let forward = chunk_retention_forward(
        input.query.clone(),
        input.key.clone(),
        input.value.clone(),
        None,
        &config,
    )
    .expect("valid bench case");
    let output_grad = common::random_output_grad::<B>(case, &device);

    bencher.bench_local(|| {
        black_box(chunk_retention_backward(
            input.query.clone(),
            input.key.clone(),
            input.value.clone(),
            None,
            forward.snapshots.clone(),
            output_grad.clone(),
            None,
            &config,
        ))
    });
}

#[divan::bench(args = common::CHUNK_CASES)]
fn bench_chunk_retention_backward_retained(bencher: Bencher<'_, '_>, case: &common::ChunkCase) {
    bench_backward(bencher, case, CheckpointLevel::Retain);
}

#[divan::bench(args = common::CHUNK_CASES)]
fn bench_chunk_retention_backward_recomputed(bencher: Bencher<'_, '_>, case: &common::ChunkCase) {
    bench_backward(bencher, case, CheckpointLevel::Recompute);
}

fn main() {
    common::announce_backend();
    divan::main();
}
