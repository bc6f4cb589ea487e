use std::hint::black_box;

use divan::Bencher;
use linattn_nn::kernels::{
    chunk_common::CheckpointLevel, chunk_delta_rule::chunk_delta_rule_forward,
};

#[path = "../../common/mod.rs"]
mod common;

type B = common::BenchBackend;

#[divan::bench(args = common::CHUNK_CASES)]
fn bench_chunk_delta_rule_forward(bencher: Bencher<'_, '_>, case: &common::ChunkCase) {
    let device = common::bench_device();
    let input = common::random_input::<B>(case, &device);
    let config = case.config(CheckpointLevel::Recompute);

    bencher.bench_local(|| {
        black_box(chunk_delta_rule_forward(
            input.query.clone(),
            input.key.clone(),
            input.value.clone(),
            input.beta.clone(),
            None,
            &config,
        ))
    });
}

fn main() {
    common::announce_backend();
    divan::main();
}
