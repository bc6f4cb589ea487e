#![allow(dead_code)]
use std::fmt;

use burn::{Tensor, prelude::Backend, tensor::Distribution};
use linattn_nn::kernels::chunk_common::{CheckpointLevel, ChunkKernelConfig};

#[cfg(feature = "wgpu")]
pub type BenchBackend =
    burn_cubecl::CubeBackend<burn::backend::wgpu::WgpuRuntime, f32, i32, u32>;
#[cfg(not(feature = "wgpu"))]
pub type BenchBackend = burn::backend::NdArray<f32>;

pub fn selected_backend_name() -> &'static str {
    if cfg!(feature = "wgpu") { "wgpu" } else { "ndarray" }
}

pub fn bench_device() -> <BenchBackend as Backend>::Device {
    <BenchBackend as Backend>::Device::default()
}

pub fn announce_backend() {
    println!("linattn-nn kernel bench backend: {}", selected_backend_name());
}

#[derive(Clone, Copy, Debug)]
pub struct ChunkCase {
    pub name: &'static str,
    pub batch_size: usize,
    pub num_heads: usize,
    pub seq_len: usize,
    pub key_dim: usize,
    pub value_dim: usize,
    pub chunk_size: usize,
}

impl ChunkCase {
    pub const fn new(
        name: &'static str,
        batch_size: usize,
        num_heads: usize,
        seq_len: usize,
        key_dim: usize,
        value_dim: usize,
        chunk_size: usize,
    ) -> Self {
        Self {
            name,
            batch_size,
            num_heads,
            seq_len,
            key_dim,
            value_dim,
            chunk_size,
        }
    }

    pub fn config(&self, checkpoint: CheckpointLevel) -> ChunkKernelConfig {
        ChunkKernelConfig::new()
            .with_chunk_size(self.chunk_size)
            .with_checkpoint(checkpoint)
    }
}

impl fmt::Display for ChunkCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

pub const CHUNK_CASES: &[ChunkCase] = &[
    ChunkCase::new("b1_h4_t128_k64_v64_c32", 1, 4, 128, 64, 64, 32),
    ChunkCase::new("b2_h8_t256_k64_v64_c64", 2, 8, 256, 64, 64, 64),
    ChunkCase::new("b1_h8_t512_k128_v128_c64", 1, 8, 512, 128, 128, 64),
];

pub struct ChunkInput<B: Backend> {
    pub query: Tensor<B, 4>,
    pub key: Tensor<B, 4>,
    pub value: Tensor<B, 4>,
    pub beta: Tensor<B, 3>,
}

pub fn random_input<B: Backend>(case: &ChunkCase, device: &B::Device) -> ChunkInput<B> {
    let key_shape = [case.batch_size, case.num_heads, case.seq_len, case.key_dim];
    let value_shape = [case.batch_size, case.num_heads, case.seq_len, case.value_dim];
    let key = Tensor::<B, 4>::random(key_shape, Distribution::Normal(0.0, 1.0), device);
    let norm = key.clone().powi_scalar(2).sum_dim(3).sqrt();

    ChunkInput {
        query: Tensor::random(key_shape, Distribution::Normal(0.0, 1.0), device),
        key: key / norm,
        value: Tensor::random(value_shape, Distribution::Normal(0.0, 1.0), device),
        beta: Tensor::random(
            [case.batch_size, case.num_heads, case.seq_len],
            Distribution::Uniform(0.0, 1.0),
            device,
        ),
    }
}

pub fn random_output_grad<B: Backend>(case: &ChunkCase, device: &B::Device) -> Tensor<B, 4> {
    Tensor::random(
        [case.batch_size, case.num_heads, case.seq_len, case.value_dim],
        Distribution::Normal(0.0, 1.0),
        device,
    )
}
