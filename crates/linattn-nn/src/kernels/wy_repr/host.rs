use burn::{
    prelude::Backend,
    tensor::{Tensor, TensorData},
};
use linattn_trace::tracy_scope;

use crate::kernels::{
    chunk_common::{
        WyMode,
        layout::{ChunkSpan, block_slice, chunk_spans, time_slice},
    },
    wy_repr::{WyBackward, WyForward, WyRepresentation},
};

/// Reference WY collaborator built from batched matmuls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkWy {
    pub mode: WyMode,
}

impl ChunkWy {
    pub fn new(mode: WyMode) -> Self {
        Self { mode }
    }
}

fn strict_lower<B: Backend>(len: usize, device: &B::Device) -> Tensor<B, 4> {
    let data: Vec<f32> = (0..len)
        .flat_map(|row| (0..len).map(move |col| if col < row { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_data(TensorData::new(data, [1, 1, len, len]), device)
}

fn identity<B: Backend>(len: usize, device: &B::Device) -> Tensor<B, 4> {
    let data: Vec<f32> = (0..len)
        .flat_map(|row| (0..len).map(move |col| if col == row { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_data(TensorData::new(data, [1, 1, len, len]), device)
}

fn beta_column<B: Backend>(beta: &Tensor<B, 3>, span: &ChunkSpan) -> Tensor<B, 4> {
    let [batch_size, num_heads, _] = beta.dims();
    beta.clone()
        .slice([0..batch_size, 0..num_heads, span.range()])
        .reshape([batch_size, num_heads, span.len, 1])
}

/// `(I + L)^-1` for a strictly lower-triangular `L` of size `len`.
///
/// `L` is nilpotent, so the Neumann series is finite and can be summed by repeated
/// squaring: `(I - L)(I + L^2)(I + L^4)...`.
fn unit_lower_inverse<B: Backend>(lower: Tensor<B, 4>, len: usize) -> Tensor<B, 4> {
    let device = lower.device();
    let mut inverse = lower.clone().neg() + identity(len, &device);
    let mut power = lower.clone().matmul(lower);
    let mut covered = 2;
    while covered < len {
        inverse = inverse.clone() + inverse.matmul(power.clone());
        power = power.clone().matmul(power);
        covered *= 2;
    }
    inverse
}

impl ChunkWy {
    fn written_value<B: Backend>(&self, value: Tensor<B, 4>, beta: &Tensor<B, 4>) -> Tensor<B, 4> {
        match self.mode {
            WyMode::Erase => value,
            WyMode::Gated => value * beta.clone(),
        }
    }

    fn pad_columns<B: Backend>(block: Tensor<B, 4>, chunk_size: usize) -> Tensor<B, 4> {
        let [batch_size, num_heads, len, width] = block.dims();
        if width == chunk_size {
            return block;
        }
        let padding = Tensor::zeros(
            [batch_size, num_heads, len, chunk_size - width],
            &block.device(),
        );
        Tensor::cat(vec![block, padding], 3)
    }

    fn apply<B: Backend>(
        &self,
        key: &Tensor<B, 4>,
        value: &Tensor<B, 4>,
        beta: &Tensor<B, 3>,
        transform: Tensor<B, 4>,
        chunk_size: usize,
    ) -> WyForward<B> {
        let seq_len = key.dims()[2];
        let (wy_keys, wy_values): (Vec<_>, Vec<_>) = chunk_spans(seq_len, chunk_size)
            .iter()
            .map(|span| {
                let block = block_slice(&transform, span.range(), 0..span.len);
                let beta = beta_column(beta, span);
                let key_chunk = time_slice(key, span.range()) * beta.clone();
                let value_chunk = self.written_value(time_slice(value, span.range()), &beta);

                (block.clone().matmul(key_chunk), block.matmul(value_chunk))
            })
            .unzip();

        WyForward {
            wy_key: Tensor::cat(wy_keys, 2),
            wy_value: Tensor::cat(wy_values, 2),
            transform,
        }
    }
}

impl<B: Backend> WyRepresentation<B> for ChunkWy {
    fn forward(
        &self,
        key: &Tensor<B, 4>,
        value: &Tensor<B, 4>,
        beta: &Tensor<B, 3>,
        chunk_size: usize,
    ) -> WyForward<B> {
        tracy_scope!("wy_forward");
        let seq_len = key.dims()[2];
        let device = key.device();

        let blocks = chunk_spans(seq_len, chunk_size)
            .iter()
            .map(|span| {
                let key_chunk = time_slice(key, span.range());
                let scaled_key = key_chunk.clone() * beta_column(beta, span);
                let lower = scaled_key.matmul(key_chunk.transpose())
                    * strict_lower(span.len, &device);

                Self::pad_columns(unit_lower_inverse(lower, span.len), chunk_size)
            })
            .collect();

        self.apply(key, value, beta, Tensor::cat(blocks, 2), chunk_size)
    }

    fn recompute(
        &self,
        key: &Tensor<B, 4>,
        value: &Tensor<B, 4>,
        beta: &Tensor<B, 3>,
        transform: &Tensor<B, 4>,
        chunk_size: usize,
    ) -> WyForward<B> {
        tracy_scope!("wy_recompute");
        self.apply(key, value, beta, transform.clone(), chunk_size)
    }

    fn backward(
        &self,
        key: &Tensor<B, 4>,
        value: &Tensor<B, 4>,
        beta: &Tensor<B, 3>,
        transform: &Tensor<B, 4>,
        wy_key_grad: &Tensor<B, 4>,
        wy_value_grad: &Tensor<B, 4>,
        chunk_size: usize,
    ) -> WyBackward<B> {
        tracy_scope!("wy_backward");
        let [batch_size, num_heads, seq_len, _] = key.dims();
        let device = key.device();

        let mut key_grads = Vec::new();
        let mut value_grads = Vec::new();
        let mut beta_grads = Vec::new();

        for span in chunk_spans(seq_len, chunk_size) {
            let block = block_slice(transform, span.range(), 0..span.len);
            let beta_chunk = beta_column(beta, &span);
            let key_chunk = time_slice(key, span.range());
            let value_chunk = time_slice(value, span.range());
            let scaled_key = key_chunk.clone() * beta_chunk.clone();
            let written = self.written_value(value_chunk.clone(), &beta_chunk);
            let wy_key_grad = time_slice(wy_key_grad, span.range());
            let wy_value_grad = time_slice(wy_value_grad, span.range());

            let block_t = block.transpose();
            let transform_grad = wy_key_grad.clone().matmul(scaled_key.clone().transpose())
                + wy_value_grad.clone().matmul(written.transpose());
            let lower_grad = block_t
                .clone()
                .matmul(transform_grad)
                .matmul(block_t.clone())
                .neg()
                * strict_lower(span.len, &device);

            let scaled_key_grad =
                block_t.clone().matmul(wy_key_grad) + lower_grad.clone().matmul(key_chunk.clone());
            let written_grad = block_t.matmul(wy_value_grad);

            key_grads.push(
                lower_grad.transpose().matmul(scaled_key)
                    + scaled_key_grad.clone() * beta_chunk.clone(),
            );
            let beta_grad = (scaled_key_grad * key_chunk).sum_dim(3);

            let (value_grad, beta_grad) = match self.mode {
                WyMode::Erase => (written_grad, beta_grad),
                WyMode::Gated => (
                    written_grad.clone() * beta_chunk,
                    beta_grad + (written_grad * value_chunk).sum_dim(3),
                ),
            };
            value_grads.push(value_grad);
            beta_grads.push(beta_grad.reshape([batch_size, num_heads, span.len]));
        }

        WyBackward {
            key_grad: Tensor::cat(key_grads, 2),
            value_grad: Tensor::cat(value_grads, 2),
            beta_grad: Tensor::cat(beta_grads, 2),
        }
    }
}
