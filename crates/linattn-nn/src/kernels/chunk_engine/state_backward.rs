use burn::{prelude::Backend, tensor::Tensor};
use linattn_trace::tracy_scope;
use log::trace;

use crate::kernels::chunk_common::{
    TileConfig,
    decay::{ChunkWeightCache, HeadDecay},
    layout::{chunk_spans, feature_slice, stack_snapshots, sub_spans, tile_ranges, time_slice},
};

/// State gradients of the backward state pass.
#[derive(Clone, Debug)]
pub struct StateGrads<B: Backend> {
    /// `(B, H, NT, K, V)`, entry `i` is the gradient w.r.t. the state leaving chunk `i`.
    pub state_grads: Tensor<B, 5>,
    /// `(B, H, K, V)` gradient w.r.t. the initial state.
    pub initial_state_grad: Tensor<B, 4>,
}

/// Delta-rule state gradients, plus the total gradient of the corrected values.
#[derive(Clone, Debug)]
pub struct DeltaStateGrads<B: Backend> {
    pub grads: StateGrads<B>,
    /// `(B, H, T, V)`.
    pub corrected_value_grad: Tensor<B, 4>,
}

fn final_grad_tile<B: Backend>(
    final_state_grad: Option<&Tensor<B, 4>>,
    value_tile: std::ops::Range<usize>,
    dims: [usize; 3],
    device: &B::Device,
) -> Tensor<B, 4> {
    let [batch_size, num_heads, key_dim] = dims;
    match final_state_grad {
        Some(grad) => feature_slice(grad, value_tile),
        None => Tensor::zeros([batch_size, num_heads, key_dim, value_tile.len()], device),
    }
}

/// Retention reverse recurrence: `dH = gamma^L dH + scale * Q^T (dO * gamma^(t+1))`.
pub fn chunk_bwd_dh<B: Backend>(
    query: &Tensor<B, 4>,
    output_grad: &Tensor<B, 4>,
    final_state_grad: Option<&Tensor<B, 4>>,
    decay: &HeadDecay,
    scale: f64,
    tiles: &TileConfig,
) -> StateGrads<B> {
    tracy_scope!("chunk_bwd_dh");
    let [batch_size, num_heads, seq_len, key_dim] = query.dims();
    let value_dim = output_grad.dims()[3];
    let device = query.device();

    let spans = chunk_spans(seq_len, tiles.chunk_size);
    let weights = ChunkWeightCache::new(Some(decay), seq_len, tiles.chunk_size, &device);
    let query = query.clone().mul_scalar(scale);
    trace!("retention state backward over {} chunks", spans.len());

    let (tile_grads, tile_initial): (Vec<_>, Vec<_>) = tile_ranges(value_dim, tiles.state_block_v)
        .into_iter()
        .map(|value_tile| {
            let init = final_grad_tile(
                final_state_grad,
                value_tile.clone(),
                [batch_size, num_heads, key_dim],
                &device,
            );
            let output_grad = feature_slice(output_grad, value_tile);

            let (grad, mut snapshots) = spans.iter().rev().fold(
                (init, Vec::with_capacity(spans.len())),
                |(grad, mut snapshots), span| {
                    snapshots.push(grad.clone());
                    let weight = weights.get(span);
                    let query_chunk = time_slice(&query, span.range());
                    let output_grad_chunk =
                        weight.scale_query(time_slice(&output_grad, span.range()));

                    let grad = weight.scale_chunk(grad)
                        + query_chunk.transpose().matmul(output_grad_chunk);
                    (grad, snapshots)
                },
            );
            snapshots.reverse();

            (stack_snapshots(snapshots), grad)
        })
        .unzip();

    StateGrads {
        state_grads: Tensor::cat(tile_grads, 4),
        initial_state_grad: Tensor::cat(tile_initial, 3),
    }
}

/// Delta-rule reverse recurrence, mirroring the sub-tiling of the forward pass.
///
/// For each chunk (last first) and each of its sub-tiles (last first):
/// `dv' = dv + K dH`, and the chunk-local term `scale * Q^T dO - W^T dv'` is added to
/// `dH` once the chunk is finished.
#[allow(clippy::too_many_arguments)]
pub fn chunk_delta_bwd_dhu<B: Backend>(
    query: &Tensor<B, 4>,
    key: &Tensor<B, 4>,
    wy_key: &Tensor<B, 4>,
    output_grad: &Tensor<B, 4>,
    local_value_grad: &Tensor<B, 4>,
    final_state_grad: Option<&Tensor<B, 4>>,
    scale: f64,
    tiles: &TileConfig,
) -> DeltaStateGrads<B> {
    tracy_scope!("chunk_delta_bwd_dhu");
    let [batch_size, num_heads, seq_len, key_dim] = query.dims();
    let value_dim = output_grad.dims()[3];
    let device = query.device();

    let spans = chunk_spans(seq_len, tiles.chunk_size);
    let query = query.clone().mul_scalar(scale);
    trace!("delta state backward over {} chunks", spans.len());

    let mut tile_grads = Vec::new();
    let mut tile_initial = Vec::new();
    let mut tile_value_grads = Vec::new();

    for value_tile in tile_ranges(value_dim, tiles.state_block_v) {
        let init = final_grad_tile(
            final_state_grad,
            value_tile.clone(),
            [batch_size, num_heads, key_dim],
            &device,
        );
        let value_width = value_tile.len();
        let output_grad = feature_slice(output_grad, value_tile.clone());
        let local_value_grad = feature_slice(local_value_grad, value_tile);

        let (grad, mut snapshots, mut value_grads) = spans.iter().rev().fold(
            (init, Vec::with_capacity(spans.len()), Vec::new()),
            |(grad, mut snapshots, mut value_grads), span| {
                snapshots.push(grad.clone());

                let mut subs = sub_spans(*span, tiles.sub_chunk_size);
                subs.reverse();
                let local = subs.into_iter().fold(
                    Tensor::zeros([batch_size, num_heads, key_dim, value_width], &device),
                    |local, sub| {
                        let value_grad = time_slice(&local_value_grad, sub.range())
                            + time_slice(key, sub.range()).matmul(grad.clone());
                        value_grads.push(value_grad.clone());

                        let query_sub = time_slice(&query, sub.range());
                        let output_grad_sub = time_slice(&output_grad, sub.range());
                        let wy_key_sub = time_slice(wy_key, sub.range());

                        local + query_sub.transpose().matmul(output_grad_sub)
                            - wy_key_sub.transpose().matmul(value_grad)
                    },
                );

                (grad + local, snapshots, value_grads)
            },
        );
        snapshots.reverse();
        value_grads.reverse();

        tile_grads.push(stack_snapshots(snapshots));
        tile_initial.push(grad);
        tile_value_grads.push(Tensor::cat(value_grads, 2));
    }

    DeltaStateGrads {
        grads: StateGrads {
            state_grads: Tensor::cat(tile_grads, 4),
            initial_state_grad: Tensor::cat(tile_initial, 3),
        },
        corrected_value_grad: Tensor::cat(tile_value_grads, 3),
    }
}
