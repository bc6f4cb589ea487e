use burn::{prelude::Backend, tensor::Tensor};
use linattn_trace::tracy_scope;
use log::trace;

use crate::kernels::chunk_common::{
    TileConfig,
    decay::{ChunkWeightCache, HeadDecay},
    layout::{chunk_spans, feature_slice, snapshot_block, tile_ranges, time_slice},
};

/// Input gradients produced by the gradient pass.
#[derive(Clone, Debug)]
pub struct InputGrads<B: Backend> {
    pub query_grad: Tensor<B, 4>,
    pub key_grad: Tensor<B, 4>,
    /// Retention: `dV`. Delta rule: `dW`, the gradient of the WY key transform.
    pub value_grad: Tensor<B, 4>,
}

/// Retention gradients for Q, K and V given the forward snapshots `states` and the
/// reverse-pass `state_grads`.
#[allow(clippy::too_many_arguments)]
pub fn chunk_bwd_dqkv<B: Backend>(
    query: &Tensor<B, 4>,
    key: &Tensor<B, 4>,
    value: &Tensor<B, 4>,
    states: &Tensor<B, 5>,
    state_grads: &Tensor<B, 5>,
    output_grad: &Tensor<B, 4>,
    decay: &HeadDecay,
    scale: f64,
    tiles: &TileConfig,
) -> InputGrads<B> {
    tracy_scope!("chunk_bwd_dqkv");
    let [batch_size, num_heads, seq_len, key_dim] = query.dims();
    let value_dim = value.dims()[3];
    let device = query.device();

    let spans = chunk_spans(seq_len, tiles.chunk_size);
    let weights = ChunkWeightCache::new(Some(decay), seq_len, tiles.chunk_size, &device);
    let key_tiles = tile_ranges(key_dim, tiles.block_k);
    let value_tiles = tile_ranges(value_dim, tiles.block_v);
    trace!("retention gradient pass over {} chunks", spans.len());

    let mut query_grads = Vec::with_capacity(spans.len());
    let mut key_grads = Vec::with_capacity(spans.len());
    let mut value_grads = Vec::with_capacity(spans.len());

    for span in &spans {
        let weight = weights.get(span);
        let len = span.len;
        let query_chunk = time_slice(query, span.range());
        let key_chunk = time_slice(key, span.range());
        let value_chunk = time_slice(value, span.range());
        let output_grad_chunk = time_slice(output_grad, span.range());

        let mut value_grad_blocks: Vec<Tensor<B, 4>> = value_tiles
            .iter()
            .map(|tile| Tensor::zeros([batch_size, num_heads, len, tile.len()], &device))
            .collect();
        let mut query_grad_blocks = Vec::with_capacity(key_tiles.len());
        let mut key_grad_blocks = Vec::with_capacity(key_tiles.len());

        for key_tile in &key_tiles {
            let query_block = feature_slice(&query_chunk, key_tile.clone());
            let key_block = feature_slice(&key_chunk, key_tile.clone());
            let scores =
                query_block.clone().matmul(key_block.clone().transpose()) * weight.causal.clone();

            let mut score_grad = Tensor::zeros([batch_size, num_heads, len, len], &device);
            let mut query_grad =
                Tensor::zeros([batch_size, num_heads, len, key_tile.len()], &device);
            let mut key_grad = Tensor::zeros([batch_size, num_heads, len, key_tile.len()], &device);

            for (value_tile, value_grad) in value_tiles.iter().zip(value_grad_blocks.iter_mut()) {
                let value_block = feature_slice(&value_chunk, value_tile.clone());
                let output_grad_block = feature_slice(&output_grad_chunk, value_tile.clone());
                let state =
                    snapshot_block(states, span.index, key_tile.clone(), value_tile.clone());
                let state_grad =
                    snapshot_block(state_grads, span.index, key_tile.clone(), value_tile.clone());

                *value_grad = value_grad.clone()
                    + weight.scale_key(key_block.clone().matmul(state_grad.clone()))
                    + scores
                        .clone()
                        .transpose()
                        .matmul(output_grad_block.clone())
                        .mul_scalar(scale);

                score_grad =
                    score_grad + output_grad_block.clone().matmul(value_block.clone().transpose());
                query_grad = query_grad + output_grad_block.matmul(state.transpose());
                key_grad = key_grad + value_block.matmul(state_grad.transpose());
            }

            let score_grad = (score_grad * weight.causal.clone()).mul_scalar(scale);
            query_grad_blocks.push(
                weight.scale_query(query_grad).mul_scalar(scale)
                    + score_grad.clone().matmul(key_block),
            );
            key_grad_blocks
                .push(weight.scale_key(key_grad) + score_grad.transpose().matmul(query_block));
        }

        query_grads.push(Tensor::cat(query_grad_blocks, 3));
        key_grads.push(Tensor::cat(key_grad_blocks, 3));
        value_grads.push(Tensor::cat(value_grad_blocks, 3));
    }

    InputGrads {
        query_grad: Tensor::cat(query_grads, 2),
        key_grad: Tensor::cat(key_grads, 2),
        value_grad: Tensor::cat(value_grads, 2),
    }
}

/// Delta-rule gradients for Q, K and the WY key transform `W`.
///
/// `corrected_value_grad` is the total `dv'` from the reverse state pass; `dW = -dv' H^T`.
#[allow(clippy::too_many_arguments)]
pub fn chunk_delta_bwd_dqkw<B: Backend>(
    query: &Tensor<B, 4>,
    key: &Tensor<B, 4>,
    corrected_value: &Tensor<B, 4>,
    states: &Tensor<B, 5>,
    state_grads: &Tensor<B, 5>,
    corrected_value_grad: &Tensor<B, 4>,
    output_grad: &Tensor<B, 4>,
    scale: f64,
    tiles: &TileConfig,
) -> InputGrads<B> {
    tracy_scope!("chunk_delta_bwd_dqkw");
    let [batch_size, num_heads, seq_len, key_dim] = query.dims();
    let value_dim = corrected_value.dims()[3];
    let device = query.device();

    let spans = chunk_spans(seq_len, tiles.chunk_size);
    let weights = ChunkWeightCache::new(None, seq_len, tiles.chunk_size, &device);
    let key_tiles = tile_ranges(key_dim, tiles.block_k);
    let value_tiles = tile_ranges(value_dim, tiles.block_v);
    trace!("delta gradient pass over {} chunks", spans.len());

    let mut query_grads = Vec::with_capacity(spans.len());
    let mut key_grads = Vec::with_capacity(spans.len());
    let mut wy_key_grads = Vec::with_capacity(spans.len());

    for span in &spans {
        let mask = weights.get(span).causal.clone();
        let len = span.len;
        let query_chunk = time_slice(query, span.range());
        let key_chunk = time_slice(key, span.range());
        let value_chunk = time_slice(corrected_value, span.range());
        let value_grad_chunk = time_slice(corrected_value_grad, span.range());
        let output_grad_chunk = time_slice(output_grad, span.range());

        let mut query_grad_blocks = Vec::with_capacity(key_tiles.len());
        let mut key_grad_blocks = Vec::with_capacity(key_tiles.len());
        let mut wy_key_grad_blocks = Vec::with_capacity(key_tiles.len());

        for key_tile in &key_tiles {
            let zeros = || Tensor::zeros([batch_size, num_heads, len, key_tile.len()], &device);
            let (score_grad, query_grad, key_grad, wy_key_grad) = value_tiles.iter().fold(
                (
                    Tensor::zeros([batch_size, num_heads, len, len], &device),
                    zeros(),
                    zeros(),
                    zeros(),
                ),
                |(score_grad, query_grad, key_grad, wy_key_grad), value_tile| {
                    let value_block = feature_slice(&value_chunk, value_tile.clone());
                    let value_grad_block = feature_slice(&value_grad_chunk, value_tile.clone());
                    let output_grad_block = feature_slice(&output_grad_chunk, value_tile.clone());
                    let state =
                        snapshot_block(states, span.index, key_tile.clone(), value_tile.clone());
                    let state_grad = snapshot_block(
                        state_grads,
                        span.index,
                        key_tile.clone(),
                        value_tile.clone(),
                    );

                    (
                        score_grad
                            + output_grad_block.clone().matmul(value_block.clone().transpose()),
                        query_grad + output_grad_block.matmul(state.clone().transpose()),
                        key_grad + value_block.matmul(state_grad.transpose()),
                        wy_key_grad + value_grad_block.matmul(state.transpose()),
                    )
                },
            );

            let query_block = feature_slice(&query_chunk, key_tile.clone());
            let key_block = feature_slice(&key_chunk, key_tile.clone());
            let score_grad = score_grad * mask.clone();

            query_grad_blocks
                .push((query_grad + score_grad.clone().matmul(key_block)).mul_scalar(scale));
            key_grad_blocks
                .push(key_grad + score_grad.transpose().matmul(query_block).mul_scalar(scale));
            wy_key_grad_blocks.push(wy_key_grad.neg());
        }

        query_grads.push(Tensor::cat(query_grad_blocks, 3));
        key_grads.push(Tensor::cat(key_grad_blocks, 3));
        wy_key_grads.push(Tensor::cat(wy_key_grad_blocks, 3));
    }

    InputGrads {
        query_grad: Tensor::cat(query_grads, 2),
        key_grad: Tensor::cat(key_grads, 2),
        value_grad: Tensor::cat(wy_key_grads, 2),
    }
}

/// Intra-chunk value gradient of the delta output,
/// `dv_j = scale * sum_{t >= j} (k_j . q_t) dO_t`.
pub fn chunk_local_value_grad<B: Backend>(
    query: &Tensor<B, 4>,
    key: &Tensor<B, 4>,
    output_grad: &Tensor<B, 4>,
    scale: f64,
    tiles: &TileConfig,
) -> Tensor<B, 4> {
    tracy_scope!("chunk_local_value_grad");
    let [batch_size, num_heads, seq_len, key_dim] = query.dims();
    let device = query.device();

    let spans = chunk_spans(seq_len, tiles.chunk_size);
    let weights = ChunkWeightCache::new(None, seq_len, tiles.chunk_size, &device);
    let key_tiles = tile_ranges(key_dim, tiles.block_k);

    let chunks = spans
        .iter()
        .map(|span| {
            let query_chunk = time_slice(query, span.range());
            let key_chunk = time_slice(key, span.range());
            let scores = key_tiles.iter().fold(
                Tensor::zeros([batch_size, num_heads, span.len, span.len], &device),
                |scores, key_tile| {
                    let key_block = feature_slice(&key_chunk, key_tile.clone());
                    let query_block = feature_slice(&query_chunk, key_tile.clone());
                    scores + key_block.matmul(query_block.transpose())
                },
            );
            let upper = weights.get(span).causal.clone().transpose();

            (scores * upper)
                .mul_scalar(scale)
                .matmul(time_slice(output_grad, span.range()))
        })
        .collect();

    Tensor::cat(chunks, 2)
}
