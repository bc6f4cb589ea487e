use burn::{prelude::Backend, tensor::Tensor};
use linattn_trace::tracy_scope;
use log::trace;

use crate::kernels::chunk_common::{
    TileConfig,
    decay::{ChunkWeightCache, HeadDecay},
    layout::{block_slice, chunk_spans, feature_slice, snapshot_block, tile_ranges, time_slice},
};

/// Output pass: `o_i = scale * (Q_i H[i] * gamma^(t+1) + (Q_i K_i^T * D) V_i)`.
///
/// `value` is the raw value for retention and the corrected value for the delta rule;
/// `decay` is `None` for the delta rule, which makes `D` a plain causal mask.
pub fn chunk_fwd_o<B: Backend>(
    query: &Tensor<B, 4>,
    key: &Tensor<B, 4>,
    value: &Tensor<B, 4>,
    states: &Tensor<B, 5>,
    decay: Option<&HeadDecay>,
    scale: f64,
    tiles: &TileConfig,
) -> Tensor<B, 4> {
    tracy_scope!("chunk_fwd_o");
    let [batch_size, num_heads, seq_len, key_dim] = query.dims();
    let value_dim = value.dims()[3];
    let device = query.device();

    let spans = chunk_spans(seq_len, tiles.chunk_size);
    let weights = ChunkWeightCache::new(decay, seq_len, tiles.chunk_size, &device);
    let key_tiles = tile_ranges(key_dim, tiles.block_k);
    let value_tiles = tile_ranges(value_dim, tiles.block_v);
    trace!(
        "output pass: {} chunks x {} value tiles x {} key tiles",
        spans.len(),
        value_tiles.len(),
        key_tiles.len()
    );

    let query = query.clone().mul_scalar(scale);

    let chunks = spans
        .iter()
        .map(|span| {
            let weight = weights.get(span);
            let query_chunk = time_slice(&query, span.range());
            let key_chunk = time_slice(key, span.range());

            let value_blocks = value_tiles
                .iter()
                .map(|value_tile| {
                    let (inter, scores) = key_tiles.iter().fold(
                        (
                            Tensor::zeros(
                                [batch_size, num_heads, span.len, value_tile.len()],
                                &device,
                            ),
                            Tensor::zeros([batch_size, num_heads, span.len, span.len], &device),
                        ),
                        |(inter, scores), key_tile| {
                            let query_block = feature_slice(&query_chunk, key_tile.clone());
                            let key_block = feature_slice(&key_chunk, key_tile.clone());
                            let state = snapshot_block(
                                states,
                                span.index,
                                key_tile.clone(),
                                value_tile.clone(),
                            );

                            (
                                inter + query_block.clone().matmul(state),
                                scores + query_block.matmul(key_block.transpose()),
                            )
                        },
                    );

                    let value_block = block_slice(value, span.range(), value_tile.clone());
                    weight.scale_query(inter) + (scores * weight.causal.clone()).matmul(value_block)
                })
                .collect();

            Tensor::cat(value_blocks, 3)
        })
        .collect();

    Tensor::cat(chunks, 2)
}
