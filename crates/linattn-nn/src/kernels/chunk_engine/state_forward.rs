use burn::{prelude::Backend, tensor::Tensor};
use linattn_trace::{tracy_plot, tracy_scope};
use log::trace;

use crate::kernels::chunk_common::{
    ChunkStates, DeltaChunkStates, DeltaSnapshots, TileConfig,
    decay::{ChunkWeightCache, HeadDecay},
    layout::{chunk_spans, feature_slice, stack_snapshots, sub_spans, tile_ranges, time_slice},
};

fn initial_tile<B: Backend>(
    initial_state: Option<&Tensor<B, 4>>,
    value_tile: std::ops::Range<usize>,
    dims: [usize; 3],
    device: &B::Device,
) -> Tensor<B, 4> {
    let [batch_size, num_heads, key_dim] = dims;
    match initial_state {
        Some(state) => feature_slice(state, value_tile),
        None => Tensor::zeros([batch_size, num_heads, key_dim, value_tile.len()], device),
    }
}

/// Retention state pass: `H[i + 1] = gamma^L H[i] + K_i^T (V_i * gamma^(L - 1 - j))`.
pub fn chunk_fwd_h<B: Backend>(
    key: &Tensor<B, 4>,
    value: &Tensor<B, 4>,
    initial_state: Option<&Tensor<B, 4>>,
    decay: &HeadDecay,
    tiles: &TileConfig,
) -> ChunkStates<B> {
    tracy_scope!("chunk_fwd_h");
    let [batch_size, num_heads, seq_len, key_dim] = key.dims();
    let value_dim = value.dims()[3];
    let device = key.device();

    let spans = chunk_spans(seq_len, tiles.chunk_size);
    let weights = ChunkWeightCache::new(Some(decay), seq_len, tiles.chunk_size, &device);
    tracy_plot!("chunk_fwd_h.num_chunks", spans.len());
    trace!("retention state pass over {} chunks", spans.len());

    let (tile_states, tile_finals): (Vec<_>, Vec<_>) = tile_ranges(value_dim, tiles.state_block_v)
        .into_iter()
        .map(|value_tile| {
            let init = initial_tile(
                initial_state,
                value_tile.clone(),
                [batch_size, num_heads, key_dim],
                &device,
            );
            let value_tile = feature_slice(value, value_tile);

            let (state, snapshots) = spans.iter().fold(
                (init, Vec::with_capacity(spans.len())),
                |(state, mut snapshots), span| {
                    snapshots.push(state.clone());
                    let weight = weights.get(span);
                    let key_chunk = time_slice(key, span.range());
                    let value_chunk = weight.scale_key(time_slice(&value_tile, span.range()));

                    let state =
                        weight.scale_chunk(state) + key_chunk.transpose().matmul(value_chunk);
                    (state, snapshots)
                },
            );

            (stack_snapshots(snapshots), state)
        })
        .unzip();

    ChunkStates {
        states: Tensor::cat(tile_states, 4),
        final_state: Tensor::cat(tile_finals, 3),
    }
}

/// Delta-rule state pass.
///
/// Every sub-tile of a chunk corrects its values against the chunk-entry state,
/// `v' = U - W H[i]`, and the sub-tile updates `K^T v'` are summed locally and applied
/// once the whole chunk is done.
pub fn chunk_delta_fwd_h<B: Backend>(
    key: &Tensor<B, 4>,
    wy_key: &Tensor<B, 4>,
    wy_value: &Tensor<B, 4>,
    initial_state: Option<&Tensor<B, 4>>,
    tiles: &TileConfig,
) -> DeltaChunkStates<B> {
    tracy_scope!("chunk_delta_fwd_h");
    let [batch_size, num_heads, seq_len, key_dim] = key.dims();
    let value_dim = wy_value.dims()[3];
    let device = key.device();

    let spans = chunk_spans(seq_len, tiles.chunk_size);
    tracy_plot!("chunk_delta_fwd_h.num_chunks", spans.len());
    trace!(
        "delta state pass over {} chunks, sub-chunk {}",
        spans.len(),
        tiles.sub_chunk_size
    );

    let mut tile_states = Vec::new();
    let mut tile_finals = Vec::new();
    let mut tile_corrected = Vec::new();

    for value_tile in tile_ranges(value_dim, tiles.state_block_v) {
        let init = initial_tile(
            initial_state,
            value_tile.clone(),
            [batch_size, num_heads, key_dim],
            &device,
        );
        let value_width = value_tile.len();
        let wy_value = feature_slice(wy_value, value_tile);

        let (state, snapshots, corrected) = spans.iter().fold(
            (init, Vec::with_capacity(spans.len()), Vec::new()),
            |(state, mut snapshots, mut corrected), span| {
                snapshots.push(state.clone());

                let local = sub_spans(*span, tiles.sub_chunk_size).into_iter().fold(
                    Tensor::zeros([batch_size, num_heads, key_dim, value_width], &device),
                    |local, sub| {
                        let key_sub = time_slice(key, sub.range());
                        let wy_key_sub = time_slice(wy_key, sub.range());
                        let value_new = time_slice(&wy_value, sub.range())
                            - wy_key_sub.matmul(state.clone());
                        corrected.push(value_new.clone());

                        local + key_sub.transpose().matmul(value_new)
                    },
                );

                (state + local, snapshots, corrected)
            },
        );

        tile_states.push(stack_snapshots(snapshots));
        tile_finals.push(state);
        tile_corrected.push(Tensor::cat(corrected, 2));
    }

    DeltaChunkStates {
        snapshots: DeltaSnapshots {
            states: Tensor::cat(tile_states, 4),
            corrected_value: Tensor::cat(tile_corrected, 3),
        },
        final_state: Tensor::cat(tile_finals, 3),
    }
}
