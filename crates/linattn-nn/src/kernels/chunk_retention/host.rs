use burn::{prelude::Backend, tensor::ops::FloatTensor};
use linattn_trace::tracy_scope;

use crate::kernels::{
    chunk_common::{
        CheckpointLevel, ChunkOptions, StateSnapshots, decay::HeadDecay, float_primitive,
        float_tensor,
    },
    chunk_engine::{chunk_bwd_dh, chunk_bwd_dqkv, chunk_fwd_h, chunk_fwd_o},
    chunk_retention::{
        ChunkRetentionBackwardOutput, ChunkRetentionBackwardOutputPrimitive,
        ChunkRetentionForwardOutput, ChunkRetentionForwardOutputPrimitive,
    },
};

pub(crate) fn chunk_retention_forward_impl<B: Backend>(
    query: FloatTensor<B>,
    key: FloatTensor<B>,
    value: FloatTensor<B>,
    initial_state: FloatTensor<B>,
    options: ChunkOptions,
) -> ChunkRetentionForwardOutputPrimitive<B> {
    tracy_scope!("chunk_retention_forward");
    let query = float_tensor::<B, 4>(query);
    let key = float_tensor::<B, 4>(key);
    let value = float_tensor::<B, 4>(value);
    let initial_state = float_tensor::<B, 4>(initial_state);

    let decay = HeadDecay::retention(query.dims()[1]);
    let chunk = chunk_fwd_h(&key, &value, Some(&initial_state), &decay, &options.tiles);
    let output = chunk_fwd_o(
        &query,
        &key,
        &value,
        &chunk.states,
        Some(&decay),
        options.scale,
        &options.tiles,
    );

    ChunkRetentionForwardOutput {
        output: float_primitive(output),
        final_state: float_primitive(chunk.final_state),
        states: match options.checkpoint {
            CheckpointLevel::Retain => Some(float_primitive(chunk.states)),
            CheckpointLevel::Recompute => None,
        },
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn chunk_retention_backward_impl<B: Backend>(
    query: FloatTensor<B>,
    key: FloatTensor<B>,
    value: FloatTensor<B>,
    initial_state: FloatTensor<B>,
    states: Option<FloatTensor<B>>,
    output_grad: FloatTensor<B>,
    final_state_grad: Option<FloatTensor<B>>,
    options: ChunkOptions,
) -> ChunkRetentionBackwardOutputPrimitive<B> {
    tracy_scope!("chunk_retention_backward");
    let query = float_tensor::<B, 4>(query);
    let key = float_tensor::<B, 4>(key);
    let value = float_tensor::<B, 4>(value);
    let initial_state = float_tensor::<B, 4>(initial_state);
    let output_grad = float_tensor::<B, 4>(output_grad);
    let final_state_grad = final_state_grad.map(float_tensor::<B, 4>);

    let decay = HeadDecay::retention(query.dims()[1]);
    let states = StateSnapshots::from(states.map(float_tensor::<B, 5>)).resolve(|| {
        chunk_fwd_h(&key, &value, Some(&initial_state), &decay, &options.tiles).states
    });

    let state_grads = chunk_bwd_dh(
        &query,
        &output_grad,
        final_state_grad.as_ref(),
        &decay,
        options.scale,
        &options.tiles,
    );
    let grads = chunk_bwd_dqkv(
        &query,
        &key,
        &value,
        &states,
        &state_grads.state_grads,
        &output_grad,
        &decay,
        options.scale,
        &options.tiles,
    );

    ChunkRetentionBackwardOutput {
        query_grad: float_primitive(grads.query_grad),
        key_grad: float_primitive(grads.key_grad),
        value_grad: float_primitive(grads.value_grad),
        initial_state_grad: float_primitive(state_grads.initial_state_grad),
    }
}
