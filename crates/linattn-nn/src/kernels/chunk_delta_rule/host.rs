use burn::{
    prelude::Backend,
    tensor::{Tensor, ops::FloatTensor},
};
use linattn_trace::tracy_scope;

use crate::kernels::{
    chunk_common::{
        CheckpointLevel, ChunkOptions, DeltaSnapshots, StateSnapshots, float_primitive,
        float_tensor,
    },
    chunk_delta_rule::{
        ChunkDeltaRuleBackwardOutput, ChunkDeltaRuleBackwardOutputPrimitive,
        ChunkDeltaRuleForwardOutput, ChunkDeltaRuleForwardOutputPrimitive, default_wy,
    },
    chunk_engine::{
        chunk_delta_bwd_dhu, chunk_delta_bwd_dqkw, chunk_delta_fwd_h, chunk_fwd_o,
        chunk_local_value_grad,
    },
    wy_repr::{WyForward, WyRepresentation},
};

pub(crate) struct DeltaRuleForward<B: Backend> {
    pub output: Tensor<B, 4>,
    pub final_state: Tensor<B, 4>,
    pub transform: Tensor<B, 4>,
    pub snapshots: StateSnapshots<DeltaSnapshots<B>>,
}

pub(crate) struct DeltaRuleGrads<B: Backend> {
    pub query_grad: Tensor<B, 4>,
    pub key_grad: Tensor<B, 4>,
    pub value_grad: Tensor<B, 4>,
    pub beta_grad: Tensor<B, 3>,
    pub initial_state_grad: Tensor<B, 4>,
}

pub(crate) fn delta_rule_forward<B: Backend, W: WyRepresentation<B>>(
    wy: &W,
    query: &Tensor<B, 4>,
    key: &Tensor<B, 4>,
    value: &Tensor<B, 4>,
    beta: &Tensor<B, 3>,
    initial_state: &Tensor<B, 4>,
    options: &ChunkOptions,
) -> DeltaRuleForward<B> {
    tracy_scope!("chunk_delta_rule_forward");
    let WyForward {
        wy_key,
        wy_value,
        transform,
    } = wy.forward(key, value, beta, options.tiles.chunk_size);

    let chunk = chunk_delta_fwd_h(key, &wy_key, &wy_value, Some(initial_state), &options.tiles);
    let output = chunk_fwd_o(
        query,
        key,
        &chunk.snapshots.corrected_value,
        &chunk.snapshots.states,
        None,
        options.scale,
        &options.tiles,
    );

    DeltaRuleForward {
        output,
        final_state: chunk.final_state,
        transform,
        snapshots: match options.checkpoint {
            CheckpointLevel::Retain => StateSnapshots::Retained(chunk.snapshots),
            CheckpointLevel::Recompute => StateSnapshots::Recompute,
        },
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn delta_rule_backward<B: Backend, W: WyRepresentation<B>>(
    wy: &W,
    query: &Tensor<B, 4>,
    key: &Tensor<B, 4>,
    value: &Tensor<B, 4>,
    beta: &Tensor<B, 3>,
    initial_state: &Tensor<B, 4>,
    transform: &Tensor<B, 4>,
    snapshots: StateSnapshots<DeltaSnapshots<B>>,
    output_grad: &Tensor<B, 4>,
    final_state_grad: Option<&Tensor<B, 4>>,
    options: &ChunkOptions,
) -> DeltaRuleGrads<B> {
    tracy_scope!("chunk_delta_rule_backward");
    let chunk_size = options.tiles.chunk_size;
    let WyForward {
        wy_key, wy_value, ..
    } = wy.recompute(key, value, beta, transform, chunk_size);

    let DeltaSnapshots {
        states,
        corrected_value,
    } = snapshots.resolve(|| {
        chunk_delta_fwd_h(key, &wy_key, &wy_value, Some(initial_state), &options.tiles).snapshots
    });

    let local_value_grad =
        chunk_local_value_grad(query, key, output_grad, options.scale, &options.tiles);
    let state_grads = chunk_delta_bwd_dhu(
        query,
        key,
        &wy_key,
        output_grad,
        &local_value_grad,
        final_state_grad,
        options.scale,
        &options.tiles,
    );
    let chunk_grads = chunk_delta_bwd_dqkw(
        query,
        key,
        &corrected_value,
        &states,
        &state_grads.grads.state_grads,
        &state_grads.corrected_value_grad,
        output_grad,
        options.scale,
        &options.tiles,
    );
    let wy_grads = wy.backward(
        key,
        value,
        beta,
        transform,
        &chunk_grads.value_grad,
        &state_grads.corrected_value_grad,
        chunk_size,
    );

    DeltaRuleGrads {
        query_grad: chunk_grads.query_grad,
        key_grad: chunk_grads.key_grad + wy_grads.key_grad,
        value_grad: wy_grads.value_grad,
        beta_grad: wy_grads.beta_grad,
        initial_state_grad: state_grads.grads.initial_state_grad,
    }
}

pub(crate) fn chunk_delta_rule_forward_impl<B: Backend>(
    query: FloatTensor<B>,
    key: FloatTensor<B>,
    value: FloatTensor<B>,
    beta: FloatTensor<B>,
    initial_state: FloatTensor<B>,
    options: ChunkOptions,
) -> ChunkDeltaRuleForwardOutputPrimitive<B> {
    let forward = delta_rule_forward(
        &default_wy(&options),
        &float_tensor::<B, 4>(query),
        &float_tensor::<B, 4>(key),
        &float_tensor::<B, 4>(value),
        &float_tensor::<B, 3>(beta),
        &float_tensor::<B, 4>(initial_state),
        &options,
    );

    let (states, corrected_value) = match forward.snapshots.into_option() {
        Some(snapshots) => (
            Some(float_primitive(snapshots.states)),
            Some(float_primitive(snapshots.corrected_value)),
        ),
        None => (None, None),
    };

    ChunkDeltaRuleForwardOutput {
        output: float_primitive(forward.output),
        final_state: float_primitive(forward.final_state),
        transform: float_primitive(forward.transform),
        states,
        corrected_value,
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn chunk_delta_rule_backward_impl<B: Backend>(
    query: FloatTensor<B>,
    key: FloatTensor<B>,
    value: FloatTensor<B>,
    beta: FloatTensor<B>,
    initial_state: FloatTensor<B>,
    transform: FloatTensor<B>,
    states: Option<FloatTensor<B>>,
    corrected_value: Option<FloatTensor<B>>,
    output_grad: FloatTensor<B>,
    final_state_grad: Option<FloatTensor<B>>,
    options: ChunkOptions,
) -> ChunkDeltaRuleBackwardOutputPrimitive<B> {
    let snapshots = match (states, corrected_value) {
        (Some(states), Some(corrected_value)) => StateSnapshots::Retained(DeltaSnapshots {
            states: float_tensor::<B, 5>(states),
            corrected_value: float_tensor::<B, 4>(corrected_value),
        }),
        _ => StateSnapshots::Recompute,
    };
    let final_state_grad = final_state_grad.map(float_tensor::<B, 4>);

    let grads = delta_rule_backward(
        &default_wy(&options),
        &float_tensor::<B, 4>(query),
        &float_tensor::<B, 4>(key),
        &float_tensor::<B, 4>(value),
        &float_tensor::<B, 3>(beta),
        &float_tensor::<B, 4>(initial_state),
        &float_tensor::<B, 4>(transform),
        snapshots,
        &float_tensor::<B, 4>(output_grad),
        final_state_grad.as_ref(),
        &options,
    );

    ChunkDeltaRuleBackwardOutput {
        query_grad: float_primitive(grads.query_grad),
        key_grad: float_primitive(grads.key_grad),
        value_grad: float_primitive(grads.value_grad),
        beta_grad: float_primitive(grads.beta_grad),
        initial_state_grad: float_primitive(grads.initial_state_grad),
    }
}
