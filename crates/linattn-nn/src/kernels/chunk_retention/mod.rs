//! Chunked retention: linear attention with per-head geometric decay
//! `gamma_h = 1 - 2^(-5 - h)`.
//!
//! `S_t = gamma S_{t-1} + k_t v_t^T`, `o_t = scale * q_t^T S_t`, evaluated chunk by chunk.

mod backward;
mod forward;
mod host;

use burn::{
    prelude::Backend,
    tensor::{Tensor, backend::AutodiffBackend, ops::FloatTensor},
};

use crate::{
    Result,
    kernels::chunk_common::{
        ChunkKernelConfig, ChunkOptions, StateSnapshots, float_primitive, float_tensor,
        layout::num_chunks,
        validate::{check_dims, check_dtype, check_inputs, check_state},
    },
};

#[derive(Clone, Debug)]
pub struct ChunkRetentionForwardOutput<T> {
    pub output: T,
    pub final_state: T,
    /// Chunk snapshots, only present when they are retained for backward.
    pub states: Option<T>,
}

#[derive(Clone, Debug)]
pub struct ChunkRetentionBackwardOutput<T> {
    pub query_grad: T,
    pub key_grad: T,
    pub value_grad: T,
    pub initial_state_grad: T,
}

pub type ChunkRetentionForwardOutputPrimitive<B> = ChunkRetentionForwardOutput<FloatTensor<B>>;
pub type ChunkRetentionBackwardOutputPrimitive<B> = ChunkRetentionBackwardOutput<FloatTensor<B>>;

#[allow(clippy::too_many_arguments)]
pub trait ChunkRetentionBackend: Backend {
    fn chunk_retention_forward(
        query: FloatTensor<Self>,
        key: FloatTensor<Self>,
        value: FloatTensor<Self>,
        initial_state: FloatTensor<Self>,
        options: ChunkOptions,
    ) -> ChunkRetentionForwardOutputPrimitive<Self>;

    fn chunk_retention_backward(
        query: FloatTensor<Self>,
        key: FloatTensor<Self>,
        value: FloatTensor<Self>,
        initial_state: FloatTensor<Self>,
        states: Option<FloatTensor<Self>>,
        output_grad: FloatTensor<Self>,
        final_state_grad: Option<FloatTensor<Self>>,
        options: ChunkOptions,
    ) -> ChunkRetentionBackwardOutputPrimitive<Self>;
}

pub trait ChunkRetentionAutodiffBackend: ChunkRetentionBackend + AutodiffBackend {}

#[derive(Clone, Debug)]
pub struct ChunkRetentionOutput<B: Backend> {
    /// `(B, H, T, V)`.
    pub output: Tensor<B, 4>,
    /// `(B, H, K, V)` in f32, present when `output_final_state` is set.
    pub final_state: Option<Tensor<B, 4>>,
    pub snapshots: StateSnapshots<Tensor<B, 5>>,
}

#[derive(Clone, Debug)]
pub struct ChunkRetentionGrads<B: Backend> {
    pub query_grad: Tensor<B, 4>,
    pub key_grad: Tensor<B, 4>,
    pub value_grad: Tensor<B, 4>,
    /// `None` when the call had no initial state.
    pub initial_state_grad: Option<Tensor<B, 4>>,
}

/// Chunked retention forward.
///
/// On an autodiff backend the returned `output` is tracked, so `backward()` on a loss
/// built from it runs [`chunk_retention_backward`] under the hood. The `final_state` is
/// returned untracked: a loss built on it receives no gradient. To chain states across
/// calls, pass its gradient to [`chunk_retention_backward`] as `final_state_grad`.
pub fn chunk_retention_forward<B: ChunkRetentionBackend>(
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
    initial_state: Option<Tensor<B, 4>>,
    config: &ChunkKernelConfig,
) -> Result<ChunkRetentionOutput<B>> {
    let shape = check_inputs(&query, &key, &value)?;
    if let Some(state) = &initial_state {
        check_state(state, &shape, "initial_state")?;
    }
    let options = config.resolve(shape.key_dim, shape.value_dim)?;

    let initial_state =
        initial_state.unwrap_or_else(|| Tensor::zeros(shape.state_dims(), &query.device()));

    let output = B::chunk_retention_forward(
        float_primitive(query),
        float_primitive(key),
        float_primitive(value),
        float_primitive(initial_state),
        options,
    );

    Ok(ChunkRetentionOutput {
        output: float_tensor(output.output),
        final_state: config
            .output_final_state
            .then(|| float_tensor(output.final_state)),
        snapshots: output.states.map(float_tensor::<B, 5>).into(),
    })
}

/// Explicit chunked retention backward.
///
/// `snapshots` comes from [`chunk_retention_forward`]; when they were not retained the
/// forward state pass is rerun here.
#[allow(clippy::too_many_arguments)]
pub fn chunk_retention_backward<B: ChunkRetentionBackend>(
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
    initial_state: Option<Tensor<B, 4>>,
    snapshots: StateSnapshots<Tensor<B, 5>>,
    output_grad: Tensor<B, 4>,
    final_state_grad: Option<Tensor<B, 4>>,
    config: &ChunkKernelConfig,
) -> Result<ChunkRetentionGrads<B>> {
    let shape = check_inputs(&query, &key, &value)?;
    check_dims(output_grad.dims(), shape.output_dims(), "output_grad")?;
    check_dtype(output_grad.dtype(), query.dtype(), "output_grad")?;
    if let Some(state) = &initial_state {
        check_state(state, &shape, "initial_state")?;
    }
    if let Some(grad) = &final_state_grad {
        check_state(grad, &shape, "final_state_grad")?;
    }
    let options = config.resolve(shape.key_dim, shape.value_dim)?;
    if let StateSnapshots::Retained(states) = &snapshots {
        let [batch_size, num_heads, key_dim, value_dim] = shape.state_dims();
        let expected = [
            batch_size,
            num_heads,
            num_chunks(shape.seq_len, options.tiles.chunk_size),
            key_dim,
            value_dim,
        ];
        check_dims(states.dims(), expected, "retained states")?;
    }

    let has_initial_state = initial_state.is_some();
    let initial_state =
        initial_state.unwrap_or_else(|| Tensor::zeros(shape.state_dims(), &query.device()));
    let states = snapshots.into_option();

    let grads = B::chunk_retention_backward(
        float_primitive(query),
        float_primitive(key),
        float_primitive(value),
        float_primitive(initial_state),
        states.map(float_primitive),
        float_primitive(output_grad),
        final_state_grad.map(float_primitive),
        options,
    );

    Ok(ChunkRetentionGrads {
        query_grad: float_tensor(grads.query_grad),
        key_grad: float_tensor(grads.key_grad),
        value_grad: float_tensor(grads.value_grad),
        initial_state_grad: has_initial_state.then(|| float_tensor(grads.initial_state_grad)),
    })
}
