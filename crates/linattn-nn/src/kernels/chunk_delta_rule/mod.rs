//! Chunked delta rule: each token corrects what the state already predicts for its key
//! before writing, `S_t = S_{t-1} + k_t (v_t - beta_t S_{t-1}^T k_t)^T` in the default
//! [`WyMode::Erase`](crate::kernels::chunk_common::WyMode) form.
//!
//! Within a chunk the updates are folded into the WY form by a [`WyRepresentation`]
//! collaborator; [`ChunkWy`] is used unless one is passed to the `*_with` entry points.

mod backward;
mod forward;
mod host;

use burn::{
    prelude::Backend,
    tensor::{Tensor, backend::AutodiffBackend, ops::FloatTensor},
};

use crate::{
    Result,
    kernels::{
        chunk_common::{
            ChunkKernelConfig, ChunkOptions, DeltaSnapshots, StateSnapshots, float_primitive,
            float_tensor,
            layout::num_chunks,
            validate::{ProblemShape, check_dims, check_dtype, check_inputs, check_state},
        },
        wy_repr::{ChunkWy, WyRepresentation},
    },
};

#[derive(Clone, Debug)]
pub struct ChunkDeltaRuleForwardOutput<T> {
    pub output: T,
    pub final_state: T,
    /// Per-chunk WY transform, always kept for backward.
    pub transform: T,
    pub states: Option<T>,
    pub corrected_value: Option<T>,
}

#[derive(Clone, Debug)]
pub struct ChunkDeltaRuleBackwardOutput<T> {
    pub query_grad: T,
    pub key_grad: T,
    pub value_grad: T,
    pub beta_grad: T,
    pub initial_state_grad: T,
}

pub type ChunkDeltaRuleForwardOutputPrimitive<B> = ChunkDeltaRuleForwardOutput<FloatTensor<B>>;
pub type ChunkDeltaRuleBackwardOutputPrimitive<B> = ChunkDeltaRuleBackwardOutput<FloatTensor<B>>;

#[allow(clippy::too_many_arguments)]
pub trait ChunkDeltaRuleBackend: Backend {
    fn chunk_delta_rule_forward(
        query: FloatTensor<Self>,
        key: FloatTensor<Self>,
        value: FloatTensor<Self>,
        beta: FloatTensor<Self>,
        initial_state: FloatTensor<Self>,
        options: ChunkOptions,
    ) -> ChunkDeltaRuleForwardOutputPrimitive<Self>;

    fn chunk_delta_rule_backward(
        query: FloatTensor<Self>,
        key: FloatTensor<Self>,
        value: FloatTensor<Self>,
        beta: FloatTensor<Self>,
        initial_state: FloatTensor<Self>,
        transform: FloatTensor<Self>,
        states: Option<FloatTensor<Self>>,
        corrected_value: Option<FloatTensor<Self>>,
        output_grad: FloatTensor<Self>,
        final_state_grad: Option<FloatTensor<Self>>,
        options: ChunkOptions,
    ) -> ChunkDeltaRuleBackwardOutputPrimitive<Self>;
}

pub trait ChunkDeltaRuleAutodiffBackend: ChunkDeltaRuleBackend + AutodiffBackend {}

#[derive(Clone, Debug)]
pub struct ChunkDeltaRuleOutput<B: Backend> {
    /// `(B, H, T, V)`.
    pub output: Tensor<B, 4>,
    /// `(B, H, K, V)` in f32, present when `output_final_state` is set.
    pub final_state: Option<Tensor<B, 4>>,
    /// `(B, H, T, BT)`.
    pub transform: Tensor<B, 4>,
    pub snapshots: StateSnapshots<DeltaSnapshots<B>>,
}

#[derive(Clone, Debug)]
pub struct ChunkDeltaRuleGrads<B: Backend> {
    pub query_grad: Tensor<B, 4>,
    pub key_grad: Tensor<B, 4>,
    pub value_grad: Tensor<B, 4>,
    pub beta_grad: Tensor<B, 3>,
    /// `None` when the call had no initial state.
    pub initial_state_grad: Option<Tensor<B, 4>>,
}

fn check_beta<B: Backend>(
    beta: &Tensor<B, 3>,
    query: &Tensor<B, 4>,
    shape: &ProblemShape,
) -> Result<()> {
    check_dims(beta.dims(), shape.beta_dims(), "beta")?;
    check_dtype(beta.dtype(), query.dtype(), "beta")
}

fn check_forward<B: Backend>(
    query: &Tensor<B, 4>,
    key: &Tensor<B, 4>,
    value: &Tensor<B, 4>,
    beta: &Tensor<B, 3>,
    initial_state: Option<&Tensor<B, 4>>,
    config: &ChunkKernelConfig,
) -> Result<(ProblemShape, ChunkOptions)> {
    let shape = check_inputs(query, key, value)?;
    check_beta(beta, query, &shape)?;
    if let Some(state) = initial_state {
        check_state(state, &shape, "initial_state")?;
    }
    let options = config.resolve(shape.key_dim, shape.value_dim)?;
    Ok((shape, options))
}

#[allow(clippy::too_many_arguments)]
fn check_backward<B: Backend>(
    query: &Tensor<B, 4>,
    key: &Tensor<B, 4>,
    value: &Tensor<B, 4>,
    beta: &Tensor<B, 3>,
    initial_state: Option<&Tensor<B, 4>>,
    transform: &Tensor<B, 4>,
    snapshots: &StateSnapshots<DeltaSnapshots<B>>,
    output_grad: &Tensor<B, 4>,
    final_state_grad: Option<&Tensor<B, 4>>,
    config: &ChunkKernelConfig,
) -> Result<(ProblemShape, ChunkOptions)> {
    let (shape, options) = check_forward(query, key, value, beta, initial_state, config)?;
    check_dims(output_grad.dims(), shape.output_dims(), "output_grad")?;
    check_dtype(output_grad.dtype(), query.dtype(), "output_grad")?;
    if let Some(grad) = final_state_grad {
        check_state(grad, &shape, "final_state_grad")?;
    }

    let [batch_size, num_heads, key_dim, value_dim] = shape.state_dims();
    let chunk_size = options.tiles.chunk_size;
    check_dims(
        transform.dims(),
        [batch_size, num_heads, shape.seq_len, chunk_size],
        "transform",
    )?;
    if let StateSnapshots::Retained(snapshots) = snapshots {
        let chunks = num_chunks(shape.seq_len, chunk_size);
        check_dims(
            snapshots.states.dims(),
            [batch_size, num_heads, chunks, key_dim, value_dim],
            "retained states",
        )?;
        check_dims(
            snapshots.corrected_value.dims(),
            shape.output_dims(),
            "retained corrected value",
        )?;
    }
    Ok((shape, options))
}

/// Chunked delta-rule forward with the default [`ChunkWy`] collaborator.
///
/// On an autodiff backend the returned `output` is tracked and gradients flow to
/// `query`, `key`, `value`, `beta` and the initial state. The `final_state` is returned
/// untracked, so a loss built on it receives no gradient; use
/// [`chunk_delta_rule_backward`] with `final_state_grad` when chaining states.
pub fn chunk_delta_rule_forward<B: ChunkDeltaRuleBackend>(
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
    beta: Tensor<B, 3>,
    initial_state: Option<Tensor<B, 4>>,
    config: &ChunkKernelConfig,
) -> Result<ChunkDeltaRuleOutput<B>> {
    let (shape, options) =
        check_forward(&query, &key, &value, &beta, initial_state.as_ref(), config)?;

    let initial_state =
        initial_state.unwrap_or_else(|| Tensor::zeros(shape.state_dims(), &query.device()));

    let output = B::chunk_delta_rule_forward(
        float_primitive(query),
        float_primitive(key),
        float_primitive(value),
        float_primitive(beta),
        float_primitive(initial_state),
        options,
    );

    let snapshots = match (output.states, output.corrected_value) {
        (Some(states), Some(corrected_value)) => StateSnapshots::Retained(DeltaSnapshots {
            states: float_tensor(states),
            corrected_value: float_tensor(corrected_value),
        }),
        _ => StateSnapshots::Recompute,
    };

    Ok(ChunkDeltaRuleOutput {
        output: float_tensor(output.output),
        final_state: config
            .output_final_state
            .then(|| float_tensor(output.final_state)),
        transform: float_tensor(output.transform),
        snapshots,
    })
}

/// Explicit chunked delta-rule backward with the default [`ChunkWy`] collaborator.
#[allow(clippy::too_many_arguments)]
pub fn chunk_delta_rule_backward<B: ChunkDeltaRuleBackend>(
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
    beta: Tensor<B, 3>,
    initial_state: Option<Tensor<B, 4>>,
    transform: Tensor<B, 4>,
    snapshots: StateSnapshots<DeltaSnapshots<B>>,
    output_grad: Tensor<B, 4>,
    final_state_grad: Option<Tensor<B, 4>>,
    config: &ChunkKernelConfig,
) -> Result<ChunkDeltaRuleGrads<B>> {
    let (shape, options) = check_backward(
        &query,
        &key,
        &value,
        &beta,
        initial_state.as_ref(),
        &transform,
        &snapshots,
        &output_grad,
        final_state_grad.as_ref(),
        config,
    )?;

    let has_initial_state = initial_state.is_some();
    let initial_state =
        initial_state.unwrap_or_else(|| Tensor::zeros(shape.state_dims(), &query.device()));
    let (states, corrected_value) = match snapshots.into_option() {
        Some(DeltaSnapshots {
            states,
            corrected_value,
        }) => (
            Some(float_primitive(states)),
            Some(float_primitive(corrected_value)),
        ),
        None => (None, None),
    };

    let grads = B::chunk_delta_rule_backward(
        float_primitive(query),
        float_primitive(key),
        float_primitive(value),
        float_primitive(beta),
        float_primitive(initial_state),
        float_primitive(transform),
        states,
        corrected_value,
        float_primitive(output_grad),
        final_state_grad.map(float_primitive),
        options,
    );

    Ok(ChunkDeltaRuleGrads {
        query_grad: float_tensor(grads.query_grad),
        key_grad: float_tensor(grads.key_grad),
        value_grad: float_tensor(grads.value_grad),
        beta_grad: float_tensor(grads.beta_grad),
        initial_state_grad: has_initial_state.then(|| float_tensor(grads.initial_state_grad)),
    })
}

/// Forward with a caller-supplied WY collaborator.
///
/// Runs directly on `B`'s tensors without the backend extension, so it is not tracked
/// by autodiff; pair it with [`chunk_delta_rule_backward_with`].
pub fn chunk_delta_rule_forward_with<B: Backend, W: WyRepresentation<B>>(
    wy: &W,
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
    beta: Tensor<B, 3>,
    initial_state: Option<Tensor<B, 4>>,
    config: &ChunkKernelConfig,
) -> Result<ChunkDeltaRuleOutput<B>> {
    let (shape, options) =
        check_forward(&query, &key, &value, &beta, initial_state.as_ref(), config)?;
    let initial_state =
        initial_state.unwrap_or_else(|| Tensor::zeros(shape.state_dims(), &query.device()));

    let forward =
        host::delta_rule_forward(wy, &query, &key, &value, &beta, &initial_state, &options);

    Ok(ChunkDeltaRuleOutput {
        output: forward.output,
        final_state: config.output_final_state.then_some(forward.final_state),
        transform: forward.transform,
        snapshots: forward.snapshots,
    })
}

/// Backward with a caller-supplied WY collaborator, the counterpart of
/// [`chunk_delta_rule_forward_with`].
#[allow(clippy::too_many_arguments)]
pub fn chunk_delta_rule_backward_with<B: Backend, W: WyRepresentation<B>>(
    wy: &W,
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
    beta: Tensor<B, 3>,
    initial_state: Option<Tensor<B, 4>>,
    transform: Tensor<B, 4>,
    snapshots: StateSnapshots<DeltaSnapshots<B>>,
    output_grad: Tensor<B, 4>,
    final_state_grad: Option<Tensor<B, 4>>,
    config: &ChunkKernelConfig,
) -> Result<ChunkDeltaRuleGrads<B>> {
    let (shape, options) = check_backward(
        &query,
        &key,
        &value,
        &beta,
        initial_state.as_ref(),
        &transform,
        &snapshots,
        &output_grad,
        final_state_grad.as_ref(),
        config,
    )?;

    let has_initial_state = initial_state.is_some();
    let initial_state =
        initial_state.unwrap_or_else(|| Tensor::zeros(shape.state_dims(), &query.device()));

    let grads = host::delta_rule_backward(
        wy,
        &query,
        &key,
        &value,
        &beta,
        &initial_state,
        &transform,
        snapshots,
        &output_grad,
        final_state_grad.as_ref(),
        &options,
    );

    Ok(ChunkDeltaRuleGrads {
        query_grad: grads.query_grad,
        key_grad: grads.key_grad,
        value_grad: grads.value_grad,
        beta_grad: grads.beta_grad,
        initial_state_grad: has_initial_state.then_some(grads.initial_state_grad),
    })
}

/// The collaborator used by the backend entry points.
pub(crate) fn default_wy(options: &ChunkOptions) -> ChunkWy {
    ChunkWy::new(options.wy_mode)
}
