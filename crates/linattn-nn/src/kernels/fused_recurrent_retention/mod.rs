//! Token-by-token retention.
//!
//! Walks the recurrence `S_t = gamma S_{t-1} + k_t v_t^T`, `o_t = scale * q_t^T S_t`
//! one position at a time. No chunk snapshots are kept, so it is cheap for short
//! sequences and decode steps, and it is the exact reference the chunked path must match.

use burn::{prelude::Backend, tensor::Tensor};
use linattn_trace::tracy_scope;
use log::trace;

use crate::{
    Result,
    kernels::{
        chunk_common::{
            ChunkKernelConfig,
            decay::HeadDecay,
            layout::time_slice,
            validate::{ProblemShape, check_dims, check_dtype, check_inputs, check_state},
        },
        chunk_retention::ChunkRetentionGrads,
    },
};

#[derive(Clone, Debug)]
pub struct FusedRetentionOutput<B: Backend> {
    /// `(B, H, T, V)`.
    pub output: Tensor<B, 4>,
    /// Present when `output_final_state` is set.
    pub final_state: Option<Tensor<B, 4>>,
}

struct Recurrence<B: Backend> {
    rates: Tensor<B, 4>,
    scale: f64,
}

impl<B: Backend> Recurrence<B> {
    fn new(shape: &ProblemShape, scale: f64, device: &B::Device) -> Self {
        Self {
            rates: HeadDecay::retention(shape.num_heads).rates(device),
            scale,
        }
    }

    fn step(&self, state: Tensor<B, 4>, key: Tensor<B, 4>, value: Tensor<B, 4>) -> Tensor<B, 4> {
        state * self.rates.clone() + key.transpose().matmul(value)
    }

    /// Every state `S_1..S_T` plus the output rows read from them.
    fn run(
        &self,
        query: &Tensor<B, 4>,
        key: &Tensor<B, 4>,
        value: &Tensor<B, 4>,
        initial_state: Tensor<B, 4>,
    ) -> (Vec<Tensor<B, 4>>, Vec<Tensor<B, 4>>) {
        let seq_len = query.dims()[2];
        let mut states = Vec::with_capacity(seq_len);
        let mut outputs = Vec::with_capacity(seq_len);

        let mut state = initial_state;
        for t in 0..seq_len {
            state = self.step(
                state,
                time_slice(key, t..t + 1),
                time_slice(value, t..t + 1),
            );
            outputs.push(
                time_slice(query, t..t + 1)
                    .matmul(state.clone())
                    .mul_scalar(self.scale),
            );
            states.push(state.clone());
        }
        (states, outputs)
    }
}

pub fn fused_recurrent_retention_forward<B: Backend>(
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
    initial_state: Option<Tensor<B, 4>>,
    config: &ChunkKernelConfig,
) -> Result<FusedRetentionOutput<B>> {
    tracy_scope!("fused_recurrent_retention_forward");
    let shape = check_inputs(&query, &key, &value)?;
    if let Some(state) = &initial_state {
        check_state(state, &shape, "initial_state")?;
    }
    let options = config.resolve(shape.key_dim, shape.value_dim)?;
    let device = query.device();
    trace!("fused retention forward over {} positions", shape.seq_len);

    let initial_state =
        initial_state.unwrap_or_else(|| Tensor::zeros(shape.state_dims(), &device));
    let recurrence = Recurrence::new(&shape, options.scale, &device);
    let (mut states, outputs) = recurrence.run(&query, &key, &value, initial_state);

    Ok(FusedRetentionOutput {
        output: Tensor::cat(outputs, 2),
        final_state: config
            .output_final_state
            .then(|| states.pop())
            .flatten(),
    })
}

/// Reverse recurrence `G_t = gamma G_{t+1} + scale * q_t dO_t^T`, seeded with
/// `final_state_grad`. The forward states are rebuilt first.
#[allow(clippy::too_many_arguments)]
pub fn fused_recurrent_retention_backward<B: Backend>(
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
    initial_state: Option<Tensor<B, 4>>,
    output_grad: Tensor<B, 4>,
    final_state_grad: Option<Tensor<B, 4>>,
    config: &ChunkKernelConfig,
) -> Result<ChunkRetentionGrads<B>> {
    tracy_scope!("fused_recurrent_retention_backward");
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
    let device = query.device();

    let has_initial_state = initial_state.is_some();
    let initial_state =
        initial_state.unwrap_or_else(|| Tensor::zeros(shape.state_dims(), &device));
    let recurrence = Recurrence::new(&shape, options.scale, &device);
    let (states, _) = recurrence.run(&query, &key, &value, initial_state);

    let seq_len = shape.seq_len;
    let mut query_grads = Vec::with_capacity(seq_len);
    let mut key_grads = Vec::with_capacity(seq_len);
    let mut value_grads = Vec::with_capacity(seq_len);

    let mut carried =
        final_state_grad.unwrap_or_else(|| Tensor::zeros(shape.state_dims(), &device));
    for (t, state) in states.into_iter().enumerate().rev() {
        let query_t = time_slice(&query, t..t + 1);
        let key_t = time_slice(&key, t..t + 1);
        let value_t = time_slice(&value, t..t + 1);
        let output_grad_t = time_slice(&output_grad, t..t + 1);

        let grad = carried
            + query_t
                .transpose()
                .matmul(output_grad_t.clone())
                .mul_scalar(options.scale);

        query_grads.push(
            output_grad_t
                .matmul(state.transpose())
                .mul_scalar(options.scale),
        );
        key_grads.push(value_t.matmul(grad.clone().transpose()));
        value_grads.push(key_t.matmul(grad.clone()));

        carried = grad * recurrence.rates.clone();
    }
    query_grads.reverse();
    key_grads.reverse();
    value_grads.reverse();

    Ok(ChunkRetentionGrads {
        query_grad: Tensor::cat(query_grads, 2),
        key_grad: Tensor::cat(key_grads, 2),
        value_grad: Tensor::cat(value_grads, 2),
        initial_state_grad: has_initial_state.then_some(carried),
    })
}
