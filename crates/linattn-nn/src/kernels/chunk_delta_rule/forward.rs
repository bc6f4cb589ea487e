use burn::{
    backend::ndarray::{
        FloatNdArrayElement, IntNdArrayElement, NdArray, NdArrayTensor, QuantElement,
        SharedArray,
    },
    tensor::ops::FloatTensor,
};

use crate::kernels::{
    chunk_common::ChunkOptions,
    chunk_delta_rule::{
        ChunkDeltaRuleBackend, ChunkDeltaRuleBackwardOutputPrimitive,
        ChunkDeltaRuleForwardOutputPrimitive,
        host::{chunk_delta_rule_backward_impl, chunk_delta_rule_forward_impl},
    },
};

impl<E: FloatNdArrayElement, I: IntNdArrayElement, Q: QuantElement> ChunkDeltaRuleBackend
    for NdArray<E, I, Q>
where
    NdArrayTensor: From<SharedArray<E>>,
    NdArrayTensor: From<SharedArray<I>>,
{
    fn chunk_delta_rule_forward(
        query: FloatTensor<Self>,
        key: FloatTensor<Self>,
        value: FloatTensor<Self>,
        beta: FloatTensor<Self>,
        initial_state: FloatTensor<Self>,
        options: ChunkOptions,
    ) -> ChunkDeltaRuleForwardOutputPrimitive<Self> {
        chunk_delta_rule_forward_impl::<Self>(query, key, value, beta, initial_state, options)
    }

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
    ) -> ChunkDeltaRuleBackwardOutputPrimitive<Self> {
        chunk_delta_rule_backward_impl::<Self>(
            query,
            key,
            value,
            beta,
            initial_state,
            transform,
            states,
            corrected_value,
            output_grad,
            final_state_grad,
            options,
        )
    }
}

#[cfg(feature = "cubecl")]
mod cube {
    use burn::tensor::{DType, ops::FloatTensor};
    use burn_cubecl::{
        BoolElement, CubeBackend, CubeRuntime, FloatElement, IntElement, kernel::cast,
    };

    use crate::kernels::{
        chunk_common::ChunkOptions,
        chunk_delta_rule::{
            ChunkDeltaRuleBackend, ChunkDeltaRuleBackwardOutput,
            ChunkDeltaRuleBackwardOutputPrimitive, ChunkDeltaRuleForwardOutput,
            ChunkDeltaRuleForwardOutputPrimitive,
            host::{chunk_delta_rule_backward_impl, chunk_delta_rule_forward_impl},
        },
    };

    /// Same precision policy as retention. The transform stays f32 as well, it is only
    /// ever fed back into backward.
    impl<R: CubeRuntime, F: FloatElement, I: IntElement, BT: BoolElement> ChunkDeltaRuleBackend
        for CubeBackend<R, F, I, BT>
    {
        fn chunk_delta_rule_forward(
            query: FloatTensor<Self>,
            key: FloatTensor<Self>,
            value: FloatTensor<Self>,
            beta: FloatTensor<Self>,
            initial_state: FloatTensor<Self>,
            options: ChunkOptions,
        ) -> ChunkDeltaRuleForwardOutputPrimitive<Self> {
            let widen = |tensor| cast::<R>(tensor, DType::F32);
            let narrow = |tensor| cast::<R>(tensor, F::dtype());
            let output = chunk_delta_rule_forward_impl::<CubeBackend<R, f32, I, BT>>(
                widen(query),
                widen(key),
                widen(value),
                widen(beta),
                widen(initial_state),
                options,
            );

            ChunkDeltaRuleForwardOutput {
                output: narrow(output.output),
                final_state: output.final_state,
                transform: output.transform,
                states: output.states.map(narrow),
                corrected_value: output.corrected_value.map(narrow),
            }
        }

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
        ) -> ChunkDeltaRuleBackwardOutputPrimitive<Self> {
            let widen = |tensor| cast::<R>(tensor, DType::F32);
            let narrow = |tensor| cast::<R>(tensor, F::dtype());
            let grads = chunk_delta_rule_backward_impl::<CubeBackend<R, f32, I, BT>>(
                widen(query),
                widen(key),
                widen(value),
                widen(beta),
                widen(initial_state),
                widen(transform),
                states.map(widen),
                corrected_value.map(widen),
                widen(output_grad),
                final_state_grad.map(widen),
                options,
            );

            ChunkDeltaRuleBackwardOutput {
                query_grad: narrow(grads.query_grad),
                key_grad: narrow(grads.key_grad),
                value_grad: narrow(grads.value_grad),
                beta_grad: narrow(grads.beta_grad),
                initial_state_grad: grads.initial_state_grad,
            }
        }
    }
}
