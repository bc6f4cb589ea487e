use burn::{
    backend::ndarray::{
        FloatNdArrayElement, IntNdArrayElement, NdArray, NdArrayTensor, QuantElement,
        SharedArray,
    },
    tensor::ops::FloatTensor,
};

use crate::kernels::{
    chunk_common::ChunkOptions,
    chunk_retention::{
        ChunkRetentionBackend, ChunkRetentionBackwardOutputPrimitive,
        ChunkRetentionForwardOutputPrimitive,
        host::{chunk_retention_backward_impl, chunk_retention_forward_impl},
    },
};

impl<E: FloatNdArrayElement, I: IntNdArrayElement, Q: QuantElement> ChunkRetentionBackend
    for NdArray<E, I, Q>
where
    NdArrayTensor: From<SharedArray<E>>,
    NdArrayTensor: From<SharedArray<I>>,
{
    fn chunk_retention_forward(
        query: FloatTensor<Self>,
        key: FloatTensor<Self>,
        value: FloatTensor<Self>,
        initial_state: FloatTensor<Self>,
        options: ChunkOptions,
    ) -> ChunkRetentionForwardOutputPrimitive<Self> {
        chunk_retention_forward_impl::<Self>(query, key, value, initial_state, options)
    }

    fn chunk_retention_backward(
        query: FloatTensor<Self>,
        key: FloatTensor<Self>,
        value: FloatTensor<Self>,
        initial_state: FloatTensor<Self>,
        states: Option<FloatTensor<Self>>,
        output_grad: FloatTensor<Self>,
        final_state_grad: Option<FloatTensor<Self>>,
        options: ChunkOptions,
    ) -> ChunkRetentionBackwardOutputPrimitive<Self> {
        chunk_retention_backward_impl::<Self>(
            query,
            key,
            value,
            initial_state,
            states,
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
        chunk_retention::{
            ChunkRetentionBackend, ChunkRetentionBackwardOutput,
            ChunkRetentionBackwardOutputPrimitive, ChunkRetentionForwardOutput,
            ChunkRetentionForwardOutputPrimitive,
            host::{chunk_retention_backward_impl, chunk_retention_forward_impl},
        },
    };

    /// Narrow float inputs are widened to f32 so every accumulator runs in f32; only the
    /// outputs and retained snapshots are narrowed back. The final state and the
    /// initial-state gradient stay f32.
    impl<R: CubeRuntime, F: FloatElement, I: IntElement, BT: BoolElement> ChunkRetentionBackend
        for CubeBackend<R, F, I, BT>
    {
        fn chunk_retention_forward(
            query: FloatTensor<Self>,
            key: FloatTensor<Self>,
            value: FloatTensor<Self>,
            initial_state: FloatTensor<Self>,
            options: ChunkOptions,
        ) -> ChunkRetentionForwardOutputPrimitive<Self> {
            let widen = |tensor| cast::<R>(tensor, DType::F32);
            let output = chunk_retention_forward_impl::<CubeBackend<R, f32, I, BT>>(
                widen(query),
                widen(key),
                widen(value),
                widen(initial_state),
                options,
            );

            ChunkRetentionForwardOutput {
                output: cast::<R>(output.output, F::dtype()),
                final_state: output.final_state,
                states: output.states.map(|states| cast::<R>(states, F::dtype())),
            }
        }

        fn chunk_retention_backward(
            query: FloatTensor<Self>,
            key: FloatTensor<Self>,
            value: FloatTensor<Self>,
            initial_state: FloatTensor<Self>,
            states: Option<FloatTensor<Self>>,
            output_grad: FloatTensor<Self>,
            final_state_grad: Option<FloatTensor<Self>>,
            options: ChunkOptions,
        ) -> ChunkRetentionBackwardOutputPrimitive<Self> {
            let widen = |tensor| cast::<R>(tensor, DType::F32);
            let grads = chunk_retention_backward_impl::<CubeBackend<R, f32, I, BT>>(
                widen(query),
                widen(key),
                widen(value),
                widen(initial_state),
                states.map(widen),
                widen(output_grad),
                final_state_grad.map(widen),
                options,
            );

            ChunkRetentionBackwardOutput {
                query_grad: cast::<R>(grads.query_grad, F::dtype()),
                key_grad: cast::<R>(grads.key_grad, F::dtype()),
                value_grad: cast::<R>(grads.value_grad, F::dtype()),
                initial_state_grad: grads.initial_state_grad,
            }
        }
    }
}
