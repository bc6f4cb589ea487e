use burn::{
    backend::{
        Autodiff,
        autodiff::{
            NodeId,
            checkpoint::{base::Checkpointer, strategy::CheckpointStrategy},
            grads::Gradients,
            ops::{Backward, Ops, OpsKind},
        },
    },
    tensor::{backend::AutodiffBackend, ops::FloatTensor},
};

use crate::kernels::{
    chunk_common::ChunkOptions,
    chunk_retention::{
        ChunkRetentionAutodiffBackend, ChunkRetentionBackend, ChunkRetentionBackwardOutput,
        ChunkRetentionBackwardOutputPrimitive, ChunkRetentionForwardOutput,
        ChunkRetentionForwardOutputPrimitive,
    },
};

impl<B: ChunkRetentionBackend, C: CheckpointStrategy> ChunkRetentionBackend for Autodiff<B, C> {
    fn chunk_retention_forward(
        query: FloatTensor<Self>,
        key: FloatTensor<Self>,
        value: FloatTensor<Self>,
        initial_state: FloatTensor<Self>,
        options: ChunkOptions,
    ) -> ChunkRetentionForwardOutputPrimitive<Self> {
        #[derive(Debug)]
        struct ChunkRetentionBackward;

        impl<B: ChunkRetentionBackend> Backward<B, 4> for ChunkRetentionBackward {
            type State = (
                NodeId,
                NodeId,
                NodeId,
                NodeId,
                Option<FloatTensor<B>>,
                ChunkOptions,
            );

            fn backward(
                self,
                ops: Ops<Self::State, 4>,
                grads: &mut Gradients,
                checkpointer: &mut Checkpointer,
            ) {
                let [node_query, node_key, node_value, node_initial_state] = ops.parents;
                let output_grad = grads.consume::<B>(&ops.node);

                let (query_state, key_state, value_state, initial_state_state, states, options) =
                    ops.state;

                let query: FloatTensor<B> = checkpointer.retrieve_node_output(query_state);
                let key: FloatTensor<B> = checkpointer.retrieve_node_output(key_state);
                let value: FloatTensor<B> = checkpointer.retrieve_node_output(value_state);
                let initial_state: FloatTensor<B> =
                    checkpointer.retrieve_node_output(initial_state_state);

                // The final state leaves the graph untracked, so only the output feeds back.
                let grads_out = B::chunk_retention_backward(
                    query,
                    key,
                    value,
                    initial_state,
                    states,
                    output_grad,
                    None,
                    options,
                );

                if let Some(node) = node_query {
                    grads.register::<B>(node.id, grads_out.query_grad);
                }
                if let Some(node) = node_key {
                    grads.register::<B>(node.id, grads_out.key_grad);
                }
                if let Some(node) = node_value {
                    grads.register::<B>(node.id, grads_out.value_grad);
                }
                if let Some(node) = node_initial_state {
                    grads.register::<B>(node.id, grads_out.initial_state_grad);
                }
            }
        }

        match ChunkRetentionBackward
            .prepare::<C>([
                query.node.clone(),
                key.node.clone(),
                value.node.clone(),
                initial_state.node.clone(),
            ])
            .compute_bound()
            .stateful()
        {
            OpsKind::Tracked(mut prep) => {
                let query_state = prep.checkpoint(&query);
                let key_state = prep.checkpoint(&key);
                let value_state = prep.checkpoint(&value);
                let initial_state_state = prep.checkpoint(&initial_state);

                let output = B::chunk_retention_forward(
                    query.primitive.clone(),
                    key.primitive.clone(),
                    value.primitive.clone(),
                    initial_state.primitive.clone(),
                    options,
                );

                let saved_state = (
                    query_state,
                    key_state,
                    value_state,
                    initial_state_state,
                    output.states.clone(),
                    options,
                );

                ChunkRetentionForwardOutput {
                    output: prep.finish(saved_state, output.output),
                    final_state: Autodiff::<B, C>::from_inner(output.final_state),
                    states: output.states.map(Autodiff::<B, C>::from_inner),
                }
            }
            OpsKind::UnTracked(prep) => {
                let output = B::chunk_retention_forward(
                    query.primitive,
                    key.primitive,
                    value.primitive,
                    initial_state.primitive,
                    options,
                );

                ChunkRetentionForwardOutput {
                    output: prep.finish(output.output),
                    final_state: Autodiff::<B, C>::from_inner(output.final_state),
                    states: output.states.map(Autodiff::<B, C>::from_inner),
                }
            }
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
        let grads = B::chunk_retention_backward(
            Autodiff::<B, C>::inner(query),
            Autodiff::<B, C>::inner(key),
            Autodiff::<B, C>::inner(value),
            Autodiff::<B, C>::inner(initial_state),
            states.map(Autodiff::<B, C>::inner),
            Autodiff::<B, C>::inner(output_grad),
            final_state_grad.map(Autodiff::<B, C>::inner),
            options,
        );

        ChunkRetentionBackwardOutput {
            query_grad: Autodiff::<B, C>::from_inner(grads.query_grad),
            key_grad: Autodiff::<B, C>::from_inner(grads.key_grad),
            value_grad: Autodiff::<B, C>::from_inner(grads.value_grad),
            initial_state_grad: Autodiff::<B, C>::from_inner(grads.initial_state_grad),
        }
    }
}

impl<B: ChunkRetentionBackend, C: CheckpointStrategy> ChunkRetentionAutodiffBackend
    for Autodiff<B, C>
{
}
