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
    chunk_delta_rule::{
        ChunkDeltaRuleAutodiffBackend, ChunkDeltaRuleBackend, ChunkDeltaRuleBackwardOutput,
        ChunkDeltaRuleBackwardOutputPrimitive, ChunkDeltaRuleForwardOutput,
        ChunkDeltaRuleForwardOutputPrimitive,
    },
};

/// Forward outputs the backward node keeps besides its checkpointed inputs.
#[derive(Debug, Clone)]
struct SavedForward<B: ChunkDeltaRuleBackend> {
    transform: FloatTensor<B>,
    states: Option<FloatTensor<B>>,
    corrected_value: Option<FloatTensor<B>>,
    options: ChunkOptions,
}

impl<B: ChunkDeltaRuleBackend, C: CheckpointStrategy> ChunkDeltaRuleBackend for Autodiff<B, C> {
    fn chunk_delta_rule_forward(
        query: FloatTensor<Self>,
        key: FloatTensor<Self>,
        value: FloatTensor<Self>,
        beta: FloatTensor<Self>,
        initial_state: FloatTensor<Self>,
        options: ChunkOptions,
    ) -> ChunkDeltaRuleForwardOutputPrimitive<Self> {
        #[derive(Debug)]
        struct ChunkDeltaRuleBackward;

        impl<B: ChunkDeltaRuleBackend> Backward<B, 5> for ChunkDeltaRuleBackward {
            type State = (NodeId, NodeId, NodeId, NodeId, NodeId, SavedForward<B>);

            fn backward(
                self,
                ops: Ops<Self::State, 5>,
                grads: &mut Gradients,
                checkpointer: &mut Checkpointer,
            ) {
                let [node_query, node_key, node_value, node_beta, node_initial_state] =
                    ops.parents;
                let output_grad = grads.consume::<B>(&ops.node);

                let (query_state, key_state, value_state, beta_state, initial_state_state, saved) =
                    ops.state;

                let query: FloatTensor<B> = checkpointer.retrieve_node_output(query_state);
                let key: FloatTensor<B> = checkpointer.retrieve_node_output(key_state);
                let value: FloatTensor<B> = checkpointer.retrieve_node_output(value_state);
                let beta: FloatTensor<B> = checkpointer.retrieve_node_output(beta_state);
                let initial_state: FloatTensor<B> =
                    checkpointer.retrieve_node_output(initial_state_state);

                // The final state leaves the graph untracked, so only the output feeds back.
                let grads_out = B::chunk_delta_rule_backward(
                    query,
                    key,
                    value,
                    beta,
                    initial_state,
                    saved.transform,
                    saved.states,
                    saved.corrected_value,
                    output_grad,
                    None,
                    saved.options,
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
                if let Some(node) = node_beta {
                    grads.register::<B>(node.id, grads_out.beta_grad);
                }
                if let Some(node) = node_initial_state {
                    grads.register::<B>(node.id, grads_out.initial_state_grad);
                }
            }
        }

        match ChunkDeltaRuleBackward
            .prepare::<C>([
                query.node.clone(),
                key.node.clone(),
                value.node.clone(),
                beta.node.clone(),
                initial_state.node.clone(),
            ])
            .compute_bound()
            .stateful()
        {
            OpsKind::Tracked(mut prep) => {
                let query_state = prep.checkpoint(&query);
                let key_state = prep.checkpoint(&key);
                let value_state = prep.checkpoint(&value);
                let beta_state = prep.checkpoint(&beta);
                let initial_state_state = prep.checkpoint(&initial_state);

                let output = B::chunk_delta_rule_forward(
                    query.primitive.clone(),
                    key.primitive.clone(),
                    value.primitive.clone(),
                    beta.primitive.clone(),
                    initial_state.primitive.clone(),
                    options,
                );

                let saved = SavedForward {
                    transform: output.transform.clone(),
                    states: output.states.clone(),
                    corrected_value: output.corrected_value.clone(),
                    options,
                };

                ChunkDeltaRuleForwardOutput {
                    output: prep.finish(
                        (
                            query_state,
                            key_state,
                            value_state,
                            beta_state,
                            initial_state_state,
                            saved,
                        ),
                        output.output,
                    ),
                    final_state: Autodiff::<B, C>::from_inner(output.final_state),
                    transform: Autodiff::<B, C>::from_inner(output.transform),
                    states: output.states.map(Autodiff::<B, C>::from_inner),
                    corrected_value: output.corrected_value.map(Autodiff::<B, C>::from_inner),
                }
            }
            OpsKind::UnTracked(prep) => {
                let output = B::chunk_delta_rule_forward(
                    query.primitive,
                    key.primitive,
                    value.primitive,
                    beta.primitive,
                    initial_state.primitive,
                    options,
                );

                ChunkDeltaRuleForwardOutput {
                    output: prep.finish(output.output),
                    final_state: Autodiff::<B, C>::from_inner(output.final_state),
                    transform: Autodiff::<B, C>::from_inner(output.transform),
                    states: output.states.map(Autodiff::<B, C>::from_inner),
                    corrected_value: output.corrected_value.map(Autodiff::<B, C>::from_inner),
                }
            }
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
        let grads = B::chunk_delta_rule_backward(
            Autodiff::<B, C>::inner(query),
            Autodiff::<B, C>::inner(key),
            Autodiff::<B, C>::inner(value),
            Autodiff::<B, C>::inner(beta),
            Autodiff::<B, C>::inner(initial_state),
            Autodiff::<B, C>::inner(transform),
            states.map(Autodiff::<B, C>::inner),
            corrected_value.map(Autodiff::<B, C>::inner),
            Autodiff::<B, C>::inner(output_grad),
            final_state_grad.map(Autodiff::<B, C>::inner),
            options,
        );

        ChunkDeltaRuleBackwardOutput {
            query_grad: Autodiff::<B, C>::from_inner(grads.query_grad),
            key_grad: Autodiff::<B, C>::from_inner(grads.key_grad),
            value_grad: Autodiff::<B, C>::from_inner(grads.value_grad),
            beta_grad: Autodiff::<B, C>::from_inner(grads.beta_grad),
            initial_state_grad: Autodiff::<B, C>::from_inner(grads.initial_state_grad),
        }
    }
}

impl<B: ChunkDeltaRuleBackend, C: CheckpointStrategy> ChunkDeltaRuleAutodiffBackend
    for Autodiff<B, C>
{
}
