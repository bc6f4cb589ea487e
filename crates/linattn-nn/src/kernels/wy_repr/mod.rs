//! WY representation of the delta-rule chunk updates.
//!
//! Within one chunk the sequential delta updates collapse to
//! `v'_t = u_t - w_t H`, where `W = T diag(beta) K`, `U = T V'` and
//! `T = (I + strict_lower(diag(beta) K K^T))^-1`. The chunk passes only need `W`, `U`
//! and, on the way back, the gradient through them; anything that provides those can
//! stand in for [`ChunkWy`].

mod host;

use burn::{prelude::Backend, tensor::Tensor};

pub use host::ChunkWy;

#[derive(Clone, Debug)]
pub struct WyForward<B: Backend> {
    /// `W`, `(B, H, T, K)`.
    pub wy_key: Tensor<B, 4>,
    /// `U`, `(B, H, T, V)`.
    pub wy_value: Tensor<B, 4>,
    /// Per-chunk `T` blocks, `(B, H, T, BT)`, zero padded on the last chunk.
    pub transform: Tensor<B, 4>,
}

#[derive(Clone, Debug)]
pub struct WyBackward<B: Backend> {
    /// Extra key gradient to add to the chunk pass key gradient.
    pub key_grad: Tensor<B, 4>,
    pub value_grad: Tensor<B, 4>,
    pub beta_grad: Tensor<B, 3>,
}

pub trait WyRepresentation<B: Backend> {
    fn forward(
        &self,
        key: &Tensor<B, 4>,
        value: &Tensor<B, 4>,
        beta: &Tensor<B, 3>,
        chunk_size: usize,
    ) -> WyForward<B>;

    /// Rebuild `W` and `U` from a stored `transform`.
    fn recompute(
        &self,
        key: &Tensor<B, 4>,
        value: &Tensor<B, 4>,
        beta: &Tensor<B, 3>,
        transform: &Tensor<B, 4>,
        chunk_size: usize,
    ) -> WyForward<B>;

    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        key: &Tensor<B, 4>,
        value: &Tensor<B, 4>,
        beta: &Tensor<B, 3>,
        transform: &Tensor<B, 4>,
        wy_key_grad: &Tensor<B, 4>,
        wy_value_grad: &Tensor<B, 4>,
        chunk_size: usize,
    ) -> WyBackward<B>;
}
