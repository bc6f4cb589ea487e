pub mod config;
pub mod decay;
pub mod layout;
pub mod tiles;
pub mod validate;

use burn::{
    prelude::Backend,
    tensor::{Tensor, TensorPrimitive, ops::FloatTensor},
};
use log::debug;

pub use config::{CheckpointLevel, ChunkKernelConfig, ChunkOptions, WyMode};
pub use linattn_config::validated::kernel::TileOverrides;
pub use tiles::{DeviceCapability, TileConfig, resolve_tiles};

/// Output of the retention forward state pass.
#[derive(Clone, Debug)]
pub struct ChunkStates<B: Backend> {
    /// `(B, H, NT, K, V)`, entry `i` is the state before chunk `i`.
    pub states: Tensor<B, 5>,
    /// `(B, H, K, V)` state after the last chunk.
    pub final_state: Tensor<B, 4>,
}

/// What the delta-rule backward pass needs from its forward state pass.
#[derive(Clone, Debug)]
pub struct DeltaSnapshots<B: Backend> {
    /// `(B, H, NT, K, V)`, entry `i` is the state before chunk `i`.
    pub states: Tensor<B, 5>,
    /// `(B, H, T, V)` values after subtracting the projected chunk-entry state.
    pub corrected_value: Tensor<B, 4>,
}

/// Output of the delta-rule forward state pass.
#[derive(Clone, Debug)]
pub struct DeltaChunkStates<B: Backend> {
    pub snapshots: DeltaSnapshots<B>,
    pub final_state: Tensor<B, 4>,
}

/// Snapshots handed from forward to backward: either kept, or rebuilt on demand.
#[derive(Clone, Debug)]
pub enum StateSnapshots<T> {
    Retained(T),
    Recompute,
}

impl<T> StateSnapshots<T> {
    pub fn is_retained(&self) -> bool {
        matches!(self, Self::Retained(_))
    }

    /// Hand over the retained snapshots, running `recompute` only if they were dropped.
    pub fn resolve(self, recompute: impl FnOnce() -> T) -> T {
        match self {
            Self::Retained(snapshots) => snapshots,
            Self::Recompute => {
                debug!("recomputing chunk snapshots for backward");
                recompute()
            }
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Retained(snapshots) => Some(snapshots),
            Self::Recompute => None,
        }
    }
}

impl<T> From<Option<T>> for StateSnapshots<T> {
    fn from(snapshots: Option<T>) -> Self {
        match snapshots {
            Some(snapshots) => Self::Retained(snapshots),
            None => Self::Recompute,
        }
    }
}

pub(crate) fn float_tensor<B: Backend, const D: usize>(primitive: FloatTensor<B>) -> Tensor<B, D> {
    Tensor::from_primitive(TensorPrimitive::Float(primitive))
}

pub(crate) fn float_primitive<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> FloatTensor<B> {
    tensor.into_primitive().tensor()
}
