use linattn_config::validated::kernel::TileOverrides;
use serde::{Deserialize, Serialize};

use crate::{KernelError, Result};

/// Largest key tile a single state update may use.
pub const MAX_STATE_BLOCK_K: usize = 256;
/// Cap for the key/value tiles of the output and gradient passes.
pub const MAX_BLOCK: usize = 64;

/// Compute capability of the target device, `(0, 0)` when unknown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapability {
    pub major: u32,
    pub minor: u32,
}

impl DeviceCapability {
    pub const GENERIC: Self = Self::new(0, 0);
    pub const AMPERE_DATACENTER: Self = Self::new(8, 0);
    pub const HOPPER: Self = Self::new(9, 0);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

/// Tile sizes injected into the chunk passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileConfig {
    pub chunk_size: usize,
    pub sub_chunk_size: usize,
    /// Key tile of the state passes. Always covers the whole key dimension.
    pub state_block_k: usize,
    pub state_block_v: usize,
    pub block_k: usize,
    pub block_v: usize,
}

fn default_state_block_v(capability: DeviceCapability) -> usize {
    if capability.major >= 9 { 64 } else { 32 }
}

fn default_sub_chunk_size(capability: DeviceCapability, key_dim: usize) -> usize {
    if capability.major >= 9 || key_dim <= 128 {
        64
    } else {
        32
    }
}

/// Pick tile sizes for one call. Pure: the same inputs always give the same tiles.
pub fn resolve_tiles(
    capability: DeviceCapability,
    key_dim: usize,
    value_dim: usize,
    chunk_size: usize,
    overrides: &TileOverrides,
) -> Result<TileConfig> {
    if chunk_size == 0 {
        return Err(KernelError::configuration("chunk size must be positive"));
    }
    if key_dim == 0 || value_dim == 0 {
        return Err(KernelError::configuration(format!(
            "key/value dims must be positive, got K={key_dim} V={value_dim}"
        )));
    }

    let state_block_k = overrides
        .state_block_k
        .unwrap_or_else(|| key_dim.next_power_of_two());
    if state_block_k < key_dim {
        return Err(KernelError::configuration(format!(
            "state update needs one key tile covering K={key_dim}, got a tile of {state_block_k}"
        )));
    }
    if state_block_k > MAX_STATE_BLOCK_K {
        return Err(KernelError::configuration(format!(
            "key tile of {state_block_k} for K={key_dim} exceeds the single-tile limit of \
             {MAX_STATE_BLOCK_K}"
        )));
    }

    let state_block_v = overrides.state_block_v.unwrap_or_else(|| {
        default_state_block_v(capability).min(value_dim.next_power_of_two())
    });
    let sub_chunk_size = overrides
        .sub_chunk_size
        .unwrap_or_else(|| default_sub_chunk_size(capability, key_dim))
        .min(chunk_size);
    let block_k = overrides
        .block_k
        .unwrap_or_else(|| key_dim.next_power_of_two().min(MAX_BLOCK));
    let block_v = overrides
        .block_v
        .unwrap_or_else(|| value_dim.next_power_of_two().min(MAX_BLOCK));

    for (name, size) in [
        ("state_block_v", state_block_v),
        ("sub_chunk_size", sub_chunk_size),
        ("block_k", block_k),
        ("block_v", block_v),
    ] {
        if size == 0 {
            return Err(KernelError::configuration(format!("{name} must be positive")));
        }
    }

    Ok(TileConfig {
        chunk_size,
        sub_chunk_size,
        state_block_k,
        state_block_v,
        block_k,
        block_v,
    })
}
