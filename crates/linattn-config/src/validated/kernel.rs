use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::{
    CheckpointOptions, ConfigError, Result, WyModeOptions,
    raw::kernel::{RawKernelConfig, RawTileOverrides},
};

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FinalKernelConfig {
    pub chunk_size: usize,
    pub scale: Option<f64>,
    pub output_final_state: bool,
    pub checkpoint: CheckpointOptions,
    pub wy_mode: WyModeOptions,

    pub compute_major: u32,
    pub compute_minor: u32,

    pub tiles: TileOverrides,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TileOverrides {
    pub state_block_k: Option<usize>,
    pub state_block_v: Option<usize>,
    pub sub_chunk_size: Option<usize>,
    pub block_k: Option<usize>,
    pub block_v: Option<usize>,
}

impl TryFrom<RawKernelConfig> for FinalKernelConfig {
    type Error = ConfigError;

    fn try_from(mut raw: RawKernelConfig) -> Result<Self> {
        raw.fill_default();

        let chunk_size = raw.chunk_size.unwrap_or(64);
        if chunk_size == 0 {
            return Err(ConfigError::invalid("chunk_size must be positive"));
        }

        if let Some(scale) = raw.scale
            && !(scale.is_finite() && scale > 0.0)
        {
            return Err(ConfigError::invalid(format!(
                "scale must be a positive finite number, got {scale}"
            )));
        }

        let tiles = raw.tiles.map(validate_tiles).transpose()?.unwrap_or_default();

        Ok(Self {
            chunk_size,
            scale: raw.scale,
            output_final_state: raw.output_final_state.unwrap_or(false),
            checkpoint: raw.checkpoint.unwrap_or_default(),
            wy_mode: raw.wy_mode.unwrap_or_default(),
            compute_major: raw.compute_major.unwrap_or(0),
            compute_minor: raw.compute_minor.unwrap_or(0),
            tiles,
        })
    }
}

fn validate_tiles(raw: RawTileOverrides) -> Result<TileOverrides> {
    let fields = [
        ("state_block_k", raw.state_block_k),
        ("state_block_v", raw.state_block_v),
        ("sub_chunk_size", raw.sub_chunk_size),
        ("block_k", raw.block_k),
        ("block_v", raw.block_v),
    ];

    for (name, value) in fields {
        if value == Some(0) {
            return Err(ConfigError::invalid(format!("tiles.{name} must be positive")));
        }
    }

    Ok(TileOverrides {
        state_block_k: raw.state_block_k,
        state_block_v: raw.state_block_v,
        sub_chunk_size: raw.sub_chunk_size,
        block_k: raw.block_k,
        block_v: raw.block_v,
    })
}

pub static KERNEL_CFG: OnceCell<Arc<FinalKernelConfig>> = OnceCell::new();

/// Validate `raw` and install it as the process-wide kernel config.
pub fn init_kernel_config(raw: RawKernelConfig) -> Result<Arc<FinalKernelConfig>> {
    let config = Arc::new(FinalKernelConfig::try_from(raw)?);
    KERNEL_CFG
        .set(config.clone())
        .map_err(|_| ConfigError::AlreadyInitialized)?;
    Ok(config)
}
