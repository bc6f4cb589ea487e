use std::path::Path;

use burn::config::Config;
use linattn_config::{
    CheckpointOptions, WyModeOptions, load_toml,
    raw::kernel::RawKernelConfig,
    validated::kernel::{FinalKernelConfig, KERNEL_CFG, TileOverrides},
};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    KernelError,
    kernels::chunk_common::tiles::{DeviceCapability, TileConfig, resolve_tiles},
};

/// Whether chunk snapshots outlive the forward pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointLevel {
    /// Keep `H` (and the corrected values) for the backward pass.
    Retain,
    /// Drop them and rerun the forward state pass during backward.
    #[default]
    Recompute,
}

/// How beta enters the delta-rule write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WyMode {
    /// `S += k (v - beta * S^T k)^T`: beta only scales the erase term.
    #[default]
    Erase,
    /// `S += beta * k (v - S^T k)^T`.
    Gated,
}

impl From<CheckpointOptions> for CheckpointLevel {
    fn from(options: CheckpointOptions) -> Self {
        match options {
            CheckpointOptions::Retain => Self::Retain,
            CheckpointOptions::Recompute => Self::Recompute,
        }
    }
}

impl From<WyModeOptions> for WyMode {
    fn from(options: WyModeOptions) -> Self {
        match options {
            WyModeOptions::Erase => Self::Erase,
            WyModeOptions::Gated => Self::Gated,
        }
    }
}

#[derive(Config, Debug)]
pub struct ChunkKernelConfig {
    #[config(default = 64)]
    pub chunk_size: usize,
    /// Query scale, `1 / sqrt(K)` when unset.
    pub scale: Option<f64>,
    #[config(default = false)]
    pub output_final_state: bool,
    #[config(default = "CheckpointLevel::Recompute")]
    pub checkpoint: CheckpointLevel,
    #[config(default = "DeviceCapability::GENERIC")]
    pub capability: DeviceCapability,
    #[config(default = "WyMode::Erase")]
    pub wy_mode: WyMode,
    #[config(default = "TileOverrides::default()")]
    pub tiles: TileOverrides,
}

/// Fully resolved per-call options handed to the backends.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChunkOptions {
    pub scale: f64,
    pub tiles: TileConfig,
    pub checkpoint: CheckpointLevel,
    pub wy_mode: WyMode,
}

impl ChunkKernelConfig {
    /// Read and validate a kernel TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw: RawKernelConfig = load_toml(path)?;
        Ok(Self::from(&FinalKernelConfig::try_from(raw)?))
    }

    /// The process-wide config installed by `init_kernel_config`, defaults otherwise.
    pub fn global() -> Self {
        KERNEL_CFG
            .get()
            .map(|config| Self::from(config.as_ref()))
            .unwrap_or_else(Self::new)
    }

    pub fn resolve(&self, key_dim: usize, value_dim: usize) -> crate::Result<ChunkOptions> {
        let scale = match self.scale {
            Some(scale) if scale.is_finite() && scale > 0.0 => scale,
            Some(scale) => {
                return Err(KernelError::configuration(format!(
                    "scale must be positive and finite, got {scale}"
                )));
            }
            None => (key_dim as f64).sqrt().recip(),
        };

        let tiles = resolve_tiles(
            self.capability,
            key_dim,
            value_dim,
            self.chunk_size,
            &self.tiles,
        )?;
        debug!(
            "chunk tiles for K={key_dim} V={value_dim} on sm{}{}: {tiles:?}, checkpoint {:?}",
            self.capability.major, self.capability.minor, self.checkpoint
        );

        Ok(ChunkOptions {
            scale,
            tiles,
            checkpoint: self.checkpoint,
            wy_mode: self.wy_mode,
        })
    }
}

impl From<&FinalKernelConfig> for ChunkKernelConfig {
    fn from(config: &FinalKernelConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            scale: config.scale,
            output_final_state: config.output_final_state,
            checkpoint: config.checkpoint.into(),
            capability: DeviceCapability::new(config.compute_major, config.compute_minor),
            wy_mode: config.wy_mode.into(),
            tiles: config.tiles,
        }
    }
}
