use serde::Deserialize;

use crate::{CheckpointOptions, WyModeOptions};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawKernelConfig {
    pub chunk_size: Option<usize>,
    pub scale: Option<f64>,
    pub output_final_state: Option<bool>,
    pub checkpoint: Option<CheckpointOptions>,
    pub wy_mode: Option<WyModeOptions>,

    pub compute_major: Option<u32>,
    pub compute_minor: Option<u32>,

    pub tiles: Option<RawTileOverrides>,
}

/// Explicit tile sizes; anything left out falls back to the device heuristics.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawTileOverrides {
    pub state_block_k: Option<usize>,
    pub state_block_v: Option<usize>,
    pub sub_chunk_size: Option<usize>,
    pub block_k: Option<usize>,
    pub block_v: Option<usize>,
}

impl RawKernelConfig {
    pub fn fill_default(&mut self) {
        if self.chunk_size.is_none() {
            self.chunk_size = Some(64);
        }

        if self.output_final_state.is_none() {
            self.output_final_state = Some(false);
        }

        if self.checkpoint.is_none() {
            self.checkpoint = Some(CheckpointOptions::default());
        }

        if self.wy_mode.is_none() {
            self.wy_mode = Some(WyModeOptions::default());
        }

        if self.compute_major.is_none() {
            self.compute_major = Some(0);
        }

        if self.compute_minor.is_none() {
            self.compute_minor = Some(0);
        }
    }
}
