//! Chunkwise-parallel linear attention for burn.
//!
//! Two recurrences share one four-pass chunk pipeline: retention (per-head geometric
//! decay) and the delta rule (state correction through a WY representation).
//! See [`kernels::chunk_retention`] and [`kernels::chunk_delta_rule`] for the entry points.

pub mod error;
pub mod kernels;

pub use error::{KernelError, Result};
