//! The four chunk passes shared by every variant.
//!
//! State passes walk the chunk axis sequentially and carry one accumulator per value
//! tile; output and gradient passes only read the stored snapshots, so every chunk is
//! independent there.

pub mod gradient;
pub mod output;
pub mod state_backward;
pub mod state_forward;

pub use gradient::{InputGrads, chunk_bwd_dqkv, chunk_delta_bwd_dqkw, chunk_local_value_grad};
pub use output::chunk_fwd_o;
pub use state_backward::{DeltaStateGrads, StateGrads, chunk_bwd_dh, chunk_delta_bwd_dhu};
pub use state_forward::{chunk_delta_fwd_h, chunk_fwd_h};
