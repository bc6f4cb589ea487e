pub mod chunk_common;
pub mod chunk_delta_rule;
pub mod chunk_engine;
pub mod chunk_retention;
pub mod fused_recurrent_retention;
pub mod wy_repr;
