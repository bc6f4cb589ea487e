//! Profiling hooks for the chunk kernels.
//!
//! Scopes are only recorded when the `tracy` feature is enabled; otherwise every
//! `tracy_scope!` expands to nothing.

#[cfg(feature = "tracy")]
#[doc(hidden)]
pub use tracy_client as __tracy_client;

/// Emit a Tracy span scoped to the current block/function.
#[cfg(feature = "tracy")]
#[macro_export]
macro_rules! tracy_scope {
    ($name:literal) => {
        let _linattn_tracy_span_guard = $crate::__tracy_client::span!($name);
    };
}

#[cfg(not(feature = "tracy"))]
#[macro_export]
macro_rules! tracy_scope {
    ($name:literal) => {};
}

/// Record a numeric sample on a Tracy plot, e.g. the chunk count of a pass.
#[cfg(feature = "tracy")]
#[macro_export]
macro_rules! tracy_plot {
    ($name:literal, $value:expr) => {
        $crate::__tracy_client::plot!($name, ($value) as f64);
    };
}

#[cfg(not(feature = "tracy"))]
#[macro_export]
macro_rules! tracy_plot {
    ($name:literal, $value:expr) => {
        let _ = $value;
    };
}
