use burn::{
    prelude::Backend,
    tensor::{DType, Tensor},
};

use crate::{KernelError, Result};

/// Dimensions shared by every tensor of one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProblemShape {
    pub batch_size: usize,
    pub num_heads: usize,
    pub seq_len: usize,
    pub key_dim: usize,
    pub value_dim: usize,
}

impl ProblemShape {
    pub fn state_dims(&self) -> [usize; 4] {
        [self.batch_size, self.num_heads, self.key_dim, self.value_dim]
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [self.batch_size, self.num_heads, self.seq_len, self.value_dim]
    }

    pub fn beta_dims(&self) -> [usize; 3] {
        [self.batch_size, self.num_heads, self.seq_len]
    }
}

/// The working precision may be narrow (f16/bf16/f32) but never the widest float type,
/// which is reserved for the accumulators.
pub fn check_precision(dtype: DType, name: &str) -> Result<()> {
    match dtype {
        DType::F64 => Err(KernelError::precision(format!(
            "{name} is f64; the working precision must be narrower than the accumulator"
        ))),
        DType::F32 | DType::F16 | DType::BF16 | DType::Flex32 => Ok(()),
        other => Err(KernelError::precision(format!(
            "{name} has non-float dtype {other:?}"
        ))),
    }
}

pub fn check_inputs<B: Backend>(
    query: &Tensor<B, 4>,
    key: &Tensor<B, 4>,
    value: &Tensor<B, 4>,
) -> Result<ProblemShape> {
    let [batch_size, num_heads, seq_len, key_dim] = query.dims();
    let [value_batch, value_heads, value_len, value_dim] = value.dims();

    if key.dims() != query.dims() {
        return Err(KernelError::shape(format!(
            "key {:?} must match query {:?}",
            key.dims(),
            query.dims()
        )));
    }
    if [value_batch, value_heads, value_len] != [batch_size, num_heads, seq_len] {
        return Err(KernelError::shape(format!(
            "value {:?} disagrees with query {:?} on batch, heads or time",
            value.dims(),
            query.dims()
        )));
    }
    if seq_len == 0 || key_dim == 0 || value_dim == 0 {
        return Err(KernelError::shape(format!(
            "empty input: T={seq_len} K={key_dim} V={value_dim}"
        )));
    }

    check_precision(query.dtype(), "query")?;
    check_dtype(key.dtype(), query.dtype(), "key")?;
    check_dtype(value.dtype(), query.dtype(), "value")?;

    Ok(ProblemShape {
        batch_size,
        num_heads,
        seq_len,
        key_dim,
        value_dim,
    })
}

pub fn check_dims<const D: usize>(
    actual: [usize; D],
    expected: [usize; D],
    name: &str,
) -> Result<()> {
    if actual != expected {
        return Err(KernelError::shape(format!(
            "{name} has shape {actual:?}, expected {expected:?}"
        )));
    }
    Ok(())
}

/// Every per-position tensor shares the query's working precision.
pub fn check_dtype(dtype: DType, query_dtype: DType, name: &str) -> Result<()> {
    if dtype != query_dtype {
        return Err(KernelError::shape(format!(
            "{name} dtype {dtype:?} differs from query dtype {query_dtype:?}"
        )));
    }
    Ok(())
}

/// States are widened to f32 inside the kernels, so any narrow float is accepted here.
pub fn check_state<B: Backend>(
    state: &Tensor<B, 4>,
    shape: &ProblemShape,
    name: &str,
) -> Result<()> {
    check_dims(state.dims(), shape.state_dims(), name)?;
    check_precision(state.dtype(), name)
}
