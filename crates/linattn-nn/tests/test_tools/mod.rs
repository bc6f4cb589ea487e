#![allow(dead_code)]

use burn::{
    backend::{Autodiff, NdArray},
    prelude::Backend,
    tensor::{Distribution, Tensor, TensorData, cast::ToElement},
};
use itertools::izip;
use linattn_nn::kernels::chunk_common::WyMode;

pub type TestBackend = NdArray<f32>;
pub type TestAutodiffBackend = Autodiff<TestBackend>;

pub const MIN_PASS_RATE: f64 = 1.0;
pub const RELATIVE_ERROR: f64 = 1e-3;
pub const ABSOLUTE_ERROR: f64 = 1e-4;

pub fn get_test_device<B: Backend>() -> B::Device {
    let device = B::Device::default();
    B::seed(&device, 42);
    device
}

pub fn assert_closeness<B: Backend, const D: usize>(
    actual: &Tensor<B, D>,
    expected: &Tensor<B, D>,
    name: &str,
    min_pass_rate: f64,
    max_relative_error: f64,
) {
    assert_eq!(
        actual.dims(),
        expected.dims(),
        "shape mismatch for '{name}': actual {:?}, expected {:?}",
        actual.dims(),
        expected.dims()
    );

    let pass_rate = get_pass_rate(actual, expected, max_relative_error);
    assert!(
        pass_rate >= min_pass_rate,
        "'{name}' precision check failed: {:.2}% within {:.2}% relative error, required {:.2}%",
        pass_rate * 100.0,
        max_relative_error * 100.0,
        min_pass_rate * 100.0
    );
}

pub fn assert_closeness_multi<B: Backend, const D: usize>(
    actual_vec: Vec<Tensor<B, D>>,
    expected_vec: Vec<Tensor<B, D>>,
    names: &[&str],
    min_pass_rate: f64,
    max_relative_error: f64,
) {
    let failures: Vec<String> = izip!(actual_vec, expected_vec, names)
        .filter_map(|(actual, expected, name)| {
            assert_eq!(actual.dims(), expected.dims(), "shape mismatch for '{name}'");
            let pass_rate = get_pass_rate(&actual, &expected, max_relative_error);
            (pass_rate < min_pass_rate).then(|| format!("{name}: {:.2}%", pass_rate * 100.0))
        })
        .collect();

    assert!(failures.is_empty(), "precision check failed for {failures:?}");
}

fn get_pass_rate<B: Backend, const D: usize>(
    actual: &Tensor<B, D>,
    expected: &Tensor<B, D>,
    max_relative_error: f64,
) -> f64 {
    let absolute_error = actual.clone().sub(expected.clone()).abs();
    let tolerance = expected.clone().abs() * max_relative_error + ABSOLUTE_ERROR;
    let pass_count = absolute_error
        .lower_equal(tolerance)
        .float()
        .sum()
        .into_scalar()
        .to_f64();
    pass_count / actual.shape().num_elements() as f64
}

#[derive(Clone, Copy, Debug)]
pub struct Problem {
    pub batch_size: usize,
    pub num_heads: usize,
    pub seq_len: usize,
    pub key_dim: usize,
    pub value_dim: usize,
}

impl Problem {
    pub const fn new(
        batch_size: usize,
        num_heads: usize,
        seq_len: usize,
        key_dim: usize,
        value_dim: usize,
    ) -> Self {
        Self {
            batch_size,
            num_heads,
            seq_len,
            key_dim,
            value_dim,
        }
    }

    pub fn key_dims(&self) -> [usize; 4] {
        [self.batch_size, self.num_heads, self.seq_len, self.key_dim]
    }

    pub fn value_dims(&self) -> [usize; 4] {
        [self.batch_size, self.num_heads, self.seq_len, self.value_dim]
    }

    pub fn state_dims(&self) -> [usize; 4] {
        [self.batch_size, self.num_heads, self.key_dim, self.value_dim]
    }

    pub fn beta_dims(&self) -> [usize; 3] {
        [self.batch_size, self.num_heads, self.seq_len]
    }
}

#[derive(Clone, Debug)]
pub struct Inputs<B: Backend> {
    pub query: Tensor<B, 4>,
    pub key: Tensor<B, 4>,
    pub value: Tensor<B, 4>,
    pub beta: Tensor<B, 3>,
    pub initial_state: Tensor<B, 4>,
}

/// Keys are L2-normalized and `beta` sits in `(0, 1)`, the regime the delta rule is
/// stable in.
pub fn random_inputs<B: Backend>(problem: Problem, device: &B::Device) -> Inputs<B> {
    let normal = Distribution::Normal(0.0, 1.0);
    let key = Tensor::<B, 4>::random(problem.key_dims(), normal, device);
    let norm = key.clone().powi_scalar(2).sum_dim(3).sqrt();

    Inputs {
        query: Tensor::random(problem.key_dims(), normal, device),
        key: key / norm,
        value: Tensor::random(problem.value_dims(), normal, device),
        beta: Tensor::random(problem.beta_dims(), Distribution::Uniform(0.05, 0.95), device),
        initial_state: Tensor::random(problem.state_dims(), Distribution::Normal(0.0, 0.5), device),
    }
}

impl Inputs<TestBackend> {
    /// Autodiff leaves holding the same values.
    pub fn tracked(&self) -> Inputs<TestAutodiffBackend> {
        Inputs {
            query: Tensor::from_inner(self.query.clone()).require_grad(),
            key: Tensor::from_inner(self.key.clone()).require_grad(),
            value: Tensor::from_inner(self.value.clone()).require_grad(),
            beta: Tensor::from_inner(self.beta.clone()).require_grad(),
            initial_state: Tensor::from_inner(self.initial_state.clone()).require_grad(),
        }
    }
}

/// `(1, H, 1, 1)` retention decay `1 - 2^(-5 - h)`.
pub fn retention_decay<B: Backend>(num_heads: usize, device: &B::Device) -> Tensor<B, 4> {
    let rates: Vec<f32> = (0..num_heads)
        .map(|head| (1.0 - 2f64.powi(-5 - head as i32)) as f32)
        .collect();
    Tensor::from_data(TensorData::new(rates, [1, num_heads, 1, 1]), device)
}

fn position<B: Backend>(tensor: &Tensor<B, 4>, t: usize) -> Tensor<B, 4> {
    let [batch_size, num_heads, _, dim] = tensor.dims();
    tensor
        .clone()
        .slice([0..batch_size, 0..num_heads, t..t + 1, 0..dim])
}

/// Token-by-token retention written straight from the recurrence.
pub fn naive_retention<B: Backend>(
    query: &Tensor<B, 4>,
    key: &Tensor<B, 4>,
    value: &Tensor<B, 4>,
    initial_state: Tensor<B, 4>,
    scale: f64,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [_, num_heads, seq_len, _] = query.dims();
    let decay = retention_decay::<B>(num_heads, &query.device());

    let mut state = initial_state;
    let mut outputs = Vec::with_capacity(seq_len);
    for t in 0..seq_len {
        state = state * decay.clone() + position(key, t).transpose().matmul(position(value, t));
        outputs.push(position(query, t).matmul(state.clone()).mul_scalar(scale));
    }
    (Tensor::cat(outputs, 2), state)
}

/// Token-by-token delta rule in either write mode.
pub fn naive_delta_rule<B: Backend>(
    inputs: &Inputs<B>,
    initial_state: Tensor<B, 4>,
    scale: f64,
    mode: WyMode,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [batch_size, num_heads, seq_len, _] = inputs.query.dims();

    let mut state = initial_state;
    let mut outputs = Vec::with_capacity(seq_len);
    for t in 0..seq_len {
        let key_t = position(&inputs.key, t);
        let value_t = position(&inputs.value, t);
        let beta_t = inputs
            .beta
            .clone()
            .slice([0..batch_size, 0..num_heads, t..t + 1])
            .reshape([batch_size, num_heads, 1, 1]);
        let predicted = key_t.clone().matmul(state.clone());

        let write = match mode {
            WyMode::Erase => value_t - predicted * beta_t,
            WyMode::Gated => (value_t - predicted) * beta_t,
        };
        state = state + key_t.transpose().matmul(write);
        outputs.push(position(&inputs.query, t).matmul(state.clone()).mul_scalar(scale));
    }
    (Tensor::cat(outputs, 2), state)
}

/// Same tensor with `delta` added at flat position `index`.
pub fn perturbed<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    index: usize,
    delta: f32,
) -> Tensor<B, D> {
    let dims = tensor.dims();
    let mut values = tensor.to_data().to_vec::<f32>().unwrap();
    values[index] += delta;
    Tensor::from_data(TensorData::new(values, dims), &tensor.device())
}

pub fn value_at<B: Backend, const D: usize>(tensor: &Tensor<B, D>, index: usize) -> f64 {
    tensor.to_data().to_vec::<f32>().unwrap()[index] as f64
}

pub fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().to_f64()
}
