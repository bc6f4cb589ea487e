use burn::{
    prelude::Backend,
    tensor::{Tensor, TensorData},
};

use crate::kernels::chunk_common::layout::ChunkSpan;

/// Per-head geometric decay `gamma_h = 1 - 2^(-5 - h)`, kept in log2 form.
#[derive(Clone, Debug, PartialEq)]
pub struct HeadDecay {
    log2_rates: Vec<f64>,
}

impl HeadDecay {
    pub fn retention(num_heads: usize) -> Self {
        let log2_rates = (0..num_heads)
            .map(|head| (1.0 - (-5.0 - head as f64).exp2()).log2())
            .collect();
        Self { log2_rates }
    }

    pub fn num_heads(&self) -> usize {
        self.log2_rates.len()
    }

    pub fn rate(&self, head: usize) -> f64 {
        self.log2_rates[head].exp2()
    }

    /// `gamma_h^exponent` for every head.
    fn powers(&self, exponent: f64) -> impl Iterator<Item = f64> + '_ {
        self.log2_rates
            .iter()
            .map(move |log2_rate| (exponent * log2_rate).exp2())
    }

    /// `(1, H, 1, 1)` tensor of `gamma_h`, broadcastable against states.
    pub fn rates<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let data: Vec<f32> = self.powers(1.0).map(|value| value as f32).collect();
        Tensor::from_data(TensorData::new(data, [1, self.num_heads(), 1, 1]), device)
    }
}

/// Position weights for one chunk length: the causal (decayed) score mask plus the
/// optional query, key and whole-chunk decay factors.
#[derive(Clone, Debug)]
pub struct ChunkWeights<B: Backend> {
    /// `(1, H|1, L, L)`, entry `[t, j]` is `gamma^(t - j)` for `j <= t`, zero otherwise.
    pub causal: Tensor<B, 4>,
    /// `(1, H, L, 1)` with `gamma^(t + 1)`.
    pub query: Option<Tensor<B, 4>>,
    /// `(1, H, L, 1)` with `gamma^(L - 1 - j)`.
    pub key: Option<Tensor<B, 4>>,
    /// `(1, H, 1, 1)` with `gamma^L`.
    pub chunk: Option<Tensor<B, 4>>,
}

impl<B: Backend> ChunkWeights<B> {
    pub fn new(decay: Option<&HeadDecay>, len: usize, device: &B::Device) -> Self {
        match decay {
            Some(decay) => Self::decayed(decay, len, device),
            None => Self::causal_only(len, device),
        }
    }

    fn causal_only(len: usize, device: &B::Device) -> Self {
        let data: Vec<f32> = (0..len)
            .flat_map(|t| (0..len).map(move |j| if j <= t { 1.0 } else { 0.0 }))
            .collect();

        Self {
            causal: Tensor::from_data(TensorData::new(data, [1, 1, len, len]), device),
            query: None,
            key: None,
            chunk: None,
        }
    }

    fn decayed(decay: &HeadDecay, len: usize, device: &B::Device) -> Self {
        let num_heads = decay.num_heads();
        let mut causal = Vec::with_capacity(num_heads * len * len);
        let mut query = Vec::with_capacity(num_heads * len);
        let mut key = Vec::with_capacity(num_heads * len);
        let mut chunk = Vec::with_capacity(num_heads);

        for log2_rate in &decay.log2_rates {
            let power = |exponent: usize| (exponent as f64 * log2_rate).exp2() as f32;
            for t in 0..len {
                causal.extend((0..len).map(|j| if j <= t { power(t - j) } else { 0.0 }));
                query.push(power(t + 1));
                key.push(power(len - 1 - t));
            }
            chunk.push(power(len));
        }

        Self {
            causal: Tensor::from_data(TensorData::new(causal, [1, num_heads, len, len]), device),
            query: Some(Tensor::from_data(
                TensorData::new(query, [1, num_heads, len, 1]),
                device,
            )),
            key: Some(Tensor::from_data(
                TensorData::new(key, [1, num_heads, len, 1]),
                device,
            )),
            chunk: Some(Tensor::from_data(
                TensorData::new(chunk, [1, num_heads, 1, 1]),
                device,
            )),
        }
    }

    pub fn scale_query(&self, tensor: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.query {
            Some(weight) => tensor * weight.clone(),
            None => tensor,
        }
    }

    pub fn scale_key(&self, tensor: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.key {
            Some(weight) => tensor * weight.clone(),
            None => tensor,
        }
    }

    pub fn scale_chunk(&self, state: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.chunk {
            Some(weight) => state * weight.clone(),
            None => state,
        }
    }
}

/// Weights for a full chunk and, if the sequence does not divide evenly, the tail chunk.
#[derive(Clone, Debug)]
pub struct ChunkWeightCache<B: Backend> {
    chunk_size: usize,
    full: ChunkWeights<B>,
    tail: Option<ChunkWeights<B>>,
}

impl<B: Backend> ChunkWeightCache<B> {
    pub fn new(
        decay: Option<&HeadDecay>,
        seq_len: usize,
        chunk_size: usize,
        device: &B::Device,
    ) -> Self {
        let full_len = chunk_size.min(seq_len);
        let tail_len = seq_len % chunk_size;

        Self {
            chunk_size: full_len,
            full: ChunkWeights::new(decay, full_len, device),
            tail: (seq_len > chunk_size && tail_len != 0)
                .then(|| ChunkWeights::new(decay, tail_len, device)),
        }
    }

    pub fn get(&self, span: &ChunkSpan) -> &ChunkWeights<B> {
        match &self.tail {
            Some(tail) if span.len != self.chunk_size => tail,
            _ => &self.full,
        }
    }
}
