use std::ops::Range;

use burn::{prelude::Backend, tensor::Tensor};

/// A contiguous run of time steps processed as one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: usize,
    pub start: usize,
    pub len: usize,
}

impl ChunkSpan {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }
}

pub fn num_chunks(seq_len: usize, chunk_size: usize) -> usize {
    seq_len.div_ceil(chunk_size)
}

/// Cut `0..seq_len` into chunks of `chunk_size`; only the last one may be shorter.
pub fn chunk_spans(seq_len: usize, chunk_size: usize) -> Vec<ChunkSpan> {
    (0..num_chunks(seq_len, chunk_size))
        .map(|index| {
            let start = index * chunk_size;
            ChunkSpan {
                index,
                start,
                len: chunk_size.min(seq_len - start),
            }
        })
        .collect()
}

/// Sub-tiles of one chunk. `start` stays absolute on the time axis.
pub fn sub_spans(span: ChunkSpan, sub_chunk_size: usize) -> Vec<ChunkSpan> {
    chunk_spans(span.len, sub_chunk_size)
        .into_iter()
        .map(|sub| ChunkSpan {
            index: sub.index,
            start: span.start + sub.start,
            len: sub.len,
        })
        .collect()
}

pub fn tile_ranges(dim: usize, block: usize) -> Vec<Range<usize>> {
    (0..dim.div_ceil(block))
        .map(|tile| tile * block..dim.min((tile + 1) * block))
        .collect()
}

pub fn time_slice<B: Backend>(tensor: &Tensor<B, 4>, time: Range<usize>) -> Tensor<B, 4> {
    let [batch_size, num_heads, _, dim] = tensor.dims();
    tensor
        .clone()
        .slice([0..batch_size, 0..num_heads, time, 0..dim])
}

pub fn feature_slice<B: Backend>(tensor: &Tensor<B, 4>, feature: Range<usize>) -> Tensor<B, 4> {
    let [batch_size, num_heads, rows, _] = tensor.dims();
    tensor
        .clone()
        .slice([0..batch_size, 0..num_heads, 0..rows, feature])
}

pub fn block_slice<B: Backend>(
    tensor: &Tensor<B, 4>,
    rows: Range<usize>,
    cols: Range<usize>,
) -> Tensor<B, 4> {
    let [batch_size, num_heads, _, _] = tensor.dims();
    tensor
        .clone()
        .slice([0..batch_size, 0..num_heads, rows, cols])
}

/// Read one `(key tile, value tile)` block of snapshot `index` out of `(B, H, NT, K, V)`.
pub fn snapshot_block<B: Backend>(
    states: &Tensor<B, 5>,
    index: usize,
    key: Range<usize>,
    value: Range<usize>,
) -> Tensor<B, 4> {
    let [batch_size, num_heads, _, _, _] = states.dims();
    let shape = [batch_size, num_heads, key.len(), value.len()];
    states
        .clone()
        .slice([0..batch_size, 0..num_heads, index..index + 1, key, value])
        .reshape(shape)
}

/// Stack per-chunk states `(B, H, K, V)` into `(B, H, NT, K, V)`.
pub fn stack_snapshots<B: Backend>(snapshots: Vec<Tensor<B, 4>>) -> Tensor<B, 5> {
    Tensor::stack::<5>(snapshots, 2)
}
