//! Attention pattern analysis
//!
//! [`AttentionPattern`] is a read-only view over one layer's
//! `[batch, heads, seq_q, seq_k]` attention weights. Rows are expected to be
//! softmax outputs but this is not enforced; malformed rows only produce
//! degenerate statistics.

use std::cmp::Ordering;

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor, D};

/// Lower clip bound applied before taking logs in entropy.
pub const ENTROPY_EPS: f32 = 1e-10;

/// One layer's attention weights.
#[derive(Debug, Clone)]
pub struct AttentionPattern {
    layer: usize,
    /// [batch, heads, seq_q, seq_k], F32
    pattern: Tensor,
}

impl AttentionPattern {
    /// Wrap a 4-D attention tensor. Any other rank is rejected.
    pub fn new(layer: usize, pattern: Tensor) -> Result<Self> {
        anyhow::ensure!(
            pattern.rank() == 4,
            "Attention pattern for layer {layer} must be [batch, heads, seq_q, seq_k], got {:?}",
            pattern.dims()
        );
        Ok(Self {
            layer,
            pattern: pattern.to_dtype(DType::F32)?,
        })
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn tensor(&self) -> &Tensor {
        &self.pattern
    }

    pub fn batch_size(&self) -> usize {
        self.pattern.dims()[0]
    }

    pub fn num_heads(&self) -> usize {
        self.pattern.dims()[1]
    }

    /// Key-axis length.
    pub fn seq_len(&self) -> usize {
        self.pattern.dims()[3]
    }

    /// One head's `[seq_q, seq_k]` matrix.
    pub fn head(&self, idx: usize, batch: usize) -> Result<Tensor> {
        anyhow::ensure!(
            idx < self.num_heads(),
            "Head {idx} out of range (layer {} has {} heads)",
            self.layer,
            self.num_heads()
        );
        anyhow::ensure!(
            batch < self.batch_size(),
            "Batch {batch} out of range (batch size {})",
            self.batch_size()
        );
        Ok(self.pattern.i((batch, idx))?)
    }

    /// One head's matrix as nested rows.
    pub fn head_matrix(&self, idx: usize, batch: usize) -> Result<Vec<Vec<f32>>> {
        Ok(self.head(idx, batch)?.to_vec2()?)
    }

    /// `-Σ_k p·ln(clip(p, 1e-10, 1))` per (batch, head, query): shape `[batch, heads, seq_q]`.
    pub fn entropy(&self) -> Result<Tensor> {
        let log_p = self.pattern.clamp(ENTROPY_EPS, 1.0f32)?.log()?;
        Ok((&self.pattern * log_p)?.sum(D::Minus1)?.neg()?)
    }

    /// Entropy of one head averaged over batch and query positions.
    pub fn mean_entropy(&self, head: usize) -> Result<f32> {
        anyhow::ensure!(
            head < self.num_heads(),
            "Head {head} out of range (layer {} has {} heads)",
            self.layer,
            self.num_heads()
        );
        let per_head = self.entropy()?.i((.., head))?;
        Ok(per_head.mean_all()?.to_scalar::<f32>()?)
    }

    /// Indices of the `k` largest key weights for every query row:
    /// U32 tensor of shape `[batch, heads, seq_q, min(k, seq_k)]`.
    pub fn top_attended(&self, k: usize) -> Result<Tensor> {
        let (b, h, q, s) = self.pattern.dims4()?;
        let k = k.min(s);
        let data: Vec<f32> = self.pattern.flatten_all()?.to_vec1()?;
        let mut out: Vec<u32> = Vec::with_capacity(b * h * q * k);
        for row in data.chunks_exact(s.max(1)).take(b * h * q) {
            let mut indexed: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
            indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
            out.extend(indexed.iter().take(k).map(|(i, _)| *i as u32));
        }
        Ok(Tensor::from_vec(out, (b, h, q, k), self.pattern.device())?)
    }

    /// Top-k `(key position, weight)` pairs for one head's query row.
    pub fn top_attended_positions(
        &self,
        head: usize,
        query: usize,
        k: usize,
        batch: usize,
    ) -> Result<Vec<(usize, f32)>> {
        let row: Vec<f32> = self.head(head, batch)?.i(query)?.to_vec1()?;
        let mut indexed: Vec<(usize, f32)> = row.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        Ok(indexed.into_iter().take(k).collect())
    }

    /// Attention from `query` to every key, averaged across heads.
    pub fn from_position(&self, query: usize, batch: usize) -> Result<Vec<f32>> {
        Ok(self.pattern.i((batch, .., query, ..))?.mean(0)?.to_vec1()?)
    }

    /// Attention received by `key` from every query, averaged across heads.
    pub fn to_position(&self, key: usize, batch: usize) -> Result<Vec<f32>> {
        Ok(self.pattern.i((batch, .., .., key))?.mean(0)?.to_vec1()?)
    }
}

/// Average `[seq_q, seq_k]` flow across layers (each layer averaged over batch and heads).
pub fn attention_flow(patterns: &[AttentionPattern]) -> Result<Tensor> {
    let first = patterns
        .first()
        .ok_or_else(|| anyhow::anyhow!("attention_flow needs at least one pattern"))?;
    let (_, _, q, s) = first.pattern.dims4()?;

    let mut acc = Tensor::zeros((q, s), DType::F32, first.pattern.device())?;
    for p in patterns {
        let (_, _, pq, ps) = p.pattern.dims4()?;
        anyhow::ensure!(
            (pq, ps) == (q, s),
            "Layer {} pattern is {pq}x{ps}, expected {q}x{s}",
            p.layer
        );
        acc = (acc + p.pattern.mean(0)?.mean(0)?)?;
    }
    Ok((acc / patterns.len() as f64)?)
}
