//! Attention head classification
//!
//! Two independent decision trees over a head's `[seq_q, seq_k]` matrix:
//!
//! - [`classify_head`] (statistical): previous_token / positional / semantic /
//!   mixed, with a confidence and summary statistics
//! - [`classify_heads`] (pattern): previous_token / bos / uniform / other,
//!   one label per head of a layer
//!
//! They use different category sets, entropy formulas and thresholds and are
//! kept as separate entry points. Both are pure functions of their input.

use std::fmt;

use anyhow::Result;
use candle_core::{IndexOp, Tensor};
use serde::Serialize;

use crate::attention::AttentionPattern;

const PREV_TOKEN_THRESHOLD: f32 = 0.5;
const DIAGONAL_THRESHOLD: f32 = 0.5;
const SEMANTIC_ENTROPY_THRESHOLD: f32 = 1.0;
const BOS_THRESHOLD: f32 = 0.5;
const UNIFORMITY_THRESHOLD: f32 = 0.8;
const SPARSE_WEIGHT: f32 = 0.01;
const LOG_EPS: f32 = 1e-10;

// ---------------------------------------------------------------------------
// Shared scores
// ---------------------------------------------------------------------------

/// Mean of `m[i][i-1]` over query rows `i > 0`; out-of-range cells count as 0.
fn prev_token_score(matrix: &[Vec<f32>]) -> f32 {
    let seq_len = matrix.len();
    if seq_len <= 1 {
        return 0.0;
    }
    let total: f32 = (1..seq_len)
        .map(|i| matrix[i].get(i - 1).copied().unwrap_or(0.0))
        .sum();
    total / (seq_len - 1) as f32
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, n) = values.fold((0.0f32, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f32
    }
}

// ---------------------------------------------------------------------------
// Statistical classifier
// ---------------------------------------------------------------------------

/// Category assigned by [`classify_head`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadCategory {
    PreviousToken,
    Positional,
    Semantic,
    Mixed,
}

impl HeadCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreviousToken => "previous_token",
            Self::Positional => "positional",
            Self::Semantic => "semantic",
            Self::Mixed => "mixed",
        }
    }
}

impl fmt::Display for HeadCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`classify_head`].
#[derive(Debug, Clone, Serialize)]
pub struct HeadClassification {
    pub category: HeadCategory,
    pub confidence: f32,
    /// Mean row entropy, `-Σ p·ln(p + 1e-10)`
    pub entropy: f32,
    pub max_attention: f32,
    /// Fraction of weights below 0.01
    pub sparsity: f32,
}

/// Statistical classification of one `[seq_q, seq_k]` head matrix.
///
/// previous_token if the sub-diagonal mean exceeds 0.5, else positional if
/// the diagonal mean exceeds 0.5, else semantic if mean entropy is below 1.0
/// (confidence `1 - entropy`), else mixed (confidence 0.5).
pub fn classify_head(matrix: &[Vec<f32>]) -> HeadClassification {
    let prev_score = prev_token_score(matrix);
    let diag_score = mean(
        matrix
            .iter()
            .enumerate()
            .filter_map(|(i, row)| row.get(i).copied()),
    );
    let entropy = mean(
        matrix
            .iter()
            .map(|row| -row.iter().map(|&p| p * (p + LOG_EPS).ln()).sum::<f32>()),
    );
    let weights = || matrix.iter().flat_map(|row| row.iter().copied());
    let max_attention = weights().fold(f32::NEG_INFINITY, f32::max);
    let sparsity = mean(weights().map(|p| if p < SPARSE_WEIGHT { 1.0 } else { 0.0 }));

    let (category, confidence) = if prev_score > PREV_TOKEN_THRESHOLD {
        (HeadCategory::PreviousToken, prev_score)
    } else if diag_score > DIAGONAL_THRESHOLD {
        (HeadCategory::Positional, diag_score)
    } else if entropy < SEMANTIC_ENTROPY_THRESHOLD {
        (HeadCategory::Semantic, 1.0 - entropy)
    } else {
        (HeadCategory::Mixed, 0.5)
    };

    HeadClassification {
        category,
        confidence,
        entropy,
        max_attention,
        sparsity,
    }
}

/// [`classify_head`] on a 2-D tensor.
pub fn classify_head_tensor(matrix: &Tensor) -> Result<HeadClassification> {
    anyhow::ensure!(
        matrix.rank() == 2,
        "Head matrix must be [seq_q, seq_k], got {:?}",
        matrix.dims()
    );
    let rows: Vec<Vec<f32>> = matrix.to_dtype(candle_core::DType::F32)?.to_vec2()?;
    Ok(classify_head(&rows))
}

/// Statistical classification of one head within a layer.
#[derive(Debug, Clone, Serialize)]
pub struct HeadAnalysis {
    pub layer: usize,
    pub head: usize,
    #[serde(flatten)]
    pub classification: HeadClassification,
}

/// Apply [`classify_head`] to every head of a layer (batch 0).
pub fn classify_layer_heads(pattern: &AttentionPattern) -> Result<Vec<HeadAnalysis>> {
    (0..pattern.num_heads())
        .map(|head| {
            let matrix = pattern.head_matrix(head, 0)?;
            Ok(HeadAnalysis {
                layer: pattern.layer(),
                head,
                classification: classify_head(&matrix),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Pattern classifier
// ---------------------------------------------------------------------------

/// Label assigned by [`classify_heads`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadType {
    PreviousToken,
    Bos,
    Uniform,
    Other,
}

impl HeadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreviousToken => "previous_token",
            Self::Bos => "bos",
            Self::Uniform => "uniform",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for HeadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pattern classification of every head of a layer (batch 0).
///
/// previous_token if the sub-diagonal mean exceeds 0.5, else bos if mean
/// attention to key 0 exceeds 0.5, else uniform if entropy normalized by
/// `ln(seq_len)` exceeds 0.8, else other.
pub fn classify_heads(pattern: &AttentionPattern) -> Result<Vec<HeadType>> {
    let entropy = pattern.entropy()?;
    (0..pattern.num_heads())
        .map(|head| {
            let matrix = pattern.head_matrix(head, 0)?;
            let seq_len = matrix.len();

            let prev_score = prev_token_score(&matrix);
            let bos_score = mean(matrix.iter().map(|row| row.first().copied().unwrap_or(0.0)));

            let head_entropy: f32 = entropy.i((0, head))?.mean_all()?.to_scalar()?;
            let max_entropy = (seq_len as f32).ln();
            let uniformity = if max_entropy > 0.0 {
                head_entropy / max_entropy
            } else {
                0.0
            };

            Ok(if prev_score > PREV_TOKEN_THRESHOLD {
                HeadType::PreviousToken
            } else if bos_score > BOS_THRESHOLD {
                HeadType::Bos
            } else if uniformity > UNIFORMITY_THRESHOLD {
                HeadType::Uniform
            } else {
                HeadType::Other
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn previous_token_matrix(seq: usize) -> Vec<Vec<f32>> {
        (0..seq)
            .map(|i| {
                let mut row = vec![0.0; seq];
                row[i.saturating_sub(1)] = 1.0;
                row
            })
            .collect()
    }

    fn layer(matrices: &[Vec<Vec<f32>>]) -> AttentionPattern {
        let heads = matrices.len();
        let seq = matrices[0].len();
        let data: Vec<f32> = matrices.iter().flatten().flatten().copied().collect();
        let t = Tensor::from_vec(data, (1, heads, seq, seq), &Device::Cpu).unwrap();
        AttentionPattern::new(0, t).unwrap()
    }

    fn uniform_causal_matrix(seq: usize) -> Vec<Vec<f32>> {
        (0..seq)
            .map(|i| {
                (0..seq)
                    .map(|j| if j <= i { 1.0 / (i + 1) as f32 } else { 0.0 })
                    .collect()
            })
            .collect()
    }

    fn full_uniform_matrix(seq: usize) -> Vec<Vec<f32>> {
        vec![vec![1.0 / seq as f32; seq]; seq]
    }

    #[test]
    fn test_previous_token_both_policies() {
        let m = previous_token_matrix(8);
        let c = classify_head(&m);
        assert_eq!(c.category, HeadCategory::PreviousToken);
        assert!((c.confidence - 1.0).abs() < 1e-6);
        assert!(c.entropy < 0.1);

        let p = layer(&[m.clone(), m]);
        assert_eq!(classify_heads(&p).unwrap(), vec![HeadType::PreviousToken; 2]);
        for h in 0..2 {
            assert!(p.mean_entropy(h).unwrap() < 0.1);
        }
    }

    #[test]
    fn test_positional_and_semantic() {
        let identity: Vec<Vec<f32>> = (0..5)
            .map(|i| (0..5).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        assert_eq!(classify_head(&identity).category, HeadCategory::Positional);

        // all mass on key 2: low entropy, weak diagonal
        let focused: Vec<Vec<f32>> = (0..5)
            .map(|_| (0..5).map(|j| if j == 2 { 1.0 } else { 0.0 }).collect())
            .collect();
        let c = classify_head(&focused);
        assert_eq!(c.category, HeadCategory::Semantic);
        assert!(c.confidence > 0.99);
        assert!((c.sparsity - 0.8).abs() < 1e-6);
        assert_eq!(c.max_attention, 1.0);
    }

    #[test]
    fn test_mixed() {
        let c = classify_head(&full_uniform_matrix(10));
        assert_eq!(c.category, HeadCategory::Mixed);
        assert_eq!(c.confidence, 0.5);
    }

    #[test]
    fn test_bos_and_uniform() {
        let bos: Vec<Vec<f32>> = (0..6)
            .map(|_| {
                let mut row = vec![0.0; 6];
                row[0] = 1.0;
                row
            })
            .collect();
        let p = layer(&[bos, full_uniform_matrix(6), uniform_causal_matrix(6)]);
        let types = classify_heads(&p).unwrap();
        assert_eq!(types[0], HeadType::Bos);
        assert_eq!(types[1], HeadType::Uniform);
        assert_eq!(types[2], HeadType::Other);
    }

    #[test]
    fn test_single_position() {
        let c = classify_head(&[vec![1.0]]);
        assert_eq!(c.category, HeadCategory::Positional);
        let p = layer(&[vec![vec![1.0]]]);
        // bos score 1.0 wins before uniformity is consulted
        assert_eq!(classify_heads(&p).unwrap(), vec![HeadType::Bos]);
    }

    #[test]
    fn test_nan_heads_fall_through() {
        let nan = vec![vec![f32::NAN; 4]; 4];
        assert_eq!(classify_head(&nan).category, HeadCategory::Mixed);
        let p = layer(&[nan]);
        assert_eq!(classify_heads(&p).unwrap(), vec![HeadType::Other]);
    }

    #[test]
    fn test_layer_analysis() {
        let p = layer(&[previous_token_matrix(4), full_uniform_matrix(4)]);
        let analysis = classify_layer_heads(&p).unwrap();
        assert_eq!(analysis.len(), 2);
        assert_eq!(analysis[1].head, 1);
        assert_eq!(analysis[1].classification.category, HeadCategory::Mixed);
        let json = serde_json::to_value(&analysis[0]).unwrap();
        assert_eq!(json["category"], "previous_token");
    }

    #[test]
    fn test_tensor_entry_point_checks_rank() {
        let t = Tensor::zeros((1, 3, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(classify_head_tensor(&t).is_err());
    }
}
