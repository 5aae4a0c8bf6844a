//! Capture sizing
//!
//! Estimates the footprint of capturing every component of every layer and
//! picks how to capture before a forward pass starts.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::info;

/// Components captured per layer (residual, attn_out, mlp_out).
const COMPONENTS_PER_LAYER: u64 = 3;
const BYTES_PER_F32: u64 = 4;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Batch size assumed by [`MemoryEstimator::suggest_strategy`].
pub const DEFAULT_BATCH: usize = 1;
/// Sequence length assumed by [`MemoryEstimator::suggest_strategy`].
pub const DEFAULT_SEQ_LEN: usize = 1024;

/// How a trace should be captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStrategy {
    /// Everything fits in memory
    InMemory,
    /// Capture only these layers
    SelectiveLayers(Vec<usize>),
    /// Write through to disk
    Streaming,
}

impl CaptureStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InMemory => "in_memory",
            Self::SelectiveLayers(_) => "selective",
            Self::Streaming => "streaming",
        }
    }
}

impl fmt::Display for CaptureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelectiveLayers(layers) => write!(f, "selective {layers:?}"),
            other => f.write_str(other.as_str()),
        }
    }
}

pub struct MemoryEstimator;

impl MemoryEstimator {
    /// Bytes needed to hold all three components of every layer as f32.
    pub fn estimate_full_capture(
        num_layers: usize,
        hidden_size: usize,
        batch_size: usize,
        seq_len: usize,
    ) -> u64 {
        [num_layers, batch_size, seq_len, hidden_size]
            .into_iter()
            .fold(COMPONENTS_PER_LAYER * BYTES_PER_F32, |acc, n| {
                acc.saturating_mul(n as u64)
            })
    }

    /// In memory below the limit, selective below four times the limit,
    /// streaming otherwise (batch 1, 1024 tokens).
    pub fn suggest_strategy(
        num_layers: usize,
        hidden_size: usize,
        memory_limit_gb: f64,
    ) -> CaptureStrategy {
        let estimate =
            Self::estimate_full_capture(num_layers, hidden_size, DEFAULT_BATCH, DEFAULT_SEQ_LEN);
        let limit = memory_limit_gb * BYTES_PER_GB;
        let estimate_f = estimate as f64;

        let strategy = if estimate_f < limit {
            CaptureStrategy::InMemory
        } else if estimate_f < limit * 4.0 {
            CaptureStrategy::SelectiveLayers(Self::key_layers(num_layers))
        } else {
            CaptureStrategy::Streaming
        };
        info!(
            "Full capture of {num_layers} layers x {hidden_size} needs {:.2} GB (limit {memory_limit_gb} GB): {strategy}",
            estimate_f / BYTES_PER_GB
        );
        strategy
    }

    /// First two, middle three, and last two layers, sorted and deduplicated.
    pub fn key_layers(num_layers: usize) -> Vec<usize> {
        let n = num_layers as i64;
        let mid = n / 2;
        [0, 1, mid - 1, mid, mid + 1, n - 2, n - 1]
            .into_iter()
            .filter(|&l| l >= 0 && l < n)
            .map(|l| l as usize)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_full_capture() {
        assert_eq!(
            MemoryEstimator::estimate_full_capture(12, 768, 1, 1024),
            12 * 3 * 1024 * 768 * 4
        );
        assert_eq!(MemoryEstimator::estimate_full_capture(0, 768, 1, 1024), 0);
        assert_eq!(
            MemoryEstimator::estimate_full_capture(usize::MAX, usize::MAX, 2, 2),
            u64::MAX
        );
    }

    #[test]
    fn test_suggest_strategy() {
        // gpt2-small: ~113 MB
        assert_eq!(
            MemoryEstimator::suggest_strategy(12, 768, 4.0),
            CaptureStrategy::InMemory
        );
        // 80 x 8192: 7.5 GB, within 4x of a 4 GB limit
        assert_eq!(
            MemoryEstimator::suggest_strategy(80, 8192, 4.0),
            CaptureStrategy::SelectiveLayers(vec![0, 1, 39, 40, 41, 78, 79])
        );
        assert_eq!(
            MemoryEstimator::suggest_strategy(80, 8192, 1.0),
            CaptureStrategy::Streaming
        );
    }

    #[test]
    fn test_key_layers() {
        assert_eq!(MemoryEstimator::key_layers(12), vec![0, 1, 5, 6, 7, 10, 11]);
        assert_eq!(MemoryEstimator::key_layers(4), vec![0, 1, 2, 3]);
        assert_eq!(MemoryEstimator::key_layers(1), vec![0]);
        assert!(MemoryEstimator::key_layers(0).is_empty());
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(CaptureStrategy::InMemory.to_string(), "in_memory");
        assert_eq!(
            CaptureStrategy::SelectiveLayers(vec![0, 3]).to_string(),
            "selective [0, 3]"
        );
        assert_eq!(CaptureStrategy::Streaming.as_str(), "streaming");
    }
}
