//! Indirect Object Identification (IOI) circuit detection
//!
//! Heuristic detector for the IOI circuit (Wang et al., 2022). Given
//! per-layer attention patterns and a sentence annotated with token roles,
//! each head is scored by a fixed positional attention lookup and kept when
//! the score clears a threshold:
//!
//! | role              | score                     | kept when                 |
//! |-------------------|---------------------------|---------------------------|
//! | name_mover        | `attn[end, io]`           | `> name_mover_threshold`  |
//! | s_inhibition      | `attn[end, s2]`           | `> s_inhibition_threshold`|
//! | duplicate_token   | `attn[s2, s1]`            | `> 0.2`                   |
//! | previous_token    | mean of `attn[i, i-1]`    | `> 0.5`                   |
//! | backup_name_mover | `attn[end, io]`           | in `(0.7·nm_thr, nm_thr)` |
//!
//! Only batch 0 is inspected. Positions outside the pattern (including the
//! `-1` "no match" marker) score 0.0 instead of failing.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};
use serde::Serialize;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::trace::InMemoryTrace;

const DUPLICATE_TOKEN_THRESHOLD: f32 = 0.2;
const PREVIOUS_TOKEN_THRESHOLD: f32 = 0.5;
const BACKUP_FRACTION: f32 = 0.7;

// ---------------------------------------------------------------------------
// Roles and configuration
// ---------------------------------------------------------------------------

/// Functional role of a head within the IOI circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IoiRole {
    NameMover,
    SInhibition,
    DuplicateToken,
    PreviousToken,
    BackupNameMover,
    /// Has a configurable layer range but no detector
    Induction,
}

impl IoiRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NameMover => "name_mover",
            Self::SInhibition => "s_inhibition",
            Self::DuplicateToken => "duplicate_token",
            Self::PreviousToken => "previous_token",
            Self::BackupNameMover => "backup_name_mover",
            Self::Induction => "induction",
        }
    }

    /// Layer search range used when the configuration has none for this role.
    pub fn default_range(&self) -> LayerRange {
        match self {
            Self::DuplicateToken | Self::PreviousToken => LayerRange::new(0, 3),
            Self::Induction => LayerRange::new(4, 7),
            Self::SInhibition => LayerRange::new(6, 9),
            Self::NameMover | Self::BackupNameMover => LayerRange::new(9, 12),
        }
    }
}

impl fmt::Display for IoiRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open layer interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayerRange {
    pub start: usize,
    pub end: usize,
}

impl LayerRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, layer: usize) -> bool {
        layer >= self.start && layer < self.end
    }
}

/// Detection thresholds and per-role layer ranges. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IoiDetectionConfig {
    pub name_mover_threshold: f32,
    pub s_inhibition_threshold: f32,
    pub top_k_heads: usize,
    layer_ranges: BTreeMap<IoiRole, LayerRange>,
}

impl Default for IoiDetectionConfig {
    fn default() -> Self {
        let roles = [
            IoiRole::DuplicateToken,
            IoiRole::PreviousToken,
            IoiRole::Induction,
            IoiRole::SInhibition,
            IoiRole::NameMover,
            IoiRole::BackupNameMover,
        ];
        Self {
            name_mover_threshold: 0.3,
            s_inhibition_threshold: 0.2,
            top_k_heads: 5,
            layer_ranges: roles.iter().map(|r| (*r, r.default_range())).collect(),
        }
    }
}

impl IoiDetectionConfig {
    pub fn with_name_mover_threshold(mut self, threshold: f32) -> Self {
        self.name_mover_threshold = threshold;
        self
    }

    pub fn with_s_inhibition_threshold(mut self, threshold: f32) -> Self {
        self.s_inhibition_threshold = threshold;
        self
    }

    pub fn with_top_k_heads(mut self, k: usize) -> Self {
        self.top_k_heads = k;
        self
    }

    pub fn with_layer_range(mut self, role: IoiRole, range: LayerRange) -> Self {
        self.layer_ranges.insert(role, range);
        self
    }

    /// Configured range for a role, falling back to the role default.
    pub fn layer_range(&self, role: IoiRole) -> LayerRange {
        self.layer_ranges
            .get(&role)
            .copied()
            .unwrap_or_else(|| role.default_range())
    }
}

// ---------------------------------------------------------------------------
// Sentence
// ---------------------------------------------------------------------------

/// Token-role positions of an IOI sentence. `-1` means "not found"; no
/// bounds checks are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IoiPositions {
    pub subjects: Vec<i64>,
    pub io: i64,
    pub subject2: i64,
    pub end: i64,
}

/// An IOI prompt with token role annotations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IoiSentence {
    pub tokens: Vec<u32>,
    pub token_strings: Vec<String>,
    pub subject_positions: Vec<i64>,
    pub io_position: i64,
    /// Second occurrence of the subject
    pub subject2_position: i64,
    pub end_position: i64,
    /// Indirect object name
    pub correct_answer: String,
    /// Subject name
    pub distractor: String,
}

impl IoiSentence {
    /// Sentence with explicitly given positions. The token list must be non-empty.
    pub fn from_positions(
        tokens: Vec<u32>,
        token_strings: Vec<String>,
        positions: IoiPositions,
        correct_answer: impl Into<String>,
        distractor: impl Into<String>,
    ) -> Result<Self> {
        anyhow::ensure!(!tokens.is_empty(), "IOI sentence needs at least one token");
        Ok(Self {
            tokens,
            token_strings,
            subject_positions: positions.subjects,
            io_position: positions.io,
            subject2_position: positions.subject2,
            end_position: positions.end,
            correct_answer: correct_answer.into(),
            distractor: distractor.into(),
        })
    }

    /// Annotate roles from token strings.
    ///
    /// A token matches a name when, after trimming and lowercasing, either
    /// contains the other. IO is the first IO match; S2 is the last subject
    /// match; end is the last token.
    pub fn from_tokens(
        tokens: Vec<u32>,
        token_strings: Vec<String>,
        subject_name: &str,
        io_name: &str,
    ) -> Result<Self> {
        anyhow::ensure!(!tokens.is_empty(), "IOI sentence needs at least one token");
        anyhow::ensure!(
            tokens.len() == token_strings.len(),
            "Got {} tokens but {} token strings",
            tokens.len(),
            token_strings.len()
        );

        let subject = subject_name.trim().to_lowercase();
        let io = io_name.trim().to_lowercase();
        let matches = |token: &str, name: &str| {
            !token.is_empty() && !name.is_empty() && (token.contains(name) || name.contains(token))
        };

        let mut subjects = Vec::new();
        let mut io_position = -1i64;
        for (i, s) in token_strings.iter().enumerate() {
            let token = s.trim().to_lowercase();
            if matches(&token, &subject) {
                subjects.push(i as i64);
            }
            if io_position == -1 && matches(&token, &io) {
                io_position = i as i64;
            }
        }
        let subject2 = subjects.last().copied().unwrap_or(-1);
        let end = tokens.len() as i64 - 1;

        Self::from_positions(
            tokens,
            token_strings,
            IoiPositions {
                subjects,
                io: io_position,
                subject2,
                end,
            },
            io_name,
            subject_name,
        )
    }

    /// Tokenize `text` and annotate roles (see [`IoiSentence::from_tokens`]).
    pub fn parse(
        text: &str,
        tokenizer: &Tokenizer,
        subject_name: &str,
        io_name: &str,
    ) -> Result<Self> {
        let encoding = tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        let tokens = encoding.get_ids().to_vec();
        let token_strings = tokens
            .iter()
            .map(|&id| {
                tokenizer
                    .decode(&[id], false)
                    .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
            })
            .collect::<Result<Vec<String>>>()?;
        Self::from_tokens(tokens, token_strings, subject_name, io_name)
    }

    /// First subject occurrence, or -1.
    pub fn subject1_position(&self) -> i64 {
        self.subject_positions.first().copied().unwrap_or(-1)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A detected head and the attention lookups behind its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IoiHead {
    pub layer: usize,
    pub head: usize,
    pub role: IoiRole,
    pub score: f32,
    pub metrics: BTreeMap<String, f32>,
}

impl IoiHead {
    fn new(layer: usize, head: usize, role: IoiRole, metric: &str, score: f32) -> Self {
        Self {
            layer,
            head,
            role,
            score,
            metrics: BTreeMap::from([(metric.to_string(), score)]),
        }
    }

    pub fn label(&self) -> String {
        format!("L{}H{}", self.layer, self.head)
    }
}

/// Heads grouped by role, plus a validity score in `[0, 1]`.
#[derive(Debug, Clone, Serialize)]
pub struct IoiCircuit {
    pub name_mover_heads: Vec<IoiHead>,
    pub s_inhibition_heads: Vec<IoiHead>,
    pub duplicate_token_heads: Vec<IoiHead>,
    pub previous_token_heads: Vec<IoiHead>,
    pub backup_name_mover_heads: Vec<IoiHead>,
    pub validity_score: f32,
    pub sentence: IoiSentence,
}

fn head_set(heads: &[IoiHead]) -> BTreeSet<(usize, usize)> {
    heads.iter().map(|h| (h.layer, h.head)).collect()
}

impl IoiCircuit {
    /// Heads detected for one role (empty for roles without a detector).
    pub fn heads(&self, role: IoiRole) -> &[IoiHead] {
        match role {
            IoiRole::NameMover => &self.name_mover_heads,
            IoiRole::SInhibition => &self.s_inhibition_heads,
            IoiRole::DuplicateToken => &self.duplicate_token_heads,
            IoiRole::PreviousToken => &self.previous_token_heads,
            IoiRole::BackupNameMover => &self.backup_name_mover_heads,
            IoiRole::Induction => &[],
        }
    }

    pub fn total_heads(&self) -> usize {
        self.name_mover_heads.len()
            + self.s_inhibition_heads.len()
            + self.duplicate_token_heads.len()
            + self.previous_token_heads.len()
            + self.backup_name_mover_heads.len()
    }

    /// Graphviz DOT with role-colored nodes (NM red, SI blue, DT green) and
    /// DT→SI→NM edges wherever the target sits in a strictly later layer.
    pub fn to_dot(&self) -> String {
        let mut lines: Vec<String> = vec![
            "digraph IOICircuit {".to_string(),
            "  rankdir=TB;".to_string(),
            "  node [shape=box];".to_string(),
            String::new(),
            "  // Name Mover heads (red)".to_string(),
        ];
        let node = |h: &IoiHead, tag: &str, color: &str, fill: &str| {
            let label = h.label();
            format!(
                "  \"{label}\" [label=\"{label}\\n{tag}\", color={color}, style=filled, fillcolor={fill}];"
            )
        };

        for h in &self.name_mover_heads {
            lines.push(node(h, "NM", "red", "lightpink"));
        }
        lines.push(String::new());
        lines.push("  // S-Inhibition heads (blue)".to_string());
        for h in &self.s_inhibition_heads {
            lines.push(node(h, "SI", "blue", "lightblue"));
        }
        lines.push(String::new());
        lines.push("  // Duplicate Token heads (green)".to_string());
        for h in &self.duplicate_token_heads {
            lines.push(node(h, "DT", "green", "lightgreen"));
        }
        lines.push(String::new());
        lines.push("  // Edges".to_string());

        for dt in &self.duplicate_token_heads {
            for si in self.s_inhibition_heads.iter().filter(|si| si.layer > dt.layer) {
                lines.push(format!("  \"{}\" -> \"{}\";", dt.label(), si.label()));
            }
        }
        for si in &self.s_inhibition_heads {
            for nm in self.name_mover_heads.iter().filter(|nm| nm.layer > si.layer) {
                lines.push(format!("  \"{}\" -> \"{}\";", si.label(), nm.label()));
            }
        }

        lines.push("}".to_string());
        lines.join("\n")
    }

    /// Compare detections against the published head set of `model_family`.
    ///
    /// Per-role metrics cover name_mover, s_inhibition and duplicate_token;
    /// the overall score uses the union of those three roles. Unsupported
    /// families are an error.
    pub fn validate_against_known(&self, model_family: &str) -> Result<IoiValidationResult> {
        let known = KnownIoiHeads::for_family(model_family)?;
        let roles = [
            IoiRole::NameMover,
            IoiRole::SInhibition,
            IoiRole::DuplicateToken,
        ];

        let mut per_role = BTreeMap::new();
        let mut all_detected = BTreeSet::new();
        let mut all_known = BTreeSet::new();
        for role in roles {
            let detected = head_set(self.heads(role));
            let expected: BTreeSet<(usize, usize)> = known.heads(role).iter().copied().collect();
            per_role.insert(role, RoleMetrics::compare(&detected, &expected));
            all_detected.extend(detected);
            all_known.extend(expected);
        }

        let overall = RoleMetrics::compare(&all_detected, &all_known);
        Ok(IoiValidationResult {
            precision: overall.precision,
            recall: overall.recall,
            f1_score: overall.f1,
            per_role,
            false_positives: all_detected.difference(&all_known).copied().collect(),
            false_negatives: all_known.difference(&all_detected).copied().collect(),
        })
    }
}

/// Precision / recall / F1 of one head set against a reference set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RoleMetrics {
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
}

impl RoleMetrics {
    fn compare(detected: &BTreeSet<(usize, usize)>, known: &BTreeSet<(usize, usize)>) -> Self {
        let tp = detected.intersection(known).count() as f32;
        let precision = if detected.is_empty() {
            0.0
        } else {
            tp / detected.len() as f32
        };
        let recall = if known.is_empty() {
            0.0
        } else {
            tp / known.len() as f32
        };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            f1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IoiValidationResult {
    pub precision: f32,
    pub recall: f32,
    pub f1_score: f32,
    pub per_role: BTreeMap<IoiRole, RoleMetrics>,
    /// Sorted `(layer, head)` pairs
    pub false_positives: Vec<(usize, usize)>,
    /// Sorted `(layer, head)` pairs
    pub false_negatives: Vec<(usize, usize)>,
}

/// Published IOI heads for a reference model.
#[derive(Debug, Clone, Copy)]
pub struct KnownIoiHeads {
    pub name_mover: &'static [(usize, usize)],
    pub backup_name_mover: &'static [(usize, usize)],
    pub s_inhibition: &'static [(usize, usize)],
    pub duplicate_token: &'static [(usize, usize)],
}

impl KnownIoiHeads {
    /// GPT-2 small heads from "Interpretability in the Wild".
    pub const GPT2: KnownIoiHeads = KnownIoiHeads {
        name_mover: &[(9, 9), (10, 0), (9, 6)],
        backup_name_mover: &[(10, 10), (10, 6), (10, 2), (11, 2), (9, 7), (10, 1)],
        s_inhibition: &[(7, 3), (7, 9), (8, 6), (8, 10)],
        duplicate_token: &[(0, 1), (0, 10), (3, 0)],
    };

    pub fn for_family(model_family: &str) -> Result<Self> {
        match model_family {
            "gpt2" => Ok(Self::GPT2),
            other => anyhow::bail!("IOI validation only supported for gpt2, got '{other}'"),
        }
    }

    pub fn heads(&self, role: IoiRole) -> &'static [(usize, usize)] {
        match role {
            IoiRole::NameMover => self.name_mover,
            IoiRole::BackupNameMover => self.backup_name_mover,
            IoiRole::SInhibition => self.s_inhibition,
            IoiRole::DuplicateToken => self.duplicate_token,
            IoiRole::PreviousToken | IoiRole::Induction => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// One layer's batch-0 heads as `[head][query][key]`.
type LayerHeads = Vec<Vec<Vec<f32>>>;

/// Attention weight at `(row, col)`, or 0.0 when either index is outside the matrix.
fn cell(matrix: &[Vec<f32>], row: i64, col: i64) -> f32 {
    let (Ok(row), Ok(col)) = (usize::try_from(row), usize::try_from(col)) else {
        return 0.0;
    };
    matrix
        .get(row)
        .and_then(|r| r.get(col))
        .copied()
        .unwrap_or(0.0)
}

fn prev_token_score(matrix: &[Vec<f32>]) -> f32 {
    let seq_len = matrix.len();
    let total: f32 = (1..seq_len)
        .map(|i| cell(matrix, i as i64, i as i64 - 1))
        .sum();
    total / seq_len.saturating_sub(1).max(1) as f32
}

/// Runs the IOI heuristics under a fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct IoiDetector {
    config: IoiDetectionConfig,
}

impl IoiDetector {
    pub fn new(config: IoiDetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IoiDetectionConfig {
        &self.config
    }

    /// Detect from per-layer `[batch, heads, seq_q, seq_k]` attention tensors.
    pub fn detect_from_attention(
        &self,
        attention: &BTreeMap<usize, Tensor>,
        sentence: &IoiSentence,
    ) -> Result<IoiCircuit> {
        let mut layers: BTreeMap<usize, LayerHeads> = BTreeMap::new();
        for (&layer, tensor) in attention {
            anyhow::ensure!(
                tensor.rank() == 4,
                "Attention for layer {layer} must be [batch, heads, seq_q, seq_k], got {:?}",
                tensor.dims()
            );
            let heads: LayerHeads = tensor.to_dtype(DType::F32)?.i(0)?.to_vec3()?;
            layers.insert(layer, heads);
        }

        let name_mover_heads = self.find_heads(&layers, IoiRole::NameMover, |m| {
            let score = cell(m, sentence.end_position, sentence.io_position);
            (score > self.config.name_mover_threshold).then_some(("end_to_io_attention", score))
        });
        let s_inhibition_heads = self.find_heads(&layers, IoiRole::SInhibition, |m| {
            let score = cell(m, sentence.end_position, sentence.subject2_position);
            (score > self.config.s_inhibition_threshold).then_some(("end_to_s2_attention", score))
        });
        let duplicate_token_heads = if sentence.subject_positions.is_empty() {
            Vec::new()
        } else {
            self.find_heads(&layers, IoiRole::DuplicateToken, |m| {
                let score = cell(m, sentence.subject2_position, sentence.subject1_position());
                (score > DUPLICATE_TOKEN_THRESHOLD).then_some(("s2_to_s1_attention", score))
            })
        };
        let previous_token_heads = self.find_heads(&layers, IoiRole::PreviousToken, |m| {
            let score = prev_token_score(m);
            (score > PREVIOUS_TOKEN_THRESHOLD).then_some(("prev_token_score", score))
        });
        let backup_name_mover_heads = self.find_heads(&layers, IoiRole::BackupNameMover, |m| {
            let score = cell(m, sentence.end_position, sentence.io_position);
            let upper = self.config.name_mover_threshold;
            (upper * BACKUP_FRACTION < score && score < upper)
                .then_some(("end_to_io_attention", score))
        });

        let validity_score = validity_score(
            &name_mover_heads,
            &s_inhibition_heads,
            &duplicate_token_heads,
        );
        debug!(
            "IOI detection: {} NM, {} SI, {} DT, {} PT, {} backup NM (validity {validity_score:.2})",
            name_mover_heads.len(),
            s_inhibition_heads.len(),
            duplicate_token_heads.len(),
            previous_token_heads.len(),
            backup_name_mover_heads.len()
        );

        Ok(IoiCircuit {
            name_mover_heads,
            s_inhibition_heads,
            duplicate_token_heads,
            previous_token_heads,
            backup_name_mover_heads,
            validity_score,
            sentence: sentence.clone(),
        })
    }

    /// Detect from the attention patterns held by a trace.
    pub fn detect_from_trace(
        &self,
        trace: &InMemoryTrace,
        sentence: &IoiSentence,
    ) -> Result<IoiCircuit> {
        self.detect_from_attention(trace.attention_tensors(), sentence)
    }

    /// Score every head in the role's layer range; keep, sort descending, truncate to top-k.
    fn find_heads<F>(
        &self,
        layers: &BTreeMap<usize, LayerHeads>,
        role: IoiRole,
        score: F,
    ) -> Vec<IoiHead>
    where
        F: Fn(&[Vec<f32>]) -> Option<(&'static str, f32)>,
    {
        let range = self.config.layer_range(role);
        let score = &score;
        let mut heads: Vec<IoiHead> = layers
            .iter()
            .filter(|(layer, _)| range.contains(**layer))
            .flat_map(|(&layer, heads)| {
                heads.iter().enumerate().filter_map(move |(head, matrix)| {
                    score(matrix).map(|(metric, s)| IoiHead::new(layer, head, role, metric, s))
                })
            })
            .collect();
        heads.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        heads.truncate(self.config.top_k_heads);
        heads
    }

    /// IO logit minus subject logit at the last position of `[seq, vocab]`
    /// or `[batch, seq, vocab]` logits (batch 0).
    pub fn compute_logit_diff(logits: &Tensor, io_token: usize, s_token: usize) -> Result<f32> {
        let last = match logits.dims() {
            [_, seq, _] if *seq > 0 => logits.i((0, seq - 1))?,
            [seq, _] if *seq > 0 => logits.i(seq - 1)?,
            dims => anyhow::bail!("Expected [seq, vocab] or [batch, seq, vocab] logits, got {dims:?}"),
        };
        let last: Vec<f32> = last.to_dtype(DType::F32)?.to_vec1()?;
        let vocab = last.len();
        let lookup = |token: usize| {
            last.get(token)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("Token id {token} out of range (vocab {vocab})"))
        };
        Ok(lookup(io_token)? - lookup(s_token)?)
    }
}

/// 0.4 for any name mover, +0.3 each for any s-inhibition / duplicate-token
/// head, plus 0.1× the top name-mover and s-inhibition scores; capped at 1.
pub fn validity_score(
    name_mover: &[IoiHead],
    s_inhibition: &[IoiHead],
    duplicate_token: &[IoiHead],
) -> f32 {
    let mut score = 0.0;
    if let Some(top) = name_mover.first() {
        score += 0.4 + top.score * 0.1;
    }
    if let Some(top) = s_inhibition.first() {
        score += 0.3 + top.score * 0.1;
    }
    if !duplicate_token.is_empty() {
        score += 0.3;
    }
    f32::min(score, 1.0)
}
