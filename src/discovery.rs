//! Clean-vs-corrupted activation diffing into a [`Circuit`].
//!
//! This is a divergence heuristic, not causal attribution: a component is
//! kept when its activation moves by more than 10% (relative L2) between the
//! two runs, and kept components are chained in layer order with a fixed
//! placeholder importance of 0.5.
//!
//! [`CircuitDiscoverer::discover_known_patterns`] looks for known head
//! circuits in a single trace's attention patterns instead.

use anyhow::Result;
use candle_core::{DType, Tensor};
use tracing::debug;

use crate::circuit::{Circuit, CircuitNode};
use crate::classifier::{classify_heads, HeadType};
use crate::key::Component;
use crate::trace::{InMemoryTrace, Trace};

/// Relative L2 change above which a component joins the circuit.
pub const DIVERGENCE_THRESHOLD: f32 = 0.1;
/// Importance given to every chaining edge.
pub const CHAIN_IMPORTANCE: f32 = 0.5;
/// Importance of a previous-token -> induction head edge.
pub const INDUCTION_IMPORTANCE: f32 = 0.8;
/// Open interval of off-diagonal attention mass that marks an induction head.
const INDUCTION_BAND: (f32, f32) = (0.1, 0.5);

/// Builds circuits from a clean and a corrupted trace.
#[derive(Debug, Clone)]
pub struct CircuitDiscoverer {
    components: Vec<Component>,
}

impl Default for CircuitDiscoverer {
    fn default() -> Self {
        Self {
            components: Component::ALL.to_vec(),
        }
    }
}

fn frobenius(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.sqr()?.sum_all()?.sqrt()?.to_scalar()?)
}

/// Mean attention from query `i >= 2` to keys `1 <= j < i - 1`, skipping
/// BOS and the previous token. 0 for sequences shorter than 4.
fn induction_score(matrix: &[Vec<f32>]) -> f32 {
    let seq_len = matrix.len();
    if seq_len < 4 {
        return 0.0;
    }
    let mut sum = 0.0;
    let mut count = 0usize;
    for (i, row) in matrix.iter().enumerate().skip(2) {
        for &w in row.iter().take(i - 1).skip(1) {
            sum += w;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

impl CircuitDiscoverer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare only these components.
    pub fn with_components(mut self, components: Vec<Component>) -> Self {
        self.components = components;
        self
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// `‖clean − corrupt‖ / ‖clean‖` for one key; `None` if either trace lacks it.
    pub fn divergence(
        &self,
        clean: &dyn Trace,
        corrupt: &dyn Trace,
        layer: usize,
        component: Component,
    ) -> Result<Option<f32>> {
        let (Some(a), Some(b)) = (
            clean.get(layer, component, 0)?,
            corrupt.get(layer, component, 0)?,
        ) else {
            return Ok(None);
        };
        anyhow::ensure!(
            a.dims() == b.dims(),
            "Shape mismatch at layer {layer} {component}: clean {:?} vs corrupted {:?}",
            a.dims(),
            b.dims()
        );
        let a = a.to_dtype(DType::F32)?;
        let b = b.to_dtype(DType::F32)?;
        let diff = frobenius(&(&a - &b)?)?;
        Ok(Some(diff / frobenius(&a)?))
    }

    /// Discover a circuit for `behavior`.
    pub fn discover(
        &self,
        behavior: &str,
        clean: &dyn Trace,
        corrupt: &dyn Trace,
    ) -> Result<Circuit> {
        let mut circuit = Circuit::new(behavior)
            .with_description(format!("Auto-discovered circuit for {behavior}"))
            .with_behavior(behavior);

        for layer in clean.layers() {
            for &component in &self.components {
                let Some(normalized) = self.divergence(clean, corrupt, layer, component)? else {
                    continue;
                };
                debug!("Layer {layer} {component}: normalized diff {normalized:.4}");
                if normalized > DIVERGENCE_THRESHOLD {
                    circuit.add_node(CircuitNode::new(layer, component, None));
                }
            }
        }

        let mut sorted: Vec<CircuitNode> = circuit.nodes().to_vec();
        sorted.sort_by_key(|n| n.layer);
        for pair in sorted.windows(2) {
            circuit.add_edge(pair[0], pair[1], CHAIN_IMPORTANCE);
        }

        Ok(circuit)
    }

    /// Every known head circuit found in `trace`'s attention patterns.
    pub fn discover_known_patterns(&self, trace: &InMemoryTrace) -> Result<Vec<Circuit>> {
        let mut patterns = Vec::new();
        if let Some(induction) = self.find_induction_circuit(trace)? {
            patterns.push(induction);
        }
        Ok(patterns)
    }

    /// Previous-token heads wired to every induction head in a later layer.
    ///
    /// `None` unless the trace has at least one head of each kind.
    pub fn find_induction_circuit(&self, trace: &InMemoryTrace) -> Result<Option<Circuit>> {
        let mut prev_token_heads = Vec::new();
        let mut induction_heads = Vec::new();

        for layer in trace.attention_layers() {
            let pattern = trace.require_attention(layer)?;
            for (head, head_type) in classify_heads(&pattern)?.into_iter().enumerate() {
                let node = CircuitNode::new(layer, Component::AttnOut, Some(head));
                if head_type == HeadType::PreviousToken {
                    prev_token_heads.push(node);
                    continue;
                }
                let score = induction_score(&pattern.head_matrix(head, 0)?);
                if score > INDUCTION_BAND.0 && score < INDUCTION_BAND.1 {
                    debug!("L{layer}H{head}: induction score {score:.3}");
                    induction_heads.push(node);
                }
            }
        }

        if prev_token_heads.is_empty() || induction_heads.is_empty() {
            return Ok(None);
        }

        let mut circuit = Circuit::new("Induction")
            .with_description("Circuit for in-context learning via pattern copying")
            .with_behavior("copy_previous_pattern");
        for &node in prev_token_heads.iter().chain(&induction_heads) {
            circuit.add_node(node);
        }
        for &from in &prev_token_heads {
            for &to in induction_heads.iter().filter(|n| n.layer > from.layer) {
                circuit.add_edge(from, to, INDUCTION_IMPORTANCE);
            }
        }
        Ok(Some(circuit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::InMemoryTrace;
    use candle_core::Device;

    fn filled(v: f32) -> Tensor {
        Tensor::full(v, (1, 2, 4), &Device::Cpu).unwrap()
    }

    fn trace(entries: &[(usize, Component, f32)]) -> InMemoryTrace {
        let mut t = InMemoryTrace::new();
        for &(layer, component, v) in entries {
            t.add_activation(layer, component, &filled(v), None).unwrap();
        }
        t
    }

    #[test]
    fn test_discovers_divergent_components() {
        let clean = trace(&[
            (0, Component::Residual, 1.0),
            (1, Component::MlpOut, 1.0),
            (1, Component::AttnOut, 1.0),
            (2, Component::Residual, 1.0),
        ]);
        let corrupt = trace(&[
            (0, Component::Residual, 2.0),
            (1, Component::MlpOut, 1.05),
            (1, Component::AttnOut, 0.5),
            (2, Component::Residual, 1.5),
        ]);

        let circuit = CircuitDiscoverer::new()
            .discover("ioi", &clean, &corrupt)
            .unwrap();
        assert_eq!(circuit.name, "ioi");
        assert_eq!(circuit.behavior, "ioi");
        let labels: Vec<String> = circuit.nodes().iter().map(CircuitNode::label).collect();
        assert_eq!(labels, vec!["L0RES", "L1ATT", "L2RES"]);
        assert_eq!(circuit.edges().len(), 2);
        assert!(circuit.edges().iter().all(|e| e.importance == 0.5));
        assert_eq!(circuit.edges()[0].to.label(), "L1ATT");
    }

    #[test]
    fn test_missing_keys_skipped() {
        let clean = trace(&[(0, Component::Residual, 1.0), (1, Component::Residual, 1.0)]);
        let corrupt = trace(&[(1, Component::Residual, 3.0)]);
        let circuit = CircuitDiscoverer::new()
            .discover("b", &clean, &corrupt)
            .unwrap();
        assert_eq!(circuit.nodes().len(), 1);
        assert!(circuit.edges().is_empty());
    }

    #[test]
    fn test_component_filter() {
        let clean = trace(&[(0, Component::Residual, 1.0), (0, Component::MlpOut, 1.0)]);
        let corrupt = trace(&[(0, Component::Residual, 5.0), (0, Component::MlpOut, 5.0)]);
        let circuit = CircuitDiscoverer::new()
            .with_components(vec![Component::MlpOut])
            .discover("b", &clean, &corrupt)
            .unwrap();
        assert_eq!(circuit.nodes().len(), 1);
        assert_eq!(circuit.nodes()[0].component, Component::MlpOut);
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let clean = trace(&[(0, Component::Residual, 1.0)]);
        let mut corrupt = InMemoryTrace::new();
        corrupt
            .add_activation(
                0,
                Component::Residual,
                &Tensor::ones((1, 3, 4), DType::F32, &Device::Cpu).unwrap(),
                None,
            )
            .unwrap();
        assert!(CircuitDiscoverer::new()
            .discover("b", &clean, &corrupt)
            .is_err());
    }

    #[test]
    fn test_zero_clean_norm_is_not_nan_node() {
        let clean = trace(&[(0, Component::Residual, 0.0)]);
        let corrupt = trace(&[(0, Component::Residual, 0.0)]);
        let circuit = CircuitDiscoverer::new()
            .discover("b", &clean, &corrupt)
            .unwrap();
        assert!(circuit.nodes().is_empty());
    }

    fn attention(matrices: &[Vec<Vec<f32>>]) -> Tensor {
        let heads = matrices.len();
        let seq = matrices[0].len();
        let data: Vec<f32> = matrices.iter().flatten().flatten().copied().collect();
        Tensor::from_vec(data, (1, heads, seq, seq), &Device::Cpu).unwrap()
    }

    fn previous_token(seq: usize) -> Vec<Vec<f32>> {
        (0..seq)
            .map(|i| {
                let mut row = vec![0.0; seq];
                row[i.saturating_sub(1)] = 1.0;
                row
            })
            .collect()
    }

    fn causal_uniform(seq: usize) -> Vec<Vec<f32>> {
        (0..seq)
            .map(|i| {
                let mut row = vec![0.0; seq];
                row.iter_mut().take(i + 1).for_each(|w| *w = 1.0 / (i + 1) as f32);
                row
            })
            .collect()
    }

    fn bos_only(seq: usize) -> Vec<Vec<f32>> {
        (0..seq)
            .map(|_| {
                let mut row = vec![0.0; seq];
                row[0] = 1.0;
                row
            })
            .collect()
    }

    #[test]
    fn test_induction_score() {
        assert_eq!(induction_score(&previous_token(6)), 0.0);
        assert_eq!(induction_score(&causal_uniform(3)), 0.0);
        // (0.25 + 2 * 0.2 + 3 / 6) / 6
        let score = induction_score(&causal_uniform(6));
        assert!((score - 1.15 / 6.0).abs() < 1e-5);
    }

    #[test]
    fn test_find_induction_circuit() {
        let mut trace = InMemoryTrace::new();
        trace
            .add_attention_pattern(0, &attention(&[previous_token(6), bos_only(6)]))
            .unwrap();
        trace
            .add_attention_pattern(2, &attention(&[bos_only(6), causal_uniform(6)]))
            .unwrap();

        let circuit = CircuitDiscoverer::new()
            .find_induction_circuit(&trace)
            .unwrap()
            .unwrap();
        assert_eq!(circuit.name, "Induction");
        assert_eq!(circuit.behavior, "copy_previous_pattern");
        let labels: Vec<String> = circuit.nodes().iter().map(CircuitNode::label).collect();
        assert_eq!(labels, vec!["L0H0", "L2H1"]);
        assert_eq!(circuit.edges().len(), 1);
        assert_eq!(circuit.edges()[0].importance, INDUCTION_IMPORTANCE);
    }

    #[test]
    fn test_induction_edges_only_point_forward() {
        let mut trace = InMemoryTrace::new();
        trace
            .add_attention_pattern(1, &attention(&[causal_uniform(6)]))
            .unwrap();
        trace
            .add_attention_pattern(3, &attention(&[previous_token(6)]))
            .unwrap();

        let found = CircuitDiscoverer::new().discover_known_patterns(&trace).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].nodes().len(), 2);
        assert!(found[0].edges().is_empty());
    }

    #[test]
    fn test_no_induction_without_previous_token_head() {
        let mut trace = InMemoryTrace::new();
        trace
            .add_attention_pattern(2, &attention(&[causal_uniform(6)]))
            .unwrap();
        let discoverer = CircuitDiscoverer::new();
        assert!(discoverer.find_induction_circuit(&trace).unwrap().is_none());
        assert!(discoverer.discover_known_patterns(&trace).unwrap().is_empty());
    }
}
