//! Multi-SAE analysis
//!
//! [`SaeAnalyzer`] keeps a registry of named [`SaeCodec`]s and runs them over
//! activations, either keyed by SAE name or pulled straight from a trace at
//! each SAE's `(layer, component)`.

use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::Serialize;
use tracing::{debug, info};

use crate::sae::{SaeCodec, SaeFeatures};
use crate::trace::Trace;

/// Features whose mean activation moves between two runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BehaviorFeatures {
    /// Mean higher in the clean run by more than the threshold
    pub activated: Vec<usize>,
    /// Mean lower in the clean run by more than the threshold
    pub deactivated: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct SaeAnalyzer {
    saes: BTreeMap<String, SaeCodec>,
}

impl SaeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `codec` under `name`, replacing any previous entry.
    pub fn register_sae(&mut self, name: impl Into<String>, codec: SaeCodec) {
        let name = name.into();
        info!(
            "Registered SAE '{name}' (layer {}, d_sae={})",
            codec.config().layer,
            codec.d_sae()
        );
        self.saes.insert(name, codec);
    }

    pub fn get_sae(&self, name: &str) -> Option<&SaeCodec> {
        self.saes.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.saes.keys().map(String::as_str)
    }

    /// Encode each entry with the SAE of the same name; unmatched entries are skipped.
    pub fn analyze_activations(
        &self,
        activations: &BTreeMap<String, Tensor>,
    ) -> Result<BTreeMap<String, SaeFeatures>> {
        let mut out = BTreeMap::new();
        for (name, tensor) in activations {
            match self.saes.get(name) {
                Some(codec) => {
                    out.insert(name.clone(), codec.encode(tensor)?);
                }
                None => debug!("No SAE registered for '{name}', skipping"),
            }
        }
        Ok(out)
    }

    /// Encode the trace activation at every registered SAE's `(layer, component)`.
    pub fn analyze_trace(&self, trace: &dyn Trace) -> Result<BTreeMap<String, SaeFeatures>> {
        let mut out = BTreeMap::new();
        for (name, codec) in &self.saes {
            let config = codec.config();
            let component = config.component();
            match trace.get(config.layer, component, 0)? {
                Some(tensor) => {
                    out.insert(name.clone(), codec.encode(&tensor)?);
                }
                None => debug!(
                    "Trace has no {component} at layer {} for SAE '{name}'",
                    config.layer
                ),
            }
        }
        Ok(out)
    }

    /// Compare per-feature mean activations between two runs, as
    /// `clean - corrupt`.
    pub fn find_behavior_features(
        &self,
        clean: &SaeFeatures,
        corrupt: &SaeFeatures,
        threshold: f32,
    ) -> Result<BehaviorFeatures> {
        anyhow::ensure!(
            clean.d_sae() == corrupt.d_sae(),
            "Feature dimension mismatch: {} vs {}",
            clean.d_sae(),
            corrupt.d_sae()
        );
        let clean_mean = feature_means(clean)?;
        let corrupt_mean = feature_means(corrupt)?;

        let mut result = BehaviorFeatures::default();
        for (i, (c, x)) in clean_mean.iter().zip(&corrupt_mean).enumerate() {
            let diff = c - x;
            if diff > threshold {
                result.activated.push(i);
            } else if diff < -threshold {
                result.deactivated.push(i);
            }
        }
        Ok(result)
    }

    /// `[d_sae, d_sae]` co-occurrence counts of each position's top-k
    /// features, divided by the number of positions.
    pub fn feature_coactivation(&self, features: &SaeFeatures, top_k: usize) -> Result<Tensor> {
        let d_sae = features.d_sae();
        let mut counts = vec![0f32; d_sae * d_sae];
        let top = features.top_k_features(top_k)?;
        for position in &top {
            for &(i, _) in position {
                for &(j, _) in position {
                    counts[i * d_sae + j] += 1.0;
                }
            }
        }
        let n = top.len().max(1) as f32;
        counts.iter_mut().for_each(|c| *c /= n);
        Ok(Tensor::from_vec(counts, (d_sae, d_sae), &Device::Cpu)?)
    }
}

fn feature_means(features: &SaeFeatures) -> Result<Vec<f32>> {
    let rows = features.rows()?;
    let mut sums = vec![0f32; features.d_sae()];
    for row in &rows {
        for (s, v) in sums.iter_mut().zip(row) {
            *s += v;
        }
    }
    let n = rows.len().max(1) as f32;
    Ok(sums.into_iter().map(|s| s / n).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Component;
    use crate::sae::SaeConfig;
    use crate::trace::InMemoryTrace;
    use candle_core::DType;

    fn identity_codec(d: usize, hook_point: &str) -> SaeCodec {
        let eye = Tensor::eye(d, DType::F32, &Device::Cpu).unwrap();
        SaeCodec::new(
            eye.clone(),
            eye,
            None,
            None,
            Some(SaeConfig::new(d, d).with_hook_point(hook_point)),
        )
        .unwrap()
    }

    fn features(data: Vec<f32>, rows: usize, cols: usize) -> SaeFeatures {
        SaeFeatures::new(Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()).unwrap()
    }

    #[test]
    fn test_analyze_activations_by_name() {
        let mut analyzer = SaeAnalyzer::new();
        analyzer.register_sae("l2", identity_codec(3, "blocks.2.hook_resid_post"));
        assert!(analyzer.get_sae("l2").is_some());
        assert!(analyzer.get_sae("nope").is_none());

        let mut acts = BTreeMap::new();
        acts.insert(
            "l2".to_string(),
            Tensor::from_vec(vec![1.0f32, -1.0, 2.0], (1, 3), &Device::Cpu).unwrap(),
        );
        acts.insert(
            "other".to_string(),
            Tensor::zeros((1, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        let out = analyzer.analyze_activations(&acts).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out["l2"].rows().unwrap()[0], vec![1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_analyze_trace_uses_hook_location() {
        let mut analyzer = SaeAnalyzer::new();
        analyzer.register_sae("mlp1", identity_codec(2, "blocks.1.hook_mlp_out"));
        analyzer.register_sae("res5", identity_codec(2, "blocks.5.hook_resid_post"));

        let mut trace = InMemoryTrace::new();
        let t = Tensor::from_vec(vec![0.5f32, 3.0], (1, 1, 2), &Device::Cpu).unwrap();
        trace.add_activation(1, Component::MlpOut, &t, None).unwrap();
        trace.add_activation(1, Component::Residual, &t.neg().unwrap(), None).unwrap();

        let out = analyzer.analyze_trace(&trace).unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["mlp1"]);
        assert_eq!(out["mlp1"].shape(), &[1, 1, 2]);
        assert_eq!(out["mlp1"].rows().unwrap()[0], vec![0.5, 3.0]);
    }

    #[test]
    fn test_find_behavior_features() {
        let analyzer = SaeAnalyzer::new();
        let clean = features(vec![1.0, 0.0, 0.5, 1.0, 0.0, 0.5], 2, 3);
        let corrupt = features(vec![0.0, 1.0, 0.55, 0.0, 1.0, 0.55], 2, 3);
        let result = analyzer.find_behavior_features(&clean, &corrupt, 0.1).unwrap();
        assert_eq!(result.activated, vec![0]);
        assert_eq!(result.deactivated, vec![1]);

        let narrow = features(vec![1.0, 0.0], 1, 2);
        assert!(analyzer.find_behavior_features(&clean, &narrow, 0.1).is_err());
    }

    #[test]
    fn test_behavior_features_follow_clean_run() {
        let analyzer = SaeAnalyzer::new();
        let clean = features(vec![1.0, 0.0], 1, 2);
        let corrupt = features(vec![0.0, 1.0], 1, 2);
        let result = analyzer.find_behavior_features(&clean, &corrupt, 0.5).unwrap();
        assert_eq!(result.activated, vec![0]);
        assert_eq!(result.deactivated, vec![1]);

        let swapped = analyzer.find_behavior_features(&corrupt, &clean, 0.5).unwrap();
        assert_eq!(swapped.activated, vec![1]);
        assert_eq!(swapped.deactivated, vec![0]);
    }

    #[test]
    fn test_feature_coactivation() {
        let analyzer = SaeAnalyzer::new();
        let f = features(vec![2.0, 1.0, 0.0, 0.0, 1.0, 3.0], 2, 3);
        let co = analyzer.feature_coactivation(&f, 2).unwrap();
        assert_eq!(co.dims(), &[3, 3]);
        let co: Vec<Vec<f32>> = co.to_vec2().unwrap();
        assert_eq!(co[1][1], 1.0);
        assert_eq!(co[0][1], 0.5);
        assert_eq!(co[1][2], 0.5);
        assert_eq!(co[0][2], 0.0);
    }
}
