//! Integration tests for microscope-rs
//!
//! These exercise capture, persistence and analysis end to end on synthetic
//! tensors; nothing here downloads a model.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use microscope_rs::{
    classify_heads, CaptureSink, CaptureStrategy, ChunkStorage, CircuitDiscoverer, Component,
    HeadType, InMemoryTrace, IoiDetector, IoiSentence, MemoryEstimator, SaeAnalyzer, SaeCodec,
    SaeConfig, StreamingConfig, StreamingTrace, Trace, TraceCache,
};
use tempfile::TempDir;

const SEQ: usize = 8;

fn activation(seq: usize, hidden: usize, offset: f32) -> Tensor {
    let data: Vec<f32> = (0..seq * hidden).map(|i| i as f32 * 0.01 + offset).collect();
    Tensor::from_vec(data, (1, seq, hidden), &Device::Cpu).unwrap()
}

/// Causal row `r`: `weight` on `target`, the rest spread over the other visible keys.
fn row(r: usize, target: usize, weight: f32) -> Vec<f32> {
    let mut out = vec![0.0; SEQ];
    if r == 0 {
        out[0] = 1.0;
        return out;
    }
    let rest = (1.0 - weight) / r as f32;
    for (k, v) in out.iter_mut().enumerate().take(r + 1) {
        *v = if k == target { weight } else { rest };
    }
    out
}

fn uniform_head() -> Vec<Vec<f32>> {
    (0..SEQ)
        .map(|r| {
            let mut out = vec![0.0; SEQ];
            out[..=r].iter_mut().for_each(|v| *v = 1.0 / (r + 1) as f32);
            out
        })
        .collect()
}

/// Uniform causal head with one query row overridden.
fn head_with(query: usize, key: usize, weight: f32) -> Vec<Vec<f32>> {
    let mut m = uniform_head();
    m[query] = row(query, key, weight);
    m
}

fn previous_token_head() -> Vec<Vec<f32>> {
    (0..SEQ).map(|r| row(r, r.saturating_sub(1), 1.0)).collect()
}

fn layer_tensor(heads: &[Vec<Vec<f32>>]) -> Tensor {
    let data: Vec<f32> = heads.iter().flatten().flatten().copied().collect();
    Tensor::from_vec(data, (1, heads.len(), SEQ, SEQ), &Device::Cpu).unwrap()
}

fn ioi_tokens() -> (Vec<u32>, Vec<String>) {
    let words = [
        "When", " John", " and", " Mary", " went", ",", " John", " gave",
    ];
    (
        (100..100 + SEQ as u32).collect(),
        words.iter().map(|w| (*w).to_string()).collect(),
    )
}

/// Trace whose attention contains a planted IOI circuit:
/// L1H0 previous-token, L1H1 duplicate-token, L7H2 s-inhibition,
/// L10H1 name mover, L10H0 backup name mover.
fn ioi_trace() -> InMemoryTrace {
    let mut trace = InMemoryTrace::new().with_architecture("gpt2");
    trace.set_input_tokens(ioi_tokens().0);
    trace
        .add_attention_pattern(
            1,
            &layer_tensor(&[previous_token_head(), head_with(6, 1, 0.6), uniform_head()]),
        )
        .unwrap();
    trace
        .add_attention_pattern(
            7,
            &layer_tensor(&[uniform_head(), uniform_head(), head_with(7, 6, 0.7)]),
        )
        .unwrap();
    trace
        .add_attention_pattern(
            10,
            &layer_tensor(&[head_with(7, 3, 0.25), head_with(7, 3, 0.9), uniform_head()]),
        )
        .unwrap();
    trace
}

#[test]
fn test_streaming_capture_resume_and_cleanup() {
    let dir = TempDir::new().unwrap();
    let strategy = CaptureStrategy::SelectiveLayers(vec![0, 2]);
    let config = StreamingConfig::from_strategy(dir.path(), &strategy);

    let mut trace = StreamingTrace::new(config.clone()).unwrap();
    trace.enable_ring_buffer(0, Component::Residual, Some(2)).unwrap();
    for step in 0..3 {
        for layer in 0..3 {
            trace
                .capture(layer, "residual", &activation(4, 6, step as f32))
                .unwrap();
        }
        trace
            .capture(2, "mlp_out", &activation(4, 6, 10.0 + step as f32))
            .unwrap();
        trace.capture(2, "attn_pattern", &activation(4, 6, 0.0)).unwrap();
    }
    trace.flush().unwrap();

    assert_eq!(trace.layers(), vec![0, 2]);
    assert_eq!(trace.storage().num_chunks(0, Component::Residual), 3);
    assert_eq!(trace.storage().num_chunks(1, Component::Residual), 0);
    assert_eq!(trace.storage().num_chunks(2, Component::MlpOut), 3);

    let recent = trace.get_recent(0, Component::Residual, 5);
    assert_eq!(recent.len(), 2);
    let newest: Vec<f32> = recent[0].flatten_all().unwrap().to_vec1().unwrap();
    assert!((newest[0] - 2.0).abs() < 1e-6);

    let chunks: Vec<(usize, Tensor)> = trace
        .iter_layer(2, Component::MlpOut)
        .collect::<anyhow::Result<_>>()
        .unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[1].1.dims(), &[1, 4, 6]);

    // Reopen from the sidecar, with and without mmap
    for use_mmap in [true, false] {
        let reopened = ChunkStorage::new(config.clone().with_mmap(use_mmap)).unwrap();
        assert_eq!(reopened.available_layers(), vec![0, 2]);
        assert_eq!(reopened.total_size_bytes(), trace.storage().total_size_bytes());
        let t = reopened.load(2, Component::MlpOut, 2).unwrap().unwrap();
        let expected = activation(4, 6, 12.0);
        let diff: f32 = (t - expected)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
        assert!(reopened.load(2, Component::MlpOut, 3).unwrap().is_none());
    }

    trace.cleanup().unwrap();
    assert!(trace.layers().is_empty());
    assert!(trace.get_recent(0, Component::Residual, 1).is_empty());
    let leftover = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftover, 0);
}

#[test]
fn test_strategy_drives_config() {
    let strategy = MemoryEstimator::suggest_strategy(80, 8192, 4.0);
    let config = StreamingConfig::from_strategy("/tmp/unused", &strategy);
    assert_eq!(config.capture_layers, MemoryEstimator::key_layers(80));

    let small = MemoryEstimator::suggest_strategy(12, 768, 4.0);
    assert_eq!(small, CaptureStrategy::InMemory);
}

#[test]
fn test_ioi_detection_after_safetensors_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ioi.safetensors");
    ioi_trace().save_safetensors(&path).unwrap();
    let trace = InMemoryTrace::load_safetensors(&path).unwrap();
    assert_eq!(trace.attention_layers(), vec![1, 7, 10]);

    let (_, strings) = ioi_tokens();
    let tokens = trace.input_tokens().unwrap().to_vec();
    let sentence = IoiSentence::from_tokens(tokens, strings, "John", "Mary").unwrap();
    assert_eq!(sentence.subject_positions, vec![1, 6]);
    assert_eq!(sentence.io_position, 3);
    assert_eq!(sentence.subject2_position, 6);
    assert_eq!(sentence.end_position, 7);

    let circuit = IoiDetector::default()
        .detect_from_trace(&trace, &sentence)
        .unwrap();
    let pairs = |heads: &[microscope_rs::IoiHead]| -> Vec<(usize, usize)> {
        heads.iter().map(|h| (h.layer, h.head)).collect()
    };
    assert_eq!(pairs(&circuit.name_mover_heads), vec![(10, 1)]);
    assert_eq!(pairs(&circuit.backup_name_mover_heads), vec![(10, 0)]);
    assert_eq!(pairs(&circuit.s_inhibition_heads), vec![(7, 2)]);
    assert_eq!(pairs(&circuit.duplicate_token_heads), vec![(1, 1)]);
    assert_eq!(pairs(&circuit.previous_token_heads), vec![(1, 0)]);
    assert!((circuit.validity_score - 1.0).abs() < 1e-6);

    let dot = circuit.to_dot();
    assert!(dot.contains("L10H1"));
    assert!(dot.contains("L7H2"));

    let validation = circuit.validate_against_known("gpt2").unwrap();
    assert!((0.0..=1.0).contains(&validation.precision));
    assert!(!validation.false_negatives.is_empty());
    assert!(circuit.validate_against_known("llama").is_err());
}

#[test]
fn test_head_classification_on_saved_trace() {
    let trace = ioi_trace();
    let pattern = trace.require_attention(1).unwrap();
    let types = classify_heads(&pattern).unwrap();
    assert_eq!(types[0], HeadType::PreviousToken);
    assert!(trace.require_attention(3).is_err());
}

#[test]
fn test_discovery_between_saved_traces() {
    let dir = TempDir::new().unwrap();
    let mut clean = InMemoryTrace::new();
    let mut corrupt = InMemoryTrace::new();
    for layer in 0..4 {
        let base = activation(3, 4, 1.0 + layer as f32);
        clean.add_activation(layer, Component::Residual, &base, None).unwrap();
        // layers 1 and 3 change a lot, the others barely
        let shift = if layer % 2 == 1 { 5.0 } else { 0.001 };
        let moved = (&base + shift).unwrap();
        corrupt.add_activation(layer, Component::Residual, &moved, None).unwrap();
    }
    let clean_path = dir.path().join("clean.safetensors");
    let corrupt_path = dir.path().join("corrupt.safetensors");
    clean.save_safetensors(&clean_path).unwrap();
    corrupt.save_safetensors(&corrupt_path).unwrap();

    let clean = InMemoryTrace::load_safetensors(&clean_path).unwrap();
    let corrupt = InMemoryTrace::load_safetensors(&corrupt_path).unwrap();
    let circuit = CircuitDiscoverer::new()
        .discover("shift", &clean, &corrupt)
        .unwrap();
    let labels: Vec<String> = circuit.nodes().iter().map(|n| n.label()).collect();
    assert_eq!(labels, vec!["L1RES", "L3RES"]);
    assert_eq!(circuit.edges().len(), 1);
    assert_eq!(circuit.minimal(0.6).edges().len(), 0);
    assert!(circuit.to_dot().contains("\"L1RES\" -> \"L3RES\""));
}

#[test]
fn test_sae_over_trace_and_cache() {
    let hidden = 4;
    let eye = Tensor::eye(hidden, DType::F32, &Device::Cpu).unwrap();
    let codec = SaeCodec::new(
        eye.clone(),
        eye,
        None,
        None,
        Some(
            SaeConfig::new(hidden, hidden)
                .with_topk(2)
                .with_hook_point("blocks.1.hook_resid_post"),
        ),
    )
    .unwrap();
    let mut analyzer = SaeAnalyzer::new();
    analyzer.register_sae("res1", codec);

    let mut cache: TraceCache = TraceCache::new(2);
    let mut ids = Vec::new();
    for offset in [0.0f32, 1.0, 2.0] {
        let mut trace = InMemoryTrace::new();
        trace
            .add_activation(1, Component::Residual, &activation(3, hidden, offset), None)
            .unwrap();
        ids.push(cache.insert(trace));
    }
    assert_eq!(cache.len(), 2);
    assert!(cache.get(&ids[0]).is_none());

    let clean = analyzer.analyze_trace(cache.get(&ids[1]).unwrap()).unwrap();
    let shifted = analyzer.analyze_trace(cache.get(&ids[2]).unwrap()).unwrap();
    let features = &clean["res1"];
    assert_eq!(features.shape(), &[1, 3, hidden]);
    for active in features.active_features(0.0).unwrap() {
        assert!(active.len() <= 2);
    }

    let behavior = analyzer
        .find_behavior_features(features, &shifted["res1"], 0.5)
        .unwrap();
    // top-2 keeps the two largest inputs, features 2 and 3, which are 1.0 lower in the clean run
    assert!(behavior.activated.is_empty());
    assert_eq!(behavior.deactivated, vec![2, 3]);

    let mut by_name = BTreeMap::new();
    by_name.insert("res1".to_string(), activation(2, hidden, 0.0));
    assert_eq!(analyzer.analyze_activations(&by_name).unwrap().len(), 1);
}
