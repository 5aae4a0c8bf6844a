//! Activation traces: where captured tensors live after a forward pass.
//!
//! Two implementations share the [`Trace`] contract:
//! - [`InMemoryTrace`]: every tensor (and attention patterns) held in memory
//! - [`StreamingTrace`]: tensors written through to [`ChunkStorage`], with
//!   optional per-key [`RingBuffer`]s for "recent window" queries
//!
//! Both accept tensors from an external capture source through
//! [`CaptureSink`], the `(layer, component_name, tensor)` callback contract.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use serde::Serialize;
use tracing::{debug, info};

use crate::attention::AttentionPattern;
use crate::key::{ActivationKey, Component};
use crate::ring_buffer::RingBuffer;
use crate::storage::{ChunkStorage, StreamingConfig};

/// Component name used by capture sources for attention patterns.
pub const ATTENTION_PATTERN_NAME: &str = "attn_pattern";

const INPUT_TOKENS_NAME: &str = "input_tokens";

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Read/write contract shared by every trace implementation.
///
/// A trace is written by a single capture session and read-only afterwards.
pub trait Trace {
    /// Record one activation. `token_range` defaults to `(0, 0)`.
    fn add_activation(
        &mut self,
        layer: usize,
        component: Component,
        tensor: &Tensor,
        token_range: Option<(usize, usize)>,
    ) -> Result<()>;

    /// Fetch a chunk; `None` when the key or chunk is absent.
    fn get(&self, layer: usize, component: Component, chunk_idx: usize)
        -> Result<Option<Tensor>>;

    /// Sorted unique layers that have any captured key.
    fn layers(&self) -> Vec<usize>;

    /// Token ids of the captured input, if recorded.
    fn input_tokens(&self) -> Option<&[u32]>;

    fn residual(&self, layer: usize) -> Result<Option<Tensor>> {
        self.get(layer, Component::Residual, 0)
    }

    fn attention_out(&self, layer: usize) -> Result<Option<Tensor>> {
        self.get(layer, Component::AttnOut, 0)
    }

    fn mlp_out(&self, layer: usize) -> Result<Option<Tensor>> {
        self.get(layer, Component::MlpOut, 0)
    }

    /// Like [`Trace::get`] for chunk 0, but a missing key is an error.
    fn require(&self, layer: usize, component: Component) -> Result<Tensor> {
        self.get(layer, component, 0)?
            .ok_or_else(|| anyhow::anyhow!("No {component} activation captured for layer {layer}"))
    }

    /// Per-position L2 norm over the last axis; `None` if the key is absent.
    fn token_norms(&self, layer: usize, component: Component) -> Result<Option<Tensor>> {
        match self.get(layer, component, 0)? {
            Some(tensor) => Ok(Some(l2_norm_last_axis(&tensor)?)),
            None => Ok(None),
        }
    }
}

/// Callback contract for capture sources: `(layer, component_name, tensor)`.
pub trait CaptureSink {
    fn capture(&mut self, layer: usize, component_name: &str, tensor: &Tensor) -> Result<()>;
}

fn l2_norm_last_axis(tensor: &Tensor) -> Result<Tensor> {
    Ok(tensor
        .to_dtype(DType::F32)?
        .sqr()?
        .sum(D::Minus1)?
        .sqrt()?)
}

fn parse_component(layer: usize, name: &str) -> Option<Component> {
    match name.parse::<Component>() {
        Ok(component) => Some(component),
        Err(_) => {
            debug!("Ignoring unknown component '{name}' at layer {layer}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Summary statistics of one captured tensor.
#[derive(Debug, Clone, Serialize)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    /// Population standard deviation
    pub std: f32,
}

impl TensorStats {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        anyhow::ensure!(!data.is_empty(), "Cannot compute statistics of an empty tensor");
        let n = data.len() as f32;
        let mean = data.iter().sum::<f32>() / n;
        let var = data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        Ok(Self {
            shape: tensor.dims().to_vec(),
            min: data.iter().copied().fold(f32::INFINITY, f32::min),
            max: data.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            mean,
            std: var.sqrt(),
        })
    }
}

// ---------------------------------------------------------------------------
// InMemoryTrace
// ---------------------------------------------------------------------------

/// Trace holding every tensor in process memory.
///
/// One tensor per key: re-adding a key replaces it, and only chunk 0 exists.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTrace {
    activations: BTreeMap<ActivationKey, Tensor>,
    attention: BTreeMap<usize, Tensor>,
    input_tokens: Option<Vec<u32>>,
    architecture: Option<String>,
}

impl InMemoryTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag the trace with the model architecture it came from.
    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    pub fn architecture(&self) -> Option<&str> {
        self.architecture.as_deref()
    }

    pub fn set_input_tokens(&mut self, tokens: Vec<u32>) {
        self.input_tokens = Some(tokens);
    }

    /// Record a layer's `[batch, heads, seq_q, seq_k]` attention weights.
    pub fn add_attention_pattern(&mut self, layer: usize, pattern: &Tensor) -> Result<()> {
        anyhow::ensure!(
            pattern.rank() == 4,
            "Attention pattern for layer {layer} must be [batch, heads, seq_q, seq_k], got {:?}",
            pattern.dims()
        );
        self.attention.insert(layer, pattern.clone());
        Ok(())
    }

    /// Attention pattern for a layer, if captured.
    pub fn attention(&self, layer: usize) -> Option<AttentionPattern> {
        let tensor = self.attention.get(&layer)?;
        AttentionPattern::new(layer, tensor.clone()).ok()
    }

    /// Attention pattern for a layer; a missing layer is an error.
    pub fn require_attention(&self, layer: usize) -> Result<AttentionPattern> {
        let tensor = self
            .attention
            .get(&layer)
            .ok_or_else(|| anyhow::anyhow!("No attention pattern captured for layer {layer}"))?;
        AttentionPattern::new(layer, tensor.clone())
    }

    /// Raw attention tensors keyed by layer.
    pub fn attention_tensors(&self) -> &BTreeMap<usize, Tensor> {
        &self.attention
    }

    pub fn attention_layers(&self) -> Vec<usize> {
        self.attention.keys().copied().collect()
    }

    /// All captured components of one layer.
    pub fn layer_activations(&self, layer: usize) -> BTreeMap<Component, &Tensor> {
        self.activations
            .iter()
            .filter(|(key, _)| key.layer == layer)
            .map(|(key, tensor)| (key.component, tensor))
            .collect()
    }

    pub fn keys(&self) -> Vec<ActivationKey> {
        self.activations.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty() && self.attention.is_empty()
    }

    /// Statistics for every captured activation.
    pub fn stats(&self) -> Result<BTreeMap<ActivationKey, TensorStats>> {
        self.activations
            .iter()
            .map(|(key, tensor)| Ok((*key, TensorStats::from_tensor(tensor)?)))
            .collect()
    }

    // --- Persistence ---

    /// Save activations, attention patterns and input tokens as safetensors.
    ///
    /// Names: `blocks.{layer}.{component}`, `blocks.{layer}.attn.hook_pattern`,
    /// and `input_tokens`.
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for (key, tensor) in &self.activations {
            tensors.insert(
                format!("blocks.{}.{}", key.layer, key.component),
                tensor.to_dtype(DType::F32)?,
            );
        }
        for (layer, tensor) in &self.attention {
            tensors.insert(
                format!("blocks.{layer}.attn.hook_pattern"),
                tensor.to_dtype(DType::F32)?,
            );
        }
        if let Some(tokens) = &self.input_tokens {
            tensors.insert(
                INPUT_TOKENS_NAME.to_string(),
                Tensor::from_vec(tokens.clone(), tokens.len(), &Device::Cpu)?,
            );
        }
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to save trace to {}", path.display()))?;
        info!(
            "Saved trace ({} activations, {} attention layers) to {}",
            self.activations.len(),
            self.attention.len(),
            path.display()
        );
        Ok(())
    }

    /// Load a trace written by [`InMemoryTrace::save_safetensors`].
    pub fn load_safetensors(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Failed to load trace from {}", path.display()))?;

        let mut trace = Self::new();
        for (name, tensor) in tensors {
            if name == INPUT_TOKENS_NAME {
                trace.input_tokens = Some(tensor.to_dtype(DType::U32)?.to_vec1()?);
                continue;
            }
            let parts: Vec<&str> = name.split('.').collect();
            match parts.as_slice() {
                ["blocks", layer, "attn", "hook_pattern"] => {
                    let layer: usize = layer
                        .parse()
                        .with_context(|| format!("Bad layer index in tensor name '{name}'"))?;
                    trace.add_attention_pattern(layer, &tensor)?;
                }
                ["blocks", layer, component] => {
                    let layer: usize = layer
                        .parse()
                        .with_context(|| format!("Bad layer index in tensor name '{name}'"))?;
                    let component: Component = component.parse()?;
                    trace
                        .activations
                        .insert(ActivationKey::new(layer, component), tensor);
                }
                _ => debug!("Ignoring unrecognized tensor '{name}' in {}", path.display()),
            }
        }
        Ok(trace)
    }
}

impl Trace for InMemoryTrace {
    fn add_activation(
        &mut self,
        layer: usize,
        component: Component,
        tensor: &Tensor,
        _token_range: Option<(usize, usize)>,
    ) -> Result<()> {
        self.activations
            .insert(ActivationKey::new(layer, component), tensor.clone());
        Ok(())
    }

    fn get(
        &self,
        layer: usize,
        component: Component,
        chunk_idx: usize,
    ) -> Result<Option<Tensor>> {
        if chunk_idx != 0 {
            return Ok(None);
        }
        Ok(self
            .activations
            .get(&ActivationKey::new(layer, component))
            .cloned())
    }

    fn layers(&self) -> Vec<usize> {
        let mut layers: Vec<usize> = self.activations.keys().map(|k| k.layer).collect();
        layers.dedup();
        layers
    }

    fn input_tokens(&self) -> Option<&[u32]> {
        self.input_tokens.as_deref()
    }
}

impl CaptureSink for InMemoryTrace {
    fn capture(&mut self, layer: usize, component_name: &str, tensor: &Tensor) -> Result<()> {
        if component_name == ATTENTION_PATTERN_NAME {
            return self.add_attention_pattern(layer, tensor);
        }
        match parse_component(layer, component_name) {
            Some(component) => self.add_activation(layer, component, tensor, None),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// StreamingTrace
// ---------------------------------------------------------------------------

/// Trace that writes through to disk and keeps only an index in memory.
#[derive(Debug)]
pub struct StreamingTrace {
    storage: ChunkStorage,
    ring_buffers: BTreeMap<ActivationKey, RingBuffer>,
    input_tokens: Option<Vec<u32>>,
}

impl StreamingTrace {
    pub fn new(config: StreamingConfig) -> Result<Self> {
        Ok(Self {
            storage: ChunkStorage::new(config)?,
            ring_buffers: BTreeMap::new(),
            input_tokens: None,
        })
    }

    pub fn storage(&self) -> &ChunkStorage {
        &self.storage
    }

    pub fn set_input_tokens(&mut self, tokens: Vec<u32>) {
        self.input_tokens = Some(tokens);
    }

    /// Mirror future writes for this key into a ring buffer.
    ///
    /// `capacity` defaults to the configured `ring_buffer_size`. Re-enabling
    /// an existing buffer keeps it unchanged.
    pub fn enable_ring_buffer(
        &mut self,
        layer: usize,
        component: Component,
        capacity: Option<usize>,
    ) -> Result<()> {
        let key = ActivationKey::new(layer, component);
        if self.ring_buffers.contains_key(&key) {
            return Ok(());
        }
        let capacity = capacity.unwrap_or(self.storage.config().ring_buffer_size);
        self.ring_buffers.insert(key, RingBuffer::new(capacity, key)?);
        debug!("Enabled ring buffer for {key} (capacity {capacity})");
        Ok(())
    }

    /// Last `n` tensors for a key from its ring buffer, most recent first.
    /// Empty when no buffer was enabled.
    pub fn get_recent(&self, layer: usize, component: Component, n: usize) -> Vec<Tensor> {
        self.ring_buffers
            .get(&ActivationKey::new(layer, component))
            .map(|rb| rb.recent(n))
            .unwrap_or_default()
    }

    /// Lazily iterate `(chunk_idx, tensor)` for a key, in write order.
    pub fn iter_layer(
        &self,
        layer: usize,
        component: Component,
    ) -> impl Iterator<Item = Result<(usize, Tensor)>> + '_ {
        self.storage.iter_chunks(layer, component)
    }

    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    /// Delete all stored data and drop ring buffer contents.
    pub fn cleanup(&mut self) -> Result<()> {
        for rb in self.ring_buffers.values_mut() {
            rb.clear();
        }
        self.storage.cleanup()
    }
}

impl Trace for StreamingTrace {
    fn add_activation(
        &mut self,
        layer: usize,
        component: Component,
        tensor: &Tensor,
        token_range: Option<(usize, usize)>,
    ) -> Result<()> {
        self.storage
            .store(layer, component, tensor, token_range.unwrap_or((0, 0)))?;
        if let Some(rb) = self
            .ring_buffers
            .get_mut(&ActivationKey::new(layer, component))
        {
            rb.push(tensor)?;
        }
        Ok(())
    }

    fn get(
        &self,
        layer: usize,
        component: Component,
        chunk_idx: usize,
    ) -> Result<Option<Tensor>> {
        self.storage.load(layer, component, chunk_idx)
    }

    fn layers(&self) -> Vec<usize> {
        self.storage.available_layers()
    }

    fn input_tokens(&self) -> Option<&[u32]> {
        self.input_tokens.as_deref()
    }
}

impl CaptureSink for StreamingTrace {
    fn capture(&mut self, layer: usize, component_name: &str, tensor: &Tensor) -> Result<()> {
        match parse_component(layer, component_name) {
            Some(component) => self.add_activation(layer, component, tensor, None),
            None => Ok(()),
        }
    }
}
