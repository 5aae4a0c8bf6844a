//! Architecture adapters
//!
//! Capture sources need to know where a model keeps its layer stack and
//! sub-modules, and the core needs layer count, width and head count to size
//! a capture. An [`ArchitectureAdapter`] answers both for one model family,
//! reading shape hyperparameters from a HuggingFace `config.json`.
//!
//! Families are chosen from the config's `model_type` tag. Tags with no
//! dedicated adapter go through a fallback chain (Llama layout first, then
//! GPT-2), keeping the first adapter that can read the config.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::key::Component;

/// Transformer families recognized from `model_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Llama,
    Mistral,
    Qwen,
    Gemma,
    Gpt2,
    GptJ,
    GptNeo,
    Falcon,
    Phi,
    Unknown,
}

impl Architecture {
    /// Map a `model_type` tag (case-insensitive, `-` same as `_`).
    pub fn from_model_type(model_type: &str) -> Self {
        match model_type.to_lowercase().replace('-', "_").as_str() {
            "llama" | "llama2" | "llama3" | "code_llama" => Self::Llama,
            "mistral" | "mixtral" => Self::Mistral,
            "qwen" | "qwen2" => Self::Qwen,
            "gemma" | "gemma2" => Self::Gemma,
            "gpt2" | "gpt_2" => Self::Gpt2,
            "gptj" | "gpt_j" => Self::GptJ,
            "gpt_neo" | "gpt_neox" => Self::GptNeo,
            "falcon" | "refinedweb" => Self::Falcon,
            "phi" | "phi3" => Self::Phi,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llama => "llama",
            Self::Mistral => "mistral",
            Self::Qwen => "qwen",
            Self::Gemma => "gemma",
            Self::Gpt2 => "gpt2",
            Self::GptJ => "gptj",
            Self::GptNeo => "gpt_neo",
            Self::Falcon => "falcon",
            Self::Phi => "phi",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where one model family keeps its modules, and how to read its shape.
pub trait ArchitectureAdapter {
    fn architecture(&self) -> Architecture;

    /// Dotted path of the layer list, e.g. `model.layers`
    fn layers_path(&self) -> &'static str;
    /// Attention module name within a layer
    fn attention_module(&self) -> &'static str;
    /// MLP module name within a layer
    fn mlp_module(&self) -> &'static str;

    /// Norm modules within a layer as `(role, name)` pairs.
    fn layer_norm_modules(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    fn num_heads(&self, config: &Value) -> Result<usize>;
    fn hidden_size(&self, config: &Value) -> Result<usize>;
    fn num_layers(&self, config: &Value) -> Result<usize>;

    fn head_dim(&self, config: &Value) -> Result<usize> {
        let heads = self.num_heads(config)?;
        anyhow::ensure!(heads > 0, "Config reports zero attention heads");
        Ok(self.hidden_size(config)? / heads)
    }

    /// Full module path whose output is `component` at `layer`.
    fn module_path(&self, layer: usize, component: Component) -> String {
        let base = format!("{}.{layer}", self.layers_path());
        match component {
            Component::Residual => base,
            Component::AttnOut => format!("{base}.{}", self.attention_module()),
            Component::MlpOut => format!("{base}.{}", self.mlp_module()),
        }
    }
}

/// First present key among `keys`, as a usize.
fn config_usize(config: &Value, keys: &[&str]) -> Result<usize> {
    keys.iter()
        .find_map(|k| config.get(*k).and_then(Value::as_u64))
        .map(|v| v as usize)
        .with_context(|| format!("Config has none of {keys:?}"))
}

/// `model.layers` / `self_attn` / `mlp` layout (Llama, Mistral, Qwen).
#[derive(Debug, Clone, Copy)]
pub struct LlamaAdapter {
    architecture: Architecture,
}

impl LlamaAdapter {
    pub fn new(architecture: Architecture) -> Self {
        Self { architecture }
    }
}

impl Default for LlamaAdapter {
    fn default() -> Self {
        Self::new(Architecture::Llama)
    }
}

impl ArchitectureAdapter for LlamaAdapter {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn layers_path(&self) -> &'static str {
        "model.layers"
    }

    fn attention_module(&self) -> &'static str {
        "self_attn"
    }

    fn mlp_module(&self) -> &'static str {
        "mlp"
    }

    fn layer_norm_modules(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("pre_attn", "input_layernorm"),
            ("pre_mlp", "post_attention_layernorm"),
        ]
    }

    fn num_heads(&self, config: &Value) -> Result<usize> {
        config_usize(config, &["num_attention_heads"])
    }

    fn hidden_size(&self, config: &Value) -> Result<usize> {
        config_usize(config, &["hidden_size"])
    }

    fn num_layers(&self, config: &Value) -> Result<usize> {
        config_usize(config, &["num_hidden_layers"])
    }
}

/// Llama layout with Gemma 2's extra norms and explicit `head_dim`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GemmaAdapter;

impl ArchitectureAdapter for GemmaAdapter {
    fn architecture(&self) -> Architecture {
        Architecture::Gemma
    }

    fn layers_path(&self) -> &'static str {
        "model.layers"
    }

    fn attention_module(&self) -> &'static str {
        "self_attn"
    }

    fn mlp_module(&self) -> &'static str {
        "mlp"
    }

    fn layer_norm_modules(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("pre_attn", "input_layernorm"),
            ("post_attn", "post_attention_layernorm"),
            ("pre_mlp", "pre_feedforward_layernorm"),
            ("post_mlp", "post_feedforward_layernorm"),
        ]
    }

    fn num_heads(&self, config: &Value) -> Result<usize> {
        config_usize(config, &["num_attention_heads"])
    }

    fn hidden_size(&self, config: &Value) -> Result<usize> {
        config_usize(config, &["hidden_size"])
    }

    fn num_layers(&self, config: &Value) -> Result<usize> {
        config_usize(config, &["num_hidden_layers"])
    }

    fn head_dim(&self, config: &Value) -> Result<usize> {
        match config_usize(config, &["head_dim"]) {
            Ok(d) => Ok(d),
            Err(_) => Ok(self.hidden_size(config)? / self.num_heads(config)?.max(1)),
        }
    }
}

/// `transformer.h` / `attn` / `mlp` layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gpt2Adapter;

impl ArchitectureAdapter for Gpt2Adapter {
    fn architecture(&self) -> Architecture {
        Architecture::Gpt2
    }

    fn layers_path(&self) -> &'static str {
        "transformer.h"
    }

    fn attention_module(&self) -> &'static str {
        "attn"
    }

    fn mlp_module(&self) -> &'static str {
        "mlp"
    }

    fn layer_norm_modules(&self) -> &'static [(&'static str, &'static str)] {
        &[("pre_attn", "ln_1"), ("pre_mlp", "ln_2")]
    }

    fn num_heads(&self, config: &Value) -> Result<usize> {
        config_usize(config, &["n_head", "num_attention_heads"])
    }

    fn hidden_size(&self, config: &Value) -> Result<usize> {
        config_usize(config, &["n_embd", "hidden_size"])
    }

    fn num_layers(&self, config: &Value) -> Result<usize> {
        config_usize(config, &["n_layer", "num_hidden_layers"])
    }
}

/// Dedicated adapter for a family, if one exists.
fn dedicated(architecture: Architecture) -> Option<Box<dyn ArchitectureAdapter>> {
    match architecture {
        Architecture::Llama | Architecture::Mistral | Architecture::Qwen => {
            Some(Box::new(LlamaAdapter::new(architecture)))
        }
        Architecture::Gemma => Some(Box::new(GemmaAdapter)),
        Architecture::Gpt2 => Some(Box::new(Gpt2Adapter)),
        _ => None,
    }
}

fn fallback_chain() -> [Box<dyn ArchitectureAdapter>; 2] {
    [Box::new(LlamaAdapter::default()), Box::new(Gpt2Adapter)]
}

/// Adapter for a `model_type` tag. Tags without a dedicated adapter get the
/// first entry of the fallback chain (Llama layout).
pub fn adapter_for(tag: &str) -> Box<dyn ArchitectureAdapter> {
    let architecture = Architecture::from_model_type(tag);
    if let Some(adapter) = dedicated(architecture) {
        return adapter;
    }
    warn!("No adapter for architecture '{tag}', falling back to llama layout");
    Box::new(LlamaAdapter::default())
}

/// Adapter for a parsed `config.json`, walking the fallback chain (Llama,
/// then GPT-2) until one can read the layer count.
pub fn adapter_for_config(config: &Value) -> Result<Box<dyn ArchitectureAdapter>> {
    let tag = config
        .get("model_type")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    if let Some(adapter) = dedicated(Architecture::from_model_type(tag)) {
        return Ok(adapter);
    }
    for adapter in fallback_chain() {
        if adapter.num_layers(config).is_ok() {
            warn!(
                "Using {} adapter as fallback for architecture '{tag}'; some features may not work",
                adapter.architecture()
            );
            return Ok(adapter);
        }
    }
    anyhow::bail!("No adapter can read config for architecture '{tag}'")
}

/// Shape hyperparameters needed to size a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelShape {
    pub architecture: Architecture,
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
}

impl ModelShape {
    pub fn from_config(config: &Value) -> Result<Self> {
        let adapter = adapter_for_config(config)?;
        Ok(Self {
            architecture: adapter.architecture(),
            num_layers: adapter.num_layers(config)?,
            hidden_size: adapter.hidden_size(config)?,
            num_heads: adapter.num_heads(config)?,
        })
    }

    /// Read a local `config.json`.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Value = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Self::from_config(&config)
    }

    /// Download `config.json` from a HuggingFace model repo.
    pub fn from_hub(model_id: &str) -> Result<Self> {
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let shape = Self::from_config_file(path)?;
        info!(
            "{model_id}: {} layers, hidden={}, heads={} ({})",
            shape.num_layers, shape.hidden_size, shape.num_heads, shape.architecture
        );
        Ok(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_model_type() {
        assert_eq!(Architecture::from_model_type("LLaMA"), Architecture::Llama);
        assert_eq!(Architecture::from_model_type("mixtral"), Architecture::Mistral);
        assert_eq!(Architecture::from_model_type("qwen2"), Architecture::Qwen);
        assert_eq!(Architecture::from_model_type("gemma2"), Architecture::Gemma);
        assert_eq!(Architecture::from_model_type("gpt-2"), Architecture::Gpt2);
        assert_eq!(Architecture::from_model_type("gpt-j"), Architecture::GptJ);
        assert_eq!(Architecture::from_model_type("gpt_neox"), Architecture::GptNeo);
        assert_eq!(Architecture::from_model_type("refinedweb"), Architecture::Falcon);
        assert_eq!(Architecture::from_model_type("phi"), Architecture::Phi);
        assert_eq!(Architecture::from_model_type("rwkv"), Architecture::Unknown);
    }

    #[test]
    fn test_adapter_for_tag() {
        assert_eq!(adapter_for("gpt2").layers_path(), "transformer.h");
        let qwen = adapter_for("qwen2");
        assert_eq!(qwen.architecture(), Architecture::Qwen);
        assert_eq!(qwen.module_path(3, Component::AttnOut), "model.layers.3.self_attn");
        let unknown = adapter_for("mamba");
        assert_eq!(unknown.architecture(), Architecture::Llama);
        assert_eq!(unknown.module_path(0, Component::Residual), "model.layers.0");
    }

    #[test]
    fn test_gpt2_config() {
        let config = json!({"model_type": "gpt2", "n_layer": 12, "n_embd": 768, "n_head": 12});
        let shape = ModelShape::from_config(&config).unwrap();
        assert_eq!(shape.architecture, Architecture::Gpt2);
        assert_eq!((shape.num_layers, shape.hidden_size, shape.num_heads), (12, 768, 12));
        assert_eq!(Gpt2Adapter.head_dim(&config).unwrap(), 64);
        assert_eq!(Gpt2Adapter.module_path(5, Component::MlpOut), "transformer.h.5.mlp");
    }

    #[test]
    fn test_gemma_head_dim() {
        let config = json!({
            "model_type": "gemma2",
            "num_hidden_layers": 26,
            "hidden_size": 2304,
            "num_attention_heads": 8,
            "head_dim": 256
        });
        let adapter = adapter_for_config(&config).unwrap();
        assert_eq!(adapter.head_dim(&config).unwrap(), 256);
        assert_eq!(adapter.layer_norm_modules().len(), 4);
    }

    #[test]
    fn test_fallback_chain() {
        // GPT-J uses GPT-2 style keys, which the Llama layout does not read
        let gptj = json!({"model_type": "gptj", "n_layer": 28, "n_embd": 4096, "n_head": 16});
        assert_eq!(
            adapter_for_config(&gptj).unwrap().architecture(),
            Architecture::Gpt2
        );
        let phi = json!({"model_type": "phi", "num_hidden_layers": 32, "hidden_size": 2560, "num_attention_heads": 32});
        assert_eq!(
            adapter_for_config(&phi).unwrap().architecture(),
            Architecture::Llama
        );
        assert!(adapter_for_config(&json!({"model_type": "mystery"})).is_err());
    }

    #[test]
    fn test_missing_key_is_error() {
        let config = json!({"model_type": "llama", "hidden_size": 4096});
        assert!(ModelShape::from_config(&config).is_err());
    }
}
