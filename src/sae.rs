//! Sparse autoencoder (SAE) encode/decode
//!
//! [`SaeCodec`] maps hidden activations `[..., d_in]` to sparse features
//! `[..., d_sae]` and back:
//!
//! ```text
//! Encode:  f = act((x - b_dec) @ W_enc + b_enc)
//! Decode:  x_hat = f @ W_dec + b_dec
//! ```
//!
//! Weights follow the SAELens safetensors layout: `W_enc [d_in, d_sae]`,
//! `W_dec [d_sae, d_in]`, and optional `b_enc [d_sae]`, `b_dec [d_in]`.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::key::Component;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Sparsification applied after the encoder affine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaeActivation {
    Relu,
    /// Keep the k largest pre-activations per position (`SaeConfig::k`)
    TopK,
    /// Treated as ReLU
    JumpRelu,
}

impl fmt::Display for SaeActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Relu => "relu",
            Self::TopK => "topk",
            Self::JumpRelu => "jumprelu",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaeConfig {
    /// Model hidden size
    pub d_in: usize,
    /// Feature dimension
    pub d_sae: usize,
    pub activation: SaeActivation,
    /// Required for `TopK`
    pub k: Option<usize>,
    /// Hook name, e.g. `blocks.8.hook_resid_post`
    pub hook_point: String,
    pub layer: usize,
}

impl SaeConfig {
    pub fn new(d_in: usize, d_sae: usize) -> Self {
        Self {
            d_in,
            d_sae,
            activation: SaeActivation::Relu,
            k: None,
            hook_point: String::new(),
            layer: 0,
        }
    }

    pub fn with_topk(mut self, k: usize) -> Self {
        self.activation = SaeActivation::TopK;
        self.k = Some(k);
        self
    }

    pub fn with_activation(mut self, activation: SaeActivation) -> Self {
        self.activation = activation;
        self
    }

    /// Set the hook point; the layer is taken from a `blocks.{n}.` prefix when present.
    pub fn with_hook_point(mut self, hook_point: impl Into<String>) -> Self {
        self.hook_point = hook_point.into();
        if let Some(layer) = layer_from_hook_point(&self.hook_point) {
            self.layer = layer;
        }
        self
    }

    pub fn with_layer(mut self, layer: usize) -> Self {
        self.layer = layer;
        self
    }

    /// Trace component this SAE reads, from the hook point suffix (residual by default).
    pub fn component(&self) -> Component {
        if self.hook_point.ends_with("hook_attn_out") {
            Component::AttnOut
        } else if self.hook_point.ends_with("hook_mlp_out") {
            Component::MlpOut
        } else {
            Component::Residual
        }
    }
}

/// Layer index of a `blocks.{n}.…` hook point.
pub fn layer_from_hook_point(hook_point: &str) -> Option<usize> {
    hook_point
        .split_once("blocks.")?
        .1
        .split('.')
        .next()?
        .parse()
        .ok()
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Encoded feature activations with sparsity statistics computed up front.
#[derive(Debug, Clone)]
pub struct SaeFeatures {
    /// `[..., d_sae]`, F32
    activations: Tensor,
    sparsity: f32,
    mean_active: f32,
}

impl SaeFeatures {
    pub fn new(activations: Tensor) -> Result<Self> {
        anyhow::ensure!(
            activations.rank() >= 1,
            "Feature activations need a feature axis, got a scalar"
        );
        let activations = activations.to_dtype(DType::F32)?;
        let data: Vec<f32> = activations.flatten_all()?.to_vec1()?;

        let zeros = data.iter().filter(|&&v| v == 0.0).count();
        let sparsity = if data.is_empty() {
            0.0
        } else {
            zeros as f32 / data.len() as f32
        };

        let d_sae = activations.dims()[activations.rank() - 1];
        let active = |row: &[f32]| row.iter().filter(|&&v| v > 0.0).count();
        let mean_active = if activations.rank() == 1 {
            active(&data) as f32
        } else if d_sae == 0 || data.is_empty() {
            0.0
        } else {
            let rows = data.len() / d_sae;
            data.chunks_exact(d_sae).map(active).sum::<usize>() as f32 / rows as f32
        };

        Ok(Self {
            activations,
            sparsity,
            mean_active,
        })
    }

    pub fn activations(&self) -> &Tensor {
        &self.activations
    }

    pub fn shape(&self) -> &[usize] {
        self.activations.dims()
    }

    pub fn d_sae(&self) -> usize {
        let dims = self.activations.dims();
        dims[dims.len() - 1]
    }

    /// Fraction of exactly-zero activations.
    pub fn sparsity(&self) -> f32 {
        self.sparsity
    }

    /// Mean count of positive features per position.
    pub fn mean_active_features(&self) -> f32 {
        self.mean_active
    }

    /// Activations as `[positions][d_sae]` rows.
    pub fn rows(&self) -> Result<Vec<Vec<f32>>> {
        let d_sae = self.d_sae();
        let data: Vec<f32> = self.activations.flatten_all()?.to_vec1()?;
        if d_sae == 0 {
            return Ok(Vec::new());
        }
        Ok(data.chunks_exact(d_sae).map(<[f32]>::to_vec).collect())
    }

    pub fn num_positions(&self) -> usize {
        let d_sae = self.d_sae();
        if d_sae == 0 {
            0
        } else {
            self.activations.elem_count() / d_sae
        }
    }

    /// Per position, indices of features strictly above `threshold`.
    pub fn active_features(&self, threshold: f32) -> Result<Vec<Vec<usize>>> {
        Ok(self
            .rows()?
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(_, &v)| v > threshold)
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect())
    }

    /// Per position, up to `k` `(feature, value)` pairs with the largest
    /// values, keeping only positive ones.
    pub fn top_k_features(&self, k: usize) -> Result<Vec<Vec<(usize, f32)>>> {
        Ok(self
            .rows()?
            .into_iter()
            .map(|row| {
                let mut indexed: Vec<(usize, f32)> = row.into_iter().enumerate().collect();
                indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
                indexed.into_iter().take(k).filter(|(_, v)| *v > 0.0).collect()
            })
            .collect())
    }

    /// Fraction of positions on which each feature exceeds `threshold`.
    pub fn feature_frequency(&self, threshold: f32) -> Result<Vec<f32>> {
        let rows = self.rows()?;
        let mut counts = vec![0usize; self.d_sae()];
        for row in &rows {
            for (count, &v) in counts.iter_mut().zip(row) {
                if v > threshold {
                    *count += 1;
                }
            }
        }
        let n = rows.len().max(1) as f32;
        Ok(counts.into_iter().map(|c| c as f32 / n).collect())
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Linear SAE encoder/decoder pair.
#[derive(Debug, Clone)]
pub struct SaeCodec {
    w_enc: Tensor,
    w_dec: Tensor,
    b_enc: Option<Tensor>,
    b_dec: Option<Tensor>,
    config: SaeConfig,
}

impl SaeCodec {
    /// Build from weights. With no config, dimensions come from `w_enc` and
    /// the activation is ReLU.
    pub fn new(
        w_enc: Tensor,
        w_dec: Tensor,
        b_enc: Option<Tensor>,
        b_dec: Option<Tensor>,
        config: Option<SaeConfig>,
    ) -> Result<Self> {
        let (d_in, d_sae) = w_enc.dims2().context("W_enc must be [d_in, d_sae]")?;
        let config = config.unwrap_or_else(|| SaeConfig::new(d_in, d_sae));
        anyhow::ensure!(
            (config.d_in, config.d_sae) == (d_in, d_sae),
            "Config dims ({}, {}) disagree with W_enc {:?}",
            config.d_in,
            config.d_sae,
            w_enc.dims()
        );
        anyhow::ensure!(
            w_dec.dims() == [d_sae, d_in],
            "W_dec must be [{d_sae}, {d_in}], got {:?}",
            w_dec.dims()
        );
        if let Some(b) = &b_enc {
            anyhow::ensure!(b.dims() == [d_sae], "b_enc must be [{d_sae}], got {:?}", b.dims());
        }
        if let Some(b) = &b_dec {
            anyhow::ensure!(b.dims() == [d_in], "b_dec must be [{d_in}], got {:?}", b.dims());
        }
        if config.activation == SaeActivation::TopK {
            anyhow::ensure!(config.k.is_some(), "topk activation requires k");
        }

        let f32_opt = |t: Option<Tensor>| t.map(|t| t.to_dtype(DType::F32)).transpose();
        Ok(Self {
            w_enc: w_enc.to_dtype(DType::F32)?,
            w_dec: w_dec.to_dtype(DType::F32)?,
            b_enc: f32_opt(b_enc)?,
            b_dec: f32_opt(b_dec)?,
            config,
        })
    }

    /// Load SAELens-layout weights from a safetensors file.
    pub fn from_safetensors(path: impl AsRef<Path>, config: Option<SaeConfig>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to deserialize {}", path.display()))?;

        let w_enc = tensor_from_view(&st.tensor("W_enc").context("Tensor 'W_enc' not found")?)?;
        let w_dec = tensor_from_view(&st.tensor("W_dec").context("Tensor 'W_dec' not found")?)?;
        let b_enc = st.tensor("b_enc").ok().map(|v| tensor_from_view(&v)).transpose()?;
        let b_dec = st.tensor("b_dec").ok().map(|v| tensor_from_view(&v)).transpose()?;

        let codec = Self::new(w_enc, w_dec, b_enc, b_dec, config)?;
        info!(
            "Loaded SAE from {}: d_in={}, d_sae={}, activation={}",
            path.display(),
            codec.d_in(),
            codec.d_sae(),
            codec.config.activation
        );
        Ok(codec)
    }

    /// Download `filename` from a HuggingFace repo and load it.
    pub fn from_hub(repo_id: &str, filename: &str, config: Option<SaeConfig>) -> Result<Self> {
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));
        info!("Downloading {filename} from {repo_id}");
        let path = repo
            .get(filename)
            .with_context(|| format!("Failed to download {filename}"))?;
        Self::from_safetensors(&path, config)
    }

    pub fn config(&self) -> &SaeConfig {
        &self.config
    }

    pub fn d_in(&self) -> usize {
        self.config.d_in
    }

    pub fn d_sae(&self) -> usize {
        self.config.d_sae
    }

    /// Encode `[..., d_in]` activations into `[..., d_sae]` features.
    pub fn encode(&self, activations: &Tensor) -> Result<SaeFeatures> {
        let (leading, flat) = flatten_positions(activations, self.d_in(), "d_in")?;

        let centered = match &self.b_dec {
            Some(b) => flat.broadcast_sub(b)?,
            None => flat,
        };
        let mut features = centered.matmul(&self.w_enc)?;
        if let Some(b) = &self.b_enc {
            features = features.broadcast_add(b)?;
        }

        let features = match (self.config.activation, self.config.k) {
            (SaeActivation::TopK, Some(k)) => apply_topk(&features, k)?,
            (SaeActivation::TopK, None) => features,
            (SaeActivation::Relu | SaeActivation::JumpRelu, _) => features.relu()?,
        };

        let mut shape = leading;
        shape.push(self.d_sae());
        SaeFeatures::new(features.reshape(shape)?)
    }

    /// Decode `[..., d_sae]` features into `[..., d_in]` activations.
    pub fn decode(&self, features: &Tensor) -> Result<Tensor> {
        let (leading, flat) = flatten_positions(features, self.d_sae(), "d_sae")?;
        let mut out = flat.matmul(&self.w_dec)?;
        if let Some(b) = &self.b_dec {
            out = out.broadcast_add(b)?;
        }
        let mut shape = leading;
        shape.push(self.d_in());
        Ok(out.reshape(shape)?)
    }

    /// Mean squared error between `activations` and their reconstruction.
    pub fn reconstruction_error(
        &self,
        activations: &Tensor,
        features: Option<&SaeFeatures>,
    ) -> Result<f32> {
        let encoded;
        let features = match features {
            Some(f) => f,
            None => {
                encoded = self.encode(activations)?;
                &encoded
            }
        };
        let reconstructed = self.decode(features.activations())?;
        let diff = (activations.to_dtype(DType::F32)? - reconstructed)?;
        Ok(diff.sqr()?.mean_all()?.to_scalar()?)
    }
}

/// Split off leading axes and flatten to `[positions, dim]` F32.
fn flatten_positions(t: &Tensor, dim: usize, name: &str) -> Result<(Vec<usize>, Tensor)> {
    let dims = t.dims();
    anyhow::ensure!(
        dims.last() == Some(&dim),
        "Expected last axis {name}={dim}, got shape {dims:?}"
    );
    let leading = dims[..dims.len() - 1].to_vec();
    let positions: usize = leading.iter().product();
    let flat = t.to_dtype(DType::F32)?.reshape((positions, dim))?;
    Ok((leading, flat))
}

/// Keep the k largest raw values per row, then zero any kept value that is not positive.
fn apply_topk(features: &Tensor, k: usize) -> Result<Tensor> {
    let (positions, d_sae) = features.dims2()?;
    let data: Vec<f32> = features.flatten_all()?.to_vec1()?;
    let mut out = vec![0.0f32; data.len()];

    if d_sae > 0 {
        for (row, dst) in data.chunks_exact(d_sae).zip(out.chunks_exact_mut(d_sae)) {
            let mut order: Vec<usize> = (0..d_sae).collect();
            order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
            for &idx in order.iter().take(k) {
                if row[idx] > 0.0 {
                    dst[idx] = row[idx];
                }
            }
        }
    }

    Ok(Tensor::from_vec(out, (positions, d_sae), features.device())?)
}

/// Convert a safetensors view (BF16/F16/F32) to an F32 CPU tensor.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!("Unsupported SAE tensor dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, &Device::Cpu)?;
    Ok(tensor.to_dtype(DType::F32)?)
}
