//! Activation keys: which (layer, component) stream a tensor belongs to.
//!
//! [`Component`] names follow the capture callback convention
//! (`residual`, `attn_out`, `mlp_out`), and [`ActivationKey`] renders as
//! `{layer}_{component}`, the index key used by on-disk chunk storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the three per-layer activation streams a trace can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Residual stream after the layer (`residual`)
    Residual,
    /// Attention block output (`attn_out`)
    AttnOut,
    /// MLP block output (`mlp_out`)
    MlpOut,
}

impl Component {
    /// All components, in canonical capture order.
    pub const ALL: [Component; 3] = [Component::Residual, Component::AttnOut, Component::MlpOut];

    /// Canonical component name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Residual => "residual",
            Self::AttnOut => "attn_out",
            Self::MlpOut => "mlp_out",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "residual" => Ok(Self::Residual),
            "attn_out" => Ok(Self::AttnOut),
            "mlp_out" => Ok(Self::MlpOut),
            other => anyhow::bail!(
                "Unknown component '{other}' (expected residual, attn_out or mlp_out)"
            ),
        }
    }
}

/// Identifies a captured tensor stream within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActivationKey {
    pub layer: usize,
    pub component: Component,
}

impl ActivationKey {
    pub fn new(layer: usize, component: Component) -> Self {
        Self { layer, component }
    }
}

impl fmt::Display for ActivationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.layer, self.component)
    }
}

impl FromStr for ActivationKey {
    type Err = anyhow::Error;

    /// Parses `{layer}_{component}`; the component itself may contain `_`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (layer, component) = s
            .split_once('_')
            .ok_or_else(|| anyhow::anyhow!("Malformed activation key '{s}'"))?;
        let layer: usize = layer
            .parse()
            .map_err(|_| anyhow::anyhow!("Malformed layer index in activation key '{s}'"))?;
        Ok(Self::new(layer, component.parse()?))
    }
}
