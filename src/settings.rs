//! Process settings, read from the environment once and passed around explicitly.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::{TraceCache, DEFAULT_MAX_SIZE};
use crate::storage::StreamingConfig;

pub const ENV_STORAGE_ROOT: &str = "MICROSCOPE_STORAGE_ROOT";
pub const ENV_TRACE_CACHE_SIZE: &str = "MICROSCOPE_TRACE_CACHE_SIZE";
pub const ENV_MEMORY_LIMIT_GB: &str = "MICROSCOPE_MEMORY_LIMIT_GB";
pub const ENV_USE_MMAP: &str = "MICROSCOPE_USE_MMAP";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSettings {
    /// Parent directory for streaming traces
    pub storage_root: PathBuf,
    pub trace_cache_max_size: usize,
    pub memory_limit_gb: f64,
    pub use_mmap: bool,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./traces"),
            trace_cache_max_size: DEFAULT_MAX_SIZE,
            memory_limit_gb: 4.0,
            use_mmap: true,
        }
    }
}

impl ScopeSettings {
    /// Defaults overridden by any `MICROSCOPE_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(root) = lookup(ENV_STORAGE_ROOT) {
            settings.storage_root = PathBuf::from(root);
        }
        if let Some(v) = lookup(ENV_TRACE_CACHE_SIZE) {
            settings.trace_cache_max_size = parse_var(ENV_TRACE_CACHE_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_MEMORY_LIMIT_GB) {
            settings.memory_limit_gb = parse_var(ENV_MEMORY_LIMIT_GB, &v)?;
            anyhow::ensure!(
                settings.memory_limit_gb > 0.0,
                "{ENV_MEMORY_LIMIT_GB} must be positive, got {v}"
            );
        }
        if let Some(v) = lookup(ENV_USE_MMAP) {
            settings.use_mmap = parse_bool(&v)
                .with_context(|| format!("Invalid {ENV_USE_MMAP}: {v:?}"))?;
        }
        Ok(settings)
    }

    /// Streaming config for a trace stored under `storage_root/name`.
    pub fn streaming_config(&self, name: &str) -> StreamingConfig {
        StreamingConfig::new(self.storage_root.join(name))
            .with_mmap(self.use_mmap)
            .with_memory_limit_bytes((self.memory_limit_gb * 1024.0 * 1024.0 * 1024.0) as u64)
    }

    pub fn trace_cache<T>(&self) -> TraceCache<T> {
        TraceCache::new(self.trace_cache_max_size)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {name}: {value:?}"))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let settings = ScopeSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, ScopeSettings::default());
    }

    #[test]
    fn test_overrides() {
        let settings = ScopeSettings::from_lookup(lookup(&[
            (ENV_STORAGE_ROOT, "/data/traces"),
            (ENV_TRACE_CACHE_SIZE, "7"),
            (ENV_MEMORY_LIMIT_GB, "0.5"),
            (ENV_USE_MMAP, "off"),
        ]))
        .unwrap();
        assert_eq!(settings.storage_root, PathBuf::from("/data/traces"));
        assert_eq!(settings.trace_cache_max_size, 7);
        assert_eq!(settings.memory_limit_gb, 0.5);
        assert!(!settings.use_mmap);

        let config = settings.streaming_config("run1");
        assert_eq!(config.storage_dir, PathBuf::from("/data/traces/run1"));
        assert_eq!(config.memory_limit_bytes, 512 * 1024 * 1024);
        assert!(!config.use_mmap);
        assert_eq!(settings.trace_cache::<u8>().max_size(), 7);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ScopeSettings::from_lookup(lookup(&[(ENV_TRACE_CACHE_SIZE, "lots")])).is_err());
        assert!(ScopeSettings::from_lookup(lookup(&[(ENV_MEMORY_LIMIT_GB, "-1")])).is_err());
        assert!(ScopeSettings::from_lookup(lookup(&[(ENV_USE_MMAP, "maybe")])).is_err());
    }
}
