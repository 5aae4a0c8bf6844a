//! Disk-backed, append-only chunk storage for captured activations.
//!
//! One binary file per (layer, component) key holds concatenated
//! little-endian f32 values in write order, with no per-chunk header.
//! The chunk index lives in memory and is persisted to a JSON sidecar
//! (`metadata.json`) on [`ChunkStorage::flush`]:
//!
//! ```text
//! {
//!   "chunks":  { "0_residual": [ {layer, component, shape, dtype, offset, size_bytes, token_range}, ... ] },
//!   "offsets": { "0_residual": 12288 }
//! }
//! ```
//!
//! Opening a directory that already has a sidecar resumes from it.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::key::{ActivationKey, Component};
use crate::memory::CaptureStrategy;

/// Sidecar file name inside the storage directory.
pub const METADATA_FILE: &str = "metadata.json";

const BYTES_PER_F32: u64 = 4;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for streaming capture. Treat as an immutable value; use the
/// `with_*` builders to derive a changed copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Directory holding chunk files and the sidecar
    pub storage_dir: PathBuf,
    /// Soft memory budget used when choosing a capture strategy
    pub memory_limit_bytes: u64,
    /// Layers to capture (empty = all layers)
    pub capture_layers: Vec<usize>,
    /// Components to capture
    pub capture_components: Vec<Component>,
    /// Read chunks through a memory map instead of seek + read
    pub use_mmap: bool,
    /// Capacity of ring buffers enabled on a streaming trace
    pub ring_buffer_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("/tmp/alignment_microscope"),
            memory_limit_bytes: 4 * 1024 * 1024 * 1024,
            capture_layers: Vec::new(),
            capture_components: Component::ALL.to_vec(),
            use_mmap: true,
            ring_buffer_size: 1000,
        }
    }
}

impl StreamingConfig {
    /// Configuration rooted at `storage_dir`, otherwise default.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Default::default()
        }
    }

    /// Preset for large models: residual stream only, 8 GiB budget, small ring buffers.
    pub fn for_large_model(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            memory_limit_bytes: 8 * 1024 * 1024 * 1024,
            capture_components: vec![Component::Residual],
            ring_buffer_size: 100,
            ..Default::default()
        }
    }

    /// Preset capturing only the given layers.
    pub fn selective(storage_dir: impl Into<PathBuf>, layers: Vec<usize>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            capture_layers: layers,
            ..Default::default()
        }
    }

    /// Configuration matching a strategy chosen by
    /// [`MemoryEstimator::suggest_strategy`](crate::memory::MemoryEstimator::suggest_strategy).
    pub fn from_strategy(storage_dir: impl Into<PathBuf>, strategy: &CaptureStrategy) -> Self {
        match strategy {
            CaptureStrategy::SelectiveLayers(layers) => Self::selective(storage_dir, layers.clone()),
            CaptureStrategy::InMemory | CaptureStrategy::Streaming => Self::new(storage_dir),
        }
    }

    pub fn with_layers(mut self, layers: Vec<usize>) -> Self {
        self.capture_layers = layers;
        self
    }

    pub fn with_components(mut self, components: Vec<Component>) -> Self {
        self.capture_components = components;
        self
    }

    pub fn with_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    pub fn with_ring_buffer_size(mut self, size: usize) -> Self {
        self.ring_buffer_size = size;
        self
    }

    pub fn with_memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Index record for one stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub layer: usize,
    pub component: Component,
    pub shape: Vec<usize>,
    /// Element type tag; always `"f32"`
    pub dtype: String,
    /// Byte offset of the chunk inside its key file
    pub offset: u64,
    pub size_bytes: u64,
    /// Token indices covered, `[start, end]`
    pub token_range: (usize, usize),
}

impl ChunkMetadata {
    pub fn key(&self) -> ActivationKey {
        ActivationKey::new(self.layer, self.component)
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// On-disk sidecar layout. Keys are `{layer}_{component}` strings.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    chunks: BTreeMap<String, Vec<ChunkMetadata>>,
    offsets: BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// ChunkStorage
// ---------------------------------------------------------------------------

/// Append-only chunk store rooted at one directory.
#[derive(Debug)]
pub struct ChunkStorage {
    config: StreamingConfig,
    chunks: BTreeMap<ActivationKey, Vec<ChunkMetadata>>,
    offsets: BTreeMap<ActivationKey, u64>,
}

impl ChunkStorage {
    /// Open (creating if needed) the storage directory and load any existing sidecar.
    ///
    /// Append offsets come from the sidecar, not the `.bin` files: chunks
    /// stored after the last [`flush`](Self::flush) are not indexed on reopen,
    /// and new appends are recorded at the flushed offset.
    pub fn new(config: StreamingConfig) -> Result<Self> {
        fs::create_dir_all(&config.storage_dir).with_context(|| {
            format!(
                "Failed to create storage directory {}",
                config.storage_dir.display()
            )
        })?;

        let mut storage = Self {
            config,
            chunks: BTreeMap::new(),
            offsets: BTreeMap::new(),
        };

        let sidecar_path = storage.metadata_path();
        if sidecar_path.exists() {
            storage.load_sidecar(&sidecar_path)?;
            info!(
                "Resumed chunk storage at {} ({} keys)",
                storage.config.storage_dir.display(),
                storage.chunks.len()
            );
        }

        Ok(storage)
    }

    fn load_sidecar(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let sidecar: Sidecar = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        for (name, chunks) in sidecar.chunks {
            let key: ActivationKey = name.parse()?;
            self.chunks.insert(key, chunks);
        }
        for (name, offset) in sidecar.offsets {
            let key: ActivationKey = name.parse()?;
            self.offsets.insert(key, offset);
        }
        Ok(())
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn storage_dir(&self) -> &Path {
        &self.config.storage_dir
    }

    fn metadata_path(&self) -> PathBuf {
        self.config.storage_dir.join(METADATA_FILE)
    }

    /// Data file for one key: `layer_{layer}_{component}.bin`.
    pub fn data_path(&self, layer: usize, component: Component) -> PathBuf {
        self.config
            .storage_dir
            .join(format!("layer_{layer}_{component}.bin"))
    }

    /// Whether the configured layer/component allow-lists admit this key.
    pub fn should_capture(&self, layer: usize, component: Component) -> bool {
        let layer_ok =
            self.config.capture_layers.is_empty() || self.config.capture_layers.contains(&layer);
        layer_ok && self.config.capture_components.contains(&component)
    }

    /// Append one chunk. Returns `false` when the key is gated out.
    pub fn store(
        &mut self,
        layer: usize,
        component: Component,
        tensor: &Tensor,
        token_range: (usize, usize),
    ) -> Result<bool> {
        if !self.should_capture(layer, component) {
            debug!("Skipping {layer}_{component}: not in capture set");
            return Ok(false);
        }

        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        let mut bytes = Vec::with_capacity(data.len() * BYTES_PER_F32 as usize);
        for v in &data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        let key = ActivationKey::new(layer, component);
        let path = self.data_path(layer, component);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("Failed to append to {}", path.display()))?;

        let offset = self.offsets.get(&key).copied().unwrap_or(0);
        let size_bytes = bytes.len() as u64;
        let meta = ChunkMetadata {
            layer,
            component,
            shape,
            dtype: "f32".to_string(),
            offset,
            size_bytes,
            token_range,
        };
        let chunks = self.chunks.entry(key).or_default();
        debug!(
            "Stored chunk {} for {key} ({} bytes at offset {offset})",
            chunks.len(),
            size_bytes
        );
        chunks.push(meta);
        self.offsets.insert(key, offset + size_bytes);

        Ok(true)
    }

    /// Read back one chunk. Unknown keys and out-of-range indices yield `None`.
    pub fn load(
        &self,
        layer: usize,
        component: Component,
        chunk_idx: usize,
    ) -> Result<Option<Tensor>> {
        let Some(meta) = self.metadata(layer, component, chunk_idx) else {
            return Ok(None);
        };

        if meta.size_bytes == 0 {
            return Ok(Some(Tensor::from_vec(
                Vec::<f32>::new(),
                meta.shape.as_slice(),
                &Device::Cpu,
            )?));
        }

        let path = self.data_path(layer, component);
        let data = if self.config.use_mmap {
            read_chunk_mmap(&path, meta)?
        } else {
            read_chunk_seek(&path, meta)?
        };

        anyhow::ensure!(
            data.len() == meta.num_elements(),
            "Chunk {chunk_idx} of {layer}_{component} holds {} values, expected shape {:?}",
            data.len(),
            meta.shape
        );
        let tensor = Tensor::from_vec(data, meta.shape.as_slice(), &Device::Cpu)?;
        Ok(Some(tensor))
    }

    /// Lazily yield `(index, tensor)` for every chunk of a key, in write order.
    ///
    /// Each call returns a fresh iterator, so iteration can be restarted.
    pub fn iter_chunks(
        &self,
        layer: usize,
        component: Component,
    ) -> impl Iterator<Item = Result<(usize, Tensor)>> + '_ {
        let n = self.num_chunks(layer, component);
        (0..n).filter_map(move |idx| match self.load(layer, component, idx) {
            Ok(Some(tensor)) => Some(Ok((idx, tensor))),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        })
    }

    /// Metadata of one chunk, if present.
    pub fn metadata(
        &self,
        layer: usize,
        component: Component,
        chunk_idx: usize,
    ) -> Option<&ChunkMetadata> {
        self.chunks
            .get(&ActivationKey::new(layer, component))?
            .get(chunk_idx)
    }

    /// All chunk records for a key, in write order.
    pub fn chunk_metadata(&self, layer: usize, component: Component) -> &[ChunkMetadata] {
        self.chunks
            .get(&ActivationKey::new(layer, component))
            .map_or(&[], Vec::as_slice)
    }

    pub fn num_chunks(&self, layer: usize, component: Component) -> usize {
        self.chunk_metadata(layer, component).len()
    }

    /// Keys with at least one stored chunk, sorted.
    pub fn keys(&self) -> Vec<ActivationKey> {
        self.chunks
            .iter()
            .filter(|(_, chunks)| !chunks.is_empty())
            .map(|(key, _)| *key)
            .collect()
    }

    /// Sorted unique layers with any stored chunk.
    pub fn available_layers(&self) -> Vec<usize> {
        let mut layers: Vec<usize> = self.keys().iter().map(|k| k.layer).collect();
        layers.dedup();
        layers
    }

    /// Bytes written across all keys.
    pub fn total_size_bytes(&self) -> u64 {
        self.offsets.values().sum()
    }

    /// Persist the chunk index to the sidecar.
    pub fn flush(&self) -> Result<()> {
        let sidecar = Sidecar {
            chunks: self
                .chunks
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            offsets: self
                .offsets
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        };
        let path = self.metadata_path();
        let json = serde_json::to_string_pretty(&sidecar)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!(
            "Flushed chunk index: {} keys, {} bytes",
            self.chunks.len(),
            self.total_size_bytes()
        );
        Ok(())
    }

    /// Delete every data file and the sidecar, and clear the index.
    pub fn cleanup(&mut self) -> Result<()> {
        let dir = &self.config.storage_dir;
        if dir.exists() {
            for entry in
                fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?
            {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "bin") {
                    fs::remove_file(&path)
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                }
            }
            let sidecar = self.metadata_path();
            if sidecar.exists() {
                fs::remove_file(&sidecar)
                    .with_context(|| format!("Failed to remove {}", sidecar.display()))?;
            }
        }
        self.chunks.clear();
        self.offsets.clear();
        info!("Cleaned up chunk storage at {}", dir.display());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Chunk readers
// ---------------------------------------------------------------------------

fn decode_f32_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_F32 as usize)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn read_chunk_seek(path: &Path, meta: &ChunkMetadata) -> Result<Vec<f32>> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    file.seek(SeekFrom::Start(meta.offset))?;
    let mut bytes = vec![0u8; meta.size_bytes as usize];
    file.read_exact(&mut bytes).with_context(|| {
        format!(
            "Truncated chunk at offset {} in {}",
            meta.offset,
            path.display()
        )
    })?;
    Ok(decode_f32_le(&bytes))
}

fn read_chunk_mmap(path: &Path, meta: &ChunkMetadata) -> Result<Vec<f32>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    // SAFETY: chunk files are append-only; existing bytes are never rewritten.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap {}", path.display()))?;
    let start = meta.offset as usize;
    let end = start + meta.size_bytes as usize;
    anyhow::ensure!(
        end <= mmap.len(),
        "Truncated chunk at offset {} in {}",
        meta.offset,
        path.display()
    );
    Ok(decode_f32_le(&mmap[start..end]))
}
