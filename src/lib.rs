// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // u64→usize for byte offsets and counts
#![allow(clippy::cast_possible_wrap)] // usize→i64 for token positions
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // IoiDetector in ioi.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &Component for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // i64→usize when value is known positive

//! microscope-rs: trace storage and analysis for transformer interpretability
//!
//! Captured activations go into a trace (in memory, or streamed to disk in
//! chunks) and are analysed from there: attention head classification,
//! circuit discovery, sparse autoencoder features and IOI circuit detection.
//!
//! ## Architecture
//!
//! - `key`: (layer, component) activation keys
//! - `ring_buffer`: Fixed-capacity window of recent tensors
//! - `storage`: Append-only chunk files with a JSON sidecar index
//! - `trace`: `Trace` contract, `InMemoryTrace`, `StreamingTrace`, capture callback
//! - `attention`: Attention pattern queries (entropy, top-k, flow)
//! - `classifier`: Head classification policies
//! - `circuit`: Circuit graph, pruning and DOT export
//! - `discovery`: Clean-vs-corrupted activation diffing into circuits
//! - `ioi`: Indirect Object Identification head detection and validation
//! - `sae`: Sparse autoencoder encode/decode
//! - `sae_analysis`: Multi-SAE registry and feature comparison
//! - `memory`: Capture footprint estimation and strategy choice
//! - `cache`: Bounded trace cache
//! - `settings`: Environment-driven settings
//! - `architecture`: Model family adapters and config.json shape reading

pub mod architecture;
pub mod attention;
pub mod cache;
pub mod circuit;
pub mod classifier;
pub mod discovery;
pub mod ioi;
pub mod key;
pub mod memory;
pub mod ring_buffer;
pub mod sae;
pub mod sae_analysis;
pub mod settings;
pub mod storage;
pub mod trace;

pub use architecture::{
    adapter_for, adapter_for_config, Architecture, ArchitectureAdapter, ModelShape,
};
pub use attention::{attention_flow, AttentionPattern};
pub use cache::TraceCache;
pub use circuit::{Circuit, CircuitEdge, CircuitNode};
pub use classifier::{
    classify_head, classify_heads, classify_layer_heads, HeadAnalysis, HeadCategory,
    HeadClassification, HeadType,
};
pub use discovery::CircuitDiscoverer;
pub use ioi::{
    IoiCircuit, IoiDetectionConfig, IoiDetector, IoiHead, IoiPositions, IoiRole, IoiSentence,
    IoiValidationResult, KnownIoiHeads, LayerRange,
};
pub use key::{ActivationKey, Component};
pub use memory::{CaptureStrategy, MemoryEstimator};
pub use ring_buffer::RingBuffer;
pub use sae::{SaeActivation, SaeCodec, SaeConfig, SaeFeatures};
pub use sae_analysis::{BehaviorFeatures, SaeAnalyzer};
pub use settings::ScopeSettings;
pub use storage::{ChunkMetadata, ChunkStorage, StreamingConfig};
pub use trace::{CaptureSink, InMemoryTrace, StreamingTrace, TensorStats, Trace};
