//! microscope CLI: inspect and analyse captured traces

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hf_hub::{api::sync::Api, Repo, RepoType};
use microscope_rs::{
    classify_heads, classify_layer_heads, CircuitDiscoverer, ChunkStorage, Component,
    InMemoryTrace, IoiDetectionConfig, IoiDetector, IoiSentence, MemoryEstimator, ModelShape,
    ScopeSettings, StreamingConfig, Trace,
};
use tokenizers::Tokenizer;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "microscope")]
#[command(about = "Trace storage and analysis for transformer interpretability")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Estimate full-capture memory and suggest a capture strategy
    Estimate {
        /// Number of layers (overrides the model config)
        #[arg(long)]
        layers: Option<usize>,
        /// Hidden size (overrides the model config)
        #[arg(long)]
        hidden: Option<usize>,
        /// Read the shape from a local config.json
        #[arg(long)]
        config: Option<PathBuf>,
        /// Read the shape from a HuggingFace model's config.json
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 1)]
        batch: usize,
        #[arg(long, default_value_t = 1024)]
        seq_len: usize,
        /// Memory limit in GB (default: MICROSCOPE_MEMORY_LIMIT_GB or 4)
        #[arg(long)]
        limit_gb: Option<f64>,
    },
    /// Summarize a streaming storage directory
    Inspect {
        dir: PathBuf,
    },
    /// Classify every attention head of a saved trace
    Heads {
        trace: PathBuf,
        /// Only this layer
        #[arg(long)]
        layer: Option<usize>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Detect the IOI circuit in a saved trace
    Ioi {
        trace: PathBuf,
        /// Subject name (the repeated one)
        #[arg(long)]
        subject: String,
        /// Indirect object name
        #[arg(long)]
        io: String,
        /// Local tokenizer.json used to decode the trace's input tokens
        #[arg(long)]
        tokenizer: Option<PathBuf>,
        /// HuggingFace model whose tokenizer.json to use
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 0.3)]
        name_mover_threshold: f32,
        #[arg(long, default_value_t = 0.2)]
        s_inhibition_threshold: f32,
        /// Compare against published heads for this family (e.g. gpt2)
        #[arg(long)]
        validate: Option<String>,
        /// Print JSON instead of DOT
        #[arg(long)]
        json: bool,
    },
    /// Diff clean and corrupted traces into a circuit
    Discover {
        clean: PathBuf,
        corrupt: PathBuf,
        #[arg(long, default_value = "behavior")]
        behavior: String,
        /// Components to compare (residual, attn_out, mlp_out)
        #[arg(long, value_delimiter = ',')]
        components: Vec<Component>,
        /// Keep only edges at or above this importance
        #[arg(long)]
        min_importance: Option<f32>,
        /// Print JSON instead of DOT
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = ScopeSettings::from_env()?;

    match cli.command {
        Command::Estimate {
            layers,
            hidden,
            config,
            model,
            batch,
            seq_len,
            limit_gb,
        } => {
            let shape = match (&config, &model) {
                (Some(path), _) => Some(ModelShape::from_config_file(path)?),
                (None, Some(id)) => Some(ModelShape::from_hub(id)?),
                (None, None) => None,
            };
            let layers = layers
                .or(shape.map(|s| s.num_layers))
                .context("Need --layers, --config or --model")?;
            let hidden = hidden
                .or(shape.map(|s| s.hidden_size))
                .context("Need --hidden, --config or --model")?;
            let limit_gb = limit_gb.unwrap_or(settings.memory_limit_gb);
            run_estimate(layers, hidden, batch, seq_len, limit_gb);
        }
        Command::Inspect { dir } => run_inspect(&dir, &settings)?,
        Command::Heads { trace, layer, json } => run_heads(&trace, layer, json)?,
        Command::Ioi {
            trace,
            subject,
            io,
            tokenizer,
            model,
            name_mover_threshold,
            s_inhibition_threshold,
            validate,
            json,
        } => {
            let tokenizer = load_tokenizer(tokenizer.as_deref(), model.as_deref())?;
            let config = IoiDetectionConfig::default()
                .with_name_mover_threshold(name_mover_threshold)
                .with_s_inhibition_threshold(s_inhibition_threshold);
            run_ioi(&trace, &tokenizer, &subject, &io, config, validate.as_deref(), json)?;
        }
        Command::Discover {
            clean,
            corrupt,
            behavior,
            components,
            min_importance,
            json,
        } => run_discover(&clean, &corrupt, &behavior, components, min_importance, json)?,
    }

    Ok(())
}

fn run_estimate(layers: usize, hidden: usize, batch: usize, seq_len: usize, limit_gb: f64) {
    let bytes = MemoryEstimator::estimate_full_capture(layers, hidden, batch, seq_len);
    let strategy = MemoryEstimator::suggest_strategy(layers, hidden, limit_gb);

    println!("=== Capture Estimate ===");
    println!("Layers: {layers}, hidden: {hidden}, batch: {batch}, seq: {seq_len}");
    println!(
        "Full capture: {bytes} bytes ({:.2} GB)",
        bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    );
    println!("Limit:        {limit_gb} GB");
    println!("Strategy:     {strategy}");
}

fn run_inspect(dir: &Path, settings: &ScopeSettings) -> Result<()> {
    let storage = ChunkStorage::new(StreamingConfig::new(dir).with_mmap(settings.use_mmap))?;
    let keys = storage.keys();
    anyhow::ensure!(
        !keys.is_empty(),
        "No chunks indexed in {} (missing or empty sidecar)",
        dir.display()
    );

    println!("=== Storage: {} ===", dir.display());
    println!("Layers: {:?}", storage.available_layers());
    println!("Total:  {} bytes", storage.total_size_bytes());
    println!();
    for key in keys {
        let chunks = storage.chunk_metadata(key.layer, key.component);
        let bytes: u64 = chunks.iter().map(|c| c.size_bytes).sum();
        let shape = chunks.first().map(|c| c.shape.clone()).unwrap_or_default();
        println!(
            "{:<16} {:>5} chunks {:>12} bytes  first shape {:?}",
            key.to_string(),
            chunks.len(),
            bytes,
            shape
        );
    }
    Ok(())
}

fn run_heads(path: &Path, only_layer: Option<usize>, json: bool) -> Result<()> {
    let trace = InMemoryTrace::load_safetensors(path)?;
    let layers: Vec<usize> = match only_layer {
        Some(layer) => vec![layer],
        None => trace.attention_layers(),
    };
    anyhow::ensure!(!layers.is_empty(), "Trace has no attention patterns");

    let mut analyses = Vec::new();
    if !json {
        println!("=== Head Classification ===");
        println!(
            "{:>5} {:>5} {:<15} {:>6} {:>8} {:>8} {:<15}",
            "layer", "head", "category", "conf", "entropy", "sparsity", "pattern"
        );
    }
    for layer in layers {
        let pattern = trace.require_attention(layer)?;
        let stats = classify_layer_heads(&pattern)?;
        let types = classify_heads(&pattern)?;
        for (analysis, head_type) in stats.into_iter().zip(types) {
            if json {
                analyses.push(serde_json::json!({
                    "analysis": analysis,
                    "pattern_type": head_type,
                }));
            } else {
                let c = &analysis.classification;
                println!(
                    "{:>5} {:>5} {:<15} {:>6.3} {:>8.3} {:>8.3} {:<15}",
                    analysis.layer,
                    analysis.head,
                    c.category.as_str(),
                    c.confidence,
                    c.entropy,
                    c.sparsity,
                    head_type.as_str()
                );
            }
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&analyses)?);
    }
    Ok(())
}

fn load_tokenizer(path: Option<&Path>, model: Option<&str>) -> Result<Tokenizer> {
    let path = match (path, model) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(model_id)) => {
            let api = Api::new().context("Failed to create HuggingFace API")?;
            let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
            repo.get("tokenizer.json")
                .context("Failed to download tokenizer.json")?
        }
        (None, None) => anyhow::bail!("Need --tokenizer or --model to decode tokens"),
    };
    Tokenizer::from_file(&path)
        .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {}: {e}", path.display()))
}

fn run_ioi(
    path: &Path,
    tokenizer: &Tokenizer,
    subject: &str,
    io: &str,
    config: IoiDetectionConfig,
    validate: Option<&str>,
    json: bool,
) -> Result<()> {
    let trace = InMemoryTrace::load_safetensors(path)?;
    let tokens = trace
        .input_tokens()
        .context("Trace has no input tokens")?
        .to_vec();
    let token_strings = tokens
        .iter()
        .map(|&id| {
            tokenizer
                .decode(&[id], false)
                .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
        })
        .collect::<Result<Vec<String>>>()?;
    let sentence = IoiSentence::from_tokens(tokens, token_strings, subject, io)?;
    info!(
        "IO at {}, S2 at {}, end at {}",
        sentence.io_position, sentence.subject2_position, sentence.end_position
    );

    let circuit = IoiDetector::new(config).detect_from_trace(&trace, &sentence)?;
    let validation = validate
        .map(|family| circuit.validate_against_known(family))
        .transpose()?;

    if json {
        let out = serde_json::json!({ "circuit": circuit, "validation": validation });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}", circuit.to_dot());
    eprintln!(
        "\n{} heads, validity {:.3}",
        circuit.total_heads(),
        circuit.validity_score
    );
    if let Some(v) = validation {
        eprintln!(
            "Precision {:.3}, recall {:.3}, F1 {:.3}",
            v.precision, v.recall, v.f1_score
        );
    }
    Ok(())
}

fn run_discover(
    clean: &Path,
    corrupt: &Path,
    behavior: &str,
    components: Vec<Component>,
    min_importance: Option<f32>,
    json: bool,
) -> Result<()> {
    let clean = InMemoryTrace::load_safetensors(clean)?;
    let corrupt = InMemoryTrace::load_safetensors(corrupt)?;

    let mut discoverer = CircuitDiscoverer::new();
    if !components.is_empty() {
        discoverer = discoverer.with_components(components);
    }
    let mut circuit = discoverer.discover(behavior, &clean, &corrupt)?;
    if let Some(threshold) = min_importance {
        circuit = circuit.minimal(threshold);
    }
    info!(
        "{} nodes, {} edges",
        circuit.nodes().len(),
        circuit.edges().len()
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&circuit)?);
    } else {
        println!("{}", circuit.to_dot());
    }
    Ok(())
}
