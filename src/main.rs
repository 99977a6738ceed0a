use anyhow::{Context, Result};
use clap::Parser;
use glm2hf_rs::{
    convert_glm_model, ConvertOptions, ReferenceSource, DEFAULT_MAX_SHARD_SIZE, DEFAULT_REFERENCE,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glm2hf")]
#[command(about = "Convert a GLM checkpoint into the Hugging Face layout")]
struct Args {
    /// Checkpoint folder with config.json, *.safetensors shards and tokenizer.model
    input_dir: PathBuf,

    /// Where to write config, weights and tokenizer
    output_dir: PathBuf,

    /// Hub repo id, or local folder / tokenizer_config.json, to copy tokenizer metadata from
    #[arg(long, default_value = DEFAULT_REFERENCE)]
    reference_tokenizer: String,

    /// Hub revision of the reference tokenizer
    #[arg(long)]
    revision: Option<String>,

    /// Largest weight file in bytes before the output is sharded
    #[arg(long, default_value_t = DEFAULT_MAX_SHARD_SIZE)]
    max_shard_size: usize,

    /// Convert config and weights only
    #[arg(long)]
    skip_tokenizer: bool,
}

/// `RUST_LOG` when set, `info` otherwise.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(log_filter()).init();

    let args = Args::parse();
    let options = ConvertOptions {
        reference: ReferenceSource::new(&args.reference_tokenizer, args.revision),
        max_shard_size: args.max_shard_size,
        skip_tokenizer: args.skip_tokenizer,
    };

    let report = convert_glm_model(&args.input_dir, &args.output_dir, &options)
        .with_context(|| format!("failed to convert {}", args.input_dir.display()))?;

    for file in &report.files {
        info!("  {}", file.display());
    }
    if let Some(vocab_size) = report.vocab_size {
        info!(vocab_size, "tokenizer ready");
    }
    Ok(())
}

#[test]
fn test_log_filter() {
    std::env::set_var("RUST_LOG", "debug");
    assert_eq!(log_filter().to_string(), "debug");
    std::env::remove_var("RUST_LOG");
    assert_eq!(log_filter().to_string(), "info");
}
