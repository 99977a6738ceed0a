use crate::{
    checkpoint::Checkpoint,
    config::{self, Translation},
    error::Result,
    model::{self, Skeleton, DEFAULT_MAX_SHARD_SIZE},
    remap, shards,
    tokenizer::{self, ReferenceSource},
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

#[derive(Clone, Debug)]
pub struct ConvertOptions {
    pub reference: ReferenceSource,
    pub max_shard_size: usize,
    pub skip_tokenizer: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            reference: ReferenceSource::default(),
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            skip_tokenizer: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConvertReport {
    pub unused_config_keys: Vec<String>,
    pub shards: usize,
    pub tensors: usize,
    pub files: Vec<PathBuf>,
    /// With added tokens; `None` when the tokenizer was skipped.
    pub vocab_size: Option<usize>,
}

/// Converts the checkpoint in `input_dir` into `output_dir`.
///
/// `config.json` is translated before anything is written, so a bad config leaves no output.
/// The merged shards are left in `input_dir` as `consolidated.safetensors`.
pub fn convert_glm_model(
    input_dir: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    options: &ConvertOptions,
) -> Result<ConvertReport> {
    let input = input_dir.as_ref();
    let output = output_dir.as_ref();

    let source = config::read_source(input.join("config.json"))?;
    let Translation { config, unused } = config::translate(source)?;
    fs::create_dir_all(output)?;
    let mut files = vec![config.save(output)?];

    let merged = shards::merge_shards(input)?;
    let checkpoint = Checkpoint::open(&merged.path)?;
    let state = remap::remap_state_dict(checkpoint.state_dict()?)?;
    let weights = Skeleton::new(&config).assign(state)?;
    let saved = model::save_weights(&weights, output, options.max_shard_size)?;
    files.extend(saved.files);
    files.extend(saved.index);

    let vocab_size = if options.skip_tokenizer {
        info!("skipping tokenizer");
        None
    } else {
        let glm = tokenizer::convert_glm_tokenizer(input, &options.reference)?;
        files.extend(glm.save(output)?);
        Some(glm.tokenizer.get_vocab_size(true))
    };

    info!(
        tensors = weights.len(),
        bytes = saved.total_size,
        "converted {} into {}",
        input.display(),
        output.display()
    );
    Ok(ConvertReport {
        unused_config_keys: unused,
        shards: merged.shards.len(),
        tensors: weights.len(),
        files,
        vocab_size,
    })
}
