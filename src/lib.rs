mod checkpoint;
mod config;
mod convert;
mod error;
mod model;
mod remap;
mod shards;
mod tokenizer;

pub use checkpoint::{Checkpoint, StateDict};
pub use config::{read_source, translate, GlmConfig, SourceConfig, Translation};
pub use convert::{convert_glm_model, ConvertOptions, ConvertReport};
pub use error::{ConvertError, Result};
pub use model::{save_weights, GlmWeights, SavedWeights, Skeleton, DEFAULT_MAX_SHARD_SIZE};
pub use remap::{remap_key, remap_key_with, remap_state_dict, STATE_DICT_MAPPING};
pub use shards::{list_shards, merge_shards, shard_ordinal, Merged, Shard, MERGED_NAME};
pub use tokenizer::{
    build_pipeline, convert_glm_tokenizer, parse_ranks, read_ranks, vocab_and_merges,
    GlmTokenizer, ReferenceSource, ReferenceTokenizer, DEFAULT_REFERENCE, GLM_PATTERN, GMASK,
    SOP,
};
