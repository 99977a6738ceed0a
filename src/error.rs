use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("config field `{0}` is missing")]
    MissingField(&'static str),

    #[error("config field `{field}` must be {expected}, got {found}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
        found: serde_json::Value,
    },

    #[error("no *.safetensors shards found in {0}")]
    NoShards(PathBuf),

    #[error("cannot read a shard ordinal from file name `{0}`")]
    ShardName(String),

    #[error("malformed merged checkpoint at byte {offset}: {reason}")]
    Checkpoint { offset: usize, reason: String },

    #[error("tensor `{0}` appears more than once")]
    DuplicateTensor(String),

    #[error("{0}")]
    WeightMismatch(String),

    #[error("reference tokenizer `{id}` is unavailable: {reason}")]
    ReferenceUnavailable { id: String, reason: String },

    #[error("tokenizer.model line {line}: {reason}")]
    Vocab { line: usize, reason: String },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConvertError>;
