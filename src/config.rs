use crate::error::{ConvertError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Flat `config.json` of the source checkpoint, consumed field by field.
pub type SourceConfig = Map<String, Value>;

const ARCHITECTURE: &str = "GlmForCausalLM";
const MODEL_TYPE: &str = "glm";

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct GlmConfig {
    pub architectures: Vec<String>,
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub resid_pdrop: f64,
    pub attention_dropout: f64,
    pub max_position_embeddings: usize,
    pub initializer_range: f64,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub use_rms_norm: bool,
    pub apply_residual_connection_post_layernorm: bool,
    pub post_layer_norm: bool,
    pub use_cache: bool,
    pub head_dim: usize,
    pub attention_bias: bool,
    pub linear_bias: bool,
    pub tie_word_embeddings: bool,
}

/// Result of [`translate`]: the target record plus the source keys nobody asked for.
#[derive(Clone, Debug)]
pub struct Translation {
    pub config: GlmConfig,
    pub unused: Vec<String>,
}

pub fn read_source(path: impl AsRef<Path>) -> Result<SourceConfig> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

pub fn translate(source: SourceConfig) -> Result<Translation> {
    let mut fields = Fields(source);

    let num_attention_heads = fields.usize("num_attention_heads")?;
    let num_key_value_heads = if fields.bool("multi_query_attention")? {
        fields.usize("multi_query_group_num")?
    } else {
        num_attention_heads
    };

    let config = GlmConfig {
        architectures: vec![ARCHITECTURE.into()],
        model_type: MODEL_TYPE.into(),
        vocab_size: fields.usize("padded_vocab_size")?,
        hidden_size: fields.usize("hidden_size")?,
        intermediate_size: fields.usize("ffn_hidden_size")?,
        num_hidden_layers: fields.usize_or("num_hidden_layer", "num_layers")?,
        num_attention_heads,
        num_key_value_heads,
        resid_pdrop: fields.f64("hidden_dropout")?,
        attention_dropout: fields.f64("attention_dropout")?,
        max_position_embeddings: fields.usize_or("max_position_embeddings", "seq_length")?,
        initializer_range: fields.f64("initializer_range")?,
        rms_norm_eps: fields.f64("layernorm_epsilon")?,
        rope_theta: 10000. * fields.f64("rope_ratio")?,
        use_rms_norm: fields.bool("rmsnorm")?,
        apply_residual_connection_post_layernorm: fields
            .bool("apply_residual_connection_post_layernorm")?,
        post_layer_norm: fields.bool("post_layer_norm")?,
        use_cache: fields.bool("use_cache")?,
        head_dim: fields.usize("kv_channels")?,
        attention_bias: fields.bool("add_qkv_bias")?,
        linear_bias: fields.bool("add_bias_linear")?,
        tie_word_embeddings: false,
    };

    let unused = fields.0.into_iter().map(|(k, _)| k).collect::<Vec<_>>();
    if !unused.is_empty() {
        warn!(keys = ?unused, "unused config keys");
    }
    Ok(Translation { config, unused })
}

impl GlmConfig {
    /// `heads * head_dim + 2 * kv_heads * head_dim`, rows of the fused qkv projection.
    #[inline]
    pub const fn qkv_dim(&self) -> usize {
        (self.num_attention_heads + 2 * self.num_key_value_heads) * self.head_dim
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let path = dir.as_ref().join("config.json");
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writeln!(writer)?;
        writer.flush()?;
        info!("wrote {}", path.display());
        Ok(path)
    }
}

struct Fields(SourceConfig);

impl Fields {
    fn take(&mut self, name: &'static str) -> Result<Value> {
        self.0.remove(name).ok_or(ConvertError::MissingField(name))
    }

    fn usize(&mut self, name: &'static str) -> Result<usize> {
        let value = self.take(name)?;
        as_usize(name, value)
    }

    /// Released checkpoints spell a few fields differently; `alias` is tried when `name` is absent.
    fn usize_or(&mut self, name: &'static str, alias: &'static str) -> Result<usize> {
        match self.0.remove(name) {
            Some(value) => as_usize(name, value),
            None => match self.0.remove(alias) {
                Some(value) => as_usize(alias, value),
                None => Err(ConvertError::MissingField(name)),
            },
        }
    }

    fn f64(&mut self, name: &'static str) -> Result<f64> {
        let value = self.take(name)?;
        value.as_f64().ok_or(ConvertError::InvalidField {
            field: name,
            expected: "a number",
            found: value,
        })
    }

    fn bool(&mut self, name: &'static str) -> Result<bool> {
        let value = self.take(name)?;
        value.as_bool().ok_or(ConvertError::InvalidField {
            field: name,
            expected: "a boolean",
            found: value,
        })
    }
}

fn as_usize(name: &'static str, value: Value) -> Result<usize> {
    match value.as_u64().and_then(|n| usize::try_from(n).ok()) {
        Some(n) => Ok(n),
        None => Err(ConvertError::InvalidField {
            field: name,
            expected: "a non-negative integer",
            found: value,
        }),
    }
}

#[cfg(test)]
pub(crate) fn glm4_source() -> SourceConfig {
    let Value::Object(map) = serde_json::json!({
        "_name_or_path": "THUDM/glm-4-9b",
        "model_type": "chatglm",
        "add_bias_linear": false,
        "add_qkv_bias": true,
        "apply_query_key_layer_scaling": true,
        "apply_residual_connection_post_layernorm": false,
        "attention_dropout": 0.0,
        "attention_softmax_in_fp32": true,
        "bias_dropout_fusion": true,
        "ffn_hidden_size": 13696,
        "fp32_residual_connection": false,
        "hidden_dropout": 0.0,
        "hidden_size": 4096,
        "kv_channels": 128,
        "layernorm_epsilon": 1.5625e-07,
        "multi_query_attention": true,
        "multi_query_group_num": 2,
        "num_attention_heads": 32,
        "num_hidden_layer": 40,
        "max_position_embeddings": 8192,
        "initializer_range": 0.02,
        "original_rope": true,
        "padded_vocab_size": 151552,
        "post_layer_norm": true,
        "rmsnorm": true,
        "rope_ratio": 1.5,
        "tie_word_embeddings": false,
        "use_cache": true,
    }) else {
        unreachable!()
    };
    map
}

#[test]
fn test_translate_glm4() {
    let Translation { config, unused } = translate(glm4_source()).unwrap();
    assert_eq!(config.num_key_value_heads, 2);
    assert_eq!(config.rope_theta, 15000.);
    assert_eq!(config.vocab_size, 151552);
    assert_eq!(config.intermediate_size, 13696);
    assert_eq!(config.num_hidden_layers, 40);
    assert_eq!(config.head_dim, 128);
    assert_eq!(config.rms_norm_eps, 1.5625e-07);
    assert!(config.attention_bias);
    assert!(!config.linear_bias);
    assert_eq!(config.qkv_dim(), (32 + 2 * 2) * 128);

    let mut unused = unused;
    unused.sort();
    assert_eq!(
        unused,
        [
            "_name_or_path",
            "apply_query_key_layer_scaling",
            "attention_softmax_in_fp32",
            "bias_dropout_fusion",
            "fp32_residual_connection",
            "model_type",
            "original_rope",
            "tie_word_embeddings",
        ]
    );
}

#[test]
fn test_without_multi_query() {
    let mut source = glm4_source();
    source.insert("multi_query_attention".into(), false.into());
    let Translation { config, unused } = translate(source).unwrap();
    assert_eq!(config.num_key_value_heads, 32);
    // the group count is left alone and reported
    assert!(unused.iter().any(|k| k == "multi_query_group_num"));
}

#[test]
fn test_missing_field() {
    const REQUIRED: &[&str] = &[
        "padded_vocab_size",
        "hidden_size",
        "ffn_hidden_size",
        "num_hidden_layer",
        "num_attention_heads",
        "multi_query_attention",
        "multi_query_group_num",
        "hidden_dropout",
        "attention_dropout",
        "max_position_embeddings",
        "initializer_range",
        "layernorm_epsilon",
        "rope_ratio",
        "rmsnorm",
        "apply_residual_connection_post_layernorm",
        "post_layer_norm",
        "use_cache",
        "kv_channels",
        "add_qkv_bias",
        "add_bias_linear",
    ];
    for &field in REQUIRED {
        let mut source = glm4_source();
        source.remove(field);
        match translate(source) {
            Err(ConvertError::MissingField(name)) => assert_eq!(name, field),
            other => panic!("removing {field} gave {other:?}"),
        }
    }
}

#[test]
fn test_released_field_names() {
    let mut source = glm4_source();
    let layers = source.remove("num_hidden_layer").unwrap();
    let positions = source.remove("max_position_embeddings").unwrap();
    source.insert("num_layers".into(), layers);
    source.insert("seq_length".into(), positions);
    let config = translate(source).unwrap().config;
    assert_eq!(config.num_hidden_layers, 40);
    assert_eq!(config.max_position_embeddings, 8192);
}

#[test]
fn test_invalid_field() {
    let mut source = glm4_source();
    source.insert("hidden_size".into(), "4096".into());
    assert!(matches!(
        translate(source),
        Err(ConvertError::InvalidField {
            field: "hidden_size",
            ..
        })
    ));

    let mut source = glm4_source();
    source.insert("rmsnorm".into(), 1.into());
    assert!(matches!(
        translate(source),
        Err(ConvertError::InvalidField {
            field: "rmsnorm",
            ..
        })
    ));
}

#[test]
fn test_save() {
    let dir = tempfile::tempdir().unwrap();
    let config = translate(glm4_source()).unwrap().config;
    let path = config.save(dir.path()).unwrap();
    let json = serde_json::from_slice::<Value>(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(json["model_type"], "glm");
    assert_eq!(json["architectures"][0], "GlmForCausalLM");
    assert_eq!(json["num_key_value_heads"], 2);
    assert_eq!(json["rope_theta"], 15000.0);
}
