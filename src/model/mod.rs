mod save;

use crate::{
    checkpoint::StateDict,
    config::GlmConfig,
    error::{ConvertError, Result},
};
use safetensors::tensor::TensorView;
use std::fmt::Write;
use tracing::{info, warn};

pub use save::{save_weights, SavedWeights, DEFAULT_MAX_SHARD_SIZE};

/// Buffers the target model rebuilds itself and never persists.
const NON_PERSISTENT: &[&str] = &["model.rotary_emb.inv_freq"];

/// Parameter names and shapes of `GlmForCausalLM` for one config, in module order.
pub struct Skeleton {
    params: Vec<(String, Vec<usize>)>,
}

/// Weights that passed [`Skeleton::assign`], in skeleton order.
pub struct GlmWeights<'a> {
    tensors: Vec<(String, TensorView<'a>)>,
}

impl Skeleton {
    pub fn new(config: &GlmConfig) -> Self {
        let vocab_size = config.vocab_size;
        let dim = config.hidden_size;
        let hidden_dim = config.intermediate_size;
        let qkv_dim = config.qkv_dim();
        let attn_dim = config.num_attention_heads * config.head_dim;

        let mut params = Vec::new();
        let mut param = |name: String, shape: &[usize]| params.push((name, shape.to_vec()));
        let norm = |param: &mut dyn FnMut(String, &[usize]), prefix: &str| {
            param(format!("{prefix}.weight"), &[dim]);
            if !config.use_rms_norm {
                param(format!("{prefix}.bias"), &[dim]);
            }
        };

        param("model.embed_tokens.weight".into(), &[vocab_size, dim]);
        for layer in 0..config.num_hidden_layers {
            let prefix = format!("model.layers.{layer}");
            norm(&mut param, &format!("{prefix}.input_layernorm"));

            param(format!("{prefix}.self_attn.qkv_proj.weight"), &[qkv_dim, dim]);
            if config.attention_bias {
                param(format!("{prefix}.self_attn.qkv_proj.bias"), &[qkv_dim]);
            }
            param(format!("{prefix}.self_attn.o_proj.weight"), &[dim, attn_dim]);
            if config.linear_bias {
                param(format!("{prefix}.self_attn.o_proj.bias"), &[dim]);
            }

            norm(&mut param, &format!("{prefix}.post_attention_layernorm"));

            param(format!("{prefix}.mlp.gate_up_proj.weight"), &[2 * hidden_dim, dim]);
            if config.linear_bias {
                param(format!("{prefix}.mlp.gate_up_proj.bias"), &[2 * hidden_dim]);
            }
            param(format!("{prefix}.mlp.down_proj.weight"), &[dim, hidden_dim]);
            if config.linear_bias {
                param(format!("{prefix}.mlp.down_proj.bias"), &[dim]);
            }
        }
        if config.post_layer_norm {
            norm(&mut param, "model.norm");
        }
        param("lm_head.weight".into(), &[vocab_size, dim]);

        Self { params }
    }

    #[inline]
    pub fn params(&self) -> &[(String, Vec<usize>)] {
        &self.params
    }

    /// Strict load: every parameter present with its exact shape, nothing left over.
    pub fn assign<'a>(&self, mut state: StateDict<'a>) -> Result<GlmWeights<'a>> {
        for &name in NON_PERSISTENT {
            if state.remove(name).is_some() {
                warn!("dropping non-persistent buffer {name}");
            }
        }

        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        let mut tensors = Vec::with_capacity(self.params.len());
        for (name, shape) in &self.params {
            match state.remove(name) {
                Some(view) if view.shape() == shape.as_slice() => {
                    tensors.push((name.clone(), view));
                }
                Some(view) => mismatched.push((name, view.shape().to_vec(), shape)),
                None => missing.push(name.as_str()),
            }
        }
        let unexpected = state.keys().map(String::as_str).collect::<Vec<_>>();

        if missing.is_empty() && unexpected.is_empty() && mismatched.is_empty() {
            info!(tensors = tensors.len(), "assigned weights");
            return Ok(GlmWeights { tensors });
        }

        let mut msg = String::from("Error(s) in loading state_dict for GlmForCausalLM:");
        if !missing.is_empty() {
            let _ = write!(msg, "\n\tMissing key(s): {}.", quoted(&missing));
        }
        if !unexpected.is_empty() {
            let _ = write!(msg, "\n\tUnexpected key(s): {}.", quoted(&unexpected));
        }
        for (name, found, expected) in mismatched {
            let _ = write!(
                msg,
                "\n\tsize mismatch for {name}: copying a param with shape {found:?} from checkpoint, \
                 the shape in current model is {expected:?}."
            );
        }
        Err(ConvertError::WeightMismatch(msg))
    }
}

fn quoted(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

impl<'a> GlmWeights<'a> {
    #[inline]
    pub fn tensors(&self) -> &[(String, TensorView<'a>)] {
        &self.tensors
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn nbytes(&self) -> usize {
        self.tensors.iter().map(|(_, view)| view.data().len()).sum()
    }
}

#[cfg(test)]
pub(crate) fn tiny_config() -> GlmConfig {
    let mut source = crate::config::glm4_source();
    for (key, value) in [
        ("padded_vocab_size", 16),
        ("hidden_size", 8),
        ("ffn_hidden_size", 12),
        ("num_hidden_layer", 2),
        ("num_attention_heads", 4),
        ("multi_query_group_num", 1),
        ("kv_channels", 2),
    ] {
        source.insert(key.into(), value.into());
    }
    crate::config::translate(source).unwrap().config
}

/// Source-side names and shapes matching [`tiny_config`].
#[cfg(test)]
pub(crate) fn tiny_source_tensors() -> Vec<(String, Vec<usize>)> {
    let mut tensors = vec![
        ("transformer.embedding.word_embeddings.weight".to_string(), vec![16, 8]),
        ("transformer.encoder.final_layernorm.weight".to_string(), vec![8]),
        ("transformer.output_layer.weight".to_string(), vec![16, 8]),
    ];
    for layer in 0..2 {
        let prefix = format!("transformer.encoder.layers.{layer}");
        tensors.extend([
            (format!("{prefix}.input_layernorm.weight"), vec![8]),
            (format!("{prefix}.self_attention.query_key_value.weight"), vec![12, 8]),
            (format!("{prefix}.self_attention.query_key_value.bias"), vec![12]),
            (format!("{prefix}.self_attention.dense.weight"), vec![8, 8]),
            (format!("{prefix}.post_attention_layernorm.weight"), vec![8]),
            (format!("{prefix}.mlp.dense_h_to_4h.weight"), vec![24, 8]),
            (format!("{prefix}.mlp.dense_4h_to_h.weight"), vec![8, 12]),
        ]);
    }
    tensors
}

#[cfg(test)]
pub(crate) fn tiny_checkpoint(
    tensors: &[(String, Vec<usize>)],
) -> (tempfile::TempDir, crate::checkpoint::Checkpoint) {
    let blob = crate::checkpoint::bf16_blob(
        &tensors
            .iter()
            .map(|(n, s)| (n.as_str(), s.clone()))
            .collect::<Vec<_>>(),
    );
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("consolidated.safetensors");
    std::fs::write(&path, blob).unwrap();
    let checkpoint = crate::checkpoint::Checkpoint::open(path).unwrap();
    (dir, checkpoint)
}

#[test]
fn test_skeleton() {
    let config = tiny_config();
    let skeleton = Skeleton::new(&config);
    // embed + 2 * 7 + norm + lm_head
    assert_eq!(skeleton.params().len(), 1 + 2 * 7 + 1 + 1);
    let find = |name: &str| {
        skeleton
            .params()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, shape)| shape.clone())
    };
    assert_eq!(find("model.layers.1.self_attn.qkv_proj.weight"), Some(vec![12, 8]));
    assert_eq!(find("model.layers.1.self_attn.qkv_proj.bias"), Some(vec![12]));
    assert_eq!(find("model.layers.0.mlp.gate_up_proj.weight"), Some(vec![24, 8]));
    assert_eq!(find("model.layers.0.self_attn.o_proj.bias"), None);
    assert_eq!(find("model.norm.weight"), Some(vec![8]));
    assert_eq!(skeleton.params().last().unwrap().0, "lm_head.weight");
}

#[test]
fn test_assign() {
    let names = tiny_source_tensors();
    let (_dir, checkpoint) = tiny_checkpoint(&names);
    let state = crate::remap::remap_state_dict(checkpoint.state_dict().unwrap()).unwrap();
    let weights = Skeleton::new(&tiny_config()).assign(state).unwrap();
    assert_eq!(weights.len(), names.len());
    assert_eq!(weights.tensors()[0].0, "model.embed_tokens.weight");
    assert_eq!(
        weights.nbytes(),
        names
            .iter()
            .map(|(_, s)| s.iter().product::<usize>() * 2)
            .sum::<usize>()
    );
}

#[test]
fn test_assign_strict() {
    let mut names = tiny_source_tensors();
    names.retain(|(n, _)| n != "transformer.output_layer.weight");
    names.push(("transformer.extra.weight".into(), vec![1]));
    names.push(("transformer.rotary_pos_emb.inv_freq".into(), vec![1]));
    for (name, shape) in &mut names {
        if name == "transformer.encoder.layers.1.mlp.dense_4h_to_h.weight" {
            *shape = vec![12, 8];
        }
    }
    let (_dir, checkpoint) = tiny_checkpoint(&names);
    let state = crate::remap::remap_state_dict(checkpoint.state_dict().unwrap()).unwrap();
    let Err(ConvertError::WeightMismatch(msg)) = Skeleton::new(&tiny_config()).assign(state) else {
        panic!("strict assignment accepted a bad state dict")
    };
    assert!(msg.contains("Missing key(s): \"lm_head.weight\""));
    assert!(msg.contains("Unexpected key(s): \"model.extra.weight\"."));
    assert!(msg.contains("size mismatch for model.layers.1.mlp.down_proj.weight"));
    assert!(!msg.contains("inv_freq"));
}
