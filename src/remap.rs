use crate::error::{ConvertError, Result};
use std::collections::BTreeMap;
use tracing::info;

/// Substring rules turning source parameter names into target ones.
///
/// Applied top to bottom, each rule replacing every occurrence in the already rewritten name,
/// so a rule must come before any shorter rule that would eat its prefix.
pub const STATE_DICT_MAPPING: &[(&str, &str)] = &[
    ("transformer.output_layer.", "lm_head."),
    ("transformer.embedding.word_embeddings.", "model.embed_tokens."),
    ("transformer.encoder.final_layernorm.", "model.norm."),
    ("transformer.rotary_pos_emb.", "model.rotary_emb."),
    ("transformer.", "model."),
    (".embedding.", ".embed_tokens."),
    (".encoder.layers.", ".layers."),
    ("final_layernorm.", "norm."),
    ("self_attention.", "self_attn."),
    ("query_key_value.", "qkv_proj."),
    ("dense_h_to_4h.", "gate_up_proj."),
    ("dense_4h_to_h.", "down_proj."),
    ("dense.", "o_proj."),
];

pub fn remap_key_with<'r>(
    key: &str,
    rules: impl IntoIterator<Item = &'r (&'r str, &'r str)>,
) -> String {
    rules
        .into_iter()
        .fold(key.to_string(), |key, (old, new)| key.replace(old, new))
}

#[inline]
pub fn remap_key(key: &str) -> String {
    remap_key_with(key, STATE_DICT_MAPPING)
}

/// Renames every key of `state`; values are moved over untouched.
pub fn remap_state_dict<V>(state: BTreeMap<String, V>) -> Result<BTreeMap<String, V>> {
    let total = state.len();
    let mut renamed = 0;
    let mut ans = BTreeMap::new();
    for (key, value) in state {
        let new_key = remap_key(&key);
        if new_key != key {
            renamed += 1;
        }
        if ans.contains_key(&new_key) {
            return Err(ConvertError::DuplicateTensor(new_key));
        }
        ans.insert(new_key, value);
    }
    info!(total, renamed, "remapped parameter names");
    Ok(ans)
}

#[test]
fn test_layer_keys() {
    for (old, new) in [
        (
            "transformer.encoder.layers.3.self_attention.query_key_value.weight",
            "model.layers.3.self_attn.qkv_proj.weight",
        ),
        (
            "transformer.encoder.layers.3.self_attention.query_key_value.bias",
            "model.layers.3.self_attn.qkv_proj.bias",
        ),
        (
            "transformer.encoder.layers.0.self_attention.dense.weight",
            "model.layers.0.self_attn.o_proj.weight",
        ),
        (
            "transformer.encoder.layers.12.mlp.dense_h_to_4h.weight",
            "model.layers.12.mlp.gate_up_proj.weight",
        ),
        (
            "transformer.encoder.layers.12.mlp.dense_4h_to_h.weight",
            "model.layers.12.mlp.down_proj.weight",
        ),
        (
            "transformer.encoder.layers.39.input_layernorm.weight",
            "model.layers.39.input_layernorm.weight",
        ),
        (
            "transformer.encoder.layers.39.post_attention_layernorm.weight",
            "model.layers.39.post_attention_layernorm.weight",
        ),
    ] {
        assert_eq!(remap_key(old), new);
    }
}

#[test]
fn test_global_keys() {
    assert_eq!(
        remap_key("transformer.embedding.word_embeddings.weight"),
        "model.embed_tokens.weight"
    );
    assert_eq!(
        remap_key("transformer.encoder.final_layernorm.weight"),
        "model.norm.weight"
    );
    assert_eq!(remap_key("transformer.output_layer.weight"), "lm_head.weight");
    assert_eq!(
        remap_key("transformer.rotary_pos_emb.inv_freq"),
        "model.rotary_emb.inv_freq"
    );
}

#[test]
fn test_order_matters() {
    let key = "transformer.output_layer.weight";
    let reversed = remap_key_with(key, STATE_DICT_MAPPING.iter().rev());
    assert_ne!(reversed, remap_key(key));
    assert_eq!(reversed, "model.output_layer.weight");
}

#[test]
fn test_remap_state_dict() {
    let state = BTreeMap::from([
        ("transformer.output_layer.weight".to_string(), 1),
        ("transformer.encoder.layers.0.mlp.dense_4h_to_h.weight".to_string(), 2),
    ]);
    let state = remap_state_dict(state).unwrap();
    assert_eq!(state["lm_head.weight"], 1);
    assert_eq!(state["model.layers.0.mlp.down_proj.weight"], 2);

    let clash = BTreeMap::from([
        ("transformer.foo".to_string(), 1),
        ("model.foo".to_string(), 2),
    ]);
    assert!(matches!(
        remap_state_dict(clash),
        Err(ConvertError::DuplicateTensor(name)) if name == "model.foo"
    ));
}
