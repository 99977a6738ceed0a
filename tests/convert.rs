use glm2hf_rs::{convert_glm_model, ConvertError, ConvertOptions, ReferenceSource};
use half::bf16;
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use serde_json::{json, Value};
use std::{collections::HashMap, fs, path::Path};

const HIDDEN: usize = 8;
const FFN: usize = 12;
const VOCAB: usize = 16;
const LAYERS: usize = 2;
// 4 heads and 1 kv group of width 2
const QKV: usize = (4 + 2) * 2;

fn source_config() -> Value {
    json!({
        "architectures": ["ChatGLMModel"],
        "model_type": "chatglm",
        "add_bias_linear": false,
        "add_qkv_bias": true,
        "apply_residual_connection_post_layernorm": false,
        "attention_dropout": 0.0,
        "ffn_hidden_size": FFN,
        "hidden_dropout": 0.0,
        "hidden_size": HIDDEN,
        "initializer_range": 0.02,
        "kv_channels": 2,
        "layernorm_epsilon": 1.5625e-07,
        "max_position_embeddings": 128,
        "multi_query_attention": true,
        "multi_query_group_num": 1,
        "num_attention_heads": 4,
        "num_hidden_layer": LAYERS,
        "padded_vocab_size": VOCAB,
        "post_layer_norm": true,
        "rmsnorm": true,
        "rope_ratio": 1,
        "use_cache": true,
    })
}

fn source_tensors() -> Vec<(String, Vec<usize>)> {
    let mut tensors = vec![(
        "transformer.embedding.word_embeddings.weight".to_string(),
        vec![VOCAB, HIDDEN],
    )];
    for layer in 0..LAYERS {
        let prefix = format!("transformer.encoder.layers.{layer}");
        tensors.extend([
            (format!("{prefix}.input_layernorm.weight"), vec![HIDDEN]),
            (format!("{prefix}.self_attention.query_key_value.weight"), vec![QKV, HIDDEN]),
            (format!("{prefix}.self_attention.query_key_value.bias"), vec![QKV]),
            (format!("{prefix}.self_attention.dense.weight"), vec![HIDDEN, HIDDEN]),
            (format!("{prefix}.post_attention_layernorm.weight"), vec![HIDDEN]),
            (format!("{prefix}.mlp.dense_h_to_4h.weight"), vec![2 * FFN, HIDDEN]),
            (format!("{prefix}.mlp.dense_4h_to_h.weight"), vec![HIDDEN, FFN]),
        ]);
    }
    tensors.extend([
        (
            "transformer.encoder.final_layernorm.weight".to_string(),
            vec![HIDDEN],
        ),
        ("transformer.output_layer.weight".to_string(), vec![VOCAB, HIDDEN]),
    ]);
    tensors
}

fn payload(seed: usize, shape: &[usize]) -> Vec<u8> {
    (0..shape.iter().product::<usize>())
        .flat_map(|i| bf16::from_f32((seed * 100 + i) as f32 / 64.).to_le_bytes())
        .collect()
}

fn write_shard(path: &Path, tensors: &[(String, Vec<usize>, Vec<u8>)]) {
    let views = tensors
        .iter()
        .map(|(name, shape, data)| {
            (
                name.as_str(),
                TensorView::new(Dtype::BF16, shape.clone(), data).unwrap(),
            )
        })
        .collect::<Vec<_>>();
    safetensors::serialize_to_file(views, &None, path).unwrap();
}

/// Writes a three-shard checkpoint and returns each source tensor's bytes.
fn write_checkpoint(dir: &Path) -> HashMap<String, Vec<u8>> {
    fs::write(dir.join("config.json"), source_config().to_string()).unwrap();

    let tensors = source_tensors()
        .into_iter()
        .enumerate()
        .map(|(i, (name, shape))| {
            let data = payload(i, &shape);
            (name, shape, data)
        })
        .collect::<Vec<_>>();
    let chunk = tensors.len().div_ceil(3);
    // highest ordinal first so directory order is no help
    for (i, part) in tensors.chunks(chunk).enumerate().rev() {
        let name = format!("model-{:05}-of-00003.safetensors", i + 1);
        write_shard(&dir.join(name), part);
    }

    let ranks = ["a", "b", "c", " ", "ab"]
        .iter()
        .enumerate()
        .map(|(rank, token)| {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            format!("{} {rank}\n", STANDARD.encode(token))
        })
        .collect::<String>();
    fs::write(dir.join("tokenizer.model"), ranks).unwrap();

    tensors
        .into_iter()
        .map(|(name, _, data)| (name, data))
        .collect()
}

fn reference_dir(dir: &Path) -> ReferenceSource {
    let config = json!({
        "additional_special_tokens": ["<|endoftext|>", "[MASK]", "[gMASK]", "[sMASK]", "<sop>", "<eop>"],
        "clean_up_tokenization_spaces": false,
        "eos_token": "<|endoftext|>",
        "pad_token": "<|endoftext|>",
        "padding_side": "left",
        "tokenizer_class": "ChatGLM4Tokenizer",
    });
    fs::write(dir.join("tokenizer_config.json"), config.to_string()).unwrap();
    ReferenceSource::Local(dir.to_path_buf())
}

#[test]
fn convert_end_to_end() {
    let input = tempfile::tempdir().unwrap();
    let reference = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let output = output.path().join("glm-hf");

    let source = write_checkpoint(input.path());
    let options = ConvertOptions {
        reference: reference_dir(reference.path()),
        ..Default::default()
    };
    let report = convert_glm_model(input.path(), &output, &options).unwrap();

    assert_eq!(report.shards, 3);
    assert_eq!(report.tensors, source.len());
    assert_eq!(report.vocab_size, Some(5 + 6));
    assert_eq!(
        report.unused_config_keys,
        ["architectures", "model_type"]
    );
    for name in [
        "config.json",
        "model.safetensors",
        "tokenizer.json",
        "tokenizer_config.json",
        "special_tokens_map.json",
    ] {
        assert!(output.join(name).is_file(), "{name} missing");
    }

    let config = serde_json::from_slice::<Value>(&fs::read(output.join("config.json")).unwrap())
        .unwrap();
    assert_eq!(config["num_key_value_heads"], 1);
    assert_eq!(config["rope_theta"], 10000.0);
    assert_eq!(config["vocab_size"], VOCAB);

    // every value arrives byte-identical under its new name
    let bytes = fs::read(output.join("model.safetensors")).unwrap();
    let weights = SafeTensors::deserialize(&bytes).unwrap();
    assert_eq!(weights.len(), source.len());
    for (old, data) in &source {
        let new = glm2hf_rs::remap_key(old);
        assert_eq!(weights.tensor(&new).unwrap().data(), data.as_slice(), "{new}");
    }
    assert!(weights.tensor("lm_head.weight").is_ok());
    assert!(weights.tensor("model.layers.1.mlp.gate_up_proj.weight").is_ok());

    let tokenizer = tokenizers::Tokenizer::from_file(output.join("tokenizer.json")).unwrap();
    let encoding = tokenizer.encode(("ab", "c"), true).unwrap();
    assert_eq!(encoding.get_ids(), &[151331, 151333, 4, 2]);
    assert_eq!(encoding.get_type_ids(), &[0, 0, 0, 1]);
}

#[test]
fn sharded_output() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_checkpoint(input.path());

    let options = ConvertOptions {
        max_shard_size: 256,
        skip_tokenizer: true,
        ..Default::default()
    };
    let report = convert_glm_model(input.path(), output.path(), &options).unwrap();
    assert_eq!(report.vocab_size, None);
    assert!(!output.path().join("tokenizer.json").exists());

    let index = serde_json::from_slice::<Value>(
        &fs::read(output.path().join("model.safetensors.index.json")).unwrap(),
    )
    .unwrap();
    let weight_map = index["weight_map"].as_object().unwrap();
    assert_eq!(weight_map.len(), report.tensors);
    for file in weight_map.values() {
        assert!(output.path().join(file.as_str().unwrap()).is_file());
    }
}

#[test]
fn missing_config_field_writes_nothing() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let output = output.path().join("never");
    write_checkpoint(input.path());

    let mut config = source_config();
    config.as_object_mut().unwrap().remove("kv_channels");
    fs::write(input.path().join("config.json"), config.to_string()).unwrap();

    let err = convert_glm_model(input.path(), &output, &ConvertOptions::default()).unwrap_err();
    assert!(matches!(err, ConvertError::MissingField("kv_channels")));
    assert!(!output.exists());
    assert!(!input.path().join("consolidated.safetensors").exists());
}

#[test]
fn unexpected_weight_is_fatal() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_checkpoint(input.path());
    write_shard(
        &input.path().join("model-00004-of-00004.safetensors"),
        &[(
            "transformer.encoder.layers.0.mlp.extra.weight".into(),
            vec![2],
            payload(0, &[2]),
        )],
    );

    let options = ConvertOptions {
        skip_tokenizer: true,
        ..Default::default()
    };
    let err = convert_glm_model(input.path(), output.path(), &options).unwrap_err();
    let ConvertError::WeightMismatch(msg) = err else {
        panic!("expected a weight mismatch, got {err:?}");
    };
    assert!(msg.contains("model.layers.0.mlp.extra.weight"));
    assert!(!output.path().join("model.safetensors").exists());
}

#[test]
fn unavailable_reference_is_fatal() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let empty = tempfile::tempdir().unwrap();
    write_checkpoint(input.path());

    let options = ConvertOptions {
        reference: ReferenceSource::Local(empty.path().to_path_buf()),
        ..Default::default()
    };
    let err = convert_glm_model(input.path(), output.path(), &options).unwrap_err();
    assert!(matches!(err, ConvertError::ReferenceUnavailable { .. }));
}
