mod reference;
mod tiktoken;

use crate::error::{ConvertError, Result};
use serde_json::{json, Map, Value};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tokenizers::{
    decoders::DecoderWrapper,
    models::{bpe::BPE, ModelWrapper},
    normalizers::NormalizerWrapper,
    pre_tokenizers::{
        byte_level::ByteLevel,
        sequence::Sequence,
        split::{Split, SplitPattern},
        PreTokenizerWrapper,
    },
    processors::{
        sequence::Sequence as ProcessorSequence, template::TemplateProcessing,
        PostProcessorWrapper,
    },
    AddedToken, SplitDelimiterBehavior, Tokenizer, TokenizerBuilder,
};
use tracing::{info, warn};

pub use reference::{ReferenceSource, ReferenceTokenizer, DEFAULT_REFERENCE};
pub use tiktoken::{parse_ranks, read_ranks, vocab_and_merges};

pub const VOCAB_NAME: &str = "tokenizer.model";

/// Pre-tokenization split of the GLM-4 tokenizer.
pub const GLM_PATTERN: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

pub const GMASK: (&str, u32) = ("[gMASK]", 151331);
pub const SOP: (&str, u32) = ("<sop>", 151333);

/// The byte-level BPE pipeline with the `[gMASK] <sop>` prefix template, before any metadata.
pub fn build_pipeline(ranks: &[(Vec<u8>, u32)]) -> Result<Tokenizer> {
    let (vocab, merges) = vocab_and_merges(ranks);
    info!(vocab = vocab.len(), merges = merges.len(), "extracted byte-level bpe");

    let bpe = BPE::builder()
        .vocab_and_merges(vocab, merges)
        .fuse_unk(false)
        .ignore_merges(true)
        .build()
        .map_err(tokenizer_error)?;

    let split = Split::new(
        SplitPattern::Regex(GLM_PATTERN.into()),
        SplitDelimiterBehavior::Isolated,
        false,
    )
    .map_err(tokenizer_error)?;
    let pre_tokenizer = Sequence::new(vec![
        PreTokenizerWrapper::Split(split),
        PreTokenizerWrapper::ByteLevel(ByteLevel::new(false, true, false)),
    ]);

    let template = TemplateProcessing::builder()
        .try_single(format!("{}:0 {}:0 $A:0", GMASK.0, SOP.0))
        .map_err(ConvertError::Tokenizer)?
        .try_pair(format!("{}:0 {}:0 $A:0 $B:1", GMASK.0, SOP.0))
        .map_err(ConvertError::Tokenizer)?
        .special_tokens(vec![GMASK, SOP])
        .build()
        .map_err(tokenizer_error)?;
    let post_processor = ProcessorSequence::new(vec![
        PostProcessorWrapper::ByteLevel(ByteLevel::new(true, false, true)),
        PostProcessorWrapper::Template(template),
    ]);

    let tokenizer = TokenizerBuilder::<
        ModelWrapper,
        NormalizerWrapper,
        PreTokenizerWrapper,
        PostProcessorWrapper,
        DecoderWrapper,
    >::new()
    .with_model(ModelWrapper::BPE(bpe))
    .with_normalizer(None)
    .with_pre_tokenizer(Some(PreTokenizerWrapper::Sequence(pre_tokenizer)))
    .with_post_processor(Some(PostProcessorWrapper::Sequence(post_processor)))
    .with_decoder(Some(DecoderWrapper::ByteLevel(ByteLevel::default())))
    .build()
    .map_err(tokenizer_error)?;
    Ok(tokenizer.into())
}

fn tokenizer_error(e: impl ToString) -> ConvertError {
    ConvertError::Tokenizer(e.to_string())
}

/// Rebuilt pipeline plus the metadata taken from the reference tokenizer.
pub struct GlmTokenizer {
    pub tokenizer: Tokenizer,
    pub reference: ReferenceTokenizer,
}

impl GlmTokenizer {
    /// Registers the reference's special tokens, in `bos, eos, pad, additional` order.
    pub fn new(mut tokenizer: Tokenizer, reference: ReferenceTokenizer) -> Self {
        let added = special_tokens(&reference)
            .into_iter()
            .map(|token| AddedToken::from(token, true))
            .collect::<Vec<_>>();
        let n = tokenizer.add_special_tokens(&added);
        info!(added = n, "registered special tokens");

        for (token, id) in [GMASK, SOP] {
            match tokenizer.token_to_id(token) {
                Some(found) if found == id => {}
                found => warn!(?found, "{token} is bound to {id} in the template"),
            }
        }
        Self {
            tokenizer,
            reference,
        }
    }

    #[inline]
    pub fn special_tokens(&self) -> Vec<&str> {
        special_tokens(&self.reference)
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        let r = &self.reference;

        let tokenizer_path = dir.join("tokenizer.json");
        self.tokenizer
            .save(&tokenizer_path, false)
            .map_err(tokenizer_error)?;

        let mut added_tokens_decoder = Map::new();
        for token in self.special_tokens() {
            if let Some(id) = self.tokenizer.token_to_id(token) {
                added_tokens_decoder.insert(
                    id.to_string(),
                    json!({
                        "content": token,
                        "lstrip": false,
                        "normalized": false,
                        "rstrip": false,
                        "single_word": false,
                        "special": true,
                    }),
                );
            }
        }
        let config_path = dir.join("tokenizer_config.json");
        write_json(
            &config_path,
            &json!({
                "added_tokens_decoder": added_tokens_decoder,
                "additional_special_tokens": r.additional_special_tokens,
                "bos_token": r.bos_token,
                "clean_up_tokenization_spaces": r.clean_up_tokenization_spaces,
                "eos_token": r.eos_token,
                "pad_token": r.pad_token,
                "padding_side": r.padding_side,
                "tokenizer_class": "PreTrainedTokenizerFast",
            }),
        )?;

        let mut special_tokens_map = Map::new();
        for (key, token) in [
            ("bos_token", &r.bos_token),
            ("eos_token", &r.eos_token),
            ("pad_token", &r.pad_token),
        ] {
            if let Some(token) = token {
                special_tokens_map.insert(key.into(), token.as_str().into());
            }
        }
        special_tokens_map.insert(
            "additional_special_tokens".into(),
            r.additional_special_tokens.clone().into(),
        );
        let map_path = dir.join("special_tokens_map.json");
        write_json(&map_path, &Value::Object(special_tokens_map))?;

        info!("wrote tokenizer to {}", dir.display());
        Ok(vec![tokenizer_path, config_path, map_path])
    }
}

/// `bos, eos, pad` then the additional tokens, each once.
fn special_tokens(r: &ReferenceTokenizer) -> Vec<&str> {
    let mut ans = Vec::<&str>::new();
    for token in r
        .bos_token
        .iter()
        .chain(&r.eos_token)
        .chain(&r.pad_token)
        .chain(&r.additional_special_tokens)
    {
        if !ans.contains(&token.as_str()) {
            ans.push(token);
        }
    }
    ans
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

/// Builds the pipeline from `input_dir/tokenizer.model` and wraps it with the reference metadata.
pub fn convert_glm_tokenizer(
    input_dir: impl AsRef<Path>,
    reference: &ReferenceSource,
) -> Result<GlmTokenizer> {
    let ranks = read_ranks(input_dir.as_ref().join(VOCAB_NAME))?;
    let tokenizer = build_pipeline(&ranks)?;
    let reference = reference.load()?;
    Ok(GlmTokenizer::new(tokenizer, reference))
}

#[cfg(test)]
fn tiny_pipeline() -> Tokenizer {
    let ranks = parse_ranks(&tiktoken::encode_ranks(&["a", "b", "c", " ", "ab"])).unwrap();
    build_pipeline(&ranks).unwrap()
}

#[test]
fn test_single_template() {
    let tokenizer = tiny_pipeline();
    let encoding = tokenizer.encode("ab", true).unwrap();
    assert_eq!(encoding.get_ids(), &[151331, 151333, 4]);
    assert_eq!(encoding.get_tokens(), &["[gMASK]", "<sop>", "ab"]);
    assert_eq!(encoding.get_type_ids(), &[0, 0, 0]);
}

#[test]
fn test_pair_template() {
    let tokenizer = tiny_pipeline();
    let encoding = tokenizer.encode(("ab", "c"), true).unwrap();
    assert_eq!(encoding.get_ids(), &[151331, 151333, 4, 2]);
    assert_eq!(encoding.get_type_ids(), &[0, 0, 0, 1]);
}

#[test]
fn test_byte_level_round_trip() {
    let tokenizer = tiny_pipeline();
    let encoding = tokenizer.encode("ab c", false).unwrap();
    assert_eq!(encoding.get_ids(), &[4, 3, 2]);
    assert_eq!(encoding.get_tokens(), &["ab", "Ġ", "c"]);
    assert_eq!(tokenizer.decode(encoding.get_ids(), false).unwrap(), "ab c");
}

#[test]
fn test_wrap_and_save() {
    let reference = ReferenceTokenizer {
        eos_token: Some("<|endoftext|>".into()),
        pad_token: Some("<|endoftext|>".into()),
        additional_special_tokens: ["<|endoftext|>", "[MASK]", "[gMASK]", "[sMASK]", "<sop>"]
            .map(String::from)
            .to_vec(),
        padding_side: "left".into(),
        ..Default::default()
    };
    let glm = GlmTokenizer::new(tiny_pipeline(), reference);
    assert_eq!(
        glm.special_tokens(),
        ["<|endoftext|>", "[MASK]", "[gMASK]", "[sMASK]", "<sop>"]
    );
    // appended after the five ranked tokens
    assert_eq!(glm.tokenizer.token_to_id("<|endoftext|>"), Some(5));
    assert_eq!(glm.tokenizer.token_to_id("<sop>"), Some(9));

    let dir = tempfile::tempdir().unwrap();
    let files = glm.save(dir.path()).unwrap();
    assert_eq!(files.len(), 3);

    let reloaded = Tokenizer::from_file(&files[0]).unwrap();
    assert_eq!(
        reloaded.encode("ab", true).unwrap().get_ids(),
        &[151331, 151333, 4]
    );

    let config = serde_json::from_slice::<Value>(&std::fs::read(&files[1]).unwrap()).unwrap();
    assert_eq!(config["tokenizer_class"], "PreTrainedTokenizerFast");
    assert_eq!(config["padding_side"], "left");
    assert_eq!(config["bos_token"], Value::Null);
    assert_eq!(config["added_tokens_decoder"]["7"]["content"], "[gMASK]");

    let map = serde_json::from_slice::<Value>(&std::fs::read(&files[2]).unwrap()).unwrap();
    assert!(map.get("bos_token").is_none());
    assert_eq!(map["eos_token"], "<|endoftext|>");
}
