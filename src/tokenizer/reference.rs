use crate::error::{ConvertError, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

pub const DEFAULT_REFERENCE: &str = "THUDM/glm-4-9b";

const CONFIG_NAME: &str = "tokenizer_config.json";

/// Where the reference `tokenizer_config.json` comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReferenceSource {
    Hub {
        repo: String,
        revision: Option<String>,
    },
    /// A directory holding `tokenizer_config.json`, or the file itself.
    Local(PathBuf),
}

/// Metadata copied onto the rebuilt tokenizer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceTokenizer {
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
    pub pad_token: Option<String>,
    pub additional_special_tokens: Vec<String>,
    pub padding_side: String,
    pub clean_up_tokenization_spaces: bool,
}

impl Default for ReferenceSource {
    fn default() -> Self {
        Self::Hub {
            repo: DEFAULT_REFERENCE.into(),
            revision: None,
        }
    }
}

impl ReferenceSource {
    /// An existing path is read locally, anything else is a hub repo id.
    pub fn new(id: &str, revision: Option<String>) -> Self {
        let path = Path::new(id);
        if path.exists() {
            Self::Local(path.into())
        } else {
            Self::Hub {
                repo: id.into(),
                revision,
            }
        }
    }

    pub fn id(&self) -> String {
        match self {
            Self::Hub {
                repo,
                revision: Some(rev),
            } => format!("{repo}@{rev}"),
            Self::Hub { repo, .. } => repo.clone(),
            Self::Local(path) => path.display().to_string(),
        }
    }

    fn unavailable(&self, reason: impl ToString) -> ConvertError {
        ConvertError::ReferenceUnavailable {
            id: self.id(),
            reason: reason.to_string(),
        }
    }

    fn fetch(&self) -> Result<PathBuf> {
        match self {
            Self::Local(path) if path.is_dir() => Ok(path.join(CONFIG_NAME)),
            Self::Local(path) => Ok(path.clone()),
            Self::Hub { repo, revision } => {
                let api = Api::new().map_err(|e| self.unavailable(e))?;
                let repo = match revision {
                    Some(rev) => Repo::with_revision(repo.clone(), RepoType::Model, rev.clone()),
                    None => Repo::model(repo.clone()),
                };
                api.repo(repo)
                    .get(CONFIG_NAME)
                    .map_err(|e| self.unavailable(e))
            }
        }
    }

    pub fn load(&self) -> Result<ReferenceTokenizer> {
        let path = self.fetch()?;
        let text = fs::read_to_string(&path)
            .map_err(|e| self.unavailable(format!("{}: {e}", path.display())))?;
        let raw = serde_json::from_str::<RawConfig>(&text)
            .map_err(|e| self.unavailable(format!("{}: {e}", path.display())))?;
        info!("loaded reference tokenizer metadata from {}", self.id());
        Ok(raw.into())
    }
}

/// Tokens are either plain strings or serialised `AddedToken`s.
#[derive(Deserialize)]
#[serde(untagged)]
enum TokenField {
    Content(String),
    Added { content: String },
}

impl From<TokenField> for String {
    fn from(value: TokenField) -> Self {
        match value {
            TokenField::Content(content) | TokenField::Added { content } => content,
        }
    }
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    bos_token: Option<TokenField>,
    #[serde(default)]
    eos_token: Option<TokenField>,
    #[serde(default)]
    pad_token: Option<TokenField>,
    #[serde(default)]
    additional_special_tokens: Vec<TokenField>,
    #[serde(default)]
    padding_side: Option<String>,
    #[serde(default)]
    clean_up_tokenization_spaces: Option<bool>,
}

impl From<RawConfig> for ReferenceTokenizer {
    fn from(raw: RawConfig) -> Self {
        Self {
            bos_token: raw.bos_token.map(Into::into),
            eos_token: raw.eos_token.map(Into::into),
            pad_token: raw.pad_token.map(Into::into),
            additional_special_tokens: raw
                .additional_special_tokens
                .into_iter()
                .map(Into::into)
                .collect(),
            padding_side: raw.padding_side.unwrap_or_else(|| "right".into()),
            clean_up_tokenization_spaces: raw.clean_up_tokenization_spaces.unwrap_or(false),
        }
    }
}

#[cfg(test)]
pub(crate) const GLM4_TOKENIZER_CONFIG: &str = r#"{
  "added_tokens_decoder": {},
  "additional_special_tokens": [
    "<|endoftext|>", "[MASK]", "[gMASK]", "[sMASK]", "<sop>", "<eop>",
    "<|system|>", "<|user|>", "<|assistant|>", "<|observation|>"
  ],
  "auto_map": {
    "AutoTokenizer": ["tokenization_chatglm.ChatGLM4Tokenizer", null]
  },
  "clean_up_tokenization_spaces": false,
  "do_lower_case": false,
  "eos_token": "<|endoftext|>",
  "model_max_length": 128000,
  "pad_token": {"content": "<|endoftext|>", "lstrip": false, "normalized": false, "rstrip": false, "single_word": false},
  "padding_side": "left",
  "remove_space": false,
  "tokenizer_class": "ChatGLM4Tokenizer"
}"#;

#[test]
fn test_load_local() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(CONFIG_NAME), GLM4_TOKENIZER_CONFIG).unwrap();

    for source in [
        ReferenceSource::new(dir.path().to_str().unwrap(), None),
        ReferenceSource::Local(dir.path().join(CONFIG_NAME)),
    ] {
        let reference = source.load().unwrap();
        assert_eq!(reference.bos_token, None);
        assert_eq!(reference.eos_token.as_deref(), Some("<|endoftext|>"));
        assert_eq!(reference.pad_token.as_deref(), Some("<|endoftext|>"));
        assert_eq!(reference.additional_special_tokens.len(), 10);
        assert_eq!(reference.additional_special_tokens[2], "[gMASK]");
        assert_eq!(reference.padding_side, "left");
        assert!(!reference.clean_up_tokenization_spaces);
    }
}

#[test]
fn test_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let source = ReferenceSource::new(dir.path().to_str().unwrap(), None);
    assert!(matches!(
        source.load(),
        Err(ConvertError::ReferenceUnavailable { .. })
    ));

    fs::write(dir.path().join(CONFIG_NAME), "not json").unwrap();
    assert!(matches!(
        source.load(),
        Err(ConvertError::ReferenceUnavailable { .. })
    ));
}

#[test]
fn test_source_kind() {
    assert_eq!(
        ReferenceSource::new("THUDM/glm-4-9b", Some("main".into())),
        ReferenceSource::Hub {
            repo: "THUDM/glm-4-9b".into(),
            revision: Some("main".into()),
        }
    );
    assert_eq!(
        ReferenceSource::new("THUDM/glm-4-9b", Some("main".into())).id(),
        "THUDM/glm-4-9b@main"
    );
    assert_eq!(ReferenceSource::default().id(), DEFAULT_REFERENCE);
}
