use super::GlmWeights;
use crate::error::Result;
use safetensors::tensor::{serialize_to_file, TensorView};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::info;

pub const DEFAULT_MAX_SHARD_SIZE: usize = 5_000_000_000;

const WEIGHTS_NAME: &str = "model.safetensors";
const WEIGHTS_INDEX_NAME: &str = "model.safetensors.index.json";

#[derive(Clone, Debug)]
pub struct SavedWeights {
    pub files: Vec<PathBuf>,
    pub index: Option<PathBuf>,
    pub total_size: usize,
}

#[derive(Serialize)]
struct Index<'a> {
    metadata: IndexMeta,
    weight_map: BTreeMap<&'a str, String>,
}

#[derive(Serialize)]
struct IndexMeta {
    total_size: usize,
}

/// Writes `model.safetensors`, or numbered shards plus an index once `max_shard_size` is exceeded.
///
/// A tensor larger than `max_shard_size` gets a shard of its own.
pub fn save_weights(
    weights: &GlmWeights,
    dir: impl AsRef<Path>,
    max_shard_size: usize,
) -> Result<SavedWeights> {
    let dir = dir.as_ref();

    let mut groups = Vec::new();
    let mut current = Vec::<&(String, TensorView)>::new();
    let mut size = 0;
    for item in weights.tensors() {
        let n = item.1.data().len();
        if !current.is_empty() && size + n > max_shard_size {
            groups.push(std::mem::take(&mut current));
            size = 0;
        }
        current.push(item);
        size += n;
    }
    groups.push(current);

    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
    let total = groups.len();
    let mut files = Vec::with_capacity(total);
    let mut weight_map = BTreeMap::new();
    for (i, group) in groups.iter().enumerate() {
        let name = if total == 1 {
            WEIGHTS_NAME.to_string()
        } else {
            format!("model-{:05}-of-{total:05}.safetensors", i + 1)
        };
        let path = dir.join(&name);
        serialize_to_file(
            group.iter().map(|(name, view)| (name.as_str(), view)),
            &metadata,
            &path,
        )?;
        info!(tensors = group.len(), "wrote {}", path.display());

        for (tensor, _) in group {
            weight_map.insert(tensor.as_str(), name.clone());
        }
        files.push(path);
    }

    let total_size = weights.nbytes();
    let index = if total > 1 {
        let path = dir.join(WEIGHTS_INDEX_NAME);
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(
            &mut writer,
            &Index {
                metadata: IndexMeta { total_size },
                weight_map,
            },
        )?;
        writeln!(writer)?;
        writer.flush()?;
        info!("wrote {}", path.display());
        Some(path)
    } else {
        None
    };

    Ok(SavedWeights {
        files,
        index,
        total_size,
    })
}

#[cfg(test)]
fn tiny_weights<'a>(checkpoint: &'a crate::checkpoint::Checkpoint) -> GlmWeights<'a> {
    let state = crate::remap::remap_state_dict(checkpoint.state_dict().unwrap()).unwrap();
    super::Skeleton::new(&super::tiny_config())
        .assign(state)
        .unwrap()
}

#[test]
fn test_single_file() {
    use safetensors::SafeTensors;

    let (_src, checkpoint) = super::tiny_checkpoint(&super::tiny_source_tensors());
    let weights = tiny_weights(&checkpoint);
    let out = tempfile::tempdir().unwrap();

    let saved = save_weights(&weights, out.path(), DEFAULT_MAX_SHARD_SIZE).unwrap();
    assert_eq!(saved.files, [out.path().join(WEIGHTS_NAME)]);
    assert!(saved.index.is_none());
    assert_eq!(saved.total_size, weights.nbytes());

    let bytes = std::fs::read(&saved.files[0]).unwrap();
    let reloaded = SafeTensors::deserialize(&bytes).unwrap();
    assert_eq!(reloaded.len(), weights.len());
    for (name, view) in weights.tensors() {
        let back = reloaded.tensor(name).unwrap();
        assert_eq!(back.shape(), view.shape());
        assert_eq!(back.dtype(), view.dtype());
        assert_eq!(back.data(), view.data());
    }
    let (_, meta) = SafeTensors::read_metadata(&bytes).unwrap();
    assert_eq!(meta.metadata().as_ref().unwrap()["format"], "pt");
}

#[test]
fn test_sharded() {
    let (_src, checkpoint) = super::tiny_checkpoint(&super::tiny_source_tensors());
    let weights = tiny_weights(&checkpoint);
    let out = tempfile::tempdir().unwrap();

    // the embedding alone is 16 * 8 * 2 bytes
    let saved = save_weights(&weights, out.path(), 200).unwrap();
    assert!(saved.files.len() > 1);
    assert_eq!(
        saved.files[0].file_name().unwrap(),
        format!("model-00001-of-{:05}.safetensors", saved.files.len()).as_str()
    );

    let index = serde_json::from_slice::<serde_json::Value>(
        &std::fs::read(saved.index.unwrap()).unwrap(),
    )
    .unwrap();
    assert_eq!(index["metadata"]["total_size"], weights.nbytes());
    let weight_map = index["weight_map"].as_object().unwrap();
    assert_eq!(weight_map.len(), weights.len());
    assert_eq!(
        weight_map["model.embed_tokens.weight"],
        "model-00001-of-".to_string() + &format!("{:05}.safetensors", saved.files.len())
    );
    for file in &saved.files {
        let bytes = std::fs::read(file).unwrap();
        let shard = safetensors::SafeTensors::deserialize(&bytes).unwrap();
        for name in shard.names() {
            assert_eq!(
                weight_map[name.as_str()],
                file.file_name().unwrap().to_str().unwrap()
            );
        }
    }
}
