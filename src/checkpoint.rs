use crate::error::{ConvertError, Result};
use memmap2::Mmap;
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    ops::Range,
    path::Path,
};
use tracing::{debug, info};

/// Weight collection keyed by parameter name; views borrow the bytes they were loaded from.
pub type StateDict<'a> = BTreeMap<String, TensorView<'a>>;

/// A merged checkpoint: one or more safetensors blobs laid end to end.
pub struct Checkpoint {
    mmap: Mmap,
}

struct Blob {
    range: Range<usize>,
    data: Range<usize>,
    meta: MetaJson,
}

impl Checkpoint {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        Ok(Self { mmap })
    }

    pub fn state_dict(&self) -> Result<StateDict<'_>> {
        let buf: &[u8] = &self.mmap;
        let mut tensors = StateDict::new();
        let blobs = split_blobs(buf)?;
        for blob in &blobs {
            SafeTensors::deserialize(&buf[blob.range.clone()]).map_err(|e| {
                ConvertError::Checkpoint {
                    offset: blob.range.start,
                    reason: e.to_string(),
                }
            })?;
            let data = &buf[blob.data.clone()];
            for (name, tensor) in &blob.meta.tensors {
                let view = TensorView::new(
                    tensor.dtype,
                    tensor.shape.clone(),
                    &data[tensor.data_offsets.clone()],
                )?;
                if tensors.insert(name.clone(), view).is_some() {
                    return Err(ConvertError::DuplicateTensor(name.clone()));
                }
            }
            debug!(
                offset = blob.range.start,
                tensors = blob.meta.tensors.len(),
                "read blob"
            );
        }
        info!(blobs = blobs.len(), tensors = tensors.len(), "loaded checkpoint");
        Ok(tensors)
    }
}

fn split_blobs(buf: &[u8]) -> Result<Vec<Blob>> {
    const LEN: usize = std::mem::size_of::<u64>();

    let mut blobs = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let err = |reason: &str| ConvertError::Checkpoint {
            offset,
            reason: reason.into(),
        };

        let rest = &buf[offset..];
        let Some((len, tail)) = rest.split_first_chunk::<LEN>() else {
            return Err(err("truncated header length"));
        };
        let len = usize::try_from(u64::from_le_bytes(*len))
            .ok()
            .filter(|&len| len <= tail.len())
            .ok_or_else(|| err("header length runs past the end of file"))?;
        let meta = serde_json::from_slice::<MetaJson>(&tail[..len])
            .map_err(|e| err(&format!("bad header: {e}")))?;

        let data_len = meta
            .tensors
            .values()
            .map(|t| t.data_offsets.end)
            .max()
            .unwrap_or(0);
        let data_start = offset + LEN + len;
        let end = data_start
            .checked_add(data_len)
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| err("tensor data runs past the end of file"))?;

        blobs.push(Blob {
            range: offset..end,
            data: data_start..end,
            meta,
        });
        offset = end;
    }
    Ok(blobs)
}

#[derive(serde::Deserialize, Debug)]
struct MetaJson {
    #[serde(flatten)]
    tensors: HashMap<String, Tensor>,
    #[serde(rename = "__metadata__", default)]
    #[allow(dead_code)]
    meta: Option<HashMap<String, serde_json::Value>>,
}

#[derive(serde::Deserialize, Debug)]
struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data_offsets: Range<usize>,
}

#[cfg(test)]
pub(crate) fn bf16_blob(tensors: &[(&str, Vec<usize>)]) -> Vec<u8> {
    use half::bf16;

    let payloads = tensors
        .iter()
        .enumerate()
        .map(|(i, (_, shape))| {
            let n = shape.iter().product::<usize>();
            (0..n)
                .flat_map(|j| bf16::from_f32((i * 1000 + j) as f32).to_le_bytes())
                .collect::<Vec<u8>>()
        })
        .collect::<Vec<_>>();
    let views = tensors
        .iter()
        .zip(&payloads)
        .map(|((name, shape), data)| {
            (
                name.to_string(),
                TensorView::new(Dtype::BF16, shape.clone(), data).unwrap(),
            )
        })
        .collect::<Vec<_>>();
    safetensors::serialize(views, &None).unwrap()
}

#[test]
fn test_concatenated_blobs() {
    let a = bf16_blob(&[("a.weight", vec![2, 3]), ("a.bias", vec![3])]);
    let b = bf16_blob(&[("b.weight", vec![4])]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("consolidated.safetensors");
    std::fs::write(&path, [a.as_slice(), b.as_slice()].concat()).unwrap();

    let checkpoint = Checkpoint::open(&path).unwrap();
    let state = checkpoint.state_dict().unwrap();
    assert_eq!(
        state.keys().map(String::as_str).collect::<Vec<_>>(),
        ["a.bias", "a.weight", "b.weight"]
    );
    assert_eq!(state["a.weight"].shape(), &[2, 3]);
    assert_eq!(state["b.weight"].dtype(), Dtype::BF16);

    // bytes pass through untouched
    let single = SafeTensors::deserialize(&b).unwrap();
    assert_eq!(state["b.weight"].data(), single.tensor("b.weight").unwrap().data());
}

#[test]
fn test_duplicate_tensor() {
    let a = bf16_blob(&[("w", vec![2])]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("consolidated.safetensors");
    std::fs::write(&path, [a.as_slice(), a.as_slice()].concat()).unwrap();

    let checkpoint = Checkpoint::open(&path).unwrap();
    assert!(matches!(
        checkpoint.state_dict(),
        Err(ConvertError::DuplicateTensor(name)) if name == "w"
    ));
}

#[test]
fn test_truncated() {
    let a = bf16_blob(&[("w", vec![8])]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("consolidated.safetensors");
    std::fs::write(&path, &a[..a.len() - 3]).unwrap();

    let checkpoint = Checkpoint::open(&path).unwrap();
    assert!(matches!(
        checkpoint.state_dict(),
        Err(ConvertError::Checkpoint { offset: 0, .. })
    ));
}
