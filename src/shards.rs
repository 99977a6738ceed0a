use crate::error::{ConvertError, Result};
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

pub const SHARD_SUFFIX: &str = ".safetensors";
pub const MERGED_NAME: &str = "consolidated.safetensors";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shard {
    pub ordinal: u32,
    pub path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct Merged {
    pub path: PathBuf,
    pub shards: Vec<Shard>,
    pub bytes: u64,
}

/// Ordinal of `model-00002-of-00008.safetensors` is 2: the second `-` segment of the file name.
pub fn shard_ordinal(file_name: &str) -> Result<u32> {
    file_name
        .splitn(3, '-')
        .nth(1)
        .and_then(|segment| segment.parse().ok())
        .ok_or_else(|| ConvertError::ShardName(file_name.into()))
}

/// Every `*.safetensors` file in `dir` except a previous merge output, ascending by ordinal.
pub fn list_shards(dir: impl AsRef<Path>) -> Result<Vec<Shard>> {
    let dir = dir.as_ref();
    let mut shards = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        // hub downloads link shards into place
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        let lossy = name.to_string_lossy();
        if !lossy.ends_with(SHARD_SUFFIX) || lossy == MERGED_NAME {
            continue;
        }
        let Some(name) = name.to_str() else {
            return Err(ConvertError::ShardName(lossy.into_owned()));
        };
        shards.push(Shard {
            ordinal: shard_ordinal(name)?,
            path,
        });
    }
    if shards.is_empty() {
        return Err(ConvertError::NoShards(dir.to_path_buf()));
    }
    shards.sort_by(|a, b| a.ordinal.cmp(&b.ordinal).then_with(|| a.path.cmp(&b.path)));
    Ok(shards)
}

/// Concatenates the shards of `dir` byte for byte into `dir/consolidated.safetensors`.
pub fn merge_shards(dir: impl AsRef<Path>) -> Result<Merged> {
    let dir = dir.as_ref();
    let shards = list_shards(dir)?;
    let path = dir.join(MERGED_NAME);

    let mut out = BufWriter::new(File::create(&path)?);
    let mut bytes = 0;
    for shard in &shards {
        let mut input = BufReader::new(File::open(&shard.path)?);
        let n = io::copy(&mut input, &mut out)?;
        debug!(ordinal = shard.ordinal, bytes = n, "appended {}", shard.path.display());
        bytes += n;
    }
    out.flush()?;

    info!(
        shards = shards.len(),
        bytes,
        "merged shards into {}",
        path.display()
    );
    Ok(Merged {
        path,
        shards,
        bytes,
    })
}

#[test]
fn test_ordinal() {
    assert_eq!(shard_ordinal("model-00002-of-00008.safetensors").unwrap(), 2);
    assert_eq!(shard_ordinal("model-10-of-12.safetensors").unwrap(), 10);
    assert!(matches!(
        shard_ordinal("model.safetensors"),
        Err(ConvertError::ShardName(_))
    ));
    assert!(matches!(
        shard_ordinal("model-final-of-00008.safetensors"),
        Err(ConvertError::ShardName(_))
    ));
}

#[test]
fn test_merge_order() {
    let dir = tempfile::tempdir().unwrap();
    // created in reverse so directory order is unlikely to help
    for i in (1..=3).rev() {
        let name = format!("model-{i:05}-of-00003.safetensors");
        fs::write(dir.path().join(name), vec![i as u8; 10 * i]).unwrap();
    }
    fs::write(dir.path().join("config.json"), b"{}").unwrap();

    let merged = merge_shards(dir.path()).unwrap();
    assert_eq!(
        merged.shards.iter().map(|s| s.ordinal).collect::<Vec<_>>(),
        [1, 2, 3]
    );
    assert_eq!(merged.bytes, 60);

    let expected = merged
        .shards
        .iter()
        .flat_map(|s| fs::read(&s.path).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(fs::read(&merged.path).unwrap(), expected);

    // a rerun ignores the previous merge output
    let again = merge_shards(dir.path()).unwrap();
    assert_eq!(again.shards.len(), 3);
    assert_eq!(fs::read(&again.path).unwrap(), expected);
}

#[test]
fn test_no_shards() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("config.json"), b"{}").unwrap();
    assert!(matches!(
        merge_shards(dir.path()),
        Err(ConvertError::NoShards(_))
    ));
    assert!(!dir.path().join(MERGED_NAME).exists());
}

#[test]
fn test_bad_shard_name() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("model.safetensors"), b"").unwrap();
    assert!(matches!(
        merge_shards(dir.path()),
        Err(ConvertError::ShardName(name)) if name == "model.safetensors"
    ));
}

#[cfg(unix)]
#[test]
fn test_symlinked_shards() {
    use std::os::unix::fs::symlink;

    let blobs = tempfile::tempdir().unwrap();
    let dir = tempfile::tempdir().unwrap();
    for i in 1..=2 {
        let blob = blobs.path().join(format!("blob{i}"));
        fs::write(&blob, vec![i as u8; 4]).unwrap();
        symlink(&blob, dir.path().join(format!("model-{i:05}-of-00002.safetensors"))).unwrap();
    }
    // a dangling link is not a shard
    symlink(
        blobs.path().join("gone"),
        dir.path().join("model-00003-of-00002.safetensors"),
    )
    .unwrap();

    let merged = merge_shards(dir.path()).unwrap();
    assert_eq!(
        merged.shards.iter().map(|s| s.ordinal).collect::<Vec<_>>(),
        [1, 2]
    );
    assert_eq!(fs::read(&merged.path).unwrap(), [1, 1, 1, 1, 2, 2, 2, 2]);
}

#[cfg(target_os = "linux")]
#[test]
fn test_non_utf8_shard_name() {
    use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

    let dir = tempfile::tempdir().unwrap();
    let name = OsStr::from_bytes(b"model-\xff-of-00002.safetensors");
    fs::write(dir.path().join(name), b"").unwrap();
    assert!(matches!(
        list_shards(dir.path()),
        Err(ConvertError::ShardName(name)) if name.ends_with(".safetensors")
    ));
}
