//! Client-side key recipes
//!
//! Unpopular chunks are encrypted under random keys the key server never sees
//! again, so the uploader must keep every final chunk key to decrypt on
//! restore. A key recipe is the ordered list of final keys for one logical
//! file, aligned entry-for-entry with the server-side recipe. Like the recipe,
//! it only ever grows: each upload session appends its keys.
//!
//! On-disk format (JSON, mode 0600 on unix):
//! ```json
//! { "file": "<hex file name hash>", "keys": ["<hex key>", ...] }
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tds_core::types::{from_hex, to_hex, KEY_SIZE};
use tds_core::{ChunkKey, FileNameHash};

#[derive(Serialize, Deserialize)]
struct KeyRecipeFile {
    file: String,
    keys: Vec<String>,
}

/// Final chunk keys for one file, in recipe order.
#[derive(Debug, Clone)]
pub struct KeyRecipe {
    file: FileNameHash,
    keys: Vec<ChunkKey>,
}

impl KeyRecipe {
    pub fn new(file: FileNameHash) -> Self {
        Self {
            file,
            keys: Vec::new(),
        }
    }

    /// `<dir>/<hex file name hash>.keys`
    pub fn path_for(dir: &Path, file: &FileNameHash) -> PathBuf {
        dir.join(format!("{}.keys", file.to_hex()))
    }

    pub fn file(&self) -> &FileNameHash {
        &self.file
    }

    pub fn push(&mut self, key: ChunkKey) {
        self.keys.push(key);
    }

    pub fn extend(&mut self, keys: impl IntoIterator<Item = ChunkKey>) {
        self.keys.extend(keys);
    }

    /// Key for the recipe entry at `position`.
    pub fn get(&self, position: usize) -> Option<&ChunkKey> {
        self.keys.get(position)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load the key recipe for `file` from `dir`, or an empty one if none exists.
    pub fn load_or_new(dir: &Path, file: &FileNameHash) -> anyhow::Result<Self> {
        let path = Self::path_for(dir, file);
        if !path.exists() {
            return Ok(Self::new(*file));
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading key recipe: {}", path.display()))?;
        let raw: KeyRecipeFile = serde_json::from_str(&data)
            .with_context(|| format!("parsing key recipe: {}", path.display()))?;

        let file = from_hex(&raw.file)
            .and_then(|b| <[u8; 32]>::try_from(b).ok())
            .map(FileNameHash)
            .with_context(|| format!("bad file hash in key recipe: {}", path.display()))?;

        let keys = raw
            .keys
            .iter()
            .enumerate()
            .map(|(i, hex)| {
                from_hex(hex)
                    .and_then(|b| <[u8; KEY_SIZE]>::try_from(b).ok())
                    .map(ChunkKey::from_bytes)
                    .with_context(|| format!("bad key #{i} in {}", path.display()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self { file, keys })
    }

    /// Write atomically to `<dir>/<hex>.keys`.
    pub fn save(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating key recipe dir: {}", dir.display()))?;
        let path = Self::path_for(dir, &self.file);
        let raw = KeyRecipeFile {
            file: self.file.to_hex(),
            keys: self.keys.iter().map(|k| to_hex(k.as_bytes())).collect(),
        };
        let json = serde_json::to_string_pretty(&raw).context("serializing key recipe")?;

        let tmp_path = path.with_extension("tmp");
        write_private(&tmp_path, json.as_bytes())
            .with_context(|| format!("writing key recipe: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming key recipe: {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}
