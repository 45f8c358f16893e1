//! Key-value Index Store used for the fingerprint and filename indexes
//!
//! Two backends:
//!   - **JSON** (default): whole map in memory, flushed atomically via temp+rename.
//!     Paths ending in `.json` select it; so does `JsonIndex::in_memory()` for tests.
//!   - **RocksDB** (feature `rocksdb`): write-through, any other path.
//!
//! Keys and values are opaque bytes. The JSON file stores both as lowercase hex
//! so the on-disk map stays valid UTF-8.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tds_core::types::{from_hex, to_hex};
use tds_core::{TdsError, TdsResult};

/// Minimal key-value contract the storage core needs.
///
/// `insert` overwrites an existing value; `query` returns `None` when the key is
/// absent. A backend failure is an error, never a silent miss.
pub trait IndexStore {
    fn insert(&mut self, key: &[u8], value: &[u8]) -> TdsResult<()>;
    fn query(&self, key: &[u8]) -> TdsResult<Option<Vec<u8>>>;
    /// Make every insert so far durable.
    fn flush(&mut self) -> TdsResult<()>;
}

/// JSON-file (or purely in-memory) index.
pub struct JsonIndex {
    path: Option<PathBuf>,
    entries: HashMap<String, String>,
    dirty: bool,
}

impl JsonIndex {
    /// Load from `path`, or start empty if the file does not exist yet.
    pub fn open(path: &Path) -> TdsResult<Self> {
        let entries = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data).map_err(|e| {
                TdsError::Corrupt(format!("parsing index {}: {e}", path.display()))
            })?
        } else {
            HashMap::new()
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "opened JSON index");
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
            dirty: false,
        })
    }

    /// Index with no backing file. `flush` is a no-op.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: HashMap::new(),
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IndexStore for JsonIndex {
    fn insert(&mut self, key: &[u8], value: &[u8]) -> TdsResult<()> {
        self.entries.insert(to_hex(key), to_hex(value));
        self.dirty = true;
        Ok(())
    }

    fn query(&self, key: &[u8]) -> TdsResult<Option<Vec<u8>>> {
        self.entries
            .get(&to_hex(key))
            .map(|v| {
                from_hex(v)
                    .ok_or_else(|| TdsError::Corrupt(format!("bad hex value in index: {v}")))
            })
            .transpose()
    }

    fn flush(&mut self) -> TdsResult<()> {
        let Some(path) = &self.path else {
            self.dirty = false;
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(&self.entries)
            .map_err(|e| TdsError::Storage(format!("serializing index: {e}")))?;

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;

        self.dirty = false;
        tracing::debug!(path = %path.display(), entries = self.entries.len(), "index flushed");
        Ok(())
    }
}

impl Drop for JsonIndex {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                tracing::warn!("failed to flush index on drop: {e}");
            }
        }
    }
}

#[cfg(feature = "rocksdb")]
mod rocks {
    use super::*;

    /// RocksDB-backed index. Every insert is written through.
    pub struct RocksIndex {
        db: rocksdb::DB,
        path: PathBuf,
    }

    impl RocksIndex {
        pub fn open(path: &Path) -> TdsResult<Self> {
            let mut opts = rocksdb::Options::default();
            opts.create_if_missing(true);
            let db = rocksdb::DB::open(&opts, path).map_err(|e| {
                TdsError::Storage(format!("opening RocksDB index {}: {e}", path.display()))
            })?;
            tracing::debug!(path = %path.display(), "opened RocksDB index");
            Ok(Self {
                db,
                path: path.to_path_buf(),
            })
        }
    }

    impl IndexStore for RocksIndex {
        fn insert(&mut self, key: &[u8], value: &[u8]) -> TdsResult<()> {
            self.db.put(key, value).map_err(|e| {
                TdsError::Storage(format!("RocksDB put in {}: {e}", self.path.display()))
            })
        }

        fn query(&self, key: &[u8]) -> TdsResult<Option<Vec<u8>>> {
            self.db.get(key).map_err(|e| {
                TdsError::Storage(format!("RocksDB get in {}: {e}", self.path.display()))
            })
        }

        fn flush(&mut self) -> TdsResult<()> {
            self.db.flush().map_err(|e| {
                TdsError::Storage(format!("RocksDB flush of {}: {e}", self.path.display()))
            })
        }
    }
}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksIndex;

/// Backend chosen at open time.
pub enum IndexBackend {
    Json(JsonIndex),
    #[cfg(feature = "rocksdb")]
    Rocks(RocksIndex),
}

impl IndexBackend {
    /// Open the backend a path implies: `.json` is JSON, anything else RocksDB.
    ///
    /// Without the `rocksdb` feature every path falls back to JSON.
    pub fn open(path: &Path) -> TdsResult<Self> {
        if path.extension().is_some_and(|ext| ext == "json") {
            return Ok(IndexBackend::Json(JsonIndex::open(path)?));
        }

        #[cfg(feature = "rocksdb")]
        {
            Ok(IndexBackend::Rocks(RocksIndex::open(path)?))
        }

        #[cfg(not(feature = "rocksdb"))]
        {
            tracing::warn!(
                "index path {} is not .json but the rocksdb feature is disabled; using JSON",
                path.display()
            );
            Ok(IndexBackend::Json(JsonIndex::open(path)?))
        }
    }

    pub fn in_memory() -> Self {
        IndexBackend::Json(JsonIndex::in_memory())
    }
}

impl IndexStore for IndexBackend {
    fn insert(&mut self, key: &[u8], value: &[u8]) -> TdsResult<()> {
        match self {
            IndexBackend::Json(i) => i.insert(key, value),
            #[cfg(feature = "rocksdb")]
            IndexBackend::Rocks(i) => i.insert(key, value),
        }
    }

    fn query(&self, key: &[u8]) -> TdsResult<Option<Vec<u8>>> {
        match self {
            IndexBackend::Json(i) => i.query(key),
            #[cfg(feature = "rocksdb")]
            IndexBackend::Rocks(i) => i.query(key),
        }
    }

    fn flush(&mut self) -> TdsResult<()> {
        match self {
            IndexBackend::Json(i) => i.flush(),
            #[cfg(feature = "rocksdb")]
            IndexBackend::Rocks(i) => i.flush(),
        }
    }
}
