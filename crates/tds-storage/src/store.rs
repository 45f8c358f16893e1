//! Storage core: deduplicating chunk store plus recipe store and restore
//!
//! Single writer. The fingerprint index maps a chunk's fingerprint to a
//! serialized `ContainerLocation`; the filename index maps a file identity to
//! its recipe file name. Chunks already in the fingerprint index are skipped,
//! which is the whole of deduplication.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tds_core::config::StorageConfig;
use tds_core::{
    Chunk, ContainerLocation, FileNameHash, Fingerprint, RecipeEntry, TdsError, TdsResult,
};

use crate::cache::ReadCache;
use crate::container::ContainerManager;
use crate::index::{IndexBackend, IndexStore};
use crate::recipe::{append_entries, decode_entries, recipe_name};

/// Counters and phase timings for chunk storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub chunks: u64,
    /// Chunks actually written to a container
    pub stored: u64,
    /// Chunks skipped because the fingerprint was already indexed
    pub duplicates: u64,
    pub bytes_written: u64,
    pub query_time: Duration,
    pub write_time: Duration,
    pub insert_time: Duration,
}

impl StoreStats {
    pub fn merge(&mut self, other: &StoreStats) {
        self.chunks += other.chunks;
        self.stored += other.stored;
        self.duplicates += other.duplicates;
        self.bytes_written += other.bytes_written;
        self.query_time += other.query_time;
        self.write_time += other.write_time;
        self.insert_time += other.insert_time;
    }
}

/// Counters and phase timings for chunk restore.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreStats {
    pub chunks: u64,
    pub bytes: u64,
    pub index_time: Duration,
    pub read_time: Duration,
}

pub struct StorageCore {
    containers: ContainerManager,
    chunk_index: IndexBackend,
    filename_index: IndexBackend,
    recipe_dir: PathBuf,
    store_stats: StoreStats,
    restore_stats: RestoreStats,
}

impl StorageCore {
    pub fn new(
        containers: ContainerManager,
        chunk_index: IndexBackend,
        filename_index: IndexBackend,
        recipe_dir: &Path,
    ) -> TdsResult<Self> {
        std::fs::create_dir_all(recipe_dir)?;
        Ok(Self {
            containers,
            chunk_index,
            filename_index,
            recipe_dir: recipe_dir.to_path_buf(),
            store_stats: StoreStats::default(),
            restore_stats: RestoreStats::default(),
        })
    }

    /// Open every on-disk component named by the storage config.
    pub fn open(config: &StorageConfig) -> TdsResult<Self> {
        let capacity = usize::try_from(config.max_container_size).map_err(|_| {
            TdsError::Config(format!(
                "max_container_size {} does not fit in memory",
                config.max_container_size
            ))
        })?;
        let containers = ContainerManager::open(
            &config.container_dir,
            &config.state_file,
            capacity,
            ReadCache::new(config.read_cache_containers),
        )?;
        let chunk_index = IndexBackend::open(&config.chunk_index)?;
        let filename_index = IndexBackend::open(&config.filename_index)?;
        tracing::info!(
            container = containers.current_name(),
            used = containers.used(),
            capacity,
            "storage core opened"
        );
        Self::new(containers, chunk_index, filename_index, &config.recipe_dir)
    }

    pub fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    /// Totals over every `store_chunks` call so far.
    pub fn store_stats(&self) -> &StoreStats {
        &self.store_stats
    }

    /// Totals over every `restore_chunks` call so far.
    pub fn restore_stats(&self) -> &RestoreStats {
        &self.restore_stats
    }

    /// Store a batch, skipping chunks whose fingerprint is already indexed.
    ///
    /// A duplicate inside the same batch is caught too: the first copy is
    /// indexed before the second is looked up.
    pub fn store_chunks(&mut self, chunks: &[Chunk]) -> TdsResult<StoreStats> {
        let mut stats = StoreStats {
            chunks: chunks.len() as u64,
            ..StoreStats::default()
        };

        for chunk in chunks {
            let started = Instant::now();
            let known = self.chunk_index.query(chunk.fingerprint.as_bytes())?;
            stats.query_time += started.elapsed();

            if known.is_some() {
                stats.duplicates += 1;
                continue;
            }

            let started = Instant::now();
            let loc = self.containers.write(&chunk.data)?;
            stats.write_time += started.elapsed();

            let started = Instant::now();
            self.index_location(&chunk.fingerprint, &loc)?;
            stats.insert_time += started.elapsed();

            stats.stored += 1;
            stats.bytes_written += chunk.data.len() as u64;
        }

        tracing::debug!(
            chunks = stats.chunks,
            stored = stats.stored,
            duplicates = stats.duplicates,
            "stored chunk batch"
        );
        self.store_stats.merge(&stats);
        Ok(stats)
    }

    /// Unconditionally write one chunk and index its location.
    pub fn store_chunk(&mut self, chunk: &Chunk) -> TdsResult<ContainerLocation> {
        let loc = self.containers.write(&chunk.data)?;
        self.index_location(&chunk.fingerprint, &loc)?;
        Ok(loc)
    }

    fn index_location(&mut self, fp: &Fingerprint, loc: &ContainerLocation) -> TdsResult<()> {
        let value = serde_json::to_vec(loc)
            .map_err(|e| TdsError::Storage(format!("serializing location: {e}")))?;
        self.chunk_index.insert(fp.as_bytes(), &value)
    }

    /// Append recipe entries for a file, registering a new recipe file on first use.
    pub fn store_recipe(&mut self, file: &FileNameHash, entries: &[RecipeEntry]) -> TdsResult<()> {
        let name = match self.filename_index.query(file.as_bytes())? {
            Some(raw) => String::from_utf8(raw).map_err(|e| {
                TdsError::Corrupt(format!("filename index entry for {file} is not UTF-8: {e}"))
            })?,
            None => {
                let name = recipe_name(file);
                self.filename_index.insert(file.as_bytes(), name.as_bytes())?;
                tracing::debug!(file = %file, recipe = %name, "registered recipe");
                name
            }
        };
        append_entries(&self.recipe_dir.join(&name), entries)
    }

    fn recipe_path(&self, file: &FileNameHash) -> TdsResult<PathBuf> {
        let raw = self
            .filename_index
            .query(file.as_bytes())?
            .ok_or_else(|| TdsError::NotFound(format!("no recipe for file {file}")))?;
        let name = String::from_utf8(raw).map_err(|e| {
            TdsError::Corrupt(format!("filename index entry for {file} is not UTF-8: {e}"))
        })?;
        let path = self.recipe_dir.join(name);
        if !path.exists() {
            return Err(TdsError::Corrupt(format!(
                "filename index names {} but the recipe file is missing",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Every recipe entry ever appended for `file`, in append order.
    pub fn restore_recipe(&self, file: &FileNameHash) -> TdsResult<Vec<RecipeEntry>> {
        let path = self.recipe_path(file)?;
        decode_entries(&std::fs::read(&path)?)
    }

    /// Byte length of the recipe file for `file`.
    pub fn restore_recipe_size(&self, file: &FileNameHash) -> TdsResult<u64> {
        let path = self.recipe_path(file)?;
        Ok(std::fs::metadata(&path)?.len())
    }

    /// Fetch the chunks for `recipe[start..end]`, checking each stored length
    /// against the recipe's recorded size.
    pub fn restore_chunks(
        &mut self,
        recipe: &[RecipeEntry],
        start: usize,
        end: usize,
    ) -> TdsResult<Vec<Chunk>> {
        let entries = recipe.get(start..end).ok_or_else(|| {
            TdsError::Storage(format!(
                "recipe range {start}..{end} out of bounds ({} entries)",
                recipe.len()
            ))
        })?;

        let mut stats = RestoreStats::default();
        let mut chunks = Vec::with_capacity(entries.len());
        for entry in entries {
            let started = Instant::now();
            let loc = self.locate(&entry.fingerprint)?;
            stats.index_time += started.elapsed();

            let started = Instant::now();
            let data = self.containers.read(&loc)?;
            stats.read_time += started.elapsed();

            if data.len() != entry.size as usize {
                return Err(TdsError::Corrupt(format!(
                    "chunk {} ({}) restored {} bytes, recipe records {}",
                    entry.chunk_id,
                    entry.fingerprint,
                    data.len(),
                    entry.size
                )));
            }
            stats.chunks += 1;
            stats.bytes += data.len() as u64;
            chunks.push(Chunk::new(entry.chunk_id, entry.fingerprint, data));
        }

        self.restore_stats.chunks += stats.chunks;
        self.restore_stats.bytes += stats.bytes;
        self.restore_stats.index_time += stats.index_time;
        self.restore_stats.read_time += stats.read_time;
        Ok(chunks)
    }

    /// Fetch one chunk's stored bytes by fingerprint.
    pub fn restore_chunk(&mut self, fp: &Fingerprint) -> TdsResult<Vec<u8>> {
        let loc = self.locate(fp)?;
        self.containers.read(&loc)
    }

    fn locate(&self, fp: &Fingerprint) -> TdsResult<ContainerLocation> {
        let raw = self
            .chunk_index
            .query(fp.as_bytes())?
            .ok_or_else(|| TdsError::NotFound(format!("chunk {fp} is not indexed")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| TdsError::Corrupt(format!("bad location for chunk {fp}: {e}")))
    }

    /// Persist the open container, its sidecar, and both indexes.
    pub fn checkpoint(&mut self) -> TdsResult<()> {
        self.containers.checkpoint()?;
        self.chunk_index.flush()?;
        self.filename_index.flush()?;
        tracing::info!(
            container = self.containers.current_name(),
            used = self.containers.used(),
            "storage checkpoint"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::JsonIndex;

    fn core(dir: &Path, capacity: usize) -> StorageCore {
        let containers = ContainerManager::open(
            &dir.join("containers"),
            &dir.join("state"),
            capacity,
            ReadCache::default(),
        )
        .unwrap();
        StorageCore::new(
            containers,
            IndexBackend::Json(JsonIndex::in_memory()),
            IndexBackend::Json(JsonIndex::in_memory()),
            &dir.join("recipes"),
        )
        .unwrap()
    }

    fn chunk(id: u32, byte: u8, len: usize) -> Chunk {
        let data = vec![byte; len];
        Chunk::new(id, Fingerprint([byte; 32]), data)
    }

    #[test]
    fn duplicate_in_same_batch_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = core(dir.path(), 1000);
        let stats = core
            .store_chunks(&[chunk(0, 1, 10), chunk(1, 1, 10), chunk(2, 2, 10)])
            .unwrap();
        assert_eq!(stats.stored, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(core.containers().used(), 20);
    }

    #[test]
    fn unknown_fingerprint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = core(dir.path(), 1000);
        let err = core.restore_chunk(&Fingerprint([9; 32])).unwrap_err();
        assert!(matches!(err, TdsError::NotFound(_)));
    }

    #[test]
    fn unknown_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(dir.path(), 1000);
        let err = core.restore_recipe(&FileNameHash([3; 32])).unwrap_err();
        assert!(matches!(err, TdsError::NotFound(_)));
    }

    #[test]
    fn restore_range_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = core(dir.path(), 1000);
        let recipe = vec![RecipeEntry {
            fingerprint: Fingerprint([1; 32]),
            size: 1,
            chunk_id: 0,
        }];
        assert!(core.restore_chunks(&recipe, 0, 2).is_err());
    }

    #[test]
    fn store_chunk_always_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = core(dir.path(), 1000);
        let first = core.store_chunk(&chunk(0, 5, 8)).unwrap();
        let second = core.store_chunk(&chunk(0, 5, 8)).unwrap();
        assert_ne!(first.offset, second.offset);
        // the index points at the latest copy
        assert_eq!(core.locate(&Fingerprint([5; 32])).unwrap(), second);
    }

    #[test]
    fn stats_accumulate_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = core(dir.path(), 1000);
        core.store_chunks(&[chunk(0, 1, 10)]).unwrap();
        core.store_chunks(&[chunk(0, 1, 10), chunk(1, 2, 5)]).unwrap();
        let totals = core.store_stats();
        assert_eq!(totals.chunks, 3);
        assert_eq!(totals.stored, 2);
        assert_eq!(totals.duplicates, 1);
        assert_eq!(totals.bytes_written, 15);
    }
}
