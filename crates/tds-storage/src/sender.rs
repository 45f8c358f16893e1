//! Sender stage: the single writer feeding a `StorageCore`
//!
//! Consumes the key client's output queue. Encrypted chunks are grouped into
//! store batches; a recipe item closes the current file. Because chunks are
//! re-fingerprinted after encryption, the stored recipe is assembled here from
//! the chunks actually received (stored fingerprint, stored size, chunk id).
//! The recipe item coming down the queue names the file and lets the sender
//! check that no chunk went missing in between.
//!
//! Each file is handed to the optional `on_file` sink as soon as its recipe is
//! stored, so the caller can persist its keys before the next file starts. A
//! later failure leaves earlier files complete and listed in `completed()`.
//!
//! Runs on a blocking thread: `StorageCore` does synchronous file I/O.

use tds_core::{
    Chunk, ChunkKey, FileNameHash, PipelineItem, RecipeEntry, TdsError, TdsResult,
};
use tokio::sync::mpsc;

use crate::store::{StorageCore, StoreStats};

/// One file fully handed to storage during a sender run.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name_hash: FileNameHash,
    /// Entries appended to the server-side recipe in this run
    pub entries: Vec<RecipeEntry>,
    /// Final chunk keys, aligned with `entries`
    pub keys: Vec<ChunkKey>,
}

#[derive(Debug, Default)]
pub struct SenderReport {
    pub stats: StoreStats,
    pub files: Vec<UploadedFile>,
}

/// Called with each file right after its recipe is stored. An error ends the run.
pub type FileSink = Box<dyn FnMut(&UploadedFile) -> TdsResult<()> + Send>;

pub struct Sender {
    core: StorageCore,
    batch_size: usize,
    pending: Vec<Chunk>,
    file_entries: Vec<RecipeEntry>,
    file_keys: Vec<ChunkKey>,
    on_file: Option<FileSink>,
    completed: Vec<UploadedFile>,
}

impl Sender {
    pub fn new(core: StorageCore, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            core,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            file_entries: Vec::new(),
            file_keys: Vec::new(),
            on_file: None,
            completed: Vec::new(),
        }
    }

    pub fn on_file(mut self, sink: FileSink) -> Self {
        self.on_file = Some(sink);
        self
    }

    /// Files whose recipes were stored in the current run, including after a failure.
    pub fn completed(&self) -> &[UploadedFile] {
        &self.completed
    }

    pub fn core(&self) -> &StorageCore {
        &self.core
    }

    pub fn into_core(self) -> StorageCore {
        self.core
    }

    /// Drain `input` until every producer has closed it, then checkpoint.
    ///
    /// Must not be called from inside an async context; use `spawn_blocking`.
    pub fn run_blocking(&mut self, mut input: mpsc::Receiver<PipelineItem>) -> TdsResult<SenderReport> {
        let mut report = SenderReport::default();
        self.completed.clear();

        while let Some(item) = input.blocking_recv() {
            match item {
                PipelineItem::Chunk(chunk) => {
                    self.accept(chunk)?;
                    if self.pending.len() >= self.batch_size {
                        self.flush_pending(&mut report.stats)?;
                    }
                }
                PipelineItem::Recipe {
                    file_name_hash,
                    entries,
                } => {
                    self.flush_pending(&mut report.stats)?;
                    self.finish_file(file_name_hash, &entries)?;
                }
            }
        }

        self.flush_pending(&mut report.stats)?;
        if !self.file_entries.is_empty() {
            tracing::warn!(
                chunks = self.file_entries.len(),
                "input closed with chunks not covered by any recipe"
            );
            self.file_entries.clear();
            self.file_keys.clear();
        }
        self.core.checkpoint()?;
        report.files = self.completed.clone();

        tracing::info!(
            files = report.files.len(),
            stored = report.stats.stored,
            duplicates = report.stats.duplicates,
            bytes = report.stats.bytes_written,
            "sender finished"
        );
        Ok(report)
    }

    fn accept(&mut self, chunk: Chunk) -> TdsResult<()> {
        let key = chunk.key.clone().ok_or_else(|| {
            TdsError::Crypto(format!("chunk {} reached the sender without a key", chunk.id))
        })?;
        let size = u32::try_from(chunk.data.len()).map_err(|_| {
            TdsError::Storage(format!("chunk {} is too large for a recipe", chunk.id))
        })?;
        self.file_entries.push(RecipeEntry {
            fingerprint: chunk.fingerprint,
            size,
            chunk_id: chunk.id,
        });
        self.file_keys.push(key);
        self.pending.push(chunk);
        Ok(())
    }

    fn flush_pending(&mut self, stats: &mut StoreStats) -> TdsResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = self.core.store_chunks(&self.pending)?;
        stats.merge(&batch);
        self.pending.clear();
        Ok(())
    }

    fn finish_file(
        &mut self,
        file_name_hash: FileNameHash,
        declared: &[RecipeEntry],
    ) -> TdsResult<()> {
        if declared.len() != self.file_entries.len()
            || declared
                .iter()
                .zip(&self.file_entries)
                .any(|(d, s)| d.chunk_id != s.chunk_id)
        {
            return Err(TdsError::Corrupt(format!(
                "recipe for {file_name_hash} lists {} chunks, sender received {}",
                declared.len(),
                self.file_entries.len()
            )));
        }

        let entries = std::mem::take(&mut self.file_entries);
        let keys = std::mem::take(&mut self.file_keys);
        self.core.store_recipe(&file_name_hash, &entries)?;
        tracing::debug!(file = %file_name_hash, chunks = entries.len(), "recipe stored");

        let uploaded = UploadedFile {
            file_name_hash,
            entries,
            keys,
        };
        if let Some(sink) = self.on_file.as_mut() {
            sink(&uploaded)?;
        }
        self.completed.push(uploaded);
        Ok(())
    }
}
