//! FastCDC content-defined chunking
//!
//! Splits file content into variable-size chunks whose boundaries depend on the
//! bytes themselves, so an insertion near the start of a file only disturbs the
//! chunks around it and the rest still deduplicate.
//!
//! Each boundary carries the plaintext fingerprint of its bytes. `to_chunks`
//! turns boundaries into the `Chunk` records the upload pipeline consumes,
//! numbered in file order.

use anyhow::{Context, Result};
use fastcdc::v2020::{
    FastCDC, AVERAGE_MAX, AVERAGE_MIN, MAXIMUM_MAX, MAXIMUM_MIN, MINIMUM_MAX, MINIMUM_MIN,
};
use std::path::Path;
use tds_core::config::ClientConfig;
use tds_core::Chunk;

/// A single content-defined chunk boundary
#[derive(Debug, Clone)]
pub struct ChunkBoundary {
    /// Byte offset within the source
    pub offset: u64,
    /// Chunk length in bytes
    pub length: usize,
    pub fingerprint: tds_core::Fingerprint,
}

/// Chunk size configuration
#[derive(Debug, Clone, Copy)]
pub struct ChunkSizes {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl ChunkSizes {
    /// Default for general file content
    pub const DEFAULT: ChunkSizes = ChunkSizes {
        min_size: 4 * 1024,  // 4KB
        avg_size: 8 * 1024,  // 8KB
        max_size: 16 * 1024, // 16KB
    };

    /// Build sizes from client config, rejecting values FastCDC would panic on.
    pub fn from_config(client: &ClientConfig) -> Result<Self> {
        let sizes = ChunkSizes {
            min_size: client.chunk_min,
            avg_size: client.chunk_avg,
            max_size: client.chunk_max,
        };
        sizes.validate()?;
        Ok(sizes)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MINIMUM_MIN..=MINIMUM_MAX).contains(&self.min_size)
            || !(AVERAGE_MIN..=AVERAGE_MAX).contains(&self.avg_size)
            || !(MAXIMUM_MIN..=MAXIMUM_MAX).contains(&self.max_size)
        {
            anyhow::bail!(
                "chunk sizes out of range: min={} avg={} max={}",
                self.min_size,
                self.avg_size,
                self.max_size
            );
        }
        if !(self.min_size <= self.avg_size && self.avg_size <= self.max_size) {
            anyhow::bail!("chunk sizes must satisfy min <= avg <= max");
        }
        Ok(())
    }
}

/// Split `data` into content-defined chunk boundaries.
///
/// Returns an empty list for empty data.
pub fn chunk_data(data: &[u8], sizes: ChunkSizes) -> Vec<ChunkBoundary> {
    if data.is_empty() {
        return vec![];
    }

    FastCDC::new(data, sizes.min_size, sizes.avg_size, sizes.max_size)
        .map(|c| ChunkBoundary {
            offset: c.offset as u64,
            length: c.length,
            fingerprint: crate::hash::fingerprint(&data[c.offset..c.offset + c.length]),
        })
        .collect()
}

/// Chunk `data` into owned `Chunk` records with ordinal IDs.
pub fn to_chunks(data: &[u8], sizes: ChunkSizes) -> Result<Vec<Chunk>> {
    chunk_data(data, sizes)
        .into_iter()
        .enumerate()
        .map(|(i, b)| {
            let id = u32::try_from(i).context("file has more chunks than a recipe can address")?;
            let start = b.offset as usize;
            Ok(Chunk::new(
                id,
                b.fingerprint,
                data[start..start + b.length].to_vec(),
            ))
        })
        .collect()
}

/// Chunk a file from disk. Returns the chunks and the file size.
pub fn chunk_file(path: &Path, sizes: ChunkSizes) -> Result<(Vec<Chunk>, u64)> {
    let data = std::fs::read(path)
        .with_context(|| format!("reading file for chunking: {}", path.display()))?;
    let chunks = to_chunks(&data, sizes)?;
    tracing::debug!(path = %path.display(), chunks = chunks.len(), bytes = data.len(), "chunked");
    Ok((chunks, data.len() as u64))
}
