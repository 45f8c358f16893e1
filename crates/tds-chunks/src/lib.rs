//! tds-chunks: content-defined chunking and the hashes derived from chunk content
//!
//! # Overview
//! - `hash`: BLAKE3 fingerprints (dedup identity), masked short hashes (popularity
//!   counting unit), and file-identity hashes (filename index key)
//! - `fastcdc`: content-defined chunking into ordered `Chunk` records

pub mod fastcdc;
pub mod hash;

pub use fastcdc::{chunk_data, chunk_file, to_chunks, ChunkBoundary, ChunkSizes};
pub use hash::{file_name_hash, fingerprint, mask_low_bits, masked_hash};
