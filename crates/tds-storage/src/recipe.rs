//! Recipe records and recipe files
//!
//! A recipe file is a flat array of fixed-width records, one per chunk in file
//! order:
//! ```text
//! [32 bytes: fingerprint][4 bytes: size, LE][4 bytes: chunk id, LE]
//! ```
//! Files are append-only; uploading the same logical file again extends it.

use std::io::Write;
use std::path::Path;

use tds_core::types::FINGERPRINT_SIZE;
use tds_core::{FileNameHash, Fingerprint, RecipeEntry, TdsError, TdsResult};

pub const RECIPE_ENTRY_SIZE: usize = FINGERPRINT_SIZE + 4 + 4;
pub const RECIPE_EXTENSION: &str = "recipe";

/// Recipe file name for a file identity: uppercase hex plus `.recipe`.
pub fn recipe_name(file: &FileNameHash) -> String {
    let hex: String = file.0.iter().map(|b| format!("{b:02X}")).collect();
    format!("{hex}.{RECIPE_EXTENSION}")
}

pub fn encode_entries(entries: &[RecipeEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * RECIPE_ENTRY_SIZE);
    for entry in entries {
        out.extend_from_slice(&entry.fingerprint.0);
        out.extend_from_slice(&entry.size.to_le_bytes());
        out.extend_from_slice(&entry.chunk_id.to_le_bytes());
    }
    out
}

/// Decode a whole recipe file. A length that is not a multiple of the record
/// width means the file was truncated or overwritten.
pub fn decode_entries(bytes: &[u8]) -> TdsResult<Vec<RecipeEntry>> {
    if bytes.len() % RECIPE_ENTRY_SIZE != 0 {
        return Err(TdsError::Corrupt(format!(
            "recipe length {} is not a multiple of {RECIPE_ENTRY_SIZE}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(RECIPE_ENTRY_SIZE)
        .map(|record| {
            let mut fp = [0u8; FINGERPRINT_SIZE];
            fp.copy_from_slice(&record[..FINGERPRINT_SIZE]);
            let mut size = [0u8; 4];
            size.copy_from_slice(&record[FINGERPRINT_SIZE..FINGERPRINT_SIZE + 4]);
            let mut id = [0u8; 4];
            id.copy_from_slice(&record[FINGERPRINT_SIZE + 4..]);
            RecipeEntry {
                fingerprint: Fingerprint(fp),
                size: u32::from_le_bytes(size),
                chunk_id: u32::from_le_bytes(id),
            }
        })
        .collect())
}

/// Append records to a recipe file, creating it if needed.
pub(crate) fn append_entries(path: &Path, entries: &[RecipeEntry]) -> TdsResult<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| TdsError::Storage(format!("opening recipe {}: {e}", path.display())))?;
    file.write_all(&encode_entries(entries))?;
    file.sync_data()?;
    Ok(())
}
