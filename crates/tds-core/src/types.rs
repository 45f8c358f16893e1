use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Width of a chunk fingerprint (BLAKE3-256)
pub const FINGERPRINT_SIZE: usize = 32;

/// Width of a masked short hash on the key-exchange wire
pub const MASKED_HASH_SIZE: usize = 16;

/// Width of a key record on the key-exchange wire and of a final chunk key
pub const KEY_SIZE: usize = 32;

/// Width of a file-identity hash used as the filename index key
pub const FILE_NAME_HASH_SIZE: usize = 32;

/// Full-width content hash of a chunk; the dedup identity in the fingerprint index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

/// A fingerprint prefix with low-order bits zeroed. Only used for popularity counting.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MaskedHash(pub [u8; MASKED_HASH_SIZE]);

/// Hash of a file's identity (its logical name), key of the filename index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileNameHash(pub [u8; FILE_NAME_HASH_SIZE]);

macro_rules! hex_display {
    ($ty:ty) => {
        impl $ty {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                to_hex(&self.0)
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let hex = self.to_hex();
                write!(f, "{}({})", stringify!($ty), &hex[..16.min(hex.len())])
            }
        }
    };
}

hex_display!(Fingerprint);
hex_display!(MaskedHash);
hex_display!(FileNameHash);

/// Lowercase hex encoding
pub fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        s.push_str(&format!("{:02x}", byte));
    }
    s
}

/// Decode lowercase or uppercase hex. `None` on odd length or a non-hex digit.
pub fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// A 256-bit chunk encryption key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkKey {
    bytes: [u8; KEY_SIZE],
}

impl ChunkKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for ChunkKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A unit of file content moving through the upload and restore pipelines.
///
/// Created by the chunker with a plaintext fingerprint; the key client assigns
/// `key`, encrypts `data` in place, and replaces `fingerprint` with the hash of
/// the stored bytes. Immutable after that.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Ordinal within the owning file
    pub id: u32,
    pub fingerprint: Fingerprint,
    pub data: Vec<u8>,
    pub key: Option<ChunkKey>,
}

impl Chunk {
    pub fn new(id: u32, fingerprint: Fingerprint, data: Vec<u8>) -> Self {
        Self {
            id,
            fingerprint,
            data,
            key: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Where a stored chunk payload lives. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLocation {
    pub container: String,
    pub offset: u64,
    pub length: u32,
}

/// One ordered reference in a file recipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecipeEntry {
    pub fingerprint: Fingerprint,
    pub size: u32,
    pub chunk_id: u32,
}

/// A record on the upload queue between pipeline stages.
#[derive(Debug, Clone)]
pub enum PipelineItem {
    /// File content; rewritten by the key client
    Chunk(Chunk),
    /// Recipe entries for a file; passed through the key client untouched
    Recipe {
        file_name_hash: FileNameHash,
        entries: Vec<RecipeEntry>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_displays_as_hex() {
        let fp = Fingerprint([0xABu8; FINGERPRINT_SIZE]);
        let hex = fp.to_string();
        assert_eq!(hex.len(), FINGERPRINT_SIZE * 2);
        assert!(hex.chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn hex_decode_accepts_both_cases() {
        assert_eq!(from_hex("00ffAb"), Some(vec![0x00, 0xff, 0xab]));
        assert_eq!(from_hex(&to_hex(&[1, 2, 254])), Some(vec![1, 2, 254]));
        assert_eq!(from_hex("abc"), None);
        assert_eq!(from_hex("zz"), None);
    }

    #[test]
    fn chunk_key_debug_is_redacted() {
        let key = ChunkKey::from_bytes([7u8; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains('7'));
    }

    #[test]
    fn new_chunk_has_no_key() {
        let chunk = Chunk::new(3, Fingerprint([0u8; FINGERPRINT_SIZE]), b"abc".to_vec());
        assert_eq!(chunk.len(), 3);
        assert!(chunk.key.is_none());
        assert!(!chunk.is_empty());
    }
}
