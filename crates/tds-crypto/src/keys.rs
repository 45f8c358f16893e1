//! Key hierarchy: server secret → popular keys, random keys, final chunk keys

use anyhow::Context;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::path::Path;
use tds_core::{ChunkKey, Fingerprint, MaskedHash};
use zeroize::Zeroize;

use crate::KEY_SIZE;

const POPULAR_KEY_INFO: &[u8] = b"tds-popular";

/// The key server's private secret. Zeroized on drop.
#[derive(Clone)]
pub struct ServerSecret {
    bytes: [u8; KEY_SIZE],
}

impl ServerSecret {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Load the secret from `path`, creating it with fresh random bytes if absent.
    ///
    /// A file of the wrong length is an error, never silently replaced: every
    /// popular key previously issued depends on it.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let mut raw = std::fs::read(path)
                .with_context(|| format!("reading server secret: {}", path.display()))?;
            if raw.len() != KEY_SIZE {
                let len = raw.len();
                raw.zeroize();
                anyhow::bail!(
                    "server secret {} has {} bytes (expected {})",
                    path.display(),
                    len,
                    KEY_SIZE
                );
            }
            let mut bytes = [0u8; KEY_SIZE];
            bytes.copy_from_slice(&raw);
            raw.zeroize();
            return Ok(Self { bytes });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating secret dir: {}", parent.display()))?;
        }
        let secret = Self::generate();
        write_private(path, secret.as_bytes())
            .with_context(|| format!("writing server secret: {}", path.display()))?;
        tracing::info!(path = %path.display(), "generated new server secret");
        Ok(secret)
    }
}

impl Drop for ServerSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

/// Deterministic server key for a popular masked hash.
///
/// Every client asking about the same masked hash gets the same key.
pub fn derive_popular_key(secret: &ServerSecret, masked: &MaskedHash) -> anyhow::Result<ChunkKey> {
    let hkdf = Hkdf::<Sha256>::new(None, secret.as_bytes());
    let mut info = Vec::with_capacity(POPULAR_KEY_INFO.len() + masked.0.len());
    info.extend_from_slice(POPULAR_KEY_INFO);
    info.extend_from_slice(&masked.0);

    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(&info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(ChunkKey::from_bytes(okm))
}

/// Fresh random key for an unpopular chunk, unlinkable to its content.
pub fn random_key() -> ChunkKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    ChunkKey::from_bytes(bytes)
}

/// Bind a server-issued key to one exact chunk.
///
/// Distinct fingerprints yield distinct final keys even when the server hands
/// out one key for a whole masked-hash class.
pub fn derive_chunk_key(fingerprint: &Fingerprint, server_key: &ChunkKey) -> ChunkKey {
    ChunkKey::from_bytes(*blake3::keyed_hash(server_key.as_bytes(), &fingerprint.0).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked(b: u8) -> MaskedHash {
        MaskedHash([b; 16])
    }

    #[test]
    fn test_popular_key_deterministic() {
        let secret = ServerSecret::from_bytes([42u8; KEY_SIZE]);
        let k1 = derive_popular_key(&secret, &masked(1)).unwrap();
        let k2 = derive_popular_key(&secret, &masked(1)).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_popular_key_depends_on_secret_and_hash() {
        let s1 = ServerSecret::from_bytes([1u8; KEY_SIZE]);
        let s2 = ServerSecret::from_bytes([2u8; KEY_SIZE]);
        let a = derive_popular_key(&s1, &masked(1)).unwrap();
        let b = derive_popular_key(&s2, &masked(1)).unwrap();
        let c = derive_popular_key(&s1, &masked(2)).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_random_keys_differ() {
        assert_ne!(random_key().as_bytes(), random_key().as_bytes());
    }

    #[test]
    fn test_chunk_key_binds_fingerprint() {
        let server_key = ChunkKey::from_bytes([9u8; KEY_SIZE]);
        let a = derive_chunk_key(&Fingerprint([1u8; 32]), &server_key);
        let b = derive_chunk_key(&Fingerprint([2u8; 32]), &server_key);
        let a2 = derive_chunk_key(&Fingerprint([1u8; 32]), &server_key);
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes(), a2.as_bytes());
    }

    #[test]
    fn test_secret_load_or_create_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/server.key");

        let created = ServerSecret::load_or_create(&path).unwrap();
        let loaded = ServerSecret::load_or_create(&path).unwrap();
        assert_eq!(created.as_bytes(), loaded.as_bytes());
        assert_eq!(std::fs::read(&path).unwrap().len(), KEY_SIZE);
    }

    #[test]
    fn test_secret_wrong_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.key");
        std::fs::write(&path, b"short").unwrap();
        let err = ServerSecret::load_or_create(&path).unwrap_err();
        assert!(err.to_string().contains("expected 32"));
    }
}
