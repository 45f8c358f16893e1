//! Per-chunk AES-256-SIV encryption/decryption
//!
//! Encrypted chunk format (binary):
//! ```text
//! [16 bytes: synthetic IV][N bytes: ciphertext]
//! ```
//!
//! The nonce is fixed at zero, so the output depends only on the final chunk
//! key and the plaintext. Two uploads of the same popular chunk therefore
//! store byte-identical payloads and share one fingerprint index entry.

use aes_siv::{
    aead::{Aead, KeyInit},
    Aes256SivAead, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use tds_core::ChunkKey;
use zeroize::Zeroize;

use crate::SIV_TAG_SIZE;

const SIV_KEY_INFO: &[u8] = b"tds-chunk-aes-siv";

fn cipher_for(key: &ChunkKey) -> anyhow::Result<Aes256SivAead> {
    // AES-256-SIV requires a 64-byte key (two 32-byte sub-keys)
    let mut double_key = [0u8; 64];
    let hkdf = Hkdf::<Sha256>::new(None, key.as_bytes());
    hkdf.expand(SIV_KEY_INFO, &mut double_key)
        .map_err(|e| anyhow::anyhow!("HKDF expand for AES-SIV: {e}"))?;
    let cipher = Aes256SivAead::new((&double_key).into());
    double_key.zeroize();
    Ok(cipher)
}

/// Encrypt one chunk. Returns `[16-byte SIV][ciphertext]`.
pub fn encrypt_chunk(key: &ChunkKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    cipher_for(key)?
        .encrypt(&Nonce::default(), plaintext)
        .map_err(|e| anyhow::anyhow!("chunk encryption failed: {e}"))
}

/// Decrypt one chunk produced by `encrypt_chunk`.
pub fn decrypt_chunk(key: &ChunkKey, encrypted: &[u8]) -> anyhow::Result<Vec<u8>> {
    if encrypted.len() < SIV_TAG_SIZE {
        anyhow::bail!(
            "encrypted chunk too short: {} bytes (minimum {})",
            encrypted.len(),
            SIV_TAG_SIZE
        );
    }
    cipher_for(key)?
        .decrypt(&Nonce::default(), encrypted)
        .map_err(|_| anyhow::anyhow!("chunk decryption failed: wrong key or corrupted data"))
}
