//! tds-crypto: key material and chunk encryption for popularity-aware dedup
//!
//! Key flow:
//! ```text
//! Server secret (256-bit, server only)
//!   ├── popular chunk:   server key = HKDF-SHA256(secret, "tds-popular" || masked_hash)
//!   └── unpopular chunk: server key = 256 random bits
//! Final chunk key = BLAKE3-keyed(server key, fingerprint)
//!   └── AES-256-SIV (key expanded via HKDF, zero nonce) → deterministic ciphertext
//! ```
//!
//! Encryption is deterministic: identical plaintext under an
//! identical final key produces identical ciphertext, which is what lets the
//! storage layer deduplicate popular content it cannot read.

pub mod chunk;
pub mod key_recipe;
pub mod keys;

pub use chunk::{decrypt_chunk, encrypt_chunk};
pub use key_recipe::KeyRecipe;
pub use keys::{derive_chunk_key, derive_popular_key, random_key, ServerSecret};

/// Size of a key in bytes (256-bit)
pub const KEY_SIZE: usize = tds_core::types::KEY_SIZE;

/// Size of the AES-SIV synthetic IV prepended to every ciphertext
pub const SIV_TAG_SIZE: usize = 16;
