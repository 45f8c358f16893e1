//! BLAKE3 hashing for chunk identity, popularity counting, and file identity
//!
//! A fingerprint is the full 32-byte BLAKE3 digest. The masked short hash sent
//! to the key server is the first 16 bytes of a fingerprint with the low-order
//! `mask_bits` bits zeroed, so many distinct chunks collapse onto one sketch
//! entry and the server never learns a full fingerprint.

use tds_core::types::{FileNameHash, Fingerprint, MaskedHash, MASKED_HASH_SIZE};

const FILE_IDENTITY_CONTEXT: &str = "tds 2024 file identity";

/// Fingerprint a byte slice.
pub fn fingerprint(data: &[u8]) -> Fingerprint {
    Fingerprint(*blake3::hash(data).as_bytes())
}

/// Derive the masked short hash of a fingerprint.
pub fn masked_hash(fp: &Fingerprint, mask_bits: u32) -> MaskedHash {
    let mut short = [0u8; MASKED_HASH_SIZE];
    short.copy_from_slice(&fp.0[..MASKED_HASH_SIZE]);
    MaskedHash(mask_low_bits(short, mask_bits))
}

/// Zero the lowest `bits` bits of a big-endian 128-bit value. `bits >= 128` zeroes everything.
pub fn mask_low_bits(short: [u8; MASKED_HASH_SIZE], bits: u32) -> [u8; MASKED_HASH_SIZE] {
    let value = u128::from_be_bytes(short);
    let masked = match bits {
        0 => value,
        b if b >= 128 => 0,
        b => value & !((1u128 << b) - 1),
    };
    masked.to_be_bytes()
}

/// Hash a file's logical name into the filename index key.
pub fn file_name_hash(name: &str) -> FileNameHash {
    let mut hasher = blake3::Hasher::new_derive_key(FILE_IDENTITY_CONTEXT);
    hasher.update(name.as_bytes());
    FileNameHash(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_fingerprint_is_deterministic() {
        assert_eq!(fingerprint(b""), fingerprint(b""));
    }

    #[test]
    fn different_content_different_fingerprint() {
        assert_ne!(fingerprint(b"foo"), fingerprint(b"bar"));
    }

    #[test]
    fn zero_mask_keeps_prefix() {
        let fp = fingerprint(b"hello tds");
        let masked = masked_hash(&fp, 0);
        assert_eq!(&masked.0[..], &fp.0[..MASKED_HASH_SIZE]);
    }

    #[test]
    fn mask_zeroes_trailing_bits() {
        let short = [0xFFu8; MASKED_HASH_SIZE];
        let masked = mask_low_bits(short, 12);
        assert_eq!(masked[15], 0x00);
        assert_eq!(masked[14], 0xF0);
        assert_eq!(masked[13], 0xFF);
    }

    #[test]
    fn full_mask_zeroes_everything() {
        assert_eq!(mask_low_bits([0xAB; MASKED_HASH_SIZE], 128), [0u8; MASKED_HASH_SIZE]);
        assert_eq!(mask_low_bits([0xAB; MASKED_HASH_SIZE], 200), [0u8; MASKED_HASH_SIZE]);
    }

    #[test]
    fn file_name_hash_differs_from_fingerprint() {
        let name = "docs/report.pdf";
        assert_ne!(file_name_hash(name).0, fingerprint(name.as_bytes()).0);
        assert_eq!(file_name_hash(name), file_name_hash(name));
    }

    proptest! {
        #[test]
        fn masking_is_idempotent(bytes in any::<[u8; 16]>(), bits in 0u32..=128) {
            let once = mask_low_bits(bytes, bits);
            prop_assert_eq!(mask_low_bits(once, bits), once);
        }

        #[test]
        fn wider_mask_collapses_more(data in proptest::collection::vec(any::<u8>(), 0..=512), bits in 0u32..64) {
            // Anything equal under a narrow mask stays equal under a wider one.
            let fp = fingerprint(&data);
            let narrow = masked_hash(&fp, bits);
            let wide = masked_hash(&fp, bits + 8);
            prop_assert_eq!(mask_low_bits(narrow.0, bits + 8), wide.0);
        }
    }
}
