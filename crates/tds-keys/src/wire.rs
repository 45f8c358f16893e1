//! Key exchange message bodies
//!
//! Request: N masked hashes, 16 bytes each, concatenated.
//! Response: N keys, 32 bytes each, in request order.
//! Neither carries a count; it is implied by the byte length.

use bytes::{BufMut, Bytes, BytesMut};
use tds_core::types::{KEY_SIZE, MASKED_HASH_SIZE};
use tds_core::{ChunkKey, MaskedHash, TdsError, TdsResult};

pub fn encode_request(hashes: &[MaskedHash]) -> Bytes {
    let mut buf = BytesMut::with_capacity(hashes.len() * MASKED_HASH_SIZE);
    for hash in hashes {
        buf.put_slice(&hash.0);
    }
    buf.freeze()
}

/// Decode a request, rejecting empty, ragged, or oversized batches.
pub fn decode_request(body: &[u8], max_keys: usize) -> TdsResult<Vec<MaskedHash>> {
    if body.is_empty() {
        return Err(TdsError::Protocol("empty key request".into()));
    }
    if body.len() % MASKED_HASH_SIZE != 0 {
        return Err(TdsError::Protocol(format!(
            "key request of {} bytes is not a multiple of {MASKED_HASH_SIZE}",
            body.len()
        )));
    }
    let count = body.len() / MASKED_HASH_SIZE;
    if count > max_keys {
        return Err(TdsError::Protocol(format!(
            "key request carries {count} hashes, limit is {max_keys}"
        )));
    }
    Ok(body
        .chunks_exact(MASKED_HASH_SIZE)
        .map(|record| {
            let mut hash = [0u8; MASKED_HASH_SIZE];
            hash.copy_from_slice(record);
            MaskedHash(hash)
        })
        .collect())
}

pub fn encode_response(keys: &[ChunkKey]) -> Bytes {
    let mut buf = BytesMut::with_capacity(keys.len() * KEY_SIZE);
    for key in keys {
        buf.put_slice(key.as_bytes());
    }
    buf.freeze()
}

/// Decode a response that must answer exactly `expected` hashes.
pub fn decode_response(body: &[u8], expected: usize) -> TdsResult<Vec<ChunkKey>> {
    if body.len() % KEY_SIZE != 0 {
        return Err(TdsError::Protocol(format!(
            "key response of {} bytes is not a multiple of {KEY_SIZE}",
            body.len()
        )));
    }
    let count = body.len() / KEY_SIZE;
    if count != expected {
        return Err(TdsError::Protocol(format!(
            "key response carries {count} keys for {expected} hashes"
        )));
    }
    Ok(body
        .chunks_exact(KEY_SIZE)
        .map(|record| {
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(record);
            ChunkKey::from_bytes(key)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let body = encode_request(&[MaskedHash([1; 16]), MaskedHash([2; 16])]);
        assert_eq!(body.len(), 32);
        assert_eq!(&body[16..], &[2u8; 16]);
        let decoded = decode_request(&body, 2).unwrap();
        assert_eq!(decoded[1], MaskedHash([2; 16]));
    }

    #[test]
    fn ragged_request_rejected() {
        let err = decode_request(&[0u8; 17], 10).unwrap_err();
        assert!(matches!(err, TdsError::Protocol(_)));
    }

    #[test]
    fn empty_request_rejected() {
        assert!(decode_request(&[], 10).is_err());
    }

    #[test]
    fn oversized_request_rejected() {
        let err = decode_request(&[0u8; 48], 2).unwrap_err();
        assert!(err.to_string().contains("limit is 2"));
    }

    #[test]
    fn response_count_must_match() {
        let body = encode_response(&[ChunkKey::from_bytes([1; 32]), ChunkKey::from_bytes([2; 32])]);
        assert_eq!(decode_response(&body, 2).unwrap().len(), 2);
        assert!(decode_response(&body, 3).is_err());
        assert!(decode_response(&body[..40], 1).is_err());
    }
}
