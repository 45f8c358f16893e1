//! Key client pipeline stage
//!
//! Sits between the chunker and the sender. Chunks are batched, their masked
//! short hashes exchanged for server keys, and each chunk is then bound to its
//! own final key, encrypted, and re-fingerprinted over the ciphertext before it
//! moves downstream. Recipe items pass through untouched, but only after the
//! pending batch has been flushed so a recipe never overtakes its chunks.
//!
//! Any channel error or malformed response aborts the stage. There is no
//! retry; the caller decides whether to reconnect.

use std::time::{Duration, Instant};

use tds_chunks::{fingerprint, masked_hash};
use tds_core::{Chunk, ChunkKey, MaskedHash, PipelineItem, TdsError, TdsResult};
use tds_crypto::{derive_chunk_key, encrypt_chunk};
use tokio::sync::mpsc;

use crate::channel::SecureChannel;
use crate::wire::{decode_response, encode_request};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyClientStats {
    pub chunks: u64,
    pub batches: u64,
    pub recipes: u64,
    /// Round trips to the key server
    pub exchange_time: Duration,
    /// Final key derivation
    pub derive_time: Duration,
    /// Encryption and ciphertext fingerprinting
    pub encrypt_time: Duration,
}

pub struct KeyClient<C> {
    channel: C,
    batch_size: usize,
    mask_bits: u32,
    stats: KeyClientStats,
}

impl<C: SecureChannel> KeyClient<C> {
    pub fn new(channel: C, batch_size: usize, mask_bits: u32) -> Self {
        Self {
            channel,
            batch_size: batch_size.max(1),
            mask_bits,
            stats: KeyClientStats::default(),
        }
    }

    pub fn stats(&self) -> &KeyClientStats {
        &self.stats
    }

    /// Close the channel to the key server.
    pub async fn shutdown(mut self) -> TdsResult<KeyClientStats> {
        self.channel.close().await?;
        Ok(self.stats)
    }

    /// Consume `input` until every producer has closed it, forwarding results to
    /// `output`. `output` is dropped on return, which ends the downstream stream.
    pub async fn run(
        &mut self,
        mut input: mpsc::Receiver<PipelineItem>,
        output: mpsc::Sender<PipelineItem>,
    ) -> TdsResult<KeyClientStats> {
        let mut pending: Vec<Chunk> = Vec::with_capacity(self.batch_size);

        while let Some(item) = input.recv().await {
            match item {
                PipelineItem::Chunk(chunk) => {
                    pending.push(chunk);
                    if pending.len() >= self.batch_size {
                        self.process_batch(&mut pending, &output).await?;
                    }
                }
                recipe @ PipelineItem::Recipe { .. } => {
                    self.process_batch(&mut pending, &output).await?;
                    forward(&output, recipe).await?;
                    self.stats.recipes += 1;
                }
            }
        }
        self.process_batch(&mut pending, &output).await?;

        tracing::info!(
            chunks = self.stats.chunks,
            batches = self.stats.batches,
            exchange_ms = self.stats.exchange_time.as_millis() as u64,
            "key client finished"
        );
        Ok(self.stats.clone())
    }

    async fn process_batch(
        &mut self,
        pending: &mut Vec<Chunk>,
        output: &mpsc::Sender<PipelineItem>,
    ) -> TdsResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let hashes: Vec<MaskedHash> = pending
            .iter()
            .map(|c| masked_hash(&c.fingerprint, self.mask_bits))
            .collect();
        let keys = self.key_exchange(&hashes).await?;

        for (chunk, server_key) in pending.drain(..).zip(keys) {
            let (chunk, derive, encrypt) = timed_derive_and_encrypt(chunk, &server_key)?;
            self.stats.derive_time += derive;
            self.stats.encrypt_time += encrypt;
            self.stats.chunks += 1;
            forward(output, PipelineItem::Chunk(chunk)).await?;
        }
        Ok(())
    }

    /// One round trip: send masked hashes, receive exactly as many keys.
    pub async fn key_exchange(&mut self, hashes: &[MaskedHash]) -> TdsResult<Vec<ChunkKey>> {
        let started = Instant::now();
        self.channel.send(&encode_request(hashes)).await?;
        let response = self
            .channel
            .recv()
            .await?
            .ok_or_else(|| TdsError::Channel("key server closed the channel".into()))?;
        let keys = decode_response(&response, hashes.len())?;
        self.stats.exchange_time += started.elapsed();
        self.stats.batches += 1;
        Ok(keys)
    }

    /// Drive `count` synthetic chunks through key exchange and final key
    /// derivation, without encrypting or storing anything.
    pub async fn simulate(&mut self, count: u64) -> TdsResult<KeyClientStats> {
        let mut next = 0u64;
        while next < count {
            let end = (next + self.batch_size as u64).min(count);
            let fingerprints: Vec<_> = (next..end)
                .map(|i| fingerprint(&synthetic_content(i)))
                .collect();
            let hashes: Vec<MaskedHash> = fingerprints
                .iter()
                .map(|fp| masked_hash(fp, self.mask_bits))
                .collect();

            let keys = self.key_exchange(&hashes).await?;

            let started = Instant::now();
            for (fp, server_key) in fingerprints.iter().zip(&keys) {
                std::hint::black_box(derive_chunk_key(fp, server_key));
            }
            self.stats.derive_time += started.elapsed();
            self.stats.chunks += end - next;
            next = end;
        }
        Ok(self.stats.clone())
    }
}

/// Synthetic chunk body for simulation. Counters repeat every 1024 values so
/// a long run produces duplicates that can cross the popularity threshold.
pub fn synthetic_content(counter: u64) -> Vec<u8> {
    let seed = (counter % 1024).to_le_bytes();
    seed.iter().copied().cycle().take(4096).collect()
}

/// Bind the server key to this chunk, encrypt it, and fingerprint the ciphertext.
pub fn derive_and_encrypt(chunk: Chunk, server_key: &ChunkKey) -> TdsResult<Chunk> {
    timed_derive_and_encrypt(chunk, server_key).map(|(chunk, _, _)| chunk)
}

fn timed_derive_and_encrypt(
    chunk: Chunk,
    server_key: &ChunkKey,
) -> TdsResult<(Chunk, Duration, Duration)> {
    let started = Instant::now();
    let final_key = derive_chunk_key(&chunk.fingerprint, server_key);
    let derive = started.elapsed();

    let started = Instant::now();
    let data = encrypt_chunk(&final_key, &chunk.data).map_err(|e| {
        TdsError::Crypto(format!("encrypting chunk {}: {e}", chunk.id))
    })?;
    let stored_fp = fingerprint(&data);
    let encrypt = started.elapsed();

    Ok((
        Chunk {
            id: chunk.id,
            fingerprint: stored_fp,
            data,
            key: Some(final_key),
        },
        derive,
        encrypt,
    ))
}

async fn forward(output: &mpsc::Sender<PipelineItem>, item: PipelineItem) -> TdsResult<()> {
    output
        .send(item)
        .await
        .map_err(|_| TdsError::Channel("downstream stage closed its queue".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FramedChannel;
    use crate::wire::encode_response;
    use tds_core::{FileNameHash, RecipeEntry};
    use tds_crypto::decrypt_chunk;

    fn plain_chunk(id: u32, body: &[u8]) -> Chunk {
        Chunk::new(id, fingerprint(body), body.to_vec())
    }

    #[test]
    fn encrypted_chunk_is_refingerprinted() {
        let plain = plain_chunk(4, b"some chunk body");
        let server_key = ChunkKey::from_bytes([3u8; 32]);
        let out = derive_and_encrypt(plain.clone(), &server_key).unwrap();

        assert_eq!(out.id, 4);
        assert_ne!(out.fingerprint, plain.fingerprint);
        assert_eq!(out.fingerprint, fingerprint(&out.data));
        let key = out.key.as_ref().unwrap();
        assert_eq!(key, &derive_chunk_key(&plain.fingerprint, &server_key));
        assert_eq!(decrypt_chunk(key, &out.data).unwrap(), plain.data);
    }

    #[test]
    fn same_server_key_gives_distinct_final_keys() {
        let server_key = ChunkKey::from_bytes([1u8; 32]);
        let a = derive_and_encrypt(plain_chunk(0, b"aaaa"), &server_key).unwrap();
        let b = derive_and_encrypt(plain_chunk(1, b"bbbb"), &server_key).unwrap();
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn synthetic_content_repeats() {
        assert_eq!(synthetic_content(5), synthetic_content(5 + 1024));
        assert_ne!(synthetic_content(5), synthetic_content(6));
        assert_eq!(synthetic_content(0).len(), 4096);
    }

    /// Answers every batch with one fewer key than requested.
    async fn short_answering_server(io: tokio::io::DuplexStream) {
        let mut channel = FramedChannel::new(io);
        while let Ok(Some(req)) = channel.recv().await {
            let n = req.len() / 16;
            let keys: Vec<ChunkKey> = (0..n.saturating_sub(1))
                .map(|_| ChunkKey::from_bytes([0; 32]))
                .collect();
            if channel.send(&encode_response(&keys)).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn key_count_mismatch_aborts() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(short_answering_server(server_io));

        let mut client = KeyClient::new(FramedChannel::new(client_io), 4, 0);
        let err = client
            .key_exchange(&[MaskedHash([1; 16]), MaskedHash([2; 16])])
            .await
            .unwrap_err();
        assert!(matches!(err, TdsError::Protocol(_)));
    }

    #[tokio::test]
    async fn closed_server_is_channel_error() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        drop(server_io);
        let mut client = KeyClient::new(FramedChannel::new(client_io), 4, 0);
        assert!(client.key_exchange(&[MaskedHash([1; 16])]).await.is_err());
    }

    #[tokio::test]
    async fn recipe_waits_for_pending_chunks() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = crate::server::KeyServer::new(
            &tds_core::config::KeyServerConfig {
                sketch_width: 1024,
                solver_enabled: false,
                ..Default::default()
            },
            tds_crypto::ServerSecret::from_bytes([1; 32]),
        );
        tokio::spawn(async move { server.serve_session(FramedChannel::new(server_io)).await });

        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let mut client = KeyClient::new(FramedChannel::new(client_io), 100, 0);

        in_tx.send(PipelineItem::Chunk(plain_chunk(0, b"zero"))).await.unwrap();
        in_tx.send(PipelineItem::Chunk(plain_chunk(1, b"one"))).await.unwrap();
        in_tx
            .send(PipelineItem::Recipe {
                file_name_hash: FileNameHash([9; 32]),
                entries: vec![RecipeEntry {
                    fingerprint: fingerprint(b"zero"),
                    size: 4,
                    chunk_id: 0,
                }],
            })
            .await
            .unwrap();
        drop(in_tx);

        let stats = client.run(in_rx, out_tx).await.unwrap();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.recipes, 1);

        let mut kinds = Vec::new();
        while let Some(item) = out_rx.recv().await {
            kinds.push(matches!(item, PipelineItem::Chunk(_)));
        }
        assert_eq!(kinds, vec![true, true, false]);
    }
}
