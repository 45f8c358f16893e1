//! Key server
//!
//! One `KeyServer` is shared (cheaply cloned) by every session. Per session the
//! loop is: receive a batch of masked hashes, count and classify each one,
//! answer with one key per hash in request order, repeat until the client
//! closes. A malformed batch ends the session with a protocol error.
//!
//! Sketch updates and threshold reads take different locks, so a batch may be
//! classified against a threshold the solver is about to replace.

use std::sync::{Arc, Mutex, PoisonError};

use tds_core::config::KeyServerConfig;
use tds_core::{ChunkKey, MaskedHash, TdsError, TdsResult};
use tds_crypto::{derive_popular_key, random_key, ServerSecret};

use crate::channel::SecureChannel;
use crate::sketch::CountMinSketch;
use crate::solver::{SolverSettings, ThresholdSolver};
use crate::wire::{decode_request, encode_response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Popularity {
    Popular,
    Unpopular,
}

/// Per-session counters, returned when the session ends cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub batches: u64,
    pub keys_issued: u64,
    pub popular: u64,
    pub unpopular: u64,
}

/// Keys for one batch plus how many were popular.
#[derive(Debug)]
pub struct IssuedKeys {
    pub keys: Vec<ChunkKey>,
    pub popular: usize,
}

struct Inner {
    secret: ServerSecret,
    sketch: Mutex<CountMinSketch>,
    solver: Arc<ThresholdSolver>,
    max_batch_keys: usize,
}

#[derive(Clone)]
pub struct KeyServer {
    inner: Arc<Inner>,
}

impl KeyServer {
    pub fn new(config: &KeyServerConfig, secret: ServerSecret) -> Self {
        let sketch = CountMinSketch::new(
            config.sketch_width,
            config.sketch_depth,
            config.sketch_decay,
        );
        let solver = Arc::new(ThresholdSolver::new(SolverSettings::from(config)));
        tracing::info!(
            width = sketch.width(),
            depth = sketch.depth(),
            threshold = solver.threshold(),
            solver = config.solver_enabled,
            "key server ready"
        );
        Self {
            inner: Arc::new(Inner {
                secret,
                sketch: Mutex::new(sketch),
                solver,
                max_batch_keys: config.max_batch_keys.max(1),
            }),
        }
    }

    /// Handle for spawning the solver task.
    pub fn solver(&self) -> Arc<ThresholdSolver> {
        self.inner.solver.clone()
    }

    pub fn threshold(&self) -> u64 {
        self.inner.solver.threshold()
    }

    pub fn set_threshold(&self, threshold: u64) {
        self.inner.solver.set_threshold(threshold);
    }

    pub fn classify(&self, estimate: u64) -> Popularity {
        classify(estimate, self.threshold())
    }

    /// Count, classify, and issue one key per hash, in order.
    pub fn issue_keys(&self, hashes: &[MaskedHash]) -> TdsResult<IssuedKeys> {
        let estimates: Vec<u64> = {
            let mut sketch = self
                .inner
                .sketch
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            hashes.iter().map(|h| sketch.observe(h)).collect()
        };

        let threshold = self.threshold();
        let mut keys = Vec::with_capacity(hashes.len());
        let mut popular = 0;
        for (hash, estimate) in hashes.iter().zip(&estimates) {
            let key = match classify(*estimate, threshold) {
                Popularity::Popular => {
                    popular += 1;
                    derive_popular_key(&self.inner.secret, hash)
                        .map_err(|e| TdsError::Crypto(e.to_string()))?
                }
                Popularity::Unpopular => random_key(),
            };
            keys.push(key);
        }

        let observations: Vec<(MaskedHash, u64)> =
            hashes.iter().copied().zip(estimates).collect();
        self.inner.solver.record(&observations);

        Ok(IssuedKeys { keys, popular })
    }

    /// Serve one client until it closes the channel.
    pub async fn serve_session<C: SecureChannel>(&self, mut channel: C) -> TdsResult<SessionStats> {
        let mut stats = SessionStats::default();

        while let Some(request) = channel.recv().await? {
            let hashes = match decode_request(&request, self.inner.max_batch_keys) {
                Ok(hashes) => hashes,
                Err(e) => {
                    tracing::warn!(bytes = request.len(), "rejecting key batch: {e}");
                    return Err(e);
                }
            };

            let issued = self.issue_keys(&hashes)?;
            channel.send(&encode_response(&issued.keys)).await?;

            stats.batches += 1;
            stats.keys_issued += issued.keys.len() as u64;
            stats.popular += issued.popular as u64;
            stats.unpopular += (issued.keys.len() - issued.popular) as u64;
            tracing::trace!(keys = issued.keys.len(), popular = issued.popular, "batch answered");
        }

        Ok(stats)
    }
}

fn classify(estimate: u64, threshold: u64) -> Popularity {
    if estimate >= threshold {
        Popularity::Popular
    } else {
        Popularity::Unpopular
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FramedChannel;
    use crate::wire::{decode_response, encode_request};

    fn server(threshold: u64, solver: bool) -> KeyServer {
        let config = KeyServerConfig {
            sketch_width: 4096,
            sketch_depth: 4,
            initial_threshold: threshold,
            solver_enabled: solver,
            max_batch_keys: 8,
            ..KeyServerConfig::default()
        };
        KeyServer::new(&config, ServerSecret::from_bytes([0x5A; 32]))
    }

    #[test]
    fn third_request_crosses_threshold() {
        let server = server(3, false);
        let hash = [MaskedHash([1; 16])];

        let first = server.issue_keys(&hash).unwrap();
        let second = server.issue_keys(&hash).unwrap();
        let third = server.issue_keys(&hash).unwrap();
        let fourth = server.issue_keys(&hash).unwrap();

        assert_eq!(first.popular, 0);
        assert_eq!(second.popular, 0);
        assert_ne!(first.keys[0], second.keys[0]);
        assert_eq!(third.popular, 1);
        assert_eq!(third.keys[0], fourth.keys[0]);
    }

    #[test]
    fn popular_key_is_shared_across_servers_with_same_secret() {
        let a = server(1, false);
        let b = server(1, false);
        let hash = [MaskedHash([4; 16])];
        assert_eq!(
            a.issue_keys(&hash).unwrap().keys[0],
            b.issue_keys(&hash).unwrap().keys[0]
        );
    }

    #[test]
    fn classify_boundary() {
        let server = server(5, false);
        assert_eq!(server.classify(4), Popularity::Unpopular);
        assert_eq!(server.classify(5), Popularity::Popular);
        server.set_threshold(6);
        assert_eq!(server.classify(5), Popularity::Unpopular);
    }

    #[test]
    fn observations_feed_solver_when_enabled() {
        let server = server(10, true);
        server
            .issue_keys(&[MaskedHash([1; 16]), MaskedHash([2; 16])])
            .unwrap();
        assert_eq!(server.solver().pending(), 2);
    }

    #[tokio::test]
    async fn session_answers_in_order_and_counts() {
        let server = server(2, false);
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let session = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_session(FramedChannel::new(server_io)).await })
        };

        let mut client = FramedChannel::new(client_io);
        let batch = [MaskedHash([1; 16]), MaskedHash([1; 16]), MaskedHash([2; 16])];
        client.send(&encode_request(&batch)).await.unwrap();
        let keys = decode_response(&client.recv().await.unwrap().unwrap(), 3).unwrap();
        // second copy of hash 1 reaches the threshold of 2
        assert_ne!(keys[0], keys[1]);
        client.close().await.unwrap();
        drop(client);

        let stats = session.await.unwrap().unwrap();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.keys_issued, 3);
        assert_eq!(stats.popular, 1);
        assert_eq!(stats.unpopular, 2);
    }

    #[tokio::test]
    async fn malformed_batch_ends_session() {
        let server = server(2, false);
        let (client_io, server_io) = tokio::io::duplex(4096);
        let session = tokio::spawn({
            let server = server.clone();
            async move { server.serve_session(FramedChannel::new(server_io)).await }
        });

        let mut client = FramedChannel::new(client_io);
        client.send(&[0u8; 15]).await.unwrap();

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, TdsError::Protocol(_)));
        assert!(client.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_above_limit_rejected() {
        let server = server(2, false);
        let (client_io, server_io) = tokio::io::duplex(4096);
        let session = tokio::spawn({
            let server = server.clone();
            async move { server.serve_session(FramedChannel::new(server_io)).await }
        });

        let mut client = FramedChannel::new(client_io);
        client
            .send(&encode_request(&[MaskedHash([0; 16]); 9]))
            .await
            .unwrap();
        assert!(session.await.unwrap().is_err());
    }
}
