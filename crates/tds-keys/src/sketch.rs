//! Count-min sketch over masked hashes
//!
//! `depth` rows of `width` saturating counters. Each row picks its counter with
//! an independent hash (BLAKE3 of a row tag and the masked hash). An estimate is
//! the minimum over the rows, so it can overcount on collisions but never
//! undercounts: without decay, `estimate(h) >= true count of h` always holds.

use tds_core::config::SketchDecay;
use tds_core::MaskedHash;

#[derive(Debug, Clone)]
pub struct CountMinSketch {
    width: usize,
    depth: usize,
    counters: Vec<u32>,
    decay: SketchDecay,
    observations: u64,
}

impl CountMinSketch {
    /// Zero dimensions are bumped to one.
    pub fn new(width: usize, depth: usize, decay: SketchDecay) -> Self {
        let width = width.max(1);
        let depth = depth.max(1);
        Self {
            width,
            depth,
            counters: vec![0; width * depth],
            decay,
            observations: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total `observe` calls since creation.
    pub fn observations(&self) -> u64 {
        self.observations
    }

    fn slot(&self, row: usize, hash: &MaskedHash) -> usize {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(row as u32).to_le_bytes());
        hasher.update(&hash.0);
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        row * self.width + (u64::from_le_bytes(word) % self.width as u64) as usize
    }

    /// Count one occurrence and return the updated estimate.
    pub fn observe(&mut self, hash: &MaskedHash) -> u64 {
        let mut estimate = u32::MAX;
        for row in 0..self.depth {
            let slot = self.slot(row, hash);
            let counter = &mut self.counters[slot];
            *counter = counter.saturating_add(1);
            estimate = estimate.min(*counter);
        }
        self.observations += 1;

        if let SketchDecay::HalveEvery(period) = self.decay {
            if period > 0 && self.observations % period == 0 {
                self.halve();
            }
        }
        u64::from(estimate)
    }

    pub fn estimate(&self, hash: &MaskedHash) -> u64 {
        (0..self.depth)
            .map(|row| self.counters[self.slot(row, hash)])
            .min()
            .map(u64::from)
            .unwrap_or(0)
    }

    fn halve(&mut self) {
        for counter in &mut self.counters {
            *counter >>= 1;
        }
        tracing::debug!(observations = self.observations, "sketch counters halved");
    }
}
