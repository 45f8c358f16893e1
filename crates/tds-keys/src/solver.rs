//! Popularity threshold and the solver that re-tunes it
//!
//! Key server sessions record `(masked hash, estimate)` observations here. The
//! solver drains them, keeps the highest estimate per hash, and picks the
//! smallest threshold `t >= min_threshold` whose deterministic-key mass stays
//! within `mass`:
//!
//! ```text
//! leaked(t) = sum over hashes with count f >= t of (f - t + 1)
//! choose min t such that leaked(t) <= mass * sum of all f
//! ```
//!
//! `leaked(t)` is the number of copies that would have received a deterministic
//! key. It only shrinks as `t` grows, so the smallest feasible `t` deduplicates
//! the most while keeping the linkable share bounded.
//!
//! Threshold and observations share one lock, separate from the sketch lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tds_core::config::KeyServerConfig;
use tds_core::MaskedHash;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SolverSettings {
    pub enabled: bool,
    pub initial_threshold: u64,
    pub trigger_count: usize,
    /// Cap on buffered observations, never below `trigger_count`
    pub max_pending: usize,
    pub interval: Duration,
    pub mass: f64,
    pub min_threshold: u64,
}

impl From<&KeyServerConfig> for SolverSettings {
    fn from(cfg: &KeyServerConfig) -> Self {
        Self {
            enabled: cfg.solver_enabled,
            initial_threshold: cfg.initial_threshold.max(1),
            trigger_count: cfg.solver_trigger_count.max(1),
            max_pending: cfg.solver_max_pending.max(cfg.solver_trigger_count).max(1),
            interval: Duration::from_secs(cfg.solver_interval_secs.max(1)),
            mass: cfg.solver_mass,
            min_threshold: cfg.min_threshold.max(1),
        }
    }
}

#[derive(Debug)]
struct SolverState {
    threshold: u64,
    observations: Vec<(MaskedHash, u64)>,
}

#[derive(Debug)]
pub struct ThresholdSolver {
    settings: SolverSettings,
    state: Mutex<SolverState>,
    wake: Notify,
    runs: AtomicU64,
}

impl ThresholdSolver {
    pub fn new(settings: SolverSettings) -> Self {
        let state = SolverState {
            threshold: settings.initial_threshold,
            observations: Vec::new(),
        };
        Self {
            settings,
            state: Mutex::new(state),
            wake: Notify::new(),
            runs: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn threshold(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .threshold
    }

    pub fn set_threshold(&self, threshold: u64) {
        let threshold = threshold.max(1);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.threshold != threshold {
            tracing::info!(old = state.threshold, new = threshold, "popularity threshold updated");
        }
        state.threshold = threshold;
    }

    /// Completed solver runs.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Observations waiting for the next run.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observations
            .len()
    }

    /// Record a batch of observations. A no-op when the solver is disabled.
    ///
    /// Past `max_pending` the oldest observations are dropped so a stalled
    /// solver cannot grow the buffer without bound.
    pub fn record(&self, observations: &[(MaskedHash, u64)]) {
        if !self.settings.enabled || observations.is_empty() {
            return;
        }
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.observations.extend_from_slice(observations);
            let excess = state
                .observations
                .len()
                .saturating_sub(self.settings.max_pending);
            if excess > 0 {
                state.observations.drain(..excess);
                tracing::warn!(dropped = excess, "solver backlog full, dropped oldest observations");
            }
            state.observations.len()
        };
        if pending >= self.settings.trigger_count {
            self.wake.notify_one();
        }
    }

    /// Drain observations and install a new threshold. Returns it, or `None`
    /// if there was nothing to solve over.
    pub fn run_once(&self) -> Option<u64> {
        if !self.settings.enabled {
            return None;
        }
        let observations = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut state.observations)
        };
        let threshold = solve(&observations, self.settings.mass, self.settings.min_threshold)?;
        self.set_threshold(threshold);
        self.runs.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(observations = observations.len(), threshold, "solver run");
        Some(threshold)
    }

    /// Background task: solve on trigger or every `interval` until cancelled.
    pub async fn run(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        if !self.settings.enabled {
            tracing::info!(threshold = self.threshold(), "threshold solver disabled");
            return;
        }
        let period = self.settings.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            self.run_once();
        }
        tracing::debug!("threshold solver stopped");
    }
}

/// Pick a threshold from raw observations. `None` when there are none.
pub fn solve(observations: &[(MaskedHash, u64)], mass: f64, min_threshold: u64) -> Option<u64> {
    let mut peaks: HashMap<MaskedHash, u64> = HashMap::new();
    for (label, estimate) in observations {
        let peak = peaks.entry(*label).or_default();
        *peak = (*peak).max(*estimate);
    }
    let counts: Vec<u64> = peaks.into_values().filter(|c| *c > 0).collect();
    if counts.is_empty() {
        return None;
    }

    let total: u128 = counts.iter().map(|c| u128::from(*c)).sum();
    let budget = mass.clamp(0.0, 1.0) * total as f64;
    let leaked = |t: u64| -> u128 {
        counts
            .iter()
            .filter(|c| **c >= t)
            .map(|c| u128::from(c - t + 1))
            .sum()
    };

    // leaked() is non-increasing in t and zero past the largest count
    let max_count = counts.iter().copied().max().unwrap_or(0);
    let mut lo = min_threshold.max(1);
    let mut hi = max_count.saturating_add(1).max(lo);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if leaked(mid) as f64 <= budget {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Some(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn h(b: u8) -> MaskedHash {
        MaskedHash([b; 16])
    }

    fn settings(enabled: bool, trigger: usize) -> SolverSettings {
        SolverSettings {
            enabled,
            initial_threshold: 10,
            trigger_count: trigger,
            max_pending: trigger.max(4),
            interval: Duration::from_secs(3600),
            mass: 0.5,
            min_threshold: 1,
        }
    }

    #[test]
    fn no_observations_keeps_threshold() {
        assert_eq!(solve(&[], 0.5, 1), None);
        let solver = ThresholdSolver::new(settings(true, 100));
        assert_eq!(solver.run_once(), None);
        assert_eq!(solver.threshold(), 10);
    }

    #[test]
    fn uses_peak_estimate_per_label() {
        // one hash seen 1,2,3,4 times: peak 4, total 4
        let obs: Vec<_> = (1..=4).map(|c| (h(1), c)).collect();
        // leaked(t) = 5 - t; budget 2 => t = 3
        assert_eq!(solve(&obs, 0.5, 1), Some(3));
    }

    #[test]
    fn zero_mass_pushes_past_every_count() {
        let obs = vec![(h(1), 7), (h(2), 3)];
        assert_eq!(solve(&obs, 0.0, 1), Some(8));
    }

    #[test]
    fn full_mass_allows_minimum() {
        let obs = vec![(h(1), 7), (h(2), 3)];
        assert_eq!(solve(&obs, 1.0, 2), Some(2));
    }

    #[test]
    fn skewed_distribution() {
        // one hot hash (100) and many singletons
        let mut obs = vec![(h(0), 100)];
        obs.extend((1..=100).map(|b| (h(b), 1)));
        // total 200, budget 100: leaked(t) = 101 - t for t >= 2, so t = 2 gives 99
        assert_eq!(solve(&obs, 0.5, 1), Some(2));
    }

    #[test]
    fn disabled_solver_ignores_observations() {
        let solver = ThresholdSolver::new(settings(false, 1));
        solver.record(&[(h(1), 50)]);
        assert_eq!(solver.pending(), 0);
        assert_eq!(solver.run_once(), None);
        assert_eq!(solver.threshold(), 10);
    }

    #[test]
    fn run_once_drains() {
        let solver = ThresholdSolver::new(settings(true, 100));
        solver.record(&[(h(1), 4), (h(2), 4)]);
        assert_eq!(solver.pending(), 2);
        assert!(solver.run_once().is_some());
        assert_eq!(solver.pending(), 0);
        assert_eq!(solver.runs(), 1);
    }

    #[test]
    fn backlog_keeps_newest_observations() {
        let solver = ThresholdSolver::new(settings(true, 100));
        assert_eq!(solver.settings().max_pending, 100);
        let obs: Vec<_> = (0..150u8).map(|b| (h(b), 1)).collect();
        solver.record(&obs[..60]);
        solver.record(&obs[60..]);
        assert_eq!(solver.pending(), 100);

        let state = solver.state.lock().unwrap();
        assert_eq!(state.observations.first(), Some(&(h(50), 1)));
        assert_eq!(state.observations.last(), Some(&(h(149), 1)));
    }

    #[test]
    fn max_pending_never_below_trigger() {
        let cfg = KeyServerConfig {
            solver_trigger_count: 500,
            solver_max_pending: 10,
            ..Default::default()
        };
        let settings = SolverSettings::from(&cfg);
        assert_eq!(settings.max_pending, 500);
    }

    #[tokio::test]
    async fn trigger_count_wakes_task() {
        let solver = Arc::new(ThresholdSolver::new(settings(true, 2)));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(solver.clone().run(cancel.clone()));

        solver.record(&[(h(1), 1), (h(1), 2)]);
        for _ in 0..100 {
            if solver.runs() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(solver.runs(), 1);
        assert_ne!(solver.threshold(), 10);

        cancel.cancel();
        task.await.unwrap();
    }
}
