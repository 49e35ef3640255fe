//! Batch-size auto-tuning.
//!
//! A feedback controller that sizes the next reduction cycle from the last
//! one's (markers, bytes, duration). The cap and the feedback are both in
//! ledger markers, the unit the dispatcher pages by; raw row counts vary too
//! wildly per marker to steer on. The goal is a bounded-latency envelope per
//! cycle while amortizing the fixed per-cycle overhead: grow the cap while
//! cycles finish comfortably inside the target and actually fill the cap,
//! shrink it when they overrun. Purely a throughput/latency governor — the
//! cap never affects correctness, only how much pending work one cycle takes.
//!
//! State is in-memory only; after a restart the tuner re-learns from its
//! defaults. It is an owned component injected into the dispatcher, not a
//! process-wide singleton.

use std::time::Duration;

use tracing::debug;

/// Configuration for the batch-size tuner.
#[derive(Debug, Clone)]
pub struct TunerConfig {
    /// Smallest cap the tuner will shrink to.
    pub min_batch: usize,
    /// Largest cap the tuner will grow to.
    pub max_batch: usize,
    /// Cap for the first cycle after startup.
    pub initial_batch: usize,
    /// Latency envelope one cycle should stay inside.
    pub target_latency: Duration,
    /// Optional byte budget; a cycle exceeding it shrinks the cap even when
    /// latency was fine. Zero disables the budget.
    pub max_bytes: usize,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            min_batch: 128,
            max_batch: 1 << 20,
            initial_batch: 4096,
            target_latency: Duration::from_millis(500),
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

impl TunerConfig {
    /// Small caps and a tight envelope, for latency-sensitive deployments.
    pub fn conservative() -> Self {
        Self {
            min_batch: 64,
            max_batch: 1 << 14,
            initial_batch: 512,
            target_latency: Duration::from_millis(100),
            max_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Multiplicative-increase / multiplicative-decrease controller over the
/// per-cycle input cap.
#[derive(Debug)]
pub struct BatchSizeTuner {
    config: TunerConfig,
    current: usize,
    cycles_observed: u64,
}

impl BatchSizeTuner {
    pub fn new(config: TunerConfig) -> Self {
        let current = config
            .initial_batch
            .clamp(config.min_batch, config.max_batch);
        Self {
            config,
            current,
            cycles_observed: 0,
        }
    }

    /// The cap the next cycle should apply to its pending-work page.
    pub fn batch_size(&self) -> usize {
        self.current
    }

    pub fn cycles_observed(&self) -> u64 {
        self.cycles_observed
    }

    /// Feed one completed cycle's measurements back into the controller.
    /// `markers` is the number of ledger markers the cycle consumed, the
    /// same unit `batch_size` caps.
    pub fn record_cycle(&mut self, markers: usize, bytes: usize, elapsed: Duration) {
        self.cycles_observed += 1;
        let previous = self.current;

        let over_latency = elapsed > self.config.target_latency;
        let over_bytes = self.config.max_bytes > 0 && bytes > self.config.max_bytes;
        let filled_cap = markers >= self.current;
        let well_under_latency = elapsed * 2 < self.config.target_latency;

        if over_latency || over_bytes {
            self.current = (self.current / 2).max(self.config.min_batch);
        } else if filled_cap && well_under_latency {
            self.current = (self.current * 2).min(self.config.max_batch);
        }

        if self.current != previous {
            debug!(
                markers,
                bytes,
                elapsed_ms = elapsed.as_millis() as u64,
                from = previous,
                to = self.current,
                "batch cap adjusted"
            );
        }
    }
}

impl Default for BatchSizeTuner {
    fn default() -> Self {
        Self::new(TunerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuner() -> BatchSizeTuner {
        BatchSizeTuner::new(TunerConfig {
            min_batch: 100,
            max_batch: 10_000,
            initial_batch: 1000,
            target_latency: Duration::from_millis(100),
            max_bytes: 1_000_000,
        })
    }

    #[test]
    fn grows_when_fast_and_full() {
        let mut t = tuner();
        t.record_cycle(1000, 1000, Duration::from_millis(10));
        assert_eq!(t.batch_size(), 2000);
        t.record_cycle(2000, 1000, Duration::from_millis(10));
        assert_eq!(t.batch_size(), 4000);
    }

    #[test]
    fn does_not_grow_on_partial_batches() {
        let mut t = tuner();
        // Fast cycle, but the cap was not the limiting factor.
        t.record_cycle(50, 1000, Duration::from_millis(5));
        assert_eq!(t.batch_size(), 1000);
    }

    #[test]
    fn shrinks_on_latency_overrun() {
        let mut t = tuner();
        t.record_cycle(1000, 1000, Duration::from_millis(500));
        assert_eq!(t.batch_size(), 500);
    }

    #[test]
    fn shrinks_on_byte_budget_overrun() {
        let mut t = tuner();
        t.record_cycle(1000, 2_000_000, Duration::from_millis(10));
        assert_eq!(t.batch_size(), 500);
    }

    #[test]
    fn respects_bounds() {
        let mut t = tuner();
        for _ in 0..20 {
            t.record_cycle(t.batch_size(), 0, Duration::from_millis(1));
        }
        assert_eq!(t.batch_size(), 10_000);
        for _ in 0..20 {
            t.record_cycle(100, 0, Duration::from_secs(2));
        }
        assert_eq!(t.batch_size(), 100);
    }

    #[test]
    fn steady_state_holds_in_band() {
        let mut t = tuner();
        // Inside the envelope, not filling the cap: no oscillation.
        for _ in 0..10 {
            t.record_cycle(800, 1000, Duration::from_millis(80));
        }
        assert_eq!(t.batch_size(), 1000);
        assert_eq!(t.cycles_observed(), 10);
    }
}
