//! Throughput accounting.
//!
//! Naive "bytes / seconds-since-start" rate computation loses all
//! sub-second resolution and reacts far too slowly to bursts or stalls
//! once a session has been alive for a while (dividing by an ever-growing
//! denominator). [`ThroughputCounter`] instead keeps a cumulative total
//! (for stats reporting) alongside an
//! exponentially-weighted moving average of the rate, recomputed every time
//! [`ThroughputCounter::update`] is called with the tick length that
//! elapsed since the previous call.

use std::time::Duration;

/// How much weight the newest sample gets when folded into the running
/// average; smaller values smooth more aggressively.
const EWMA_SMOOTHING: f64 = 0.2;

/// Tracks a byte counter's cumulative total and a smoothed instantaneous
/// rate, in bytes/sec.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThroughputCounter {
    total: u64,
    rate: f64,
}

impl ThroughputCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records `delta_bytes` transferred over `elapsed`, folding the
    /// instantaneous rate into the moving average. A zero or negative
    /// elapsed is ignored (the first sample after construction has nothing
    /// to divide by).
    pub(crate) fn update(&mut self, delta_bytes: u64, elapsed: Duration) {
        self.total += delta_bytes;
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let instantaneous = delta_bytes as f64 / secs;
        self.rate = EWMA_SMOOTHING * instantaneous + (1.0 - EWMA_SMOOTHING) * self.rate;
    }

    /// The total number of bytes ever recorded.
    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    /// The current smoothed rate, in bytes/sec.
    pub(crate) fn rate(&self) -> f64 {
        self.rate
    }
}

/// Aggregate upload/download throughput and request/piece counters for a
/// single peer session or an entire torrent.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Stats {
    pub downloaded: ThroughputCounter,
    pub uploaded: ThroughputCounter,
    pub blocks_received: u64,
    pub blocks_sent: u64,
    pub pieces_verified: u64,
    pub pieces_failed: u64,
}

impl Stats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Samples both throughput counters for a tick of length `elapsed`,
    /// given the cumulative totals observed so far (this is how the peer
    /// manager's rate sampler folds per-peer counters into a snapshot
    /// without each peer needing to track its own previous sample).
    pub(crate) fn sample(
        &mut self,
        downloaded_delta: u64,
        uploaded_delta: u64,
        elapsed: Duration,
    ) {
        self.downloaded.update(downloaded_delta, elapsed);
        self.uploaded.update(uploaded_delta, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_accumulates_across_updates() {
        let mut c = ThroughputCounter::new();
        c.update(100, Duration::from_secs(1));
        c.update(50, Duration::from_secs(1));
        assert_eq!(c.total(), 150);
    }

    #[test]
    fn rate_converges_toward_steady_input() {
        let mut c = ThroughputCounter::new();
        for _ in 0..50 {
            c.update(1000, Duration::from_secs(1));
        }
        assert!((c.rate() - 1000.0).abs() < 1.0);
    }

    #[test]
    fn zero_elapsed_does_not_skew_rate() {
        let mut c = ThroughputCounter::new();
        c.update(1000, Duration::from_secs(1));
        let rate_before = c.rate();
        c.update(0, Duration::from_secs(0));
        assert_eq!(c.rate(), rate_before);
        assert_eq!(c.total(), 1000);
    }
}
