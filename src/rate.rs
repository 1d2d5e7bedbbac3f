//! Transfer rate measurement.
//!
//! Each peer stream carries a [`RateMeter`]: a running byte/s average
//! over a sliding 20-second window. The meter is clocked explicitly in
//! whole seconds so callers (and tests) control time; sessions feed it
//! from a monotonic clock anchored at engine start.

/// Width of the sliding window in seconds.
pub const WINDOW_SECS: u64 = 20;

/// Offset applied to a fresh meter's window start. Without it the first
/// update would divide by a near-zero elapsed time and a brand-new peer
/// would briefly report an absurd rate.
pub const FUDGE_SECS: u64 = 5;

/// Sliding running-average of bytes per second on one stream.
#[derive(Debug, Clone)]
pub struct RateMeter {
    rate: f64,
    total: u64,
    next_expected: u64,
    last_update: u64,
    rate_since: u64,
}

impl RateMeter {
    pub fn new(now: u64) -> Self {
        Self {
            rate: 0.0,
            total: 0,
            next_expected: now + FUDGE_SECS,
            last_update: now,
            rate_since: now.saturating_sub(FUDGE_SECS),
        }
    }

    /// Folds `amount` bytes observed at time `now` into the average and
    /// returns the updated rate.
    ///
    /// Idle calls (`amount == 0`) before the expected next update are
    /// ignored; past it they decay the rate toward zero, so a stalled
    /// stream reads as slow rather than frozen at its last speed.
    pub fn update(&mut self, amount: u64, now: u64) -> f64 {
        if now < self.next_expected && amount == 0 {
            return self.rate;
        }

        let elapsed = now.saturating_sub(self.rate_since).max(1) as f64;
        let carried = self.rate * self.last_update.saturating_sub(self.rate_since) as f64;
        self.rate = (carried + amount as f64) / elapsed;

        self.total += amount;
        self.next_expected = now + (amount / (self.rate as u64).max(1)).min(FUDGE_SECS);
        self.last_update = now;
        self.rate_since = self.rate_since.max(now.saturating_sub(WINDOW_SECS));
        self.rate
    }

    /// Current rate in bytes per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Total bytes folded in over the meter's lifetime.
    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Capacity of a [`RateWindow`].
pub const RATE_WINDOW_CAP: usize = 25;

/// Samples retained when a full window is truncated.
pub const RATE_WINDOW_KEEP: usize = 20;

/// Rolling window of recent download-rate samples, used for the
/// per-torrent rate sparkline.
#[derive(Debug, Clone, Default)]
pub struct RateWindow {
    samples: Vec<f64>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a sample. When the window exceeds its cap the oldest
    /// samples are discarded down to the retention mark.
    pub fn push(&mut self, sample: f64) {
        self.samples.push(sample);
        if self.samples.len() > RATE_WINDOW_CAP {
            let drop = self.samples.len() - RATE_WINDOW_KEEP;
            self.samples.drain(..drop);
        }
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }
}
