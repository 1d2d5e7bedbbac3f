//! Global transfer-rate limiting.
//!
//! The engine paces each direction on a virtual timeline. Every socket
//! read or write reserves a slot before moving its bytes: each byte
//! pushes the timeline forward by `1/rate` seconds, and a caller whose
//! slot lies in the future sleeps until it arrives. An idle gate lets
//! the timeline lag the clock by at most one burst window, so short
//! spikes pass untouched while the long-run average stays at the
//! configured cap. A zero rate disables pacing.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::Config;

/// How far the virtual timeline may lag behind the clock: the credit an
/// idle connection banks for a burst.
const BURST_WINDOW: Duration = Duration::from_millis(500);

struct Pacing {
    /// Seconds the timeline advances per byte; 0.0 disables the gate.
    secs_per_byte: f64,
    /// When the next transfer may start.
    next_free: Instant,
}

impl Pacing {
    /// Claims a slot for `bytes` at time `now` and returns how long the
    /// caller must wait before using it.
    fn reserve(&mut self, bytes: usize, now: Instant) -> Duration {
        if self.secs_per_byte == 0.0 {
            return Duration::ZERO;
        }
        let credit_floor = now.checked_sub(BURST_WINDOW).unwrap_or(now);
        if self.next_free < credit_floor {
            self.next_free = credit_floor;
        }
        let wait = self.next_free.saturating_duration_since(now);
        self.next_free += Duration::from_secs_f64(bytes as f64 * self.secs_per_byte);
        wait
    }
}

/// Paces one direction of traffic at a bytes-per-second cap.
pub struct RateGate {
    pacing: Mutex<Pacing>,
}

impl RateGate {
    /// A rate of zero means unlimited.
    pub fn new(bytes_per_sec: u64) -> Self {
        let now = Instant::now();
        Self {
            pacing: Mutex::new(Pacing {
                secs_per_byte: pace_of(bytes_per_sec),
                // Start with full burst credit.
                next_free: now.checked_sub(BURST_WINDOW).unwrap_or(now),
            }),
        }
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        self.pacing.lock().secs_per_byte = pace_of(bytes_per_sec);
    }

    /// Reserves a slot for `bytes` and sleeps until it arrives.
    ///
    /// Reservation happens under the lock but the sleep does not, so a
    /// caller waiting out a large transfer never blocks others from
    /// reserving the slots after it.
    pub async fn acquire(&self, bytes: usize) {
        let wait = self.pacing.lock().reserve(bytes, Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

fn pace_of(bytes_per_sec: u64) -> f64 {
    if bytes_per_sec == 0 {
        0.0
    } else {
        1.0 / bytes_per_sec as f64
    }
}

/// The engine's upload and download gates.
pub struct BandwidthLimiter {
    download: RateGate,
    upload: RateGate,
}

impl BandwidthLimiter {
    /// Limits are in bytes per second; 0 means unlimited.
    pub fn new(download_limit: u64, upload_limit: u64) -> Self {
        Self {
            download: RateGate::new(download_limit),
            upload: RateGate::new(upload_limit),
        }
    }

    /// Builds the gate pair from the configured KB/s caps.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_download_rate * 1024,
            config.max_upload_rate * 1024,
        )
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn set_download_rate(&self, bytes_per_sec: u64) {
        self.download.set_rate(bytes_per_sec);
    }

    pub fn set_upload_rate(&self, bytes_per_sec: u64) {
        self.upload.set_rate(bytes_per_sec);
    }

    /// Paces a socket read of `bytes`.
    pub async fn acquire_download(&self, bytes: usize) {
        self.download.acquire(bytes).await;
    }

    /// Paces a socket write of `bytes`.
    pub async fn acquire_upload(&self, bytes: usize) {
        self.upload.acquire(bytes).await;
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Headroom so `now - BURST_WINDOW` arithmetic can't underflow the
    // platform's Instant epoch.
    fn anchored_now() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_burst_credit_then_pacing() {
        let now = anchored_now();
        // 1000 B/s with full burst credit banked.
        let mut pacing = Pacing {
            secs_per_byte: 0.001,
            next_free: now - BURST_WINDOW,
        };

        // The banked 500 ms admits 500 bytes on the spot.
        assert!(pacing.reserve(500, now).is_zero());
        // The timeline is now at `now`; this transfer still starts
        // immediately but pushes the next slot 250 ms out.
        assert!(pacing.reserve(250, now).is_zero());
        // Credit exhausted: the next caller waits for its slot.
        let wait = pacing.reserve(100, now);
        assert!(
            wait >= Duration::from_millis(240) && wait <= Duration::from_millis(260),
            "wait {wait:?}"
        );
    }

    #[test]
    fn test_wait_grows_with_reserved_bytes() {
        let now = anchored_now();
        let mut pacing = Pacing { secs_per_byte: 0.001, next_free: now };
        pacing.reserve(2000, now);
        let wait = pacing.reserve(1, now);
        // Two seconds of traffic are already on the timeline.
        assert!(wait >= Duration::from_millis(1900), "wait {wait:?}");
    }

    #[test]
    fn test_idle_restores_burst_credit() {
        let now = anchored_now();
        let mut pacing = Pacing { secs_per_byte: 0.001, next_free: now };
        pacing.reserve(1000, now);

        // After a long idle stretch the lag is clamped to one burst
        // window, not accumulated forever.
        let later = now + Duration::from_secs(30);
        assert!(pacing.reserve(500, later).is_zero());
        let wait = pacing.reserve(100, later);
        assert!(wait.is_zero(), "wait {wait:?}");
        assert!(pacing.next_free > later);
    }

    #[test]
    fn test_zero_rate_never_waits_or_advances() {
        let now = anchored_now();
        let mut pacing = Pacing { secs_per_byte: 0.0, next_free: now };
        assert!(pacing.reserve(usize::MAX / 2, now).is_zero());
        assert_eq!(pacing.next_free, now);
    }

    #[tokio::test]
    async fn test_gates_pass_traffic() {
        let limiter = BandwidthLimiter::unlimited();
        limiter.acquire_download(1 << 40).await;
        limiter.acquire_upload(1 << 40).await;

        // A finite rate with burst credit available returns promptly.
        let limiter = BandwidthLimiter::new(1_000_000, 1_000_000);
        limiter.acquire_download(1024).await;
        limiter.acquire_upload(1024).await;
    }

    #[test]
    fn test_set_rate_switches_pacing() {
        let gate = RateGate::new(0);
        assert_eq!(gate.pacing.lock().secs_per_byte, 0.0);
        gate.set_rate(2000);
        assert_eq!(gate.pacing.lock().secs_per_byte, 1.0 / 2000.0);
        gate.set_rate(0);
        assert_eq!(gate.pacing.lock().secs_per_byte, 0.0);
    }
}
