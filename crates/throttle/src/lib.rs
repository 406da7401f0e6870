//! Token-bucket bandwidth limiter shared by every byte-sending path.
//!
//! One [`BandwidthThrottler`] is created per process and handed out behind an
//! `Arc`; the configured cap is therefore a global ceiling, not per job.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sleep between refill checks while a caller waits for tokens.
pub const REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors produced while waiting for bandwidth.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError {
    #[error("throttle wait cancelled")]
    Cancelled,
}

/// Informational counters; never used for decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleStats {
    /// Current cap in bytes/second (0 = unlimited).
    pub limit: u64,
    /// Bytes granted in total.
    pub bytes_granted: u64,
    /// Bytes that were not available on first request.
    pub bytes_throttled: u64,
    /// Time callers spent sleeping for tokens.
    pub total_delay: Duration,
}

struct Bucket {
    capacity: u64,
    available: f64,
    last_refill: Instant,
    stats: ThrottleStats,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        let cap = self.capacity as f64;
        self.available = (self.available + cap * elapsed.as_secs_f64()).min(cap);
    }
}

/// Process-wide token bucket.
///
/// Invariant: `0 <= available <= capacity`.
pub struct BandwidthThrottler {
    bucket: Mutex<Bucket>,
}

impl BandwidthThrottler {
    /// Creates a throttler capped at `bytes_per_sec` (0 disables throttling).
    ///
    /// The bucket starts full.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                capacity: bytes_per_sec,
                available: bytes_per_sec as f64,
                last_refill: Instant::now(),
                stats: ThrottleStats {
                    limit: bytes_per_sec,
                    ..ThrottleStats::default()
                },
            }),
        }
    }

    /// A throttler that grants everything.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Changes the cap; accumulated tokens are clamped to the new capacity.
    pub fn set_limit(&self, bytes_per_sec: u64) {
        let mut b = self.bucket.lock().unwrap();
        let now = Instant::now();
        b.refill(now);
        let was_disabled = b.capacity == 0;
        b.capacity = bytes_per_sec;
        b.available = if was_disabled {
            bytes_per_sec as f64
        } else {
            b.available.min(bytes_per_sec as f64)
        };
        b.stats.limit = bytes_per_sec;
        debug!(limit = bytes_per_sec, "bandwidth limit changed");
    }

    /// Current cap in bytes/second.
    pub fn limit(&self) -> u64 {
        self.bucket.lock().unwrap().capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.limit() > 0
    }

    /// Grants up to `n` bytes without waiting and returns the grant.
    pub fn request_bytes(&self, n: u64) -> u64 {
        let mut b = self.bucket.lock().unwrap();
        if b.capacity == 0 {
            b.stats.bytes_granted += n;
            return n;
        }
        b.refill(Instant::now());
        let granted = (b.available.floor() as u64).min(n);
        b.available -= granted as f64;
        b.stats.bytes_granted += granted;
        granted
    }

    /// Waits until `n` bytes have been granted.
    ///
    /// The wait loops in [`REFILL_INTERVAL`] steps so concurrent callers keep
    /// drawing from the same refills. Returns [`ThrottleError::Cancelled`] as
    /// soon as `cancel` fires; bytes granted so far are not returned.
    pub async fn wait_for_bytes(
        &self,
        n: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ThrottleError> {
        let mut granted = self.request_bytes(n);
        if granted >= n {
            return Ok(());
        }

        self.bucket.lock().unwrap().stats.bytes_throttled += n - granted;
        let started = Instant::now();

        while granted < n {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.record_delay(started.elapsed());
                    return Err(ThrottleError::Cancelled);
                }
                _ = tokio::time::sleep(REFILL_INTERVAL) => {}
            }
            granted += self.request_bytes(n - granted);
        }

        self.record_delay(started.elapsed());
        Ok(())
    }

    pub fn stats(&self) -> ThrottleStats {
        self.bucket.lock().unwrap().stats
    }

    fn record_delay(&self, delay: Duration) {
        self.bucket.lock().unwrap().stats.total_delay += delay;
    }
}

impl Default for BandwidthThrottler {
    fn default() -> Self {
        Self::unlimited()
    }
}
