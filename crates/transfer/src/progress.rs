use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Default averaging window.
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Cap on retained samples.
const MAX_SAMPLES: usize = 100;

/// Sliding-window transfer speed.
///
/// Owned by the task driving one upload, so no interior locking.
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Records `bytes` acknowledged now.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.prune(now);
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    /// Bytes/second over the window ending now.
    pub fn bytes_per_second(&mut self) -> f64 {
        self.bytes_per_second_at(Instant::now())
    }

    /// Bytes/second over the window ending at `now`.
    ///
    /// The oldest sample only marks the start of the measured span, so a
    /// single sample yields 0.
    pub fn bytes_per_second_at(&mut self, now: Instant) -> f64 {
        self.prune(now);
        let Some(&(start, _)) = self.samples.front() else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed.is_zero() || self.samples.len() < 2 {
            return 0.0;
        }
        let bytes: u64 = self.samples.iter().skip(1).map(|(_, b)| b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to send `remaining` bytes at the current speed.
    pub fn eta(&mut self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        (speed > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
