use std::time::{Duration, Instant};

/// Transfer rate estimate as an exponential moving average.
///
/// Bytes are recorded as they move and folded into the average on each
/// [`update`](Self::update). A sample taken after `dt` is weighted by
/// `dt / window`, so the estimate settles over roughly one window.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    rate: f64,
    pending: u64,
    total: u64,
    window: Duration,
    last_update: Instant,
}

impl RateEstimator {
    pub fn starting_at(window: Duration, now: Instant) -> Self {
        Self {
            rate: 0.0,
            pending: 0,
            total: 0,
            window,
            last_update: now,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.pending += bytes as u64;
        self.total += bytes as u64;
    }

    /// Folds the bytes recorded since the last update into the average and
    /// returns the new rate in bytes per second.
    pub fn update(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_update);
        if elapsed.is_zero() {
            return self.rate;
        }

        let sample = self.pending as f64 / elapsed.as_secs_f64();
        let alpha = (elapsed.as_secs_f64() / self.window.as_secs_f64()).min(1.0);
        self.rate += alpha * (sample - self.rate);

        self.pending = 0;
        self.last_update = now;
        self.rate
    }

    /// Total bytes recorded over the estimator's lifetime.
    pub fn total(&self) -> u64 {
        self.total
    }
}
