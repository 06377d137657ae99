//! Round-trip time estimation. See [`RttEstimator`].

use std::time::Duration;

/// Smoothing factor applied to the running average on every sample.
const SMOOTHING: f64 = 0.125;

/// Exponentially-weighted moving average of round-trip time.
///
/// Deliberately simpler than a variance-tracking estimator: one smoothed
/// average plus the last raw sample, updated as
/// `avg <- 0.875 * avg + 0.125 * sample`.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    average_ms: f64,
    last_sample_ms: f64,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Creates an estimator with no samples yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            average_ms: 0.0,
            last_sample_ms: 0.0,
            has_sample: false,
        }
    }

    /// Feeds in a new round-trip sample.
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        if self.has_sample {
            self.average_ms = (1.0 - SMOOTHING) * self.average_ms + SMOOTHING * sample_ms;
        } else {
            self.average_ms = sample_ms;
            self.has_sample = true;
        }
        self.last_sample_ms = sample_ms;
    }

    /// Current smoothed average RTT, or `None` if no sample has ever been
    /// recorded.
    #[must_use]
    pub fn average(&self) -> Option<Duration> {
        self.has_sample.then(|| Duration::from_secs_f64(self.average_ms / 1000.0))
    }

    /// The most recent raw sample, or `None` if no sample has ever been
    /// recorded.
    #[must_use]
    pub fn last_sample(&self) -> Option<Duration> {
        self.has_sample.then(|| Duration::from_secs_f64(self.last_sample_ms / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_becomes_the_average() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100));
        assert_eq!(rtt.average(), Some(Duration::from_millis(100)));
        assert_eq!(rtt.last_sample(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn subsequent_samples_are_smoothed() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100));
        rtt.update(Duration::from_millis(200));
        // 0.875*100 + 0.125*200 = 112.5ms
        let avg = rtt.average().unwrap().as_secs_f64() * 1000.0;
        assert!((avg - 112.5).abs() < 1e-6);
        assert_eq!(rtt.last_sample(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn no_sample_yields_none() {
        let rtt = RttEstimator::new();
        assert_eq!(rtt.average(), None);
    }
}
