//! Round-trip time tracking used to size retransmission intervals.
//!
//! Resolved open question (SPEC_FULL.md §9): RTT is smoothed with an
//! exponentially-weighted moving average and the result is scaled and
//! clamped by `SendBufferSettings`, not reported raw.

use std::time::Duration;

/// Smoothing weight applied to each new sample, matching the teacher
/// crate's reorder-latency estimator.
const SMOOTHING: f64 = 0.125;

/// An EWMA estimator over observed round-trip times.
#[derive(Debug, Clone, Copy)]
pub struct RttWindow {
    estimate: Option<Duration>,
}

impl RttWindow {
    pub fn new() -> Self {
        Self { estimate: None }
    }

    /// Record a fresh round-trip sample (ack received minus pack sent).
    pub fn record(&mut self, sample: Duration) {
        self.estimate = Some(match self.estimate {
            None => sample,
            Some(prev) => {
                let prev_secs = prev.as_secs_f64();
                let sample_secs = sample.as_secs_f64();
                let next = prev_secs + SMOOTHING * (sample_secs - prev_secs);
                Duration::from_secs_f64(next.max(0.0))
            }
        });
    }

    /// The current smoothed estimate, or `None` if no sample has been
    /// recorded yet.
    pub fn estimate(&self) -> Option<Duration> {
        self.estimate
    }

    /// The current estimate, or a `default` if no sample has been seen.
    pub fn estimate_or(&self, default: Duration) -> Duration {
        self.estimate.unwrap_or(default)
    }
}

impl Default for RttWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_the_estimate() {
        let mut rtt = RttWindow::new();
        rtt.record(Duration::from_millis(100));
        assert_eq!(rtt.estimate(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn converges_toward_repeated_samples() {
        let mut rtt = RttWindow::new();
        rtt.record(Duration::from_millis(100));
        for _ in 0..50 {
            rtt.record(Duration::from_millis(200));
        }
        let estimate = rtt.estimate().unwrap();
        assert!(estimate.as_millis() > 190 && estimate.as_millis() <= 200);
    }

    #[test]
    fn estimate_or_falls_back_when_empty() {
        let rtt = RttWindow::new();
        assert_eq!(rtt.estimate_or(Duration::from_secs(1)), Duration::from_secs(1));
    }
}
