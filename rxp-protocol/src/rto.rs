//! Retransmission timeout estimation
//!
//! Smoothed RTT and deviation with the classic 1/8 and 1/4 gains, and an
//! exponential backoff on every retransmission timeout.

use std::time::Duration;

/// RTT estimator producing the retransmission timeout
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    /// Smoothed RTT (microseconds)
    srtt: f64,
    /// RTT deviation (microseconds)
    rtt_var: f64,
    /// Number of samples
    sample_count: u32,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RtoEstimator {
    /// Create a new RTO estimator
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        let max_rto = max_rto.max(min_rto);
        RtoEstimator {
            srtt: 0.0,
            rtt_var: 0.0,
            sample_count: 0,
            rto: initial_rto.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
        }
    }

    /// Update with a new RTT sample
    pub fn update(&mut self, sample: Duration) {
        let sample = sample.as_micros() as f64;

        if self.sample_count == 0 {
            self.srtt = sample;
            self.rtt_var = sample / 2.0;
        } else {
            let alpha = 0.125;
            let beta = 0.25;

            self.srtt = (1.0 - alpha) * self.srtt + alpha * sample;
            self.rtt_var = (1.0 - beta) * self.rtt_var + beta * (sample - self.srtt).abs();
        }
        self.sample_count += 1;

        let rto_us = self.srtt + 4.0 * self.rtt_var;
        self.rto = Duration::from_micros(rto_us as u64).clamp(self.min_rto, self.max_rto);
    }

    /// Double the timeout after a retransmission timeout
    pub fn backoff(&mut self) {
        self.rto = self.rto.saturating_mul(2).min(self.max_rto);
    }

    /// Current retransmission timeout
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed RTT, if any sample has been taken
    pub fn srtt(&self) -> Option<Duration> {
        if self.sample_count == 0 {
            None
        } else {
            Some(Duration::from_micros(self.srtt as u64))
        }
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_millis(100),
            Duration::from_secs(60),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_rto() {
        let rto = RtoEstimator::default();
        assert_eq!(rto.rto(), Duration::from_secs(1));
        assert!(rto.srtt().is_none());
    }

    #[test]
    fn test_first_sample_seeds_estimate() {
        let mut rto = RtoEstimator::default();
        rto.update(Duration::from_millis(200));

        // srtt = 200ms, dev = 100ms, rto = 200 + 400
        assert_eq!(rto.srtt(), Some(Duration::from_millis(200)));
        assert_eq!(rto.rto(), Duration::from_millis(600));
    }

    #[test]
    fn test_smoothing() {
        let mut rto = RtoEstimator::default();
        rto.update(Duration::from_millis(200));
        rto.update(Duration::from_millis(200));

        // srtt stays 200ms, dev = 3/4 * 100 + 1/4 * 0 = 75ms
        assert_eq!(rto.srtt(), Some(Duration::from_millis(200)));
        assert_eq!(rto.rto(), Duration::from_millis(500));
    }

    #[test]
    fn test_clamped_to_minimum() {
        let mut rto = RtoEstimator::default();
        rto.update(Duration::from_micros(10));
        assert_eq!(rto.rto(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut rto = RtoEstimator::new(
            Duration::from_millis(400),
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        rto.backoff();
        assert_eq!(rto.rto(), Duration::from_millis(800));
        rto.backoff();
        assert_eq!(rto.rto(), Duration::from_secs(1));

        // A fresh sample recomputes from the formula
        rto.update(Duration::from_millis(100));
        assert_eq!(rto.rto(), Duration::from_millis(300));
    }
}
