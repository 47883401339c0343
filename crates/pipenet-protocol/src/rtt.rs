use std::time::Duration;

/// Initial smoothed round-trip estimate, in milliseconds.
pub const INITIAL_RTT_MS: f32 = 50.0;
/// Initial round-trip variance, in milliseconds.
pub const INITIAL_RTT_VARIANCE_MS: f32 = 5.0;

const RTT_ALPHA: f32 = 1.0 / 8.0;
const RTT_BETA: f32 = 1.0 / 4.0;

/// Round-trip time tracking.
/// Uses an exponentially weighted moving average for the mean and the mean deviation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttEstimator {
    /// Last raw sample in milliseconds.
    last_rtt: f32,
    /// Smoothed round-trip time in milliseconds.
    smoothed_rtt: f32,
    /// Smoothed mean deviation in milliseconds.
    smoothed_variance: f32,
    samples: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Creates an estimator primed with the initial guesses.
    pub fn new() -> Self {
        Self {
            last_rtt: INITIAL_RTT_MS,
            smoothed_rtt: INITIAL_RTT_MS,
            smoothed_variance: INITIAL_RTT_VARIANCE_MS,
            samples: 0,
        }
    }

    /// Folds a new sample into the estimate.
    ///
    /// `processing_time` is how long the remote held the packet before
    /// acknowledging it and is removed from the sample. Samples never drop
    /// below one millisecond.
    pub fn update(&mut self, sample: Duration, processing_time: Duration) {
        let sample_ms = sample.saturating_sub(processing_time).as_secs_f32() * 1000.0;
        let sample_ms = sample_ms.max(1.0);

        let delta = sample_ms - self.smoothed_rtt;
        self.smoothed_rtt += delta * RTT_ALPHA;
        self.smoothed_variance += (delta.abs() - self.smoothed_variance) * RTT_BETA;
        self.last_rtt = sample_ms;
        self.samples = self.samples.saturating_add(1);
    }

    /// Returns the current smoothed RTT.
    pub fn rtt(&self) -> Duration {
        from_millis_f32(self.smoothed_rtt)
    }

    /// Returns the RTT variance.
    pub fn rtt_variance(&self) -> Duration {
        from_millis_f32(self.smoothed_variance)
    }

    /// Last raw sample, after processing-time compensation.
    pub fn last_rtt(&self) -> Duration {
        from_millis_f32(self.last_rtt)
    }

    /// Number of samples folded in.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Returns the retransmission timeout, `rtt + 4 * variance` clamped to `[minimum, maximum]`.
    pub fn resend_timeout(&self, minimum: Duration, maximum: Duration) -> Duration {
        let rto_ms = self.smoothed_rtt + 4.0 * self.smoothed_variance;
        from_millis_f32(rto_ms).clamp(minimum, maximum.max(minimum))
    }
}

fn from_millis_f32(ms: f32) -> Duration {
    Duration::from_micros((ms.max(0.0) * 1000.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_millis(64);
    const MAX: Duration = Duration::from_millis(200);

    #[test]
    fn test_initial_estimate() {
        let rtt = RttEstimator::new();
        assert_eq!(rtt.rtt(), Duration::from_millis(50));
        assert_eq!(rtt.samples(), 0);
        // 50 + 4 * 5 = 70
        let timeout = rtt.resend_timeout(MIN, MAX);
        assert!(timeout >= Duration::from_millis(69) && timeout <= Duration::from_millis(71));
    }

    #[test]
    fn test_converges_towards_samples() {
        let mut rtt = RttEstimator::new();
        for _ in 0..100 {
            rtt.update(Duration::from_millis(20), Duration::ZERO);
        }
        let ms = rtt.rtt().as_secs_f32() * 1000.0;
        assert!((ms - 20.0).abs() < 0.5, "rtt {ms}");
        assert!(rtt.rtt_variance() < Duration::from_millis(1));
        assert_eq!(rtt.resend_timeout(MIN, MAX), MIN);
    }

    #[test]
    fn test_processing_time_is_subtracted() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(80), Duration::from_millis(30));
        let last = rtt.last_rtt().as_secs_f32() * 1000.0;
        assert!((last - 50.0).abs() < 0.01);

        rtt.update(Duration::from_millis(10), Duration::from_millis(30));
        let last = rtt.last_rtt().as_secs_f32() * 1000.0;
        assert!((last - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_timeout_is_clamped_to_maximum() {
        let mut rtt = RttEstimator::new();
        for _ in 0..50 {
            rtt.update(Duration::from_millis(900), Duration::ZERO);
        }
        assert_eq!(rtt.resend_timeout(MIN, MAX), MAX);
    }
}
