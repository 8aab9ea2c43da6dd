use std::time::Duration;

/// Cadence of the skew probe; also serves as the protocol keepalive.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// EMA weight per skew sample. Tracks slow drift while damping jitter
/// and rtt asymmetry.
const SKEW_ALPHA: f64 = 0.2;

/// Smoothed estimate of `serverClock - localClock` in milliseconds.
///
/// Probe protocol: the client sends `{t0 = localNow()}`, the server answers
/// `{t0, t1 = serverNow()}`, and on receipt at `t2 = localNow()` the
/// estimated server time is `t1 + rtt/2`, giving an instantaneous skew of
/// `t1 + (t2 - t0)/2 - t2`.
#[derive(Debug, Default)]
pub struct SkewEstimator {
    skew_ms: Option<f64>,
    last_rtt_ms: Option<f64>,
}

impl SkewEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_pong(&mut self, t0: f64, t1: f64, t2: f64) {
        let rtt = (t2 - t0).max(0.0);
        let sample = t1 + rtt / 2.0 - t2;
        self.last_rtt_ms = Some(rtt);
        self.skew_ms = Some(match self.skew_ms {
            Some(current) => current + SKEW_ALPHA * (sample - current),
            None => sample,
        });
    }

    /// Smoothed skew in milliseconds; zero until the first sample lands.
    pub fn skew_ms(&self) -> f64 {
        self.skew_ms.unwrap_or(0.0)
    }

    /// Most recent raw round-trip time, used to size adaptive thresholds.
    pub fn last_rtt_ms(&self) -> f64 {
        self.last_rtt_ms.unwrap_or(0.0)
    }

    /// Converts a local timestamp into estimated server time.
    pub fn corrected(&self, local_now_ms: f64) -> f64 {
        local_now_ms + self.skew_ms()
    }
}

/// Local clock, epoch milliseconds.
pub fn local_now_ms() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_to_fixed_offset() {
        let mut estimator = SkewEstimator::new();
        let offset = 750.0;
        let rtt = 80.0;

        let mut local = 10_000.0;
        for _ in 0..10 {
            let t0 = local;
            let t1 = t0 + rtt / 2.0 + offset;
            let t2 = t0 + rtt;
            estimator.on_pong(t0, t1, t2);
            local += 2_000.0;
        }

        assert!((estimator.skew_ms() - offset).abs() < 10.0);
        assert_eq!(estimator.last_rtt_ms(), rtt);
    }

    #[test]
    fn damps_jittered_samples() {
        let mut estimator = SkewEstimator::new();
        estimator.on_pong(0.0, 500.0, 100.0); // skew 450
        let settled = estimator.skew_ms();
        estimator.on_pong(2_000.0, 3_250.0, 2_100.0); // outlier sample: 1200
        let after = estimator.skew_ms();
        assert!(after > settled);
        assert!(after < settled + 0.25 * (1_200.0 - settled));
    }

    #[test]
    fn corrected_applies_smoothed_skew() {
        let mut estimator = SkewEstimator::new();
        estimator.on_pong(0.0, 800.0, 100.0);
        assert_eq!(estimator.corrected(1_000.0), 1_000.0 + estimator.skew_ms());
    }
}
