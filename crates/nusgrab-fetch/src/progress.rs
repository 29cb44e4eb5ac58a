//! Progress snapshots and throughput smoothing.

use std::time::{Duration, Instant};

/// Snapshot of one running transfer. Cheap to copy; pushed through a
/// watch channel so display code reads the latest state without locking
/// the transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferProgress {
    /// Bytes on their way to storage, including any resumed prefix.
    pub bytes_done: u64,

    /// Expected total, when known from metadata or Content-Length.
    pub total: Option<u64>,

    /// Smoothed throughput in bytes per second.
    pub rate_bps: f64,

    /// Remaining time at the smoothed rate.
    pub eta: Option<Duration>,

    /// Attempt counter, 0 for the first try.
    pub attempt: u32,
}

/// Aggregate snapshot across one title (item m of n plus byte totals).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TitleProgress {
    pub item: usize,
    pub items: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Weight given to the newest rate sample.
const SMOOTHING: f64 = 0.2;

/// Exponential moving average over instantaneous throughput samples.
/// Raw chunk timings are too jittery to display directly.
#[derive(Debug)]
pub(crate) struct SpeedEstimator {
    rate: f64,
    primed: bool,
    last_at: Instant,
    last_bytes: u64,
}

impl SpeedEstimator {
    pub(crate) fn new(start_bytes: u64) -> Self {
        Self {
            rate: 0.0,
            primed: false,
            last_at: Instant::now(),
            last_bytes: start_bytes,
        }
    }

    /// Fold in a new byte total, returning the smoothed rate.
    pub(crate) fn sample(&mut self, bytes_done: u64) -> f64 {
        let elapsed = self.last_at.elapsed();
        self.update(bytes_done, elapsed)
    }

    fn update(&mut self, bytes_done: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return self.rate;
        }
        let delta = bytes_done.saturating_sub(self.last_bytes);
        let instant = delta as f64 / secs;
        self.rate = if self.primed {
            SMOOTHING * instant + (1.0 - SMOOTHING) * self.rate
        } else {
            self.primed = true;
            instant
        };
        self.last_at = Instant::now();
        self.last_bytes = bytes_done;
        self.rate
    }
}

/// Remaining time at `rate_bps`, or `None` when it cannot be estimated.
pub(crate) fn eta(rate_bps: f64, total: Option<u64>, bytes_done: u64) -> Option<Duration> {
    let total = total?;
    if rate_bps <= 0.0 || bytes_done >= total {
        return None;
    }
    let remaining = (total - bytes_done) as f64 / rate_bps;
    Some(Duration::from_secs_f64(remaining))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_sets_the_rate() {
        let mut est = SpeedEstimator::new(0);
        let rate = est.update(1000, Duration::from_secs(1));
        assert_eq!(rate, 1000.0);
    }

    #[test]
    fn newest_sample_gets_one_fifth_weight() {
        let mut est = SpeedEstimator::new(0);
        est.update(1000, Duration::from_secs(1));
        // Instantaneous rate jumps to 2000 B/s; the display rate moves a
        // fifth of the way there.
        let rate = est.update(3000, Duration::from_secs(1));
        assert_eq!(rate, 0.2 * 2000.0 + 0.8 * 1000.0);
    }

    #[test]
    fn stalled_transfer_decays_toward_zero() {
        let mut est = SpeedEstimator::new(0);
        est.update(1000, Duration::from_secs(1));
        let rate = est.update(1000, Duration::from_secs(1));
        assert_eq!(rate, 800.0);
    }

    #[test]
    fn eta_from_smoothed_rate() {
        assert_eq!(
            eta(100.0, Some(1000), 500),
            Some(Duration::from_secs_f64(5.0))
        );
        assert_eq!(eta(0.0, Some(1000), 500), None);
        assert_eq!(eta(100.0, None, 500), None);
        assert_eq!(eta(100.0, Some(1000), 1000), None);
    }
}
