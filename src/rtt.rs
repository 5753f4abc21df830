use std::time::Duration;

/// Exponentially-weighted moving average of the round-trip time and its deviation, used to
///  size retransmission timeouts. Both estimates are unset until the first sample arrives;
///  before that, a fixed initial timeout applies.
///
/// Weights follow the classic TCP estimator: 7/8 for the average, 3/4 for the deviation.
pub struct RttEstimator {
    initial_timeout: f64,
    min_timeout: f64,
    avg: Option<f64>,
    dev: Option<f64>,
}

impl RttEstimator {
    pub fn new(initial_timeout: Duration, min_timeout: Duration) -> RttEstimator {
        RttEstimator {
            initial_timeout: initial_timeout.as_secs_f64(),
            min_timeout: min_timeout.as_secs_f64(),
            avg: None,
            dev: None,
        }
    }

    pub fn add_sample(&mut self, sample: f64) {
        // A sample can come out negative if a retransmission refreshed the echoed timestamp
        //  while the ACK for the original copy was in flight. Such a sample carries no
        //  information about the path.
        if sample < 0.0 {
            return;
        }

        match (self.avg, self.dev) {
            (Some(avg), Some(dev)) => {
                self.avg = Some(0.875 * avg + 0.125 * sample);
                self.dev = Some(0.75 * dev + 0.25 * (sample - avg).abs());
            }
            _ => {
                self.avg = Some(sample);
                self.dev = Some(sample / 2.0);
            }
        }
    }

    /// The current retransmission timeout in seconds:
    ///  `max(avg + 4*max(dev, min_timeout), min_timeout)`, or the initial timeout before
    ///  any sample exists. The `min_timeout` floor keeps the timer from thrashing on
    ///  near-zero-latency loopback links.
    pub fn retransmission_timeout(&self) -> f64 {
        match (self.avg, self.dev) {
            (Some(avg), Some(dev)) => (avg + 4.0 * dev.max(self.min_timeout)).max(self.min_timeout),
            _ => self.initial_timeout,
        }
    }

    /// Penalty applied when a timer-driven retransmission fires: sustained loss means the
    ///  current estimates are too optimistic, and backing them off avoids retransmission
    ///  storms while the path recovers.
    pub fn apply_backoff(&mut self) {
        if let (Some(avg), Some(dev)) = (self.avg, self.dev) {
            self.avg = Some(avg * 2.0);
            self.dev = Some(dev * 2.0);
        }
    }
}
