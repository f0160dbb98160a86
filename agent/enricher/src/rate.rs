use tokio::time::Instant;

const WINDOW_SECS: u64 = 60;

/// Counts events over a sliding one-minute window using per-second buckets.
#[derive(Debug)]
pub(crate) struct FlowRate {
    epoch: Instant,
    /// `(second, count)` pairs indexed by `second % WINDOW_SECS`.
    buckets: [(u64, u64); WINDOW_SECS as usize],
}

impl FlowRate {
    pub(crate) fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            buckets: [(0, 0); WINDOW_SECS as usize],
        }
    }

    pub(crate) fn record(&mut self, now: Instant) {
        let sec = self.second(now);
        let bucket = &mut self.buckets[(sec % WINDOW_SECS) as usize];
        if bucket.0 != sec {
            *bucket = (sec, 0);
        }
        bucket.1 += 1;
    }

    pub(crate) fn total(&self, now: Instant) -> u64 {
        let sec = self.second(now);
        self.buckets
            .iter()
            .filter(|(s, _)| *s <= sec && sec - *s < WINDOW_SECS)
            .map(|(_, count)| count)
            .sum()
    }

    fn second(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_secs()
    }
}
