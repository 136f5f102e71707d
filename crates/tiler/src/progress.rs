use std::time::{Duration, Instant};

/// Rate-limited progress reporting for long point loops.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tick {
    start: Instant,
    last: Instant,
    every: u64,
}

impl Tick {
    /// Trigger at most once per `every` points.
    #[inline]
    pub fn new(every: u64) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
            every: every.max(1),
        }
    }

    /// True when `count` is a multiple of `every` and 200 ms passed since the last report.
    /// Resets the interval when it fires.
    #[inline]
    pub fn should(&mut self, count: u64) -> bool {
        const MIN_INTERVAL: Duration = Duration::from_millis(200);

        if count % self.every == 0 && self.last.elapsed() >= MIN_INTERVAL {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }

    /// Million points per second since construction.
    #[inline]
    pub fn rate_mps(&self, count: u64) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64().max(1e-9);
        count as f64 / 1_000_000.0 / elapsed
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
