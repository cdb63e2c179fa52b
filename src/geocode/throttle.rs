use std::time::{Duration, Instant};

/// Minimum spacing between remote calls, measured from the end of the
/// previous call so slow responses don't eat into the pause.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: None,
        }
    }

    /// How long to wait at `now` before the next call may start.
    pub fn delay_before_next(&self, now: Instant) -> Duration {
        match self.last_call {
            Some(prev) => self
                .min_interval
                .saturating_sub(now.saturating_duration_since(prev)),
            None => Duration::ZERO,
        }
    }

    pub fn record_call(&mut self, finished_at: Instant) {
        self.last_call = Some(finished_at);
    }

    pub async fn wait(&self) {
        let delay = self.delay_before_next(Instant::now());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
