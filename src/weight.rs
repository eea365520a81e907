// ===============================
// src/weight.rs
// ===============================
//
// Request-weight accounting for the REST client.
// A call is only dispatched once its cost fits in the current window;
// otherwise the caller is told how long to wait for the window to reset.
//
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct WeightBudget {
    current: u32,
    window_start: Instant,
    limit: u32,
    window: Duration,
}

impl WeightBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { current: 0, window_start: Instant::now(), limit, window }
    }

    pub fn current(&self) -> u32 { self.current }
    pub fn limit(&self) -> u32 { self.limit }

    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= self.window {
            self.current = 0;
            self.window_start = now;
        }
    }

    /// Time left until the current window resets.
    pub fn until_reset(&self, now: Instant) -> Duration {
        self.window.saturating_sub(now.saturating_duration_since(self.window_start))
    }

    /// Reserve `cost` if it fits; otherwise return the wait until reset.
    pub fn try_reserve(&mut self, cost: u32, now: Instant) -> Result<(), Duration> {
        self.roll(now);
        if self.current.saturating_add(cost) > self.limit {
            return Err(self.until_reset(now));
        }
        self.current += cost;
        Ok(())
    }

    /// Adopt the exchange's view (`X-MBX-USED-WEIGHT-1M`) when it is higher than ours.
    pub fn sync_used(&mut self, used: u32, now: Instant) {
        self.roll(now);
        if used > self.current {
            self.current = used;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn over_budget_call_waits_for_reset() {
        let mut b = WeightBudget::new(1200, Duration::from_secs(60));
        b.try_reserve(1195, Instant::now()).unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        let wait = b.try_reserve(10, Instant::now()).unwrap_err();
        assert_eq!(wait, Duration::from_secs(40));
        assert_eq!(b.current(), 1195, "rejected reservation must not be counted");

        tokio::time::advance(wait).await;
        assert!(b.try_reserve(10, Instant::now()).is_ok());
        assert_eq!(b.current(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn exact_fit_is_allowed() {
        let mut b = WeightBudget::new(1200, Duration::from_secs(60));
        b.try_reserve(1190, Instant::now()).unwrap();
        assert!(b.try_reserve(10, Instant::now()).is_ok());
        assert!(b.try_reserve(1, Instant::now()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn header_sync_only_raises() {
        let mut b = WeightBudget::new(1200, Duration::from_secs(60));
        b.try_reserve(100, Instant::now()).unwrap();
        b.sync_used(40, Instant::now());
        assert_eq!(b.current(), 100);
        b.sync_used(900, Instant::now());
        assert_eq!(b.current(), 900);
    }
}
