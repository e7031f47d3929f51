use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Minimum interval between two rate-limited backend calls.
pub const MIN_CALL_INTERVAL: Duration = Duration::from_secs(6);

/// Time source for the limiter; swapped for a manual clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Blocks the calling (worker) thread until the minimum interval has passed.
#[derive(Clone)]
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_interval(clock, MIN_CALL_INTERVAL)
    }

    pub fn with_interval(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self { clock, interval }
    }

    /// Sleeps for whatever is left of the interval since `last_call` and
    /// returns the time after the wait, which becomes the next `last_call`.
    ///
    /// A `last_call` in the future (clock moved backwards) counts as zero
    /// elapsed time, so the full interval is waited.
    pub fn wait_if_needed(&self, last_call: Option<DateTime<Utc>>) -> DateTime<Utc> {
        if let Some(last_call) = last_call {
            let elapsed = (self.clock.now() - last_call)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if let Some(remaining) = self.interval.checked_sub(elapsed) {
                if !remaining.is_zero() {
                    log::debug!(
                        "Rate limiter sleeping {:.2}s before next hosted call",
                        remaining.as_secs_f64()
                    );
                    self.clock.sleep(remaining);
                }
            }
        }
        self.clock.now()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn first_call_does_not_wait() {
        let clock = Arc::new(ManualClock::starting_at(start()));
        let limiter = RateLimiter::new(clock.clone());

        let stamp = limiter.wait_if_needed(None);

        assert_eq!(stamp, start());
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn waits_for_remainder_of_interval() {
        let clock = Arc::new(ManualClock::starting_at(start()));
        let limiter = RateLimiter::new(clock.clone());
        clock.advance(Duration::from_secs(2));

        let stamp = limiter.wait_if_needed(Some(start()));

        assert_eq!(clock.sleeps(), vec![Duration::from_secs(4)]);
        assert_eq!(stamp, start() + chrono::Duration::seconds(6));
    }

    #[test]
    fn no_wait_when_interval_already_elapsed() {
        let clock = Arc::new(ManualClock::starting_at(start()));
        let limiter = RateLimiter::new(clock.clone());
        clock.advance(Duration::from_secs(30));

        limiter.wait_if_needed(Some(start()));

        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn future_timestamp_waits_full_interval() {
        let clock = Arc::new(ManualClock::starting_at(start()));
        let limiter = RateLimiter::new(clock.clone());

        limiter.wait_if_needed(Some(start() + chrono::Duration::seconds(60)));

        assert_eq!(clock.sleeps(), vec![MIN_CALL_INTERVAL]);
    }

    #[test]
    fn back_to_back_calls_are_spaced_by_interval() {
        let clock = Arc::new(ManualClock::starting_at(start()));
        let limiter = RateLimiter::new(clock.clone());
        let calls = 5;

        let mut last_call = None;
        let mut call_starts = Vec::new();
        for _ in 0..calls {
            let stamp = limiter.wait_if_needed(last_call);
            call_starts.push(clock.now());
            last_call = Some(stamp);
        }

        let span = *call_starts.last().unwrap() - call_starts[0];
        assert!(span >= chrono::Duration::seconds(6 * (calls - 1)));
    }
}
