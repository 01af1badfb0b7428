//! Reconnect backoff schedule.
//!
//! Exponential doubling with jitter, plus a mandatory stop: the first
//! delay that would carry total waiting past the stop point is clamped
//! so an attempt happens exactly there. The stop keeps a consumer from
//! sleeping through the tail of its subscribe deadline.

use std::time::Duration;

use rand::Rng;

/// Backoff schedule parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First delay.
    pub initial: Duration,
    /// Delay ceiling.
    pub max: Duration,
    /// Total-waited point at which one attempt is forced.
    pub mandatory_stop: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(60),
            mandatory_stop: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff with jitter and a mandatory stop.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
    total: Duration,
    mandatory_stop_made: bool,
}

impl Backoff {
    /// Creates a fresh schedule.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            next: config.initial,
            total: Duration::ZERO,
            mandatory_stop_made: false,
        }
    }

    /// Returns the next delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let mut delay = self.next.min(self.config.max);

        // Clamp the first delay that would sail past the mandatory stop.
        if !self.mandatory_stop_made {
            let stop = self.config.mandatory_stop;
            if self.total + delay > stop {
                delay = stop.saturating_sub(self.total).max(self.config.initial);
                self.mandatory_stop_made = true;
            }
        }

        self.total += delay;
        self.next = (self.next * 2).min(self.config.max);

        jittered(delay)
    }

    /// Resets the schedule after a successful attempt.
    pub fn reset(&mut self) {
        self.next = self.config.initial;
        self.total = Duration::ZERO;
        self.mandatory_stop_made = false;
    }
}

/// Applies +/-20% jitter so reconnecting consumers spread out.
fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            mandatory_stop: Duration::from_secs(2),
        }
    }

    /// Jitter is +/-20%, so a delay of `d` lands in [0.8d, 1.2d].
    fn assert_near(actual: Duration, base: Duration) {
        assert!(
            actual >= base.mul_f64(0.8) && actual <= base.mul_f64(1.2),
            "{actual:?} not within 20% of {base:?}"
        );
    }

    #[test]
    fn test_doubles_until_max() {
        let mut backoff = Backoff::new(BackoffConfig {
            mandatory_stop: Duration::from_secs(3600),
            ..config()
        });

        assert_near(backoff.next_delay(), Duration::from_millis(100));
        assert_near(backoff.next_delay(), Duration::from_millis(200));
        assert_near(backoff.next_delay(), Duration::from_millis(400));
    }

    #[test]
    fn test_capped_at_max() {
        let mut backoff = Backoff::new(BackoffConfig {
            mandatory_stop: Duration::from_secs(3600),
            ..config()
        });

        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_near(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_mandatory_stop_clamps_once() {
        let mut backoff = Backoff::new(config());

        // 100 + 200 + 400 + 800 = 1500ms; next raw delay (1600ms) would
        // pass the 2s stop, so it is clamped to 500ms.
        for _ in 0..4 {
            backoff.next_delay();
        }
        assert_near(backoff.next_delay(), Duration::from_millis(500));

        // After the stop the schedule keeps doubling from where it was.
        assert_near(backoff.next_delay(), Duration::from_millis(3200));
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(config());
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_near(backoff.next_delay(), Duration::from_millis(100));
    }
}
