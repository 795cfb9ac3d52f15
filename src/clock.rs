//! Monotonic time source for the background loops.

use std::time::{Duration, Instant};

/// Time as seen by the polling and acquisition loops.
///
/// `now` is measured from an arbitrary origin fixed at construction.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
    fn sleep_until(&self, deadline: Duration);

    fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline);
    }
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep_until(&self, deadline: Duration) {
        let remaining = deadline.saturating_sub(self.now());
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_sleep_until_past_deadline_returns() {
        let clock = SystemClock::new();
        clock.sleep_until(Duration::ZERO);
        assert!(clock.now() < Duration::from_secs(1));
    }

    #[test]
    fn test_simulated_clock_wakes_sleeper_on_advance() {
        let clock = std::sync::Arc::new(sim::SimulatedClock::new());
        let sleeper = {
            let clock = clock.clone();
            std::thread::spawn(move || clock.sleep(Duration::from_secs(2)))
        };
        clock.wait_for_sleep_calls(1);
        assert_eq!(clock.last_deadline(), Some(Duration::from_secs(2)));
        clock.advance(Duration::from_secs(2));
        sleeper.join().unwrap();
        assert_eq!(clock.now(), Duration::from_secs(2));
    }
}
