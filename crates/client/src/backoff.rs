//! Reconnect policy with exponential back-off.
//!
//! Pure bookkeeping, no I/O: the connection controller asks for the
//! next delay, sleeps, and reports back by calling [`reset`] on a
//! successful (re)connection.
//!
//! [`reset`]: ReconnectStrategy::reset

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Exponential back-off state for reconnect attempts.
///
/// The delay is capped at `max_delay`; the attempt count is not capped
/// at all — while reconnection is enabled the controller retries
/// indefinitely.
#[derive(Debug)]
pub struct ReconnectStrategy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt_count: AtomicU32,
    current_delay: Mutex<Duration>,
}

impl ReconnectStrategy {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            attempt_count: AtomicU32::new(0),
            current_delay: Mutex::new(initial_delay),
        }
    }

    /// Return the delay for the next attempt and advance the schedule:
    /// `current = min(current * multiplier, max)`.
    pub fn next_delay(&self) -> Duration {
        let mut current = self.current_delay.lock();
        let delay = *current;
        let next_ms = (current.as_millis() as f64 * self.multiplier)
            .min(self.max_delay.as_millis() as f64);
        *current = Duration::from_millis(next_ms as u64);
        self.attempt_count.fetch_add(1, Ordering::Relaxed);
        delay
    }

    /// Back to square one — called after every successful connection.
    pub fn reset(&self) {
        let mut current = self.current_delay.lock();
        *current = self.initial_delay;
        self.attempt_count.store(0, Ordering::Relaxed);
    }

    /// Number of `next_delay` calls since the last reset.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::Relaxed)
    }

    /// The delay the next `next_delay` call would return.
    pub fn current_delay(&self) -> Duration {
        *self.current_delay.lock()
    }
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(5),
            Duration::from_secs(300),
            2.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_values() {
        let s = ReconnectStrategy::default();
        assert_eq!(s.current_delay(), Duration::from_secs(5));
        assert_eq!(s.attempt_count(), 0);
    }

    #[test]
    fn nth_delay_follows_the_law() {
        // n-th delay = min(initial * multiplier^n, max)
        let s = ReconnectStrategy::new(
            Duration::from_millis(100),
            Duration::from_millis(2_000),
            2.0,
        );
        let expected_ms = [100u64, 200, 400, 800, 1_600, 2_000, 2_000];
        for (n, exp) in expected_ms.iter().enumerate() {
            let d = s.next_delay();
            assert_eq!(d, Duration::from_millis(*exp), "attempt {n}");
        }
        assert_eq!(s.attempt_count(), 7);
    }

    #[test]
    fn delay_capped_at_max() {
        let s = ReconnectStrategy::new(
            Duration::from_secs(10),
            Duration::from_secs(30),
            10.0,
        );
        for _ in 0..5 {
            s.next_delay();
        }
        assert_eq!(s.current_delay(), Duration::from_secs(30));
    }

    #[test]
    fn reset_restores_initial_delay() {
        let s = ReconnectStrategy::new(
            Duration::from_millis(100),
            Duration::from_millis(10_000),
            2.0,
        );
        s.next_delay();
        s.next_delay();
        s.reset();
        assert_eq!(s.attempt_count(), 0);
        assert_eq!(s.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn concurrent_next_delay_is_safe() {
        use std::sync::Arc;

        let s = Arc::new(ReconnectStrategy::new(
            Duration::from_millis(1),
            Duration::from_millis(1_000),
            2.0,
        ));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = s.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    s.next_delay();
                    let _ = s.attempt_count();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.attempt_count(), 800);
        assert_eq!(s.current_delay(), Duration::from_millis(1_000));
    }
}
