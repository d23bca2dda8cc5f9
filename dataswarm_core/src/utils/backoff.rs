use std::time::{Duration, Instant};

/// Reconnect delay that starts at `min`, doubles after every failure up to `max`,
/// and resets after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = if max < min { min } else { max };
        Backoff {
            min,
            max,
            current: min,
            next_attempt: None,
        }
    }

    /// Whether an attempt may be made at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |t| now >= t)
    }

    /// Record a failed attempt at `now`; returns the delay before the next one.
    pub fn failed(&mut self, now: Instant) -> Duration {
        let delay = self.current;
        self.next_attempt = Some(now + delay);
        self.current = ::std::cmp::min(self.current * 2, self.max);
        delay
    }

    pub fn succeeded(&mut self) {
        self.current = self.min;
        self.next_attempt = None;
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{Clock, ManualClock};

    #[test]
    fn doubles_and_caps() {
        let clock = ManualClock::new();
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert!(b.ready(clock.now()));
        let delays: Vec<u64> = (0..5).map(|_| b.failed(clock.now()).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert!(!b.ready(clock.now()));
        clock.advance(Duration::from_secs(5));
        assert!(b.ready(clock.now()));
        b.succeeded();
        assert_eq!(b.failed(clock.now()), Duration::from_secs(1));
    }
}
