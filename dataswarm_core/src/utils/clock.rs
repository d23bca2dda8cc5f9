use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Source of monotonic time for timer-gated actions (catalog updates, reconnect delays,
/// status reports), so they can be driven deterministically in tests.
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// Fires at most once per `interval`; the first check fires immediately.
#[derive(Debug, Clone)]
pub struct Interval {
    interval: Duration,
    last: Option<Instant>,
}

impl Interval {
    pub fn new(interval: Duration) -> Self {
        Interval {
            interval,
            last: None,
        }
    }

    pub fn check(&mut self, now: Instant) -> bool {
        let due = match self.last {
            Some(last) => now.duration_since(last) >= self.interval,
            None => true,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_shared() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let start = clock.now();
        other.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));
    }

    #[test]
    fn interval_gating() {
        let clock = ManualClock::new();
        let mut every = Interval::new(Duration::from_secs(60));
        assert!(every.check(clock.now()));
        assert!(!every.check(clock.now()));
        clock.advance(Duration::from_secs(59));
        assert!(!every.check(clock.now()));
        clock.advance(Duration::from_secs(1));
        assert!(every.check(clock.now()));
    }
}
