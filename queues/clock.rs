use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Source of wall-clock time for a queue. Delayed-set scores, rate-limit
/// windows and every timestamp written into a job hash come from here, so
/// tests can freeze time instead of sleeping.
#[derive(Clone, Debug)]
pub enum Clock {
    Wall,
    Frozen(Arc<AtomicI64>),
}

impl Clock {
    /// A clock that only moves when [Clock::advance] or [Clock::set] is
    /// called.
    pub fn frozen(start: DateTime<Utc>) -> Clock {
        Clock::Frozen(Arc::new(AtomicI64::new(start.timestamp_millis())))
    }

    pub fn now_ms(&self) -> i64 {
        match self {
            Clock::Wall => Utc::now().timestamp_millis(),
            Clock::Frozen(ms) => ms.load(Ordering::SeqCst),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis(self.now_ms())
    }

    /// Move a frozen clock forward. Does nothing on a wall clock.
    pub fn advance(&self, by: Duration) {
        if let Clock::Frozen(ms) = self {
            ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
        }
    }

    /// Set a frozen clock to an absolute time. Does nothing on a wall clock.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Clock::Frozen(ms) = self {
            ms.store(to.timestamp_millis(), Ordering::SeqCst);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::Wall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_clock() {
        let start = Utc.timestamp_millis(1_600_000_000_000);
        let clock = Clock::frozen(start);
        assert_eq!(clock.now_ms(), 1_600_000_000_000);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_ms(), 1_600_000_000_250);
        assert_eq!(clock.now(), start + chrono::Duration::milliseconds(250));

        clock.set(start);
        assert_eq!(clock.now_ms(), 1_600_000_000_000);
    }

    #[test]
    fn wall_clock_advance_is_noop() {
        let clock = Clock::Wall;
        let before = clock.now_ms();
        clock.advance(Duration::from_secs(3600));
        // Within a second of the real time, not an hour ahead.
        assert!(clock.now_ms() - before < 1000);
    }
}
