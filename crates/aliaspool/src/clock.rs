//! Time source for registry timestamps.

use chrono::{DateTime, Utc};

/// Source of "now" for allocation timestamps.
///
/// The registry reads the clock on every write; tests substitute a manual clock
/// to make staleness deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;


#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(start.to_rfc3339(), "2026-01-01T00:00:00+00:00");
        assert_eq!(clock.now(), start);

        clock.advance(TimeDelta::days(2));
        assert_eq!(clock.now() - start, TimeDelta::days(2));

        clock.rewind(TimeDelta::days(1));
        assert_eq!(clock.now() - start, TimeDelta::days(1));
    }

    #[test]
    fn system_clock_is_recent() {
        let now = SystemClock.now();
        assert!(now.timestamp() > ManualClock::EPOCH_MILLIS / 1000 - 365 * 24 * 3600);
    }
}
