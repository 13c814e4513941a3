//! Injectable time source.
//!
//! Health state is a pure function of heartbeat age, so every component
//! that reads "now" takes it from a [`Clock`]. Production wires in
//! [`SystemClock`]; tests drive a manual clock to step through the
//! healthy/degraded/expired windows without sleeping.

use chrono::{DateTime, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests.
#[cfg(test)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    /// Starts at an arbitrary fixed instant.
    pub fn fixed() -> Self {
        Self::new(
            DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock();
        *now += duration;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(chrono::Duration::seconds(secs));
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::fixed();
        let start = clock.now();
        clock.advance_secs(90);
        assert_eq!((clock.now() - start).num_seconds(), 90);
    }
}
