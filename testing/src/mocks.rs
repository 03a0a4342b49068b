//! Deterministic clocks.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Duration, Utc};
use gather_core::environment::Clock;
use std::sync::{Arc, RwLock};

/// Fixed clock for deterministic tests
///
/// Always returns the same time, making tests reproducible.
///
/// # Example
///
/// ```
/// use gather_testing::mocks::FixedClock;
/// use gather_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }

    /// The fixed instant, without going through the trait
    #[must_use]
    pub const fn now_value(&self) -> DateTime<Utc> {
        self.time
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Create a default fixed clock for tests (2030-01-01 00:00:00 UTC)
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(
        DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .map(|time| time.with_timezone(&Utc))
            .unwrap_or_default(),
    )
}

/// Clock that only moves when told to. Clones share the same instant.
///
/// # Example
///
/// ```
/// use gather_testing::mocks::ManualClock;
/// use gather_core::environment::Clock;
/// use chrono::{Duration, Utc};
///
/// let clock = ManualClock::new(Utc::now());
/// let before = clock.now();
/// clock.advance(Duration::minutes(5));
/// assert_eq!(clock.now() - before, Duration::minutes(5));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    time: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock stopped at `time`
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(RwLock::new(time)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut time = self.time.write().unwrap();
        *time += by;
    }

    /// Jump to an instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.time.write().unwrap() = to;
    }

    /// Current instant, without going through the trait
    #[must_use]
    pub fn now_value(&self) -> DateTime<Utc> {
        *self.time.read().unwrap()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now_value()
    }
}
