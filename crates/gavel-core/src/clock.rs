// Wall-clock source for countdown deadlines.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Source of the current time. Every countdown deadline is computed from
/// this, never from `Utc::now()` directly.
pub trait Now: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<F> Now for F
where
    F: Fn() -> DateTime<Utc> + Send + Sync,
{
    fn now(&self) -> DateTime<Utc> {
        (self)()
    }
}

impl Now for DateTime<Utc> {
    fn now(&self) -> DateTime<Utc> {
        *self
    }
}

/// The production clock.
pub fn system_clock() -> Arc<dyn Now> {
    Arc::new(Utc::now)
}

/// A clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    instant: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            instant: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut instant = self.instant.lock().unwrap_or_else(|e| e.into_inner());
        *instant += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.instant.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Now for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.instant.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_instant_is_a_clock() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(t.now(), t);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(t);
        let other = clock.clone();

        clock.advance(Duration::seconds(15));
        assert_eq!(other.now(), t + Duration::seconds(15));

        other.set(t);
        assert_eq!(clock.now(), t);
    }
}
