use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::model::Timestamp;

#[derive(Clone)]
/// The wall clock used for monitor timestamps and grace periods.
///
/// This handle is cheap to clone.
pub struct Clock(Arc<ClockInner>);

enum ClockInner {
    System,
    Manual(Mutex<Timestamp>),
}

impl Clock {
    pub fn system() -> Self {
        Self(Arc::new(ClockInner::System))
    }

    /// A clock which only moves when told to.
    pub fn manual(start: Timestamp) -> Self {
        Self(Arc::new(ClockInner::Manual(Mutex::new(start))))
    }

    pub fn now(&self) -> Timestamp {
        match self.0.as_ref() {
            ClockInner::System => unix_timestamp(),
            ClockInner::Manual(ts) => *ts.lock(),
        }
    }

    /// Moves a manual clock forward. No-op on the system clock.
    pub fn advance(&self, secs: f64) {
        if let ClockInner::Manual(ts) = self.0.as_ref() {
            *ts.lock() += secs;
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

fn unix_timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock() {
        let clock = Clock::system();
        let ts1 = clock.now();
        let ts2 = clock.now();
        assert!(ts1 > 0.0);
        assert!(ts1 <= ts2);

        let clock = Clock::manual(100.0);
        let shared = clock.clone();
        assert_eq!(clock.now(), 100.0);
        shared.advance(30.5);
        assert_eq!(clock.now(), 130.5, "Clones should share the same time.");
    }
}
