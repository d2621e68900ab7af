//! Time source for activity tracking.

use chrono::{DateTime, Utc};

/// Wall clock used to stamp and age process records.
///
/// Records are compared across instances, so this has to be wall-clock time
/// rather than a monotonic instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
