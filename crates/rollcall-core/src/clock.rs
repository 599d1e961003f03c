use chrono::{Local, NaiveDate, NaiveDateTime};

/// Source of the local wall-clock time used to stamp attendance.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    /// The local calendar date.
    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// Local system time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock pinned to one instant.
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}
