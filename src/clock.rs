use chrono::{Local, NaiveDateTime, TimeDelta};
use std::time::Duration;

/// Source of local wall-clock time for the scheduler and capture routine.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;

    fn sleep(&self, duration: Duration);
}

/// Real local time and `std::thread::sleep`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// `at + duration`, saturating instead of overflowing.
pub fn offset(at: NaiveDateTime, duration: Duration) -> NaiveDateTime {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(NaiveDateTime::MAX)
}
