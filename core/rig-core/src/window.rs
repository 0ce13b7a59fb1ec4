//! Booking time windows and the clock they are checked against.
//!
//! A window is checked every time it is used. Callers never cache the result:
//! a booking can lapse in the middle of a session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

/// Closed interval `[start, end]` during which an identity may drive the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BookingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BookingWindow {
    /// Returns `None` when `start > end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Window covering every representable instant.
    pub fn unbounded() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }
}

/// `window.start <= now <= window.end`.
pub fn authorized(now: DateTime<Utc>, window: &BookingWindow) -> bool {
    window.start <= now && now <= window.end
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used for replaying booking scenarios.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn bounds_are_inclusive() {
        let window = BookingWindow::new(at(10, 0), at(11, 0)).expect("ordered window");
        assert!(authorized(at(10, 0), &window));
        assert!(authorized(at(10, 30), &window));
        assert!(authorized(at(11, 0), &window));
        assert!(!authorized(at(9, 59), &window));
        assert!(!authorized(at(11, 0) + Duration::milliseconds(1), &window));
    }

    #[test]
    fn rejects_inverted_window() {
        assert!(BookingWindow::new(at(11, 0), at(10, 0)).is_none());
        assert!(BookingWindow::new(at(10, 0), at(10, 0)).is_some());
    }

    #[test]
    fn unbounded_window_covers_extremes() {
        let window = BookingWindow::unbounded();
        assert!(authorized(DateTime::<Utc>::MIN_UTC, &window));
        assert!(authorized(DateTime::<Utc>::MAX_UTC, &window));
        assert!(authorized(Utc::now(), &window));
    }

    #[test]
    fn manual_clock_moves_only_when_set() {
        let clock = ManualClock::new(at(10, 30));
        assert_eq!(clock.now(), at(10, 30));
        clock.set(at(11, 5));
        assert_eq!(clock.now(), at(11, 5));
    }
}
