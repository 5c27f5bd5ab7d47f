/*!
 # Wall-clock source

 The schedule runs on local minute-of-day and weekday. Until the device has
 learnt the real time (NTP on the board) readings are flagged as not
 synchronized and the schedule keeps every output off.
*/

use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Weekday};
use parking_lot::Mutex;
use tracing::trace;

use crate::schedule::MinuteOfDay;

/// Unix time below which the system clock is assumed to be unset.
///
/// A board without NTP boots at the epoch; anything before late 2023 cannot
/// be a real reading.
pub const SYNC_THRESHOLD_UNIX: i64 = 1_700_000_000;

/// One sample of the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    pub minute: MinuteOfDay,
    pub weekday: Weekday,
    pub synchronized: bool,
}

impl ClockReading {
    /// Reading taken from a calendar time
    pub fn from_datetime<Tz: TimeZone>(time: &DateTime<Tz>) -> Self {
        let minute = MinuteOfDay::from_hm(time.hour() as u8, time.minute() as u8)
            .unwrap_or(MinuteOfDay::MIDNIGHT);
        Self {
            minute,
            weekday: time.weekday(),
            synchronized: time.timestamp() >= SYNC_THRESHOLD_UNIX,
        }
    }
}

/// Anything that can tell the controller what time it is
pub trait ClockSource {
    fn now(&self) -> ClockReading;
}

/// Host clock in the local timezone
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> ClockReading {
        let reading = ClockReading::from_datetime(&Local::now());
        trace!(
            "Clock reading {} {:?} synchronized={}",
            reading.minute,
            reading.weekday,
            reading.synchronized
        );
        reading
    }
}

/// Clock set by hand, shared between clones.
///
/// Starts unsynchronized at Monday 00:00.
#[derive(Debug, Clone)]
pub struct ManualClock {
    reading: Arc<Mutex<ClockReading>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(ClockReading {
            minute: MinuteOfDay::MIDNIGHT,
            weekday: Weekday::Mon,
            synchronized: false,
        })
    }
}

impl ManualClock {
    pub fn new(reading: ClockReading) -> Self {
        Self {
            reading: Arc::new(Mutex::new(reading)),
        }
    }

    /// Moves the clock and marks it synchronized
    pub fn set(&self, minute: MinuteOfDay, weekday: Weekday) {
        *self.reading.lock() = ClockReading {
            minute,
            weekday,
            synchronized: true,
        };
    }

    pub fn set_synchronized(&self, synchronized: bool) {
        self.reading.lock().synchronized = synchronized;
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> ClockReading {
        *self.reading.lock()
    }
}
