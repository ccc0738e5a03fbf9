use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use rustix::time::{clock_gettime, ClockId};

/// A point in time on the monotonic clock, in nanoseconds
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(i64);

impl Time {
    /// A time that is never reached
    pub const NEVER: Time = Time(i64::MAX);

    /// Create a time from a raw nanosecond count
    pub const fn from_nanos(nanos: i64) -> Time {
        Time(nanos)
    }

    /// Raw nanosecond count
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Whether this is [`Time::NEVER`]
    pub fn is_never(&self) -> bool {
        *self == Self::NEVER
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            f.write_str("Time(never)")
        } else {
            write!(f, "Time({}ns)", self.0)
        }
    }
}

impl Add<i64> for Time {
    type Output = Time;
    fn add(self, nanos: i64) -> Time {
        Time(self.0.saturating_add(nanos))
    }
}

impl Add<Duration> for Time {
    type Output = Time;
    fn add(self, d: Duration) -> Time {
        self + i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
    }
}

impl Sub for Time {
    type Output = i64;
    fn sub(self, other: Time) -> i64 {
        self.0.saturating_sub(other.0)
    }
}

/// Source of monotonic timestamps
pub trait Clock: fmt::Debug + Send + Sync {
    /// Returns the current time
    fn now(&self) -> Time;
}

/// CLOCK_MONOTONIC
#[derive(Debug, Default, Clone, Copy)]
pub struct Monotonic;

impl Clock for Monotonic {
    fn now(&self) -> Time {
        let ts = clock_gettime(ClockId::Monotonic);
        Time(ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64)
    }
}

/// A clock that only moves when told to
///
/// Useful to drive time-dependent state machines deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock starting at `start`
    pub fn new(start: Time) -> Self {
        ManualClock {
            now: AtomicI64::new(start.as_nanos()),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, time: Time) {
        self.now.store(time.as_nanos(), Ordering::SeqCst);
    }

    /// Move forward by `nanos`
    pub fn advance(&self, nanos: i64) {
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        Time(self.now.load(Ordering::SeqCst))
    }
}
