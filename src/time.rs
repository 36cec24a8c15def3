//! Wall-clock time types used by the address tables.
//!
//! All bookkeeping in this crate is second-granular: advertised
//! timestamps, staleness arithmetic and the persistence format all
//! deal in whole seconds since the Unix epoch.
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic;
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time, in whole seconds since Epoch.
///
/// This clock is monotonic.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default, Hash)]
pub struct LocalTime {
    secs: u64,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.secs)
    }
}

impl LocalTime {
    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).as_secs();
        let last = LAST.load(atomic::Ordering::SeqCst);

        // If the system clock went backwards, return the last recorded
        // time instead.
        if now < last {
            Self::from_secs(last)
        } else {
            LAST.store(now, atomic::Ordering::SeqCst);
            LocalTime::from_secs(now)
        }
    }

    /// Construct a local time from whole seconds since Epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self { secs }
    }

    /// Return the whole seconds since Epoch.
    pub const fn as_secs(&self) -> u64 {
        self.secs
    }

    /// Elapse time.
    ///
    /// Adds the given duration to the time.
    pub fn elapse(&mut self, duration: LocalDuration) {
        self.secs += duration.as_secs()
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let secs = system
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self { secs }
    }
}

/// Subtract two local times. Yields a duration; saturates at zero when
/// the subtrahend lies in the future.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.secs.saturating_sub(other.secs))
    }
}

/// Subtract a duration from a local time. Saturates at the Epoch.
impl std::ops::Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            secs: self.secs.saturating_sub(other.0),
        }
    }
}

/// Add a duration to a local time. Yields a local time.
impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            secs: self.secs + other.0,
        }
    }
}

/// Time duration as measured locally, in whole seconds.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u64);

impl LocalDuration {
    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Create a new duration from whole minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Create a new duration from whole days.
    pub const fn from_days(days: u64) -> Self {
        Self::from_mins(days * 60 * 24)
    }

    /// Return the number of seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 60 {
            write!(f, "{} second(s)", self.0)
        } else if self.0 < 60 * 60 {
            write!(f, "{} minute(s)", self.0 / 60)
        } else {
            write!(f, "{} hour(s)", self.0 / 60 / 60)
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0 + other.0)
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u64) -> LocalDuration {
        LocalDuration(self.0 * other)
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_secs(other.0)
    }
}

/// Clock that tells the time.
pub trait Clock: Clone {
    /// Tell the time in local time.
    fn local_time(&self) -> LocalTime;
}

impl Clock for LocalTime {
    fn local_time(&self) -> LocalTime {
        *self
    }
}

/// Clock with interior mutability, useful to drive time in tests.
#[derive(Debug, Clone)]
pub struct RefClock {
    inner: Rc<RefCell<LocalTime>>,
}

impl RefClock {
    /// Elapse time.
    pub fn elapse(&self, duration: LocalDuration) {
        self.inner.borrow_mut().elapse(duration)
    }

    /// Set the time to the given value.
    pub fn set(&self, time: LocalTime) {
        *self.inner.borrow_mut() = time;
    }
}

impl From<LocalTime> for RefClock {
    fn from(other: LocalTime) -> Self {
        Self {
            inner: Rc::new(RefCell::new(other)),
        }
    }
}

impl Clock for RefClock {
    fn local_time(&self) -> LocalTime {
        *self.inner.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_display() {
        assert_eq!(LocalDuration::from_secs(42).to_string(), "42 second(s)");
        assert_eq!(LocalDuration::from_mins(90).to_string(), "90 minute(s)");
        assert_eq!(LocalDuration::from_days(1).to_string(), "24 hour(s)");
    }

    #[test]
    fn test_saturating_arithmetic() {
        let epoch = LocalTime::from_secs(0);
        let later = LocalTime::from_secs(60);

        assert_eq!(epoch - later, LocalDuration::from_secs(0));
        assert_eq!(later - epoch, LocalDuration::from_mins(1));
        assert_eq!(epoch - LocalDuration::from_days(5), epoch);
        assert_eq!(later + LocalDuration::from_secs(6), LocalTime::from_secs(66));
    }

    #[test]
    fn test_ref_clock() {
        let clock = RefClock::from(LocalTime::from_secs(100));

        clock.elapse(LocalDuration::from_secs(23));
        assert_eq!(clock.local_time(), LocalTime::from_secs(123));
    }
}
