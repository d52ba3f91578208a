//! Time primitives shared by the brewlink crates
//!
//! Token expiry is tracked in whole seconds since the Unix epoch, which is
//! the resolution of the `exp` claim carried by the tokens themselves. The
//! [`Clock`] trait lets every time-sensitive decision be driven by a clock
//! that tests can move by hand.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Unix time
///
/// Seconds elapsed since 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
#[repr(transparent)]
pub struct UnixTime(pub u64);

/// A span of time measured in whole seconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
#[repr(transparent)]
pub struct DurationSecs(pub u64);

impl From<SystemTime> for UnixTime {
    #[inline]
    fn from(t: SystemTime) -> Self {
        // A system clock set before the epoch reads as the epoch itself.
        let secs = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        UnixTime(secs)
    }
}

impl UnixTime {
    /// Saturating subtraction of a duration
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: DurationSecs) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// The span from `earlier` until this time, or zero if `earlier` is later
    #[inline]
    #[must_use]
    pub const fn duration_since(self, earlier: UnixTime) -> DurationSecs {
        DurationSecs(self.0.saturating_sub(earlier.0))
    }
}

impl ops::Add<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn add(self, rhs: DurationSecs) -> Self::Output {
        UnixTime(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn sub(self, rhs: DurationSecs) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl ops::Sub for UnixTime {
    type Output = DurationSecs;

    #[inline]
    fn sub(self, rhs: UnixTime) -> Self::Output {
        self.duration_since(rhs)
    }
}

impl From<DurationSecs> for Duration {
    #[inline]
    fn from(d: DurationSecs) -> Self {
        Duration::from_secs(d.0)
    }
}

impl From<Duration> for DurationSecs {
    /// Truncates to whole seconds
    #[inline]
    fn from(d: Duration) -> Self {
        DurationSecs(d.as_secs())
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixTime;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> UnixTime {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now(&self) -> UnixTime {
        (**self).now()
    }
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime::from(SystemTime::now())
    }
}

/// A clock that only moves when told to
///
/// Clones share the same time, so a test can hold one handle while the code
/// under test reads another.
#[derive(Clone, Debug, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    /// Creates a new manual clock reading `time`
    pub fn new(time: UnixTime) -> Self {
        Self(Arc::new(AtomicU64::new(time.0)))
    }

    /// Sets the current time to `time`
    pub fn set(&self, time: UnixTime) {
        self.0.store(time.0, Ordering::SeqCst);
    }

    /// Moves the current time forward by `by`
    pub fn advance(&self, by: DurationSecs) {
        self.0.fetch_add(by.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime(self.0.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtraction_saturates_at_zero() {
        let early = UnixTime(100);
        let late = UnixTime(160);

        assert_eq!(late - early, DurationSecs(60));
        assert_eq!(early - late, DurationSecs(0));
        assert_eq!(early - DurationSecs(500), UnixTime(0));
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(UnixTime(1_000));
        let observer = clock.clone();

        clock.advance(DurationSecs(3_550));

        assert_eq!(observer.now(), UnixTime(4_550));

        observer.set(UnixTime(7));
        assert_eq!(clock.now(), UnixTime(7));
    }

    #[test]
    fn system_clock_is_after_epoch() {
        assert!(System.now() > UnixTime(1_600_000_000));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn unix_time_serializes_as_plain_seconds() {
        let json = serde_json::to_string(&UnixTime(1_700_000_000)).unwrap();
        assert_eq!(json, "1700000000");

        let back: UnixTime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, UnixTime(1_700_000_000));
    }
}
