//! Time APIs for the discovery core.
//!
//! These are not meant to be general-purpose: the discovery tracker deals in
//! millisecond-scale back-off windows and sweep cadences, so the types here
//! have millisecond resolution. A [`Clock`] trait abstracts over the time
//! source so that the tracker and the GATT read cache can be driven by a
//! simulated clock in tests.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant as StdInstant;

/// A duration with millisecond resolution.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(u64);

impl Duration {
    /// The zero-length duration.
    pub const ZERO: Self = Duration(0);

    /// Creates a [`Duration`] from a number of milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Duration(millis)
    }

    /// Creates a [`Duration`] representing a number of seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs * 1_000)
    }

    /// Returns the number of whole seconds that fit in `self`.
    pub fn whole_secs(&self) -> u64 {
        self.0 / 1_000
    }

    /// Returns the number of milliseconds represented by `self`.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns the smaller of `self` and `other`.
    pub fn min(self, other: Self) -> Self {
        if self <= other {
            self
        } else {
            other
        }
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000 {
            let (secs, subsec_millis) = (self.0 / 1_000, self.0 % 1_000);
            if subsec_millis == 0 {
                write!(f, "{}s", secs)
            } else {
                write!(f, "{}.{:03}s", secs, subsec_millis)
            }
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// A point in time, relative to an epoch chosen by the [`Clock`] that
/// produced it.
///
/// `Instant`s created by different [`Clock`] instances are not compatible and
/// mixing them in operations gives unspecified results. [`Duration`]s are
/// clock-independent and can be mixed freely.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64);

impl Instant {
    /// Creates an `Instant` from raw milliseconds since the producing clock's
    /// epoch.
    ///
    /// This should only be called from a [`Clock`] implementation.
    pub const fn from_raw_millis(millis: u64) -> Self {
        Instant(millis)
    }

    /// Returns the raw value from which this `Instant` was created.
    pub fn raw_millis(&self) -> u64 {
        self.0
    }

    /// Calculates the time that has passed between `earlier` and `self`.
    ///
    /// Returns [`Duration::ZERO`] when `earlier` is actually later than
    /// `self`, which can happen when results from a concurrent fetch are
    /// folded back in after the clock has moved.
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }
}

/// [`Instant`]s can be subtracted, computing the [`Duration`] between them.
impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

/// A [`Duration`] can be added to an [`Instant`], moving it forwards in time.
impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.saturating_add(d.as_millis()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

/// A [`Duration`] can be subtracted from an [`Instant`], moving it backwards
/// in time. Saturates at the clock's epoch.
impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, d: Duration) -> Self {
        Instant(self.0.saturating_sub(d.as_millis()))
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, d: Duration) {
        *self = *self - d;
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// Trait for time providers.
///
/// The [`Instant`]s returned by `now` must never move backwards in time.
/// This trait can also be implemented by a mock clock for testing.
pub trait Clock: Send + Sync {
    /// Obtains the current time as an [`Instant`].
    fn now(&self) -> Instant;
}

/// A [`Clock`] backed by the operating system's monotonic clock.
///
/// The epoch is offset into the past far enough that back-off bookkeeping can
/// place "last read" instants a full back-off cap before the first `now`.
pub struct SystemClock {
    start: StdInstant,
}

/// Milliseconds between the reported epoch and the clock's creation.
const EPOCH_OFFSET_MILLIS: u64 = 60 * 60 * 1_000;

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: StdInstant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let elapsed = self.start.elapsed().as_millis() as u64;
        Instant::from_raw_millis(EPOCH_OFFSET_MILLIS + elapsed)
    }
}

/// A manually advanced [`Clock`] for deterministic tests and simulations.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<AtomicU64>,
}

impl FakeClock {
    /// Creates a fake clock. The initial instant is offset from the epoch the
    /// same way [`SystemClock`]'s first reading is.
    pub fn new() -> Self {
        Self {
            now: Arc::new(AtomicU64::new(EPOCH_OFFSET_MILLIS)),
        }
    }

    /// Moves the clock forwards by `d`.
    pub fn advance(&self, d: Duration) {
        self.now.fetch_add(d.as_millis(), Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        Instant::from_raw_millis(self.now.load(Ordering::SeqCst))
    }
}
