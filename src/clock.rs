//! Monotonic time source used by the timer.
//!
//! The [`Now`] trait abstracts "read the current moment in time" in the
//! crate's internal unit: hundred-nanosecond ticks, the same unit .NET's
//! `DateTime`/`TimeSpan` use, and the unit this timer's deadline math is
//! modelled on. [`SystemClock`] is the default, backed by [`quanta`]'s
//! calibrated monotonic clock. [`MockClock`] is a deterministic,
//! manually-advanced clock for tests: every end-to-end scenario in this
//! crate's test suite drives the wheel through a `MockClock` rather than
//! sleeping in real wall-clock time.
//!
//! [`Now`]: trait.Now.html
//! [`SystemClock`]: struct.SystemClock.html
//! [`MockClock`]: struct.MockClock.html

use std::fmt::Debug;
use std::sync::Arc;

/// Number of hundred-nanosecond units per millisecond.
pub const TICKS_PER_MS: u64 = 10_000;

/// A source of monotonically non-decreasing readings, in hundred-nanosecond
/// units since some unspecified origin.
///
/// Implementations must never return a value smaller than a previously
/// returned value.
pub trait Now: Debug + Send + Sync {
    /// Returns the current reading.
    fn now(&self) -> u64;
}

/// The production [`Now`] implementation, backed by [`quanta`]'s calibrated
/// monotonic clock.
///
/// [`Now`]: trait.Now.html
#[derive(Debug, Clone)]
pub struct SystemClock {
    clock: quanta::Clock,
}

impl SystemClock {
    /// Creates a new clock reading from the OS's monotonic clock source.
    pub fn new() -> Self {
        Self {
            clock: quanta::Clock::new(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Now for SystemClock {
    fn now(&self) -> u64 {
        // `quanta`'s raw reading is calibrated to nanoseconds; rescale down
        // to our hundred-nanosecond unit.
        self.clock.now() / 100
    }
}

/// A deterministic [`Now`] implementation for tests.
///
/// Cloning a [`MockClock`] shares the same underlying counter; advance it
/// with [`advance`] from the test thread while the worker thread observes
/// the new reading on its next call to [`Now::now`].
///
/// [`MockClock`]: struct.MockClock.html
/// [`advance`]: #method.advance
/// [`Now::now`]: trait.Now.html#method.now
#[derive(Debug, Clone)]
pub struct MockClock {
    ticks: Arc<std::sync::atomic::AtomicU64>,
}

impl MockClock {
    /// Creates a new mock clock starting at reading `0`.
    pub fn new() -> Self {
        Self {
            ticks: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Advances the clock by `ticks` hundred-nanosecond units.
    pub fn advance(&self, ticks: u64) {
        self.ticks
            .fetch_add(ticks, std::sync::atomic::Ordering::SeqCst);
    }

    /// Advances the clock by the given number of milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.advance(ms * TICKS_PER_MS);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Now for MockClock {
    fn now(&self) -> u64 {
        self.ticks.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Converts a count of hundred-nanosecond ticks to milliseconds, rounding
/// **up** so a task is never fired before its nominal deadline.
pub fn ticks_to_ms_ceil(ticks: u64) -> u64 {
    (ticks + TICKS_PER_MS - 1) / TICKS_PER_MS
}

/// Converts a [`std::time::Duration`] to a count of hundred-nanosecond
/// ticks, rounding up.
///
/// [`std::time::Duration`]: https://doc.rust-lang.org/std/time/struct.Duration.html
pub fn duration_to_ticks_ceil(d: std::time::Duration) -> u64 {
    let nanos = d.as_secs().saturating_mul(1_000_000_000).saturating_add(u64::from(d.subsec_nanos()));
    (nanos + 99) / 100
}

/// Converts a [`std::time::Duration`] to a count of whole milliseconds,
/// rounding up. Deadlines are pinned to a millisecond boundary at
/// submission, matching the wheel's own resolution.
///
/// [`std::time::Duration`]: https://doc.rust-lang.org/std/time/struct.Duration.html
pub fn duration_to_ms_ceil(d: std::time::Duration) -> u64 {
    let nanos = d.as_secs().saturating_mul(1_000_000_000).saturating_add(u64::from(d.subsec_nanos()));
    (nanos + 999_999) / 1_000_000
}
