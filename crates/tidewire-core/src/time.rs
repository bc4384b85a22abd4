//! Millisecond service time.
//!
//! The protocol timestamps everything with a `u32` millisecond counter that
//! is allowed to wrap. Comparisons treat any difference larger than one day
//! as "negative", so two times are only comparable if they are less than a
//! day apart.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Instant,
};

/// Differences at or above this many milliseconds are treated as wrapped.
pub const TIME_OVERFLOW: u32 = 24 * 60 * 60 * 1000;

/// Returns true if `a` happened before `b`.
#[inline]
pub fn time_less(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) >= TIME_OVERFLOW
}

/// Returns true if `a` happened after `b`.
#[inline]
pub fn time_greater(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) >= TIME_OVERFLOW
}

/// Returns true if `a` happened at or before `b`.
#[inline]
pub fn time_less_equal(a: u32, b: u32) -> bool {
    !time_greater(a, b)
}

/// Returns true if `a` happened at or after `b`.
#[inline]
pub fn time_greater_equal(a: u32, b: u32) -> bool {
    !time_less(a, b)
}

/// Absolute distance between two service times.
#[inline]
pub fn time_difference(a: u32, b: u32) -> u32 {
    if a.wrapping_sub(b) >= TIME_OVERFLOW {
        b.wrapping_sub(a)
    } else {
        a.wrapping_sub(b)
    }
}

/// Abstraction over a millisecond time source to improve testability.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current service time in milliseconds.
    fn now_ms(&self) -> u32;
}

/// Monotonic clock counting milliseconds since it was created.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Starts a clock at zero.
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> u32 {
        // Truncation is the intended wrap.
        self.origin.elapsed().as_millis() as u32
    }
}

/// Clock advanced by hand, for simulations and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: u32) -> Self {
        Self { now: AtomicU32::new(start) }
    }

    /// Moves the clock forward by `ms`, wrapping at `u32::MAX`.
    pub fn advance(&self, ms: u32) -> u32 {
        self.now.fetch_add(ms, Ordering::Relaxed).wrapping_add(ms)
    }

    /// Sets the clock to an absolute value.
    pub fn set(&self, ms: u32) {
        self.now.store(ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::Relaxed)
    }
}
