//! Deadlines for suspending operations.
//!
//! A `Deadline` packs four cases into one `u64`:
//!
//! ```text
//!  0x0000_0000_0000_0000          instant
//!  0x0xxx_xxxx_xxxx_xxxx          relative, nanoseconds
//!  0x8xxx_xxxx_xxxx_xxxx          absolute, monotonic nanoseconds
//!  0xFFFF_FFFF_FFFF_FFFF          never
//! ```
//!
//! `start()` anchors a relative deadline to the monotonic clock exactly
//! once; waits that retry after a spurious wake keep the anchored value so
//! the total budget is never re-extended.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

const MAX_UNITS: u64 = u64::MAX >> 1;
const ABSOLUTE_FLAG: u64 = !MAX_UNITS;
const NEVER: u64 = u64::MAX;
const INSTANT: u64 = 0;

/// A point on the monotonic clock, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimePoint(u64);

impl TimePoint {
    pub const fn from_nanos(nanos: u64) -> Self {
        TimePoint(nanos)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn now() -> Self {
        TimePoint(monotonic_nanos())
    }

    pub fn saturating_add(&self, d: Duration) -> Self {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        TimePoint(self.0.saturating_add(nanos))
    }

    /// Zero if `earlier` is later than `self`.
    pub fn saturating_duration_since(&self, earlier: TimePoint) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn monotonic_nanos() -> u64 {
            let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
            unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
            (ts.tv_sec as u64)
                .saturating_mul(1_000_000_000)
                .saturating_add(ts.tv_nsec as u64)
        }
    } else {
        fn monotonic_nanos() -> u64 {
            use std::sync::OnceLock;
            use std::time::Instant;

            static ANCHOR: OnceLock<Instant> = OnceLock::new();
            let anchor = *ANCHOR.get_or_init(Instant::now);
            // Offset by one so that the anchor itself is never zero.
            u64::try_from(anchor.elapsed().as_nanos())
                .unwrap_or(MAX_UNITS)
                .saturating_add(1)
        }
    }
}

/// Relative or absolute timeout with `instant` / `never` sentinels.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Deadline(u64);

impl Deadline {
    /// Largest relative duration that can be represented; longer durations
    /// saturate to it.
    pub const MAX_RELATIVE: Duration = Duration::from_nanos(MAX_UNITS);

    /// Do not wait at all: fail with `AsyncOperationTimedOut` unless the
    /// operation can complete immediately.
    pub const fn instant() -> Self {
        Deadline(INSTANT)
    }

    pub const fn never() -> Self {
        Deadline(NEVER)
    }

    /// Relative deadline. Durations above `MAX_RELATIVE` saturate.
    pub fn relative(d: Duration) -> Self {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Deadline(nanos.min(MAX_UNITS))
    }

    /// Absolute deadline on the monotonic clock.
    pub fn absolute(at: TimePoint) -> Self {
        // MAX_UNITS | flag would alias `never`.
        Deadline(ABSOLUTE_FLAG | at.0.min(MAX_UNITS - 1))
    }

    #[inline]
    pub const fn is_instant(&self) -> bool {
        self.0 == INSTANT
    }

    #[inline]
    pub const fn is_never(&self) -> bool {
        self.0 == NEVER
    }

    /// True for relative deadlines, including `instant`.
    #[inline]
    pub const fn is_relative(&self) -> bool {
        self.0 & ABSOLUTE_FLAG == 0
    }

    #[inline]
    pub const fn is_absolute(&self) -> bool {
        self.0 & ABSOLUTE_FLAG != 0 && self.0 != NEVER
    }

    /// `instant` or `never`: no clock reading is needed to act on it.
    #[inline]
    pub const fn is_trivial(&self) -> bool {
        self.0 == INSTANT || self.0 == NEVER
    }

    /// # Panics
    ///
    /// If the deadline is not relative.
    pub fn relative_duration(&self) -> Duration {
        assert!(self.is_relative(), "relative_duration() on {:?}", self);
        Duration::from_nanos(self.0)
    }

    /// # Panics
    ///
    /// If the deadline is not absolute.
    pub fn absolute_time(&self) -> TimePoint {
        assert!(self.is_absolute(), "absolute_time() on {:?}", self);
        TimePoint(self.0 & MAX_UNITS)
    }

    /// Anchor a relative deadline to now. Absolute deadlines and both
    /// sentinels are returned unchanged. Overflow saturates to the latest
    /// representable absolute time.
    pub fn start(self) -> Self {
        if self.0 & ABSOLUTE_FLAG != 0 || self.is_instant() {
            return self;
        }
        let at = monotonic_nanos().saturating_add(self.0).min(MAX_UNITS - 1);
        Deadline(ABSOLUTE_FLAG | at)
    }

    /// Time left before expiry, `None` for `never`.
    pub fn remaining(&self) -> Option<Duration> {
        if self.is_never() {
            None
        } else if self.is_relative() {
            Some(Duration::from_nanos(self.0))
        } else {
            Some(self.absolute_time().saturating_duration_since(TimePoint::now()))
        }
    }

    pub fn has_expired(&self) -> bool {
        self.remaining().map_or(false, |d| d.is_zero())
    }

    /// Timeout argument for poll(2)/epoll_wait(2): -1 for never, otherwise
    /// milliseconds rounded up so a short wait never becomes a busy poll.
    pub fn poll_timeout_ms(&self) -> i32 {
        match self.remaining() {
            None => -1,
            Some(d) => {
                let ms = d.as_nanos().div_ceil(1_000_000);
                i32::try_from(ms).unwrap_or(i32::MAX)
            }
        }
    }

    /// The earlier of two deadlines. Both must be started or both relative
    /// for the comparison to be meaningful.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.remaining(), other.remaining()) {
            (None, _) => other,
            (_, None) => self,
            (Some(a), Some(b)) => {
                if a <= b {
                    self
                } else {
                    other
                }
            }
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::never()
    }
}

impl From<Duration> for Deadline {
    fn from(d: Duration) -> Self {
        Deadline::relative(d)
    }
}

impl From<TimePoint> for Deadline {
    fn from(at: TimePoint) -> Self {
        Deadline::absolute(at)
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_instant() {
            write!(f, "Deadline::instant")
        } else if self.is_never() {
            write!(f, "Deadline::never")
        } else if self.is_relative() {
            write!(f, "Deadline::relative({:?})", Duration::from_nanos(self.0))
        } else {
            write!(f, "Deadline::absolute({}ns)", self.0 & MAX_UNITS)
        }
    }
}

/// Retry-loop helper for blocking waits.
///
/// Each `step()` yields the budget left for the next wait. The first step
/// always succeeds so an `instant` or already-expired deadline still gets
/// one non-blocking attempt; later steps fail with
/// `AsyncOperationTimedOut` once the budget is gone.
#[derive(Debug, Clone, Copy)]
pub struct StepDeadline {
    deadline: Deadline,
    first: bool,
}

impl StepDeadline {
    pub fn new(deadline: Deadline) -> Self {
        Self {
            deadline: deadline.start(),
            first: true,
        }
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn step(&mut self) -> Result<Deadline> {
        let first = std::mem::replace(&mut self.first, false);
        if self.deadline.is_never() {
            return Ok(self.deadline);
        }
        match self.deadline.remaining() {
            Some(d) if !d.is_zero() => Ok(Deadline::relative(d)),
            _ if first => Ok(Deadline::instant()),
            _ => Err(Error::AsyncOperationTimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_are_trivial() {
        assert!(Deadline::instant().is_trivial());
        assert!(Deadline::never().is_trivial());
        assert!(!Deadline::relative(Duration::from_millis(5)).is_trivial());
        assert!(Deadline::instant().is_relative());
        assert!(!Deadline::never().is_relative());
        assert!(!Deadline::never().is_absolute());
    }

    #[test]
    fn test_zero_relative_is_instant() {
        assert_eq!(Deadline::relative(Duration::ZERO), Deadline::instant());
    }

    #[test]
    fn test_start_is_absolute_and_not_in_the_past() {
        let before = TimePoint::now();
        let started = Deadline::relative(Duration::from_secs(1)).start();
        assert!(started.is_absolute());
        assert!(started.absolute_time() >= before);
        assert!(started.absolute_time() >= before.saturating_add(Duration::from_secs(1)));
    }

    #[test]
    fn test_start_is_idempotent() {
        let started = Deadline::relative(Duration::from_millis(50)).start();
        assert_eq!(started.start(), started);
        assert_eq!(Deadline::never().start(), Deadline::never());
        assert_eq!(Deadline::instant().start(), Deadline::instant());
    }

    #[test]
    fn test_relative_saturates() {
        let max = Deadline::relative(Deadline::MAX_RELATIVE);
        let over = Deadline::relative(Deadline::MAX_RELATIVE + Duration::from_nanos(1));
        assert_eq!(max, over);
        assert_eq!(Deadline::relative(Duration::MAX), max);
    }

    #[test]
    fn test_start_saturates_instead_of_wrapping() {
        let started = Deadline::relative(Deadline::MAX_RELATIVE).start();
        assert!(started.is_absolute());
        assert!(!started.is_never());
        assert!(started.absolute_time() >= TimePoint::now());
        let over = Deadline::relative(Duration::MAX).start();
        assert_eq!(started.absolute_time(), over.absolute_time());
    }

    #[test]
    #[should_panic]
    fn test_relative_accessor_rejects_absolute() {
        let _ = Deadline::relative(Duration::from_secs(1)).start().relative_duration();
    }

    #[test]
    fn test_poll_timeout() {
        assert_eq!(Deadline::never().poll_timeout_ms(), -1);
        assert_eq!(Deadline::instant().poll_timeout_ms(), 0);
        assert_eq!(Deadline::relative(Duration::from_micros(1)).poll_timeout_ms(), 1);
        assert_eq!(Deadline::relative(Duration::from_millis(20)).poll_timeout_ms(), 20);
    }

    #[test]
    fn test_expiry() {
        assert!(Deadline::instant().has_expired());
        assert!(!Deadline::never().has_expired());
        let past = Deadline::absolute(TimePoint::from_nanos(1));
        assert!(past.has_expired());
    }

    #[test]
    fn test_min() {
        let short = Deadline::relative(Duration::from_millis(1));
        let long = Deadline::relative(Duration::from_secs(1));
        assert_eq!(short.min(long), short);
        assert_eq!(Deadline::never().min(long), long);
        assert_eq!(long.min(Deadline::never()), long);
    }

    #[test]
    fn test_step_deadline_instant_allows_one_attempt() {
        let mut step = StepDeadline::new(Deadline::instant());
        assert_eq!(step.step(), Ok(Deadline::instant()));
        assert_eq!(step.step(), Err(Error::AsyncOperationTimedOut));
    }

    #[test]
    fn test_step_deadline_never_keeps_going() {
        let mut step = StepDeadline::new(Deadline::never());
        for _ in 0..3 {
            assert_eq!(step.step(), Ok(Deadline::never()));
        }
    }

    #[test]
    fn test_step_deadline_does_not_extend_budget() {
        let mut step = StepDeadline::new(Deadline::relative(Duration::from_millis(30)));
        let first = step.step().unwrap().relative_duration();
        std::thread::sleep(Duration::from_millis(10));
        let second = step.step().unwrap().relative_duration();
        assert!(second < first);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(step.step(), Err(Error::AsyncOperationTimedOut));
    }
}
