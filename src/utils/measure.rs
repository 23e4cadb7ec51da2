//! Basic execution timing utilities.

use std::time::Duration;
use std::time::Instant;

#[inline(always)]
pub(crate) fn measure_fn<F, T>(f: F) -> (T, Duration)
where
  F: FnOnce() -> T,
{
  let instant: Instant = Instant::now();
  let output: T = f();

  (output, instant.elapsed())
}

/// Returns the time left until `deadline`, or `None` for an unbounded wait.
#[inline]
pub(crate) fn remaining(deadline: Option<Instant>) -> Option<Duration> {
  deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// Converts an optional timeout into an optional absolute deadline.
#[inline]
pub(crate) fn deadline(timeout: Option<Duration>) -> Option<Instant> {
  timeout.map(|timeout| Instant::now() + timeout)
}
