use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::panic;
use std::panic::AssertUnwindSafe;
use tracing::trace;
use tracing::warn;

use crate::consts::RECOVERY_DEPTH;
use crate::error::Errno;
use crate::error::fatal;
use crate::host::MemoryFault;
use crate::tls::ThreadContext;
use crate::utils::panic_message;

// -----------------------------------------------------------------------------
// Recovery Stack
// -----------------------------------------------------------------------------

/// A recorded return point for a faulting memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryPoint {
  /// The error reported when an access under this point faults.
  pub errno: Errno,
}

/// Fixed-depth stack of recovery points.
pub struct RecoveryStack {
  points: [Option<RecoveryPoint>; RECOVERY_DEPTH],
  len: usize,
  /// Set while unwinding from a caught fault.
  in_exception: bool,
}

impl RecoveryStack {
  pub const fn new() -> Self {
    Self {
      points: [None; RECOVERY_DEPTH],
      len: 0,
      in_exception: false,
    }
  }

  #[inline]
  pub const fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub const fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  pub const fn in_exception(&self) -> bool {
    self.in_exception
  }

  /// Returns the innermost recovery point.
  #[inline]
  pub fn top(&self) -> Option<RecoveryPoint> {
    self.len.checked_sub(1).and_then(|index| self.points[index])
  }

  /// Pushes a point and returns the depth to [`pop`] back to.
  ///
  /// A point left behind by a caught fault is discarded first. Pushing onto
  /// a full stack is fatal in debug builds; release builds drop the point
  /// with a warning.
  ///
  /// [`pop`]: Self::pop
  pub fn push(&mut self, point: RecoveryPoint) -> usize {
    if self.in_exception {
      self.in_exception = false;
      self.len = self.len.saturating_sub(1);
    }

    let depth: usize = self.len;

    if depth == RECOVERY_DEPTH {
      if cfg!(debug_assertions) {
        fatal!("recovery stack overflow");
      }

      warn!(target: "posix_shim", depth, "recovery stack full, point dropped");
      return depth;
    }

    self.points[depth] = Some(point);
    self.len = depth + 1;

    depth
  }

  /// Pops every point above `depth` and clears the exception state.
  pub fn pop(&mut self, depth: usize) {
    for point in &mut self.points[depth.min(self.len)..self.len] {
      *point = None;
    }

    self.len = self.len.min(depth);
    self.in_exception = false;
  }

  /// Marks the innermost point as the target of a caught fault.
  pub fn enter_exception(&mut self) {
    self.in_exception = true;
  }

  /// Drops every point, as a forked child does after its fixups.
  pub fn clear(&mut self) {
    self.pop(0);
  }
}

impl Default for RecoveryStack {
  fn default() -> Self {
    Self::new()
  }
}

impl Debug for RecoveryStack {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("RecoveryStack")
      .field("points", &&self.points[..self.len])
      .field("in_exception", &self.in_exception)
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Fault Scope
// -----------------------------------------------------------------------------

/// A scoped recovery point.
///
/// Accesses run through [`probe`] that fault are reported as the scope's
/// error instead of propagating. The point is popped when the scope drops.
///
/// [`probe`]: Self::probe
///
/// # Examples
///
/// ```ignore
/// let mut scope = ctx.fault_scope(Errno::EFAULT);
/// let bytes = scope.probe(|| memory.read_vec(addr, len))?;
/// ```
pub struct FaultScope<'a> {
  ctx: &'a ThreadContext,
  errno: Errno,
  depth: usize,
  faulted: bool,
}

impl<'a> FaultScope<'a> {
  pub(crate) fn new(ctx: &'a ThreadContext, errno: Errno) -> Self {
    let depth: usize = ctx.recovery().push(RecoveryPoint { errno });

    Self {
      ctx,
      errno,
      depth,
      faulted: false,
    }
  }

  /// Returns `true` if any probe in this scope faulted.
  #[inline]
  pub fn faulted(&self) -> bool {
    self.faulted
  }

  /// Runs `f`, turning a [`MemoryFault`] or a panic into the scope's error.
  pub fn probe<T, F>(&mut self, f: F) -> Result<T, Errno>
  where
    F: FnOnce() -> Result<T, MemoryFault>,
  {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(fault)) => Err(self.recover(&fault)),
      Err(payload) => match payload.downcast::<MemoryFault>() {
        Ok(fault) => Err(self.recover(&fault)),
        Err(payload) => Err(self.recover(&panic_message(&*payload))),
      },
    }
  }

  fn recover(&mut self, cause: &dyn std::fmt::Display) -> Errno {
    self.ctx.recovery().enter_exception();

    trace!(
      target: "posix_shim",
      tid = %self.ctx.tid(),
      errno = ?self.errno,
      %cause,
      "fault caught",
    );

    self.faulted = true;
    self.ctx.set_errno(self.errno);
    self.errno
  }
}

impl Drop for FaultScope<'_> {
  fn drop(&mut self) {
    self.ctx.recovery().pop(self.depth);
  }
}

impl Debug for FaultScope<'_> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("FaultScope")
      .field("errno", &self.errno)
      .field("depth", &self.depth)
      .field("faulted", &self.faulted)
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::consts::RECOVERY_DEPTH;
  use crate::error::Errno;
  use crate::tls::RecoveryPoint;
  use crate::tls::RecoveryStack;

  const POINT: RecoveryPoint = RecoveryPoint { errno: Errno::EFAULT };

  #[test]
  fn test_push_pop() {
    let mut stack: RecoveryStack = RecoveryStack::new();

    let outer: usize = stack.push(POINT);
    let inner: usize = stack.push(RecoveryPoint { errno: Errno::EINVAL });

    assert_eq!((outer, inner), (0, 1));
    assert_eq!(stack.top().map(|point| point.errno), Some(Errno::EINVAL));

    stack.pop(inner);
    assert_eq!(stack.len(), 1);

    stack.pop(outer);
    assert!(stack.is_empty());
  }

  #[test]
  fn test_stale_point_discarded() {
    let mut stack: RecoveryStack = RecoveryStack::new();

    stack.push(POINT);
    stack.enter_exception();

    assert!(stack.in_exception());
    assert_eq!(stack.push(POINT), 0);
    assert_eq!(stack.len(), 1);
    assert!(!stack.in_exception());
  }

  #[cfg(not(debug_assertions))]
  #[test]
  fn test_overflow_truncates() {
    let mut stack: RecoveryStack = RecoveryStack::new();

    for _ in 0..RECOVERY_DEPTH + 4 {
      stack.push(POINT);
    }

    assert_eq!(stack.len(), RECOVERY_DEPTH);
  }

  #[test]
  fn test_fills_to_depth() {
    let mut stack: RecoveryStack = RecoveryStack::new();

    for expected in 0..RECOVERY_DEPTH {
      assert_eq!(stack.push(POINT), expected);
    }

    assert_eq!(stack.len(), RECOVERY_DEPTH);
  }
}
