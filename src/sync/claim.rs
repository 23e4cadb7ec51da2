use crate::loom::sync::atomic::AtomicBool;
use crate::loom::sync::atomic::AtomicU8;
use crate::loom::sync::atomic::Ordering;

// -----------------------------------------------------------------------------
// Claim Flag
// -----------------------------------------------------------------------------

/// An atomic test-and-set ownership flag.
///
/// The flag is the sole arbiter of ownership for whatever it guards: the
/// thread whose [`try_claim`] returned `true` owns the resource until it
/// calls [`release`].
///
/// [`try_claim`]: Self::try_claim
/// [`release`]: Self::release
#[derive(Debug)]
#[repr(transparent)]
pub struct ClaimFlag {
  inner: AtomicBool,
}

impl ClaimFlag {
  pub fn new() -> Self {
    Self {
      inner: AtomicBool::new(false),
    }
  }

  /// Creates a flag that is already claimed.
  pub fn claimed() -> Self {
    Self {
      inner: AtomicBool::new(true),
    }
  }

  /// Attempts to take ownership; returns `true` on success.
  #[inline]
  pub fn try_claim(&self) -> bool {
    !self.inner.swap(true, Ordering::Acquire)
  }

  /// Gives up ownership.
  #[inline]
  pub fn release(&self) {
    self.inner.store(false, Ordering::Release);
  }

  #[inline]
  pub fn is_claimed(&self) -> bool {
    self.inner.load(Ordering::Acquire)
  }
}

impl Default for ClaimFlag {
  fn default() -> Self {
    Self::new()
  }
}

// -----------------------------------------------------------------------------
// Rendezvous
// -----------------------------------------------------------------------------

/// A two-party handoff where the last arriver does the work.
///
/// Both parties call [`arrive`] exactly once; exactly one of them observes
/// `true` and is responsible for the shared cleanup.
///
/// [`arrive`]: Self::arrive
#[derive(Debug)]
#[repr(transparent)]
pub struct Rendezvous {
  arrivals: AtomicU8,
}

impl Rendezvous {
  pub fn new() -> Self {
    Self {
      arrivals: AtomicU8::new(0),
    }
  }

  /// Registers an arrival. Returns `true` for the second arriver.
  #[inline]
  pub fn arrive(&self) -> bool {
    let prev: u8 = self.arrivals.fetch_add(1, Ordering::AcqRel);
    debug_assert!(prev < 2, "rendezvous visited more than twice");
    prev == 1
  }

  /// Returns the number of parties that have arrived.
  #[inline]
  pub fn arrivals(&self) -> u8 {
    self.arrivals.load(Ordering::Acquire)
  }
}

impl Default for Rendezvous {
  fn default() -> Self {
    Self::new()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(all(test, not(loom)))]
mod tests {
  use crate::sync::ClaimFlag;
  use crate::sync::Rendezvous;

  #[test]
  fn test_claim_release() {
    let flag: ClaimFlag = ClaimFlag::new();

    assert!(flag.try_claim());
    assert!(!flag.try_claim());
    assert!(flag.is_claimed());

    flag.release();

    assert!(!flag.is_claimed());
    assert!(flag.try_claim());
  }

  #[test]
  fn test_second_arriver_wins() {
    let rendezvous: Rendezvous = Rendezvous::new();

    assert!(!rendezvous.arrive());
    assert!(rendezvous.arrive());
    assert_eq!(rendezvous.arrivals(), 2);
  }
}
