//! The system-wide lock order.
//!
//! Three locks may be held together: the worker-pool/fork coordination
//! lock, the signal hold, and the process-wide lock, always acquired in that
//! order. Every thread tracks the levels it holds and debug builds assert
//! that a new level is strictly greater than every level already held.
//!
//! Fork acquires all three through [`PoolLocked`], [`SignalsHeld`] and
//! [`ForkLocks`], which only allow the acquisitions in order.

use std::cell::Cell;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use crate::sync::Muto;
use crate::sync::MutoGuard;

thread_local! {
  static HELD: Cell<u8> = const { Cell::new(0) };
}

// -----------------------------------------------------------------------------
// Lock Level
// -----------------------------------------------------------------------------

/// Position of a lock in the global acquisition order.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockLevel {
  /// The worker-pool/fork coordination lock.
  Pool = 0,
  /// The process signal hold.
  SignalHold = 1,
  /// The process-wide lock.
  Process = 2,
}

impl LockLevel {
  #[inline]
  const fn bit(self) -> u8 {
    1 << self as u8
  }

  /// Returns `true` if the calling thread holds this level.
  pub fn is_held(self) -> bool {
    HELD.with(|held| held.get() & self.bit() != 0)
  }
}

/// Asserts that the calling thread may acquire `level` now.
///
/// Lock users call this before blocking, so an out-of-order acquire fails
/// in debug builds instead of deadlocking.
#[inline]
pub(crate) fn check(level: LockLevel) {
  HELD.with(|held| {
    let bits: u8 = held.get();

    debug_assert!(
      bits >> level as u8 == 0,
      "lock order violated: acquiring {level:?} while holding {bits:#05b}",
    );
  });
}

/// Records that the calling thread acquired `level`.
pub(crate) fn enter(level: LockLevel) {
  check(level);
  HELD.with(|held| held.set(held.get() | level.bit()));
}

/// Records that the calling thread released `level`.
pub(crate) fn leave(level: LockLevel) {
  // Thread-local storage may already be gone during thread exit.
  let _ignore = HELD.try_with(|held| held.set(held.get() & !level.bit()));
}

/// Holds a lock level that is not backed by a [`Muto`].
pub(crate) struct LevelGuard {
  level: LockLevel,
}

impl LevelGuard {
  pub(crate) fn enter(level: LockLevel) -> Self {
    enter(level);
    Self { level }
  }
}

impl Drop for LevelGuard {
  fn drop(&mut self) {
    leave(self.level);
  }
}

// -----------------------------------------------------------------------------
// Fork Lock Chain
// -----------------------------------------------------------------------------

/// First step of the fork lock chain: the pool lock is held.
pub struct PoolLocked<'a> {
  pool: MutoGuard<'a>,
}

impl<'a> PoolLocked<'a> {
  /// Acquires the pool/fork coordination lock.
  pub fn lock(pool: &'a Muto) -> Self {
    Self { pool: pool.lock() }
  }

  /// Holds signals. `hold` returns a guard that releases the hold on drop.
  pub fn hold_signals<H, F>(self, hold: F) -> SignalsHeld<'a, H>
  where
    F: FnOnce() -> H,
  {
    let level: LevelGuard = LevelGuard::enter(LockLevel::SignalHold);

    SignalsHeld {
      hold: hold(),
      level,
      pool: self.pool,
    }
  }

  /// Like [`hold_signals`], for a hold that can fail. On failure the pool
  /// lock is released and the error returned.
  ///
  /// [`hold_signals`]: Self::hold_signals
  pub fn try_hold_signals<H, E, F>(self, hold: F) -> Result<SignalsHeld<'a, H>, E>
  where
    F: FnOnce() -> Result<H, E>,
  {
    let level: LevelGuard = LevelGuard::enter(LockLevel::SignalHold);

    Ok(SignalsHeld {
      hold: hold()?,
      level,
      pool: self.pool,
    })
  }
}

/// Second step of the fork lock chain: pool lock and signal hold.
pub struct SignalsHeld<'a, H> {
  hold: H,
  level: LevelGuard,
  pool: MutoGuard<'a>,
}

impl<'a, H> SignalsHeld<'a, H> {
  /// Acquires the process-wide lock, completing the chain.
  pub fn lock_process(self, process: &'a Muto) -> ForkLocks<'a, H> {
    ForkLocks {
      process: process.lock(),
      hold: self.hold,
      level: self.level,
      pool: self.pool,
    }
  }
}

/// All three fork locks, released in reverse order on drop.
pub struct ForkLocks<'a, H> {
  // Field order is drop order.
  process: MutoGuard<'a>,
  hold: H,
  level: LevelGuard,
  pool: MutoGuard<'a>,
}

impl<H> ForkLocks<'_, H> {
  /// Returns the signal hold guard.
  #[inline]
  pub fn hold(&self) -> &H {
    &self.hold
  }
}

impl<H> Debug for ForkLocks<'_, H> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("ForkLocks")
      .field("pool", &self.pool.name())
      .field("signals", &self.level.level)
      .field("process", &self.process.name())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(all(test, not(loom)))]
mod tests {
  use std::thread;

  use crate::sync::ForkLocks;
  use crate::sync::LockLevel;
  use crate::sync::Muto;
  use crate::sync::PoolLocked;
  use crate::sync::SignalsHeld;

  #[test]
  fn test_chain_tracks_levels() {
    let pool: Muto = Muto::with_level("pool", LockLevel::Pool);
    let process: Muto = Muto::with_level("process", LockLevel::Process);

    let locks: ForkLocks<'_, ()> = PoolLocked::lock(&pool)
      .hold_signals(|| ())
      .lock_process(&process);

    assert!(LockLevel::Pool.is_held());
    assert!(LockLevel::SignalHold.is_held());
    assert!(LockLevel::Process.is_held());

    drop(locks);

    assert!(!LockLevel::Pool.is_held());
    assert!(!LockLevel::SignalHold.is_held());
    assert!(!LockLevel::Process.is_held());
    assert!(!pool.is_locked());
    assert!(!process.is_locked());
  }

  #[test]
  fn test_failed_hold_releases_pool() {
    let pool: Muto = Muto::with_level("pool", LockLevel::Pool);

    let result: Result<SignalsHeld<'_, ()>, &str> = PoolLocked::lock(&pool).try_hold_signals(|| Err("stalled"));

    assert_eq!(result.err(), Some("stalled"));
    assert!(!LockLevel::Pool.is_held());
    assert!(!LockLevel::SignalHold.is_held());
    assert!(!pool.is_locked());
  }

  #[test]
  fn test_recursion_is_not_a_violation() {
    let pool: Muto = Muto::with_level("pool", LockLevel::Pool);
    let process: Muto = Muto::with_level("process", LockLevel::Process);

    let _locks = PoolLocked::lock(&pool).hold_signals(|| ()).lock_process(&process);
    let _again = pool.lock();

    assert_eq!(pool.visits(), 2);
  }

  #[cfg(debug_assertions)]
  #[test]
  fn test_out_of_order_asserts() {
    let result = thread::spawn(|| {
      let pool: Muto = Muto::with_level("pool", LockLevel::Pool);
      let process: Muto = Muto::with_level("process", LockLevel::Process);

      let _process = process.lock();
      let _pool = pool.lock();
    })
    .join();

    assert!(result.is_err());
  }
}
