use parking_lot::Mutex;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::time::Duration;
use std::time::Instant;
use tracing::trace;

use crate::error::Errno;
use crate::error::fatal;
use crate::host::Event;
use crate::loom::sync::atomic::AtomicBool;
use crate::loom::sync::atomic::AtomicI32;
use crate::loom::sync::atomic::AtomicU32;
use crate::loom::sync::atomic::Ordering;
use crate::sync::LockLevel;
use crate::sync::order;
use crate::utils::ThreadId;
use crate::utils::deadline;
use crate::utils::remaining;

/// Name prefix of a lock used exactly once in the process lifetime.
const EPHEMERAL: char = '!';

// -----------------------------------------------------------------------------
// Muto
// -----------------------------------------------------------------------------

/// A fast recursive mutual-exclusion lock.
///
/// An uncontended acquire costs one atomic swap; a recursive acquire by the
/// owning thread costs nothing but a counter increment. Only contended
/// acquires block, on an auto-reset event that each release signals at most
/// once.
///
/// A lock whose name starts with `!` is *ephemeral*: once the last waiter
/// has gone its event is closed, and any later contention is fatal.
pub struct Muto {
  name: &'static str,
  level: Option<LockLevel>,
  /// Set while some thread owns the lock.
  sync: AtomicBool,
  /// Number of threads contending for the lock, minus one.
  waiters: AtomicI32,
  /// Recursion depth of the owner; zero exactly when the lock is free.
  visits: AtomicU32,
  /// Raw [`ThreadId`] of the owner, or zero.
  owner: AtomicU32,
  event: Mutex<Option<Event>>,
}

impl Muto {
  /// Creates a new lock outside the fork lock order.
  pub fn new(name: &'static str) -> Self {
    Self::build(name, None)
  }

  /// Creates a new lock at the given position in the fork lock order.
  pub fn with_level(name: &'static str, level: LockLevel) -> Self {
    Self::build(name, Some(level))
  }

  fn build(name: &'static str, level: Option<LockLevel>) -> Self {
    Self {
      name,
      level,
      sync: AtomicBool::new(false),
      waiters: AtomicI32::new(-1),
      visits: AtomicU32::new(0),
      owner: AtomicU32::new(0),
      event: Mutex::new(Some(Event::auto(false))),
    }
  }

  #[inline]
  pub fn name(&self) -> &'static str {
    self.name
  }

  #[inline]
  pub fn level(&self) -> Option<LockLevel> {
    self.level
  }

  #[inline]
  pub fn is_ephemeral(&self) -> bool {
    self.name.starts_with(EPHEMERAL)
  }

  /// Returns the recursion depth of the current owner.
  #[inline]
  pub fn visits(&self) -> u32 {
    self.visits.load(Ordering::Acquire)
  }

  /// Returns `true` if some thread owns the lock.
  #[inline]
  pub fn is_locked(&self) -> bool {
    self.owner.load(Ordering::Acquire) != 0
  }

  /// Returns the owning thread, if any.
  #[inline]
  pub fn owner(&self) -> Option<ThreadId> {
    ThreadId::from_u32(self.owner.load(Ordering::Acquire))
  }

  /// Returns `true` if the calling thread owns the lock.
  #[inline]
  pub fn is_owned(&self) -> bool {
    self.owner.load(Ordering::Acquire) == ThreadId::current().as_u32()
  }

  /// Acquires the lock, waiting at most `timeout`.
  ///
  /// `None` waits forever and `Some(Duration::ZERO)` only tries. Returns
  /// the new visit count, or `None` if the wait timed out.
  pub fn acquire(&self, timeout: Option<Duration>) -> Option<u32> {
    let this: u32 = ThreadId::current().as_u32();

    if self.owner.load(Ordering::Acquire) != this {
      if let Some(level) = self.level {
        order::check(level);
      }

      let attempt: bool = timeout == Some(Duration::ZERO);
      let deadline: Option<Instant> = deadline(timeout);

      // Count ourselves as a waiter first; a non-zero result means another
      // thread is ahead of us and we must wait for a wakeup before trying.
      let mut waiting: bool = !attempt && self.waiters.fetch_add(1, Ordering::AcqRel) + 1 != 0;

      while waiting || self.sync.swap(true, Ordering::Acquire) {
        if !self.event().wait(remaining(deadline)) {
          if !attempt {
            self.waiters.fetch_sub(1, Ordering::AcqRel);
          }

          return None;
        }

        waiting = false;
      }

      if attempt {
        self.waiters.fetch_add(1, Ordering::AcqRel);
      }

      if let Some(level) = self.level {
        order::enter(level);
      }

      self.owner.store(this, Ordering::Release);
    }

    Some(self.visits.fetch_add(1, Ordering::AcqRel) + 1)
  }

  /// Releases one visit of the lock.
  ///
  /// Fails with `EPERM` if the calling thread does not own the lock.
  pub fn release(&self) -> Result<(), Errno> {
    let this: u32 = ThreadId::current().as_u32();

    if self.owner.load(Ordering::Acquire) != this || self.visits.load(Ordering::Acquire) == 0 {
      return Err(Errno::EPERM);
    }

    if self.visits.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.owner.store(0, Ordering::Release);

      if let Some(level) = self.level {
        order::leave(level);
      }

      self.sync.store(false, Ordering::Release);

      // We counted ourselves as a waiter and never took it back; a count
      // still non-negative means someone is blocked on the event.
      if self.waiters.fetch_sub(1, Ordering::AcqRel) - 1 >= 0 {
        self.event().set();
      } else if self.is_ephemeral() {
        trace!(target: "posix_shim", name = self.name, "closing ephemeral lock");
        *self.event.lock() = None;
      }
    }

    Ok(())
  }

  /// Acquires the lock, waiting forever.
  pub fn lock(&self) -> MutoGuard<'_> {
    if self.acquire(None).is_none() {
      fatal!(format!("unbounded acquire of {} failed", self.name));
    }

    MutoGuard { muto: self }
  }

  /// Acquires the lock, waiting at most `timeout`.
  pub fn try_lock_for(&self, timeout: Duration) -> Option<MutoGuard<'_>> {
    self.acquire(Some(timeout)).map(|_| MutoGuard { muto: self })
  }

  fn event(&self) -> Event {
    match self.event.lock().as_ref() {
      Some(event) => event.clone(),
      None => fatal!(format!("ephemeral lock {} used after close", self.name)),
    }
  }
}

impl Debug for Muto {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Muto")
      .field("name", &self.name)
      .field("owner", &self.owner())
      .field("visits", &self.visits())
      .finish_non_exhaustive()
  }
}

// -----------------------------------------------------------------------------
// Muto Guard
// -----------------------------------------------------------------------------

/// Releases one visit of a [`Muto`] on drop.
#[must_use = "if unused the lock is released immediately"]
pub struct MutoGuard<'a> {
  muto: &'a Muto,
}

impl MutoGuard<'_> {
  #[inline]
  pub fn name(&self) -> &'static str {
    self.muto.name
  }
}

impl Drop for MutoGuard<'_> {
  fn drop(&mut self) {
    if let Err(error) = self.muto.release() {
      fatal!(format!("guard of {} released by non-owner: {error}", self.muto.name));
    }
  }
}

impl Debug for MutoGuard<'_> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_tuple("MutoGuard").field(&self.muto.name).finish()
  }
}

// -----------------------------------------------------------------------------
// Lazy Muto
// -----------------------------------------------------------------------------

/// A [`Muto`] created on first use.
///
/// Racing initializers each build a lock; exactly one installs it with a
/// pointer swap and the others discard theirs.
pub struct LazyMuto {
  name: &'static str,
  level: Option<LockLevel>,
  inner: AtomicPtr<Muto>,
}

impl LazyMuto {
  pub const fn new(name: &'static str) -> Self {
    Self {
      name,
      level: None,
      inner: AtomicPtr::new(ptr::null_mut()),
    }
  }

  pub const fn with_level(name: &'static str, level: LockLevel) -> Self {
    Self {
      name,
      level: Some(level),
      inner: AtomicPtr::new(ptr::null_mut()),
    }
  }

  /// Returns `true` if the lock has been created.
  pub fn is_installed(&self) -> bool {
    !self.inner.load(std::sync::atomic::Ordering::Acquire).is_null()
  }

  /// Returns the lock, creating it if necessary.
  pub fn get(&self) -> &Muto {
    use std::sync::atomic::Ordering;

    let mut current: *mut Muto = self.inner.load(Ordering::Acquire);

    if current.is_null() {
      let fresh: *mut Muto = Box::into_raw(Box::new(Muto::build(self.name, self.level)));

      match self
        .inner
        .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => current = fresh,
        Err(installed) => {
          // SAFETY: `fresh` came from `Box::into_raw` above and was never shared.
          drop(unsafe { Box::from_raw(fresh) });
          current = installed;
        }
      }
    }

    // SAFETY: The pointer is non-null, was created by `Box::into_raw`, and is
    //         only freed when `self` is dropped.
    unsafe { &*current }
  }

  #[inline]
  pub fn lock(&self) -> MutoGuard<'_> {
    self.get().lock()
  }
}

impl Drop for LazyMuto {
  fn drop(&mut self) {
    let current: *mut Muto = *self.inner.get_mut();

    if !current.is_null() {
      // SAFETY: We have exclusive access and the pointer came from `Box::into_raw`.
      drop(unsafe { Box::from_raw(current) });
    }
  }
}

// SAFETY: `LazyMuto` only hands out shared references to a `Muto`, which is
//         itself `Send + Sync`.
unsafe impl Send for LazyMuto {}
unsafe impl Sync for LazyMuto {}

impl Debug for LazyMuto {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("LazyMuto")
      .field("name", &self.name)
      .field("installed", &self.is_installed())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(all(test, not(loom)))]
mod tests {
  use std::panic;
  use std::panic::AssertUnwindSafe;
  use std::sync::Arc;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;
  use std::sync::mpsc;
  use std::thread;
  use std::time::Duration;
  use std::time::Instant;

  use crate::error::Errno;
  use crate::sync::LazyMuto;
  use crate::sync::LockLevel;
  use crate::sync::Muto;

  #[cfg(debug_assertions)]
  #[test]
  fn test_order_checked_before_waiting() {
    let pool: Arc<Muto> = Arc::new(Muto::with_level("pool", LockLevel::Pool));
    let process: Muto = Muto::with_level("process", LockLevel::Process);
    let (held_send, held_recv) = mpsc::channel::<()>();
    let (release_send, release_recv) = mpsc::channel::<()>();

    let holder = {
      let pool: Arc<Muto> = Arc::clone(&pool);

      thread::spawn(move || {
        let _guard = pool.lock();
        held_send.send(()).unwrap();
        let _ignore = release_recv.recv();
      })
    };

    held_recv.recv().unwrap();

    let outer = process.lock();
    let start: Instant = Instant::now();

    let result = panic::catch_unwind(AssertUnwindSafe(|| pool.try_lock_for(Duration::from_secs(30)).is_some()));

    assert!(result.is_err());
    assert!(start.elapsed() < Duration::from_secs(5));

    drop(release_send);
    holder.join().unwrap();
    drop(outer);

    // The rejected acquire never registered as a waiter.
    assert!(pool.try_lock_for(Duration::from_secs(5)).is_some());
  }

  #[test]
  fn test_visits_track_recursion() {
    let muto: Muto = Muto::new("test");

    assert_eq!(muto.visits(), 0);
    assert!(!muto.is_locked());

    assert_eq!(muto.acquire(None), Some(1));
    assert_eq!(muto.acquire(None), Some(2));
    assert!(muto.is_owned());

    muto.release().unwrap();
    assert_eq!(muto.visits(), 1);
    assert!(muto.is_locked());

    muto.release().unwrap();
    assert_eq!(muto.visits(), 0);
    assert!(!muto.is_locked());

    assert_eq!(muto.release(), Err(Errno::EPERM));
    assert_eq!(muto.visits(), 0);
  }

  #[test]
  fn test_release_by_non_owner() {
    let muto: Arc<Muto> = Arc::new(Muto::new("test"));
    let _guard = muto.lock();
    let other: Arc<Muto> = Arc::clone(&muto);

    let result = thread::spawn(move || other.release()).join().unwrap();

    assert_eq!(result, Err(Errno::EPERM));
    assert_eq!(muto.visits(), 1);
  }

  #[test]
  fn test_timeout() {
    let muto: Arc<Muto> = Arc::new(Muto::new("test"));
    let _guard = muto.lock();
    let other: Arc<Muto> = Arc::clone(&muto);

    let result = thread::spawn(move || {
      (
        other.acquire(Some(Duration::ZERO)),
        other.acquire(Some(Duration::from_millis(10))),
      )
    })
    .join()
    .unwrap();

    assert_eq!(result, (None, None));
  }

  #[test]
  fn test_mutual_exclusion() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let muto: Arc<Muto> = Arc::new(Muto::new("test"));
    let inside: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let total: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
      .map(|_| {
        let muto: Arc<Muto> = Arc::clone(&muto);
        let inside: Arc<AtomicUsize> = Arc::clone(&inside);
        let total: Arc<AtomicUsize> = Arc::clone(&total);

        thread::spawn(move || {
          for _ in 0..ROUNDS {
            let _guard = muto.lock();

            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
            assert_eq!(muto.visits(), 1);
            total.fetch_add(1, Ordering::Relaxed);
            inside.fetch_sub(1, Ordering::SeqCst);
          }
        })
      })
      .collect();

    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(total.load(Ordering::Relaxed), THREADS * ROUNDS);
    assert!(!muto.is_locked());
  }

  #[test]
  fn test_ephemeral_closes_event() {
    let muto: Muto = Muto::new("!once");

    assert!(muto.is_ephemeral());

    drop(muto.lock());

    assert!(muto.event.lock().is_none());

    // Uncontended use never touches the event.
    drop(muto.lock());
  }

  #[test]
  fn test_lazy_installs_once() {
    static LAZY: LazyMuto = LazyMuto::new("lazy");

    let handles: Vec<_> = (0..4)
      .map(|_| thread::spawn(|| LAZY.get() as *const Muto as usize))
      .collect();

    let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(addrs.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(LAZY.is_installed());
  }
}
