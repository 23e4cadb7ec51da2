use std::cell::Cell;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::num::NonZeroU32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use crate::error::fatal;

thread_local! {
  static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// A unique identifier for a host thread.
///
/// Identifiers are never reused within one host process, which lets a lock
/// store its owner as a plain integer. This has a maximum value of
/// `(2 ^ 24) - 1`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ThreadId {
  inner: NonZeroU32,
}

impl ThreadId {
  // The maximum number of host threads over the lifetime of the process.
  pub(crate) const MAX_THREADS: u32 = (1 << 24) - 1;

  /// Returns the unique identifier of the calling thread.
  ///
  /// During thread-local destruction the identifier can no longer be
  /// cached, so a fresh one is generated; such a thread cannot own locks.
  #[inline]
  pub fn current() -> Self {
    CURRENT
      .try_with(|thread| {
        thread.get().unwrap_or_else(
          #[cold]
          || {
            let id: ThreadId = next_thread_id();
            thread.set(Some(id));
            id
          },
        )
      })
      .unwrap_or_else(|_| next_thread_id())
  }

  /// Rebuilds an identifier from [`as_u32`] output.
  ///
  /// [`as_u32`]: Self::as_u32
  #[inline]
  pub(crate) fn from_u32(raw: u32) -> Option<Self> {
    NonZeroU32::new(raw).map(|inner| Self { inner })
  }

  /// Returns this `ThreadId` as a numeric identifier.
  #[inline]
  pub fn as_u32(&self) -> u32 {
    self.inner.get()
  }
}

impl Display for ThreadId {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "#{}", self.inner)
  }
}

fn next_thread_id() -> ThreadId {
  static ID: AtomicU32 = AtomicU32::new(0);

  let mut last: u32 = ID.load(Ordering::Relaxed);

  'next: loop {
    let Some(id) = last.checked_add(1) else {
      exhausted();
    };

    if id > ThreadId::MAX_THREADS {
      exhausted();
    }

    match ID.compare_exchange_weak(last, id, Ordering::Relaxed, Ordering::Relaxed) {
      Ok(_) => {
        break 'next ThreadId {
          // SAFETY: `id` is derived from `last + 1` and `last` never wraps.
          inner: unsafe { NonZeroU32::new_unchecked(id) },
        };
      }
      Err(next) => last = next,
    }
  }
}

#[cold]
fn exhausted() -> ! {
  fatal!("failed to generate unique thread ID: bitspace exhausted")
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::thread;

  use crate::utils::ThreadId;

  #[test]
  fn test_stable_per_thread() {
    assert_eq!(ThreadId::current(), ThreadId::current());
  }

  #[test]
  fn test_unique_across_threads() {
    let this: ThreadId = ThreadId::current();
    let that: ThreadId = thread::spawn(ThreadId::current).join().unwrap();

    assert_ne!(this, that);
    assert_eq!(ThreadId::from_u32(that.as_u32()), Some(that));
  }
}
