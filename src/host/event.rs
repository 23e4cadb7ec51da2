use parking_lot::Condvar;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::time::Duration;
use std::time::Instant;
use triomphe::Arc;

use crate::utils::deadline;

// -----------------------------------------------------------------------------
// Event
// -----------------------------------------------------------------------------

/// A host event object.
///
/// A manual-reset event stays signalled until [`reset`] is called and wakes
/// every waiter. An auto-reset event is consumed by the waiter it releases,
/// so each [`set`] releases exactly one waiter.
///
/// Cloning an `Event` duplicates the handle; both handles refer to the same
/// kernel object.
///
/// [`set`]: Self::set
/// [`reset`]: Self::reset
#[derive(Clone)]
pub struct Event {
  inner: Arc<EventInner>,
}

struct EventInner {
  state: Mutex<EventState>,
  cond: Condvar,
  manual: bool,
}

struct EventState {
  signalled: bool,
  observers: Vec<Arc<Observer>>,
}

impl Event {
  /// Creates a new manual-reset event.
  pub fn manual(signalled: bool) -> Self {
    Self::new(true, signalled)
  }

  /// Creates a new auto-reset event.
  pub fn auto(signalled: bool) -> Self {
    Self::new(false, signalled)
  }

  fn new(manual: bool, signalled: bool) -> Self {
    Self {
      inner: Arc::new(EventInner {
        state: Mutex::new(EventState {
          signalled,
          observers: Vec::new(),
        }),
        cond: Condvar::new(),
        manual,
      }),
    }
  }

  /// Returns `true` if this is a manual-reset event.
  #[inline]
  pub fn is_manual(&self) -> bool {
    self.inner.manual
  }

  /// Returns `true` if both handles refer to the same event object.
  #[inline]
  pub fn ptr_eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// Signals the event.
  pub fn set(&self) {
    let mut state = self.inner.state.lock();

    state.signalled = true;

    for observer in state.observers.iter() {
      observer.notify();
    }

    drop(state);

    self.inner.cond.notify_all();
  }

  /// Clears the signalled state.
  pub fn reset(&self) {
    self.inner.state.lock().signalled = false;
  }

  /// Returns `true` if the event is currently signalled.
  ///
  /// This never consumes an auto-reset event.
  pub fn is_set(&self) -> bool {
    self.inner.state.lock().signalled
  }

  /// Waits until the event is signalled or `timeout` elapses.
  ///
  /// Returns `false` on timeout. A `None` timeout waits forever.
  pub fn wait(&self, timeout: Option<Duration>) -> bool {
    let deadline: Option<Instant> = deadline(timeout);
    let mut state = self.inner.state.lock();

    loop {
      if state.signalled {
        if !self.inner.manual {
          state.signalled = false;
        }

        return true;
      }

      match deadline {
        Some(deadline) => {
          if self.inner.cond.wait_until(&mut state, deadline).timed_out() && !state.signalled {
            return false;
          }
        }
        None => {
          self.inner.cond.wait(&mut state);
        }
      }
    }
  }

  /// Waits until any of `events` is signalled or `timeout` elapses.
  ///
  /// Returns the index of the event that released the caller, preferring the
  /// lowest index when several are signalled. Only that event is consumed.
  pub fn wait_any(events: &[&Event], timeout: Option<Duration>) -> Option<usize> {
    if events.is_empty() {
      if let Some(timeout) = timeout {
        std::thread::sleep(timeout);
      } else {
        std::thread::park();
      }

      return None;
    }

    let deadline: Option<Instant> = deadline(timeout);
    let observer: Arc<Observer> = Arc::new(Observer::new());

    for event in events {
      event.inner.state.lock().observers.push(Arc::clone(&observer));
    }

    let index: Option<usize> = 'wait: loop {
      for (index, event) in events.iter().enumerate() {
        if event.try_consume() {
          break 'wait Some(index);
        }
      }

      if !observer.wait(deadline) {
        // One last look; a `set` may have landed right at the deadline.
        break 'wait events.iter().position(|event| event.try_consume());
      }
    };

    for event in events {
      event
        .inner
        .state
        .lock()
        .observers
        .retain(|item| !Arc::ptr_eq(item, &observer));
    }

    index
  }

  fn try_consume(&self) -> bool {
    let mut state = self.inner.state.lock();

    if !state.signalled {
      return false;
    }

    if !self.inner.manual {
      state.signalled = false;
    }

    true
  }
}

impl Debug for Event {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Event")
      .field("manual", &self.inner.manual)
      .field("signalled", &self.is_set())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Observer
// -----------------------------------------------------------------------------

struct Observer {
  woken: Mutex<bool>,
  cond: Condvar,
}

impl Observer {
  fn new() -> Self {
    Self {
      woken: Mutex::new(false),
      cond: Condvar::new(),
    }
  }

  fn notify(&self) {
    *self.woken.lock() = true;
    self.cond.notify_one();
  }

  fn wait(&self, deadline: Option<Instant>) -> bool {
    let mut woken = self.woken.lock();

    while !*woken {
      match deadline {
        Some(deadline) => {
          if self.cond.wait_until(&mut woken, deadline).timed_out() {
            break;
          }
        }
        None => {
          self.cond.wait(&mut woken);
        }
      }
    }

    let result: bool = *woken;
    *woken = false;
    result
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
