use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use triomphe::Arc;

use crate::host::Event;
use crate::loom::sync::atomic::AtomicU8;
use crate::loom::sync::atomic::Ordering;
use crate::pool::Task;
use crate::sync::ClaimFlag;

// -----------------------------------------------------------------------------
// Slot Ref
// -----------------------------------------------------------------------------

/// Identifies the worker slot a thread backs.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
pub struct SlotRef {
  index: u32,
  overflow: bool,
}

impl SlotRef {
  pub(crate) const fn fixed(index: usize) -> Self {
    Self {
      index: index as u32,
      overflow: false,
    }
  }

  pub(crate) const fn overflow(serial: u32) -> Self {
    Self {
      index: serial,
      overflow: true,
    }
  }

  /// Index in the fixed array, or the serial number of an overflow slot.
  #[inline]
  pub const fn index(&self) -> usize {
    self.index as usize
  }

  /// Returns `true` for a heap-allocated slot that is freed after one job.
  #[inline]
  pub const fn is_overflow(&self) -> bool {
    self.overflow
  }
}

impl Debug for SlotRef {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    Display::fmt(self, f)
  }
}

impl Display for SlotRef {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    if self.overflow {
      write!(f, "overflow#{}", self.index)
    } else {
      write!(f, "slot#{:0>2}", self.index)
    }
  }
}

// -----------------------------------------------------------------------------
// Slot State
// -----------------------------------------------------------------------------

/// Lifecycle of a worker slot.
///
/// Diagnostic only: the claim flag alone decides who owns a slot.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
  Free = 0,
  Claimed = 1,
  Running = 2,
  AwaitingReuse = 3,
  Terminating = 4,
}

impl SlotState {
  const fn from_u8(value: u8) -> Self {
    match value {
      1 => Self::Claimed,
      2 => Self::Running,
      3 => Self::AwaitingReuse,
      4 => Self::Terminating,
      _ => Self::Free,
    }
  }
}

// -----------------------------------------------------------------------------
// Backing Thread
// -----------------------------------------------------------------------------

/// The host thread behind a slot.
pub(crate) struct Backing {
  pub(crate) jobs: UnboundedSender<Task>,
  /// Set by the thread right before it returns.
  pub(crate) exited: Event,
  pub(crate) handle: Mutex<Option<JoinHandle<()>>>,
}

// -----------------------------------------------------------------------------
// Slot
// -----------------------------------------------------------------------------

pub(crate) struct Slot {
  pub(crate) slot: SlotRef,
  pub(crate) claim: ClaimFlag,
  state: AtomicU8,
  tag: Mutex<Cow<'static, str>>,
  pub(crate) backing: Mutex<Option<Arc<Backing>>>,
}

impl Slot {
  pub(crate) fn new(slot: SlotRef) -> Self {
    Self {
      slot,
      claim: ClaimFlag::new(),
      state: AtomicU8::new(SlotState::Free as u8),
      tag: Mutex::new(Cow::Borrowed("")),
      backing: Mutex::new(None),
    }
  }

  #[inline]
  pub(crate) fn state(&self) -> SlotState {
    SlotState::from_u8(self.state.load(Ordering::Acquire))
  }

  #[inline]
  pub(crate) fn set_state(&self, state: SlotState) {
    self.state.store(state as u8, Ordering::Release);
  }

  /// Moves from `current` to `new`; fails if the slot left `current`.
  #[inline]
  pub(crate) fn transition(&self, current: SlotState, new: SlotState) -> bool {
    self
      .state
      .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  pub(crate) fn tag(&self) -> Cow<'static, str> {
    self.tag.lock().clone()
  }

  pub(crate) fn set_tag(&self, tag: Cow<'static, str>) {
    *self.tag.lock() = tag;
  }

  /// Returns the backing thread, if it is still accepting jobs.
  pub(crate) fn live_backing(&self) -> Option<Arc<Backing>> {
    self
      .backing
      .lock()
      .as_ref()
      .filter(|backing| !backing.jobs.is_closed() && !backing.exited.is_set())
      .cloned()
  }
}

impl Debug for Slot {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Slot")
      .field("slot", &self.slot)
      .field("claimed", &self.claim.is_claimed())
      .field("state", &self.state())
      .field("tag", &self.tag())
      .field("backed", &self.backing.lock().is_some())
      .finish()
  }
}
