//! Reusable worker threads for blocking, interruptible work.
//!
//! A [`WorkerPool`] owns a fixed array of slots. Each slot is claimed with an
//! atomic test-and-set and lazily backed by one host thread that loops over
//! a job channel, so a reused slot skips thread creation entirely. When every
//! slot is taken, a heap-allocated overflow slot runs the job on a fresh
//! thread that exits afterwards.
//!
//! ```text
//! FREE -> CLAIMED -> RUNNING -> AWAITING-REUSE -> FREE
//!                           \-> TERMINATING ----> FREE
//! ```

mod slot;
mod worker;

pub use self::slot::SlotRef;
pub use self::slot::SlotState;
pub use self::worker::Detach;
pub use self::worker::Interrupt;
pub use self::worker::Job;
pub use self::worker::Worker;

pub(crate) use self::slot::Backing;
pub(crate) use self::slot::Slot;
pub(crate) use self::worker::Task;
pub(crate) use self::worker::Ticket;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc as StdArc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;
use triomphe::Arc;

use crate::consts::DETACH_GRACE;
use crate::consts::POOL_SLOTS;
use crate::consts::TERMINATE_JOIN_TIMEOUT;
use crate::consts::WORKER_STACK_SIZE;
use crate::error::fatal;
use crate::host::Event;
use crate::sync::LockLevel;
use crate::sync::Muto;

/// Called on every pool thread before its first job.
pub type StartHook = StdArc<dyn Fn(SlotRef) + Send + Sync + 'static>;

// -----------------------------------------------------------------------------
// Pool Config
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct PoolConfig {
  pub stack_size: usize,
  /// Grace period after the extra handle of a two-phase detach fired.
  pub detach_grace: Duration,
  /// How long a forced termination waits to join the thread.
  pub terminate_join_timeout: Duration,
  pub on_thread_start: Option<StartHook>,
}

impl PoolConfig {
  pub fn new() -> Self {
    Self {
      stack_size: WORKER_STACK_SIZE,
      detach_grace: DETACH_GRACE,
      terminate_join_timeout: TERMINATE_JOIN_TIMEOUT,
      on_thread_start: None,
    }
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self::new()
  }
}

impl Debug for PoolConfig {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("PoolConfig")
      .field("stack_size", &self.stack_size)
      .field("detach_grace", &self.detach_grace)
      .field("terminate_join_timeout", &self.terminate_join_timeout)
      .field("on_thread_start", &self.on_thread_start.is_some())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Shared State
// -----------------------------------------------------------------------------

pub(crate) struct Shared {
  slots: Box<[CachePadded<Arc<Slot>>]>,
  pub(crate) config: PoolConfig,
  pub(crate) fork_lock: Muto,
  overflow_live: AtomicUsize,
  overflow_serial: AtomicU32,
  spawned: AtomicUsize,
  terminations: AtomicUsize,
}

impl Shared {
  /// Returns a finished slot to the pool.
  pub(crate) fn release(&self, slot: &Slot) {
    trace!(target: "posix_shim", slot = %slot.slot, "slot released");

    slot.set_tag(Cow::Borrowed(""));
    slot.set_state(SlotState::Free);

    if slot.slot.is_overflow() {
      self.overflow_live.fetch_sub(1, Ordering::AcqRel);
    } else {
      slot.claim.release();
    }
  }

  pub(crate) fn count_termination(&self) {
    self.terminations.fetch_add(1, Ordering::Relaxed);
  }

  fn claim(&self) -> Arc<Slot> {
    for slot in self.slots.iter() {
      if slot.claim.try_claim() {
        return Arc::clone(slot);
      }
    }

    let serial: u32 = self.overflow_serial.fetch_add(1, Ordering::Relaxed);
    let slot: Slot = Slot::new(SlotRef::overflow(serial));

    // Overflow slots are born claimed and never returned to the array.
    slot.claim.try_claim();
    self.overflow_live.fetch_add(1, Ordering::AcqRel);

    debug!(target: "posix_shim", slot = %slot.slot, "pool exhausted, using overflow slot");

    Arc::new(slot)
  }
}

// -----------------------------------------------------------------------------
// Worker Pool
// -----------------------------------------------------------------------------

/// A pool of reusable host threads.
pub struct WorkerPool {
  shared: Arc<Shared>,
}

impl WorkerPool {
  pub fn new(slots: usize, config: PoolConfig) -> Self {
    let slots: Box<[CachePadded<Arc<Slot>>]> = (0..slots)
      .map(|index| CachePadded::new(Arc::new(Slot::new(SlotRef::fixed(index)))))
      .collect();

    Self {
      shared: Arc::new(Shared {
        slots,
        config,
        fork_lock: Muto::with_level("pool", LockLevel::Pool),
        overflow_live: AtomicUsize::new(0),
        overflow_serial: AtomicU32::new(0),
        spawned: AtomicUsize::new(0),
        terminations: AtomicUsize::new(0),
      }),
    }
  }

  /// Runs `job` on a pool thread and returns its owner handle.
  ///
  /// Spawning a thread that cannot be created is fatal.
  pub fn create<N, F>(&self, name: N, job: F) -> Worker
  where
    N: Into<Cow<'static, str>>,
    F: FnOnce(&Interrupt) + Send + 'static,
  {
    let name: Cow<'static, str> = name.into();
    let slot: Arc<Slot> = self.shared.claim();
    let ticket: Arc<Ticket> = Arc::new(Ticket::new());

    slot.set_tag(name.clone());
    slot.set_state(SlotState::Claimed);

    let backing: Arc<Backing> = match slot.live_backing() {
      Some(backing) => backing,
      None => self.spawn_backing(&slot),
    };

    trace!(target: "posix_shim", slot = %slot.slot, %name, "job assigned");

    let task: Task = Task {
      job: Box::new(job),
      ticket: Arc::clone(&ticket),
    };

    if backing.jobs.send(task).is_err() {
      fatal!("pool thread vanished");
    }

    Worker::new(Arc::clone(&self.shared), slot, ticket, name)
  }

  /// Runs `job` with no further interest in it: the slot frees itself.
  pub fn spawn_detached<N, F>(&self, name: N, job: F)
  where
    N: Into<Cow<'static, str>>,
    F: FnOnce(&Interrupt) + Send + 'static,
  {
    drop(self.create(name, job));
  }

  /// The pool/fork coordination lock.
  #[inline]
  pub fn fork_lock(&self) -> &Muto {
    &self.shared.fork_lock
  }

  #[inline]
  pub fn config(&self) -> &PoolConfig {
    &self.shared.config
  }

  /// Number of fixed slots.
  #[inline]
  pub fn capacity(&self) -> usize {
    self.shared.slots.len()
  }

  /// Number of claimed slots, overflow slots included.
  pub fn in_use(&self) -> usize {
    let fixed: usize = self
      .shared
      .slots
      .iter()
      .filter(|slot| slot.claim.is_claimed())
      .count();

    fixed + self.shared.overflow_live.load(Ordering::Acquire)
  }

  /// Number of host threads spawned so far.
  #[inline]
  pub fn threads_spawned(&self) -> usize {
    self.shared.spawned.load(Ordering::Relaxed)
  }

  /// Number of forced terminations so far.
  #[inline]
  pub fn terminations(&self) -> usize {
    self.shared.terminations.load(Ordering::Relaxed)
  }

  /// Returns the state of fixed slot `index`.
  pub fn slot_state(&self, index: usize) -> Option<SlotState> {
    self.shared.slots.get(index).map(|slot| slot.state())
  }

  fn spawn_backing(&self, slot: &Arc<Slot>) -> Arc<Backing> {
    // Spawning never races a fork.
    let _fence = self.shared.fork_lock.lock();

    let (send, recv): _ = mpsc::unbounded_channel();

    let backing: Arc<Backing> = Arc::new(Backing {
      jobs: send,
      exited: Event::manual(false),
      handle: Mutex::new(None),
    });

    let shared: Arc<Shared> = Arc::clone(&self.shared);
    let thread_slot: Arc<Slot> = Arc::clone(slot);
    let exited: Event = backing.exited.clone();

    let spawned: Result<JoinHandle<()>, _> = thread::Builder::new()
      .name(format!("posix-shim-worker-{}", slot.slot))
      .stack_size(self.shared.config.stack_size)
      .spawn(move || worker::run(shared, thread_slot, exited, recv));

    match spawned {
      Ok(handle) => *backing.handle.lock() = Some(handle),
      Err(error) => fatal!(error),
    }

    self.shared.spawned.fetch_add(1, Ordering::Relaxed);

    if !slot.slot.is_overflow() {
      *slot.backing.lock() = Some(Arc::clone(&backing));
    }

    debug!(target: "posix_shim", slot = %slot.slot, "pool thread spawned");

    backing
  }
}

impl Default for WorkerPool {
  fn default() -> Self {
    Self::new(POOL_SLOTS, PoolConfig::new())
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    // The slots own the only job senders. Dropping them closes every
    // channel, and each thread exits once its current job returns.
    for slot in self.shared.slots.iter() {
      drop(slot.backing.lock().take());
    }
  }
}

impl Debug for WorkerPool {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("WorkerPool")
      .field("capacity", &self.capacity())
      .field("in_use", &self.in_use())
      .field("threads_spawned", &self.threads_spawned())
      .field("terminations", &self.terminations())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
