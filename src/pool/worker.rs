use std::borrow::Cow;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use triomphe::Arc;

use crate::error::Errno;
use crate::host::Event;
use crate::pool::Backing;
use crate::pool::Shared;
use crate::pool::Slot;
use crate::pool::SlotRef;
use crate::pool::SlotState;
use crate::sync::ClaimFlag;
use crate::sync::Rendezvous;
use crate::utils::panic_message;

/// A unit of blocking work run on a pool thread.
pub type Job = Box<dyn FnOnce(&Interrupt) + Send + 'static>;

// -----------------------------------------------------------------------------
// Interrupt
// -----------------------------------------------------------------------------

/// Cancellation token handed to every job.
///
/// Set when the job is forcibly terminated. A job that blocks should wait
/// on [`event`] alongside its own wait object and bail out once it fires.
///
/// [`event`]: Self::event
#[derive(Clone)]
pub struct Interrupt {
  event: Event,
}

impl Interrupt {
  pub(crate) fn new() -> Self {
    Self {
      event: Event::manual(false),
    }
  }

  #[inline]
  pub fn is_set(&self) -> bool {
    self.event.is_set()
  }

  /// Sleeps until interrupted or `timeout` elapses. Returns `true` if
  /// interrupted.
  #[inline]
  pub fn wait(&self, timeout: Option<Duration>) -> bool {
    self.event.wait(timeout)
  }

  #[inline]
  pub fn event(&self) -> &Event {
    &self.event
  }

  pub(crate) fn trigger(&self) {
    self.event.set();
  }
}

impl Debug for Interrupt {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_tuple("Interrupt").field(&self.is_set()).finish()
  }
}

// -----------------------------------------------------------------------------
// Ticket
// -----------------------------------------------------------------------------

/// Shared state of one job between its owner and the pool thread.
pub(crate) struct Ticket {
  /// Manual-reset; set once the job returned.
  pub(crate) done: Event,
  /// Claimed by whoever decides the job's fate first: the pool thread on
  /// completion, or the owner on forced termination.
  pub(crate) settle: ClaimFlag,
  /// The second of owner and pool thread to arrive frees the slot.
  pub(crate) rendezvous: Rendezvous,
  pub(crate) interrupt: Interrupt,
}

impl Ticket {
  pub(crate) fn new() -> Self {
    Self {
      done: Event::manual(false),
      settle: ClaimFlag::new(),
      rendezvous: Rendezvous::new(),
      interrupt: Interrupt::new(),
    }
  }
}

/// A job together with its ticket, as sent to a pool thread.
pub(crate) struct Task {
  pub(crate) job: Job,
  pub(crate) ticket: Arc<Ticket>,
}

// -----------------------------------------------------------------------------
// Pool Thread
// -----------------------------------------------------------------------------

/// Entry point of a pool thread.
///
/// Runs jobs until its job channel closes. Overflow threads run exactly one.
///
/// The thread holds the receiving end only, so dropping the slot's
/// [`Backing`] ends the loop once the current job returns.
pub(crate) fn run(shared: Arc<Shared>, slot: Arc<Slot>, exited: Event, mut jobs: UnboundedReceiver<Task>) {
  let this: SlotRef = slot.slot;

  if let Some(hook) = shared.config.on_thread_start.as_ref() {
    hook(this);
  }

  debug!(target: "posix_shim", %this, "pool thread started");

  while let Some(Task { job, ticket }) = jobs.blocking_recv() {
    // Terminated before it ever ran.
    if ticket.settle.is_claimed() {
      break;
    }

    slot.transition(SlotState::Claimed, SlotState::Running);

    trace!(target: "posix_shim", %this, tag = %slot.tag(), "job started");

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&ticket.interrupt))) {
      warn!(
        target: "posix_shim",
        %this,
        panic = panic_message(&*payload),
        "job panicked",
      );
    }

    // The owner terminated this job; the slot is no longer ours.
    if !ticket.settle.try_claim() {
      break;
    }

    slot.transition(SlotState::Running, SlotState::AwaitingReuse);

    trace!(target: "posix_shim", %this, "job done");

    // Arrive first: an owner woken by `done` must find the slot settled.
    if ticket.rendezvous.arrive() {
      shared.release(&slot);
    }

    ticket.done.set();

    if this.is_overflow() {
      break;
    }
  }

  debug!(target: "posix_shim", %this, "pool thread exiting");

  exited.set();
}

// -----------------------------------------------------------------------------
// Worker
// -----------------------------------------------------------------------------

/// How [`Worker::detach`] ended.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Detach {
  /// The job finished before the extra handle fired.
  Completed,
  /// The extra handle fired, but the job finished within the grace period.
  CompletedInGrace,
  /// The job was forcibly terminated.
  Terminated,
}

/// Owner handle of a job running on a pool slot.
///
/// Dropping the handle without detaching signals "no further interest": the
/// slot frees itself once the job returns.
pub struct Worker {
  shared: Arc<Shared>,
  slot: Arc<Slot>,
  ticket: Arc<Ticket>,
  name: Cow<'static, str>,
  detached: bool,
}

impl Worker {
  pub(crate) fn new(shared: Arc<Shared>, slot: Arc<Slot>, ticket: Arc<Ticket>, name: Cow<'static, str>) -> Self {
    Self {
      shared,
      slot,
      ticket,
      name,
      detached: false,
    }
  }

  #[inline]
  pub fn name(&self) -> &str {
    &self.name
  }

  #[inline]
  pub fn slot(&self) -> SlotRef {
    self.slot.slot
  }

  /// Returns `true` once the job has returned.
  #[inline]
  pub fn is_done(&self) -> bool {
    self.ticket.done.is_set()
  }

  /// The interrupt token of the job.
  #[inline]
  pub fn interrupt(&self) -> &Interrupt {
    &self.ticket.interrupt
  }

  /// Waits for the job to finish.
  ///
  /// With an `extra` handle the wait is two-phase: if `extra` fires first the
  /// job gets the pool's grace period to finish on its own, after which it
  /// is terminated. A second call fails with `EINVAL`.
  pub fn detach(&mut self, extra: Option<&Event>) -> Result<Detach, Errno> {
    if self.detached {
      return Err(Errno::EINVAL);
    }

    self.detached = true;

    let Some(extra) = extra else {
      self.ticket.done.wait(None);
      self.arrive();
      return Ok(Detach::Completed);
    };

    if Event::wait_any(&[&self.ticket.done, extra], None) == Some(0) {
      self.arrive();
      return Ok(Detach::Completed);
    }

    let grace: Duration = self.shared.config.detach_grace;

    trace!(target: "posix_shim", name = %self.name, ?grace, "extra handle fired");

    if self.ticket.done.wait(Some(grace)) {
      self.arrive();
      return Ok(Detach::CompletedInGrace);
    }

    if self.terminate() {
      Ok(Detach::Terminated)
    } else {
      // The job settled between the grace timeout and the termination.
      self.ticket.done.wait(None);
      self.arrive();
      Ok(Detach::CompletedInGrace)
    }
  }

  /// Forcibly ends the job.
  ///
  /// Returns `Ok(false)` if the job had already finished. The job only
  /// observes its [`Interrupt`]; any state it was updating must be treated
  /// as possibly inconsistent.
  pub fn terminate_thread(&mut self) -> Result<bool, Errno> {
    if self.detached {
      return Err(Errno::EINVAL);
    }

    self.detached = true;

    if self.terminate() {
      Ok(true)
    } else {
      self.ticket.done.wait(None);
      self.arrive();
      Ok(false)
    }
  }

  fn arrive(&self) {
    if self.ticket.rendezvous.arrive() {
      self.shared.release(&self.slot);
    }
  }

  fn terminate(&self) -> bool {
    // Fences against a concurrent fork or thread spawn.
    let _fence = self.shared.fork_lock.lock();

    if !self.ticket.settle.try_claim() {
      return false;
    }

    let this: SlotRef = self.slot.slot;

    self.slot.set_state(SlotState::Terminating);
    self.ticket.interrupt.trigger();

    // Closing the job channel makes the thread exit once the job returns.
    let backing: Option<Arc<Backing>> = self.slot.backing.lock().take();
    let timeout: Duration = self.shared.config.terminate_join_timeout;

    let joined: bool = match backing {
      Some(backing) if backing.exited.wait(Some(timeout)) => {
        backing.handle.lock().take().map(|handle| handle.join()).is_some()
      }
      Some(backing) => {
        // Leave the thread to finish on its own.
        drop(backing.handle.lock().take());
        false
      }
      None => false,
    };

    self.shared.count_termination();

    warn!(
      target: "posix_shim",
      %this,
      name = %self.name,
      joined,
      "worker thread terminated",
    );

    self.shared.release(&self.slot);

    true
  }
}

impl Drop for Worker {
  fn drop(&mut self) {
    if !self.detached {
      self.detached = true;
      self.arrive();
    }
  }
}

impl Debug for Worker {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Worker")
      .field("name", &self.name)
      .field("slot", &self.slot.slot)
      .field("done", &self.is_done())
      .field("detached", &self.detached)
      .finish()
  }
}
