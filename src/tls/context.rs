use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::borrow::Cow;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::consts::DEFAULT_LOCALE;
use crate::consts::DEFAULT_LOG_MASK;
use crate::error::Errno;
use crate::host::Event;
use crate::host::Region;
use crate::pool::SlotRef;
use crate::signal::Pending;
use crate::signal::SigInfo;
use crate::signal::SigSet;
use crate::signal::Signo;
use crate::tls::FaultScope;
use crate::tls::RecoveryStack;
use crate::utils::ThreadId;

// -----------------------------------------------------------------------------
// Reentrant State
// -----------------------------------------------------------------------------

/// Per-thread C-library state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reent {
  pub locale: Cow<'static, str>,
  pub log_mask: u32,
}

impl Default for Reent {
  fn default() -> Self {
    Self {
      locale: Cow::Borrowed(DEFAULT_LOCALE),
      log_mask: DEFAULT_LOG_MASK,
    }
  }
}

// -----------------------------------------------------------------------------
// Thread Init
// -----------------------------------------------------------------------------

/// Initial state of a new [`ThreadContext`].
#[derive(Clone, Debug, Default)]
pub struct ThreadInit {
  pub name: String,
  /// Emulated stack of the thread.
  pub stack: Region,
  pub sigmask: SigSet,
  pub reent: Reent,
  pub worker: Option<SlotRef>,
}

impl ThreadInit {
  pub fn new(name: impl Into<String>, stack: Region) -> Self {
    Self {
      name: name.into(),
      stack,
      ..Self::default()
    }
  }
}

// -----------------------------------------------------------------------------
// Thread Context
// -----------------------------------------------------------------------------

/// The per-thread control block.
///
/// Exactly one context exists per attached host thread. Its fields are
/// written by the owning thread, except for pending signals and the wake
/// events, which the signal thread of the process also touches.
pub struct ThreadContext {
  tid: ThreadId,
  name: String,
  errno: AtomicI32,
  sigmask: AtomicU64,
  /// Signals a `sigwait` caller is waiting for.
  sigwait: AtomicU64,
  pending: Mutex<Pending>,
  /// Auto-reset; set whenever a signal is queued for this thread.
  signal_arrived: Event,
  /// Manual-reset; set to abort interruptible waits.
  cancel: Event,
  recovery: Mutex<RecoveryStack>,
  reent: Mutex<Reent>,
  stack: Region,
  worker: Option<SlotRef>,
  handler_depth: AtomicU32,
}

impl ThreadContext {
  pub(crate) fn new(init: ThreadInit) -> Self {
    Self {
      tid: ThreadId::current(),
      name: init.name,
      errno: AtomicI32::new(0),
      sigmask: AtomicU64::new(init.sigmask.maskable().bits()),
      sigwait: AtomicU64::new(0),
      pending: Mutex::new(Pending::new()),
      signal_arrived: Event::auto(false),
      cancel: Event::manual(false),
      recovery: Mutex::new(RecoveryStack::new()),
      reent: Mutex::new(init.reent),
      stack: init.stack,
      worker: init.worker,
      handler_depth: AtomicU32::new(0),
    }
  }

  /// The host thread this context belongs to.
  #[inline]
  pub fn tid(&self) -> ThreadId {
    self.tid
  }

  #[inline]
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Returns `true` if the calling thread owns this context.
  #[inline]
  pub fn is_current(&self) -> bool {
    self.tid == ThreadId::current()
  }

  // ---------------------------------------------------------------------------
  // Saved Error
  // ---------------------------------------------------------------------------

  /// The error recorded by the last failing operation of this thread.
  pub fn errno(&self) -> Option<Errno> {
    Errno::from_raw(self.errno.load(Ordering::Relaxed))
  }

  pub fn set_errno(&self, errno: Errno) {
    self.errno.store(errno.raw(), Ordering::Relaxed);
  }

  pub fn clear_errno(&self) {
    self.errno.store(0, Ordering::Relaxed);
  }

  // ---------------------------------------------------------------------------
  // Signals
  // ---------------------------------------------------------------------------

  /// The set of signals blocked for this thread.
  #[inline]
  pub fn sigmask(&self) -> SigSet {
    SigSet::from_bits(self.sigmask.load(Ordering::Acquire))
  }

  /// Replaces the mask and returns the old one. Unmaskable signals are
  /// dropped from `mask`.
  pub(crate) fn swap_sigmask(&self, mask: SigSet) -> SigSet {
    SigSet::from_bits(self.sigmask.swap(mask.maskable().bits(), Ordering::AcqRel))
  }

  #[inline]
  pub(crate) fn sigwait_mask(&self) -> SigSet {
    SigSet::from_bits(self.sigwait.load(Ordering::Acquire))
  }

  #[inline]
  pub(crate) fn set_sigwait_mask(&self, set: SigSet) {
    self.sigwait.store(set.bits(), Ordering::Release);
  }

  /// Signals queued for this thread and not yet delivered.
  pub fn pending(&self) -> SigSet {
    self.pending.lock().set()
  }

  pub(crate) fn pending_mut(&self) -> MutexGuard<'_, Pending> {
    self.pending.lock()
  }

  /// Queues a signal for this thread and wakes it.
  pub(crate) fn post(&self, info: SigInfo) {
    self.pending.lock().push(info);
    self.signal_arrived.set();
  }

  /// Takes the next deliverable pending signal: one not in `mask`.
  pub(crate) fn take_deliverable(&self, mask: SigSet) -> Option<SigInfo> {
    self.pending.lock().take_first(SigSet::FULL.difference(mask))
  }

  pub(crate) fn discard_pending(&self, signo: Signo) -> bool {
    self.pending.lock().discard(signo)
  }

  #[inline]
  pub fn signal_arrived(&self) -> &Event {
    &self.signal_arrived
  }

  #[inline]
  pub fn cancel_event(&self) -> &Event {
    &self.cancel
  }

  /// Aborts the current and future interruptible waits of this thread.
  pub fn cancel(&self) {
    self.cancel.set();
  }

  /// Number of signal handlers currently running on this thread.
  #[inline]
  pub fn handler_depth(&self) -> u32 {
    self.handler_depth.load(Ordering::Relaxed)
  }

  pub(crate) fn enter_handler(&self) {
    self.handler_depth.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn leave_handler(&self) {
    self.handler_depth.fetch_sub(1, Ordering::Relaxed);
  }

  // ---------------------------------------------------------------------------
  // Fault Recovery
  // ---------------------------------------------------------------------------

  pub(crate) fn recovery(&self) -> MutexGuard<'_, RecoveryStack> {
    self.recovery.lock()
  }

  /// Pushes a recovery point reporting `errno` on a faulting access.
  pub fn fault_scope(&self, errno: Errno) -> FaultScope<'_> {
    FaultScope::new(self, errno)
  }

  /// Returns `true` while unwinding from a caught fault.
  pub fn in_exception(&self) -> bool {
    self.recovery.lock().in_exception()
  }

  /// Depth of the recovery-point stack.
  pub fn recovery_depth(&self) -> usize {
    self.recovery.lock().len()
  }

  // ---------------------------------------------------------------------------
  // Misc.
  // ---------------------------------------------------------------------------

  pub fn reent(&self) -> Reent {
    self.reent.lock().clone()
  }

  pub fn set_reent(&self, reent: Reent) {
    *self.reent.lock() = reent;
  }

  /// The emulated stack of this thread.
  #[inline]
  pub fn stack(&self) -> Region {
    self.stack
  }

  /// The worker slot this thread backs, if any.
  #[inline]
  pub fn worker(&self) -> Option<SlotRef> {
    self.worker
  }

  /// Clears the state a forked child must not carry over.
  pub(crate) fn reset_after_fork(&self) {
    self.recovery.lock().clear();
    self.cancel.reset();
    self.signal_arrived.reset();
    self.clear_errno();
    self.set_sigwait_mask(SigSet::EMPTY);
    self.handler_depth.store(0, Ordering::Relaxed);
  }
}

impl Debug for ThreadContext {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("ThreadContext")
      .field("tid", &self.tid)
      .field("name", &self.name)
      .field("sigmask", &self.sigmask())
      .field("pending", &self.pending())
      .field("stack", &self.stack)
      .field("worker", &self.worker)
      .finish_non_exhaustive()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::error::Errno;
  use crate::host::AddressSpace;
  use crate::host::MemoryFault;
  use crate::host::Region;
  use crate::signal::SiCode;
  use crate::signal::SigInfo;
  use crate::signal::SigSet;
  use crate::signal::Signo;
  use crate::tls::ThreadContext;
  use crate::tls::ThreadInit;

  fn context() -> ThreadContext {
    ThreadContext::new(ThreadInit::new("test", Region::new(0x1000, 0x100)))
  }

  #[test]
  fn test_fault_scope_reports_errno() {
    let ctx: ThreadContext = context();
    let memory: AddressSpace = AddressSpace::new();

    memory.map(Region::new(0x2000, 0x10)).unwrap();

    {
      let mut scope = ctx.fault_scope(Errno::EFAULT);

      assert_eq!(scope.probe(|| memory.read_vec(0x2000, 4)), Ok(vec![0; 4]));
      assert!(!scope.faulted());
      assert_eq!(scope.probe(|| memory.read_vec(0x3000, 4)), Err(Errno::EFAULT));
      assert!(scope.faulted());
      assert!(ctx.in_exception());
    }

    assert_eq!(ctx.errno(), Some(Errno::EFAULT));
    assert_eq!(ctx.recovery_depth(), 0);
    assert!(!ctx.in_exception());
  }

  #[test]
  fn test_fault_scope_catches_raised_fault() {
    let ctx: ThreadContext = context();
    let mut scope = ctx.fault_scope(Errno::EINVAL);

    let result: Result<(), Errno> = scope.probe(|| MemoryFault { addr: 0, len: 1 }.raise());

    assert_eq!(result, Err(Errno::EINVAL));
  }

  #[test]
  fn test_nested_scopes() {
    let ctx: ThreadContext = context();
    let _outer = ctx.fault_scope(Errno::EFAULT);

    {
      let _inner = ctx.fault_scope(Errno::EINVAL);
      assert_eq!(ctx.recovery_depth(), 2);
    }

    assert_eq!(ctx.recovery_depth(), 1);
  }

  #[test]
  fn test_mask_drops_unmaskable() {
    let ctx: ThreadContext = context();

    ctx.swap_sigmask(SigSet::FULL);

    assert!(!ctx.sigmask().contains(Signo::SIGKILL));
    assert!(!ctx.sigmask().contains(Signo::SIGCONT));
    assert!(ctx.sigmask().contains(Signo::SIGUSR1));
  }

  #[test]
  fn test_take_deliverable_skips_masked() {
    let ctx: ThreadContext = context();

    ctx.post(SigInfo::new(Signo::SIGUSR1, SiCode::User, 1));

    assert!(ctx.signal_arrived().is_set());
    assert_eq!(ctx.take_deliverable(SigSet::EMPTY.with(Signo::SIGUSR1)), None);
    assert!(ctx.pending().contains(Signo::SIGUSR1));
    assert!(ctx.take_deliverable(SigSet::EMPTY).is_some());
  }
}
