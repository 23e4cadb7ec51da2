//! Per-thread context blocks.
//!
//! Every host thread that runs emulated code carries one [`ThreadContext`]:
//! its signal mask, pending signals, saved error code and recovery stack.
//! The block is reached through a thread-local and is linked into the
//! [`ThreadList`] of the owning process while the thread is attached.
//!
//! # Contents
//!
//! - [`init`] / [`remove`]: attach and detach the calling thread
//! - [`current`] / [`current_process`]: look up the calling thread's state
//! - [`FaultScope`]: scoped recovery point for faulting memory accesses

mod context;
mod list;
mod recovery;

pub use self::context::Reent;
pub use self::context::ThreadContext;
pub use self::context::ThreadInit;
pub use self::list::ListKey;
pub use self::list::ThreadList;
pub use self::recovery::FaultScope;
pub use self::recovery::RecoveryPoint;
pub use self::recovery::RecoveryStack;

use std::cell::RefCell;
use std::sync::Arc as StdArc;
use std::sync::Weak;
use tracing::trace;
use triomphe::Arc;

use crate::proc::Process;
use crate::signal::SigSet;

thread_local! {
  static CURRENT: RefCell<Option<Attached>> = const { RefCell::new(None) };
}

/// The attachment of one host thread to a process.
struct Attached {
  ctx: Arc<ThreadContext>,
  process: Weak<Process>,
  key: ListKey,
}

impl Drop for Attached {
  fn drop(&mut self) {
    if let Some(process) = self.process.upgrade() {
      process.threads().remove(self.key);
    }

    trace!(target: "posix_shim", tid = %self.ctx.tid(), "thread context removed");
  }
}

/// Attaches the calling thread to `process`.
///
/// With `is_new_thread` unset the thread is being re-armed (the first thread
/// of a freshly forked child, or a thread that switches processes): the new
/// block inherits the signal mask of the block it replaces.
pub fn init(process: &StdArc<Process>, init: ThreadInit, is_new_thread: bool) -> Arc<ThreadContext> {
  let previous: Option<Attached> = CURRENT.with_borrow_mut(Option::take);

  let init: ThreadInit = match previous.as_ref() {
    Some(attached) if !is_new_thread => ThreadInit {
      sigmask: attached.ctx.sigmask(),
      ..init
    },
    _ => init,
  };

  // Unlink the old block before the new one appears in any list.
  drop(previous);

  let ctx: Arc<ThreadContext> = Arc::new(ThreadContext::new(init));
  let key: ListKey = process.threads().insert(Arc::clone(&ctx));

  trace!(
    target: "posix_shim",
    tid = %ctx.tid(),
    pid = process.pid(),
    name = ctx.name(),
    is_new_thread,
    "thread context attached",
  );

  CURRENT.with_borrow_mut(|current| {
    *current = Some(Attached {
      ctx: Arc::clone(&ctx),
      process: StdArc::downgrade(process),
      key,
    });
  });

  ctx
}

/// Detaches the calling thread from its process.
pub fn remove() {
  // `try_with` so this is safe to call from other thread-local destructors.
  let _ignore = CURRENT.try_with(|current| drop(current.borrow_mut().take()));
}

/// Returns the context of the calling thread.
pub fn current() -> Option<Arc<ThreadContext>> {
  CURRENT
    .try_with(|current| current.borrow().as_ref().map(|attached| Arc::clone(&attached.ctx)))
    .ok()
    .flatten()
}

/// Returns the process the calling thread is attached to.
pub fn current_process() -> Option<StdArc<Process>> {
  CURRENT
    .try_with(|current| current.borrow().as_ref().and_then(|attached| attached.process.upgrade()))
    .ok()
    .flatten()
}

/// Returns the signal mask of the calling thread, or the empty set for an
/// unattached thread.
pub(crate) fn current_mask() -> SigSet {
  current().map_or(SigSet::EMPTY, |ctx| ctx.sigmask())
}
