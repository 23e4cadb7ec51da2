use std::sync::Arc as StdArc;
use std::time::Duration;
use std::time::Instant;
use tracing::trace;

use crate::host::Event;
use crate::proc::Process;
use crate::signal::Handler;
use crate::signal::SaFlags;
use crate::signal::SigAction;
use crate::signal::SigInfo;
use crate::signal::SigSet;
use crate::signal::sigthread;
use crate::tls::ThreadContext;
use crate::utils::deadline;
use crate::utils::remaining;

// -----------------------------------------------------------------------------
// Wakeup
// -----------------------------------------------------------------------------

/// Why a [`cancelable_wait`] returned.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Wakeup {
  /// The handle at this index was signalled.
  Object(usize),
  /// A signal handler ran that does not restart interrupted waits.
  Signalled,
  /// The thread's cancel event fired.
  Cancelled,
  Timeout,
}

/// Outcome of one [`dispatch_pending`] round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Dispatched {
  /// Number of handlers run.
  pub(crate) ran: u32,
  /// Set if any handler lacked `SA_RESTART`.
  pub(crate) interrupts: bool,
}

// -----------------------------------------------------------------------------
// Handler Frame
// -----------------------------------------------------------------------------

/// Restores the mask in effect before a handler, even if it unwinds.
struct HandlerFrame<'a> {
  ctx: &'a ThreadContext,
  saved: SigSet,
}

impl<'a> HandlerFrame<'a> {
  fn enter(ctx: &'a ThreadContext, action: &SigAction, info: &SigInfo) -> Self {
    let mut mask: SigSet = ctx.sigmask().union(action.mask);

    if !action.flags.contains(SaFlags::NODEFER) {
      mask.insert(info.signo);
    }

    let saved: SigSet = ctx.swap_sigmask(mask);

    ctx.enter_handler();

    Self { ctx, saved }
  }
}

impl Drop for HandlerFrame<'_> {
  fn drop(&mut self) {
    self.ctx.leave_handler();
    self.ctx.swap_sigmask(self.saved);
  }
}

// -----------------------------------------------------------------------------
// Dispatch
// -----------------------------------------------------------------------------

/// Runs the handlers of every deliverable signal pending on `ctx`.
///
/// Must run on the thread owning `ctx`. A signal raised by a handler is
/// picked up by this same loop once it is no longer blocked, so signals
/// blocked by the running handler wait for it to return.
pub(crate) fn dispatch_pending(process: &StdArc<Process>, ctx: &ThreadContext) -> Dispatched {
  debug_assert!(ctx.is_current());

  let mut outcome: Dispatched = Dispatched::default();

  while let Some(info) = ctx.take_deliverable(ctx.sigmask()) {
    let action: SigAction = process.signals().dispositions().get(info.signo);

    let handler = match action.handler {
      Handler::Catch(ref handler) => StdArc::clone(handler),
      // The disposition changed after the signal was queued.
      Handler::Ignore => continue,
      Handler::Default => {
        sigthread::apply_default(process, info);
        continue;
      }
    };

    if action.flags.contains(SaFlags::RESETHAND) {
      process.signals().dispositions().reset(info.signo);
    }

    trace!(
      target: "posix_shim",
      signo = %info.signo,
      tid = %ctx.tid(),
      depth = ctx.handler_depth(),
      "running handler",
    );

    {
      let _frame: HandlerFrame<'_> = HandlerFrame::enter(ctx, &action, &info);
      handler(&info);
    }

    outcome.ran += 1;
    outcome.interrupts |= !action.flags.contains(SaFlags::RESTART);
  }

  outcome
}

// -----------------------------------------------------------------------------
// Cancelable Wait
// -----------------------------------------------------------------------------

/// Waits on `handles`, running signal handlers as signals arrive.
///
/// A wake for a signal the thread blocks goes back to sleep. After handlers
/// that all carry `SA_RESTART` the wait continues; otherwise it returns
/// [`Wakeup::Signalled`]. While the process is stopped the thread stays
/// parked until it is continued.
pub fn cancelable_wait(
  process: &StdArc<Process>,
  ctx: &ThreadContext,
  handles: &[&Event],
  timeout: Option<Duration>,
) -> Wakeup {
  let deadline: Option<Instant> = deadline(timeout);

  let mut events: Vec<&Event> = Vec::with_capacity(handles.len() + 2);
  events.extend_from_slice(handles);
  events.push(ctx.signal_arrived());
  events.push(ctx.cancel_event());

  let signal: usize = handles.len();

  // Signals queued before the wait began.
  if ctx.pending().difference(ctx.sigmask()) != SigSet::EMPTY {
    ctx.signal_arrived().set();
  }

  loop {
    match Event::wait_any(&events, remaining(deadline)) {
      Some(index) if index < signal => return Wakeup::Object(index),
      Some(index) if index == signal => {
        if !process.wait_while_stopped(ctx) {
          return Wakeup::Cancelled;
        }

        let outcome: Dispatched = dispatch_pending(process, ctx);

        if outcome.ran == 0 {
          // Masked, or already taken: sleep again.
          continue;
        }

        if outcome.interrupts {
          return Wakeup::Signalled;
        }
      }
      Some(_) => return Wakeup::Cancelled,
      None => return Wakeup::Timeout,
    }
  }
}
