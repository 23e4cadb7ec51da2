//! The per-process signal thread.
//!
//! Every signal aimed at a process goes through this thread: it applies
//! default actions, picks the thread that runs a handler and queues signals
//! nobody can take yet. Hold and flush requests arrive through the same
//! queue, so they are ordered with respect to ordinary signals.

use std::sync::Arc as StdArc;
use std::sync::Weak;
use tracing::Level;
use tracing::Span;
use tracing::debug;
use tracing::span;
use tracing::trace;
use triomphe::Arc;

use crate::proc::ExitStatus;
use crate::proc::Process;
use crate::signal::DefaultAction;
use crate::signal::Handler;
use crate::signal::PacketRecv;
use crate::signal::SigAction;
use crate::signal::SigInfo;
use crate::signal::SigSet;
use crate::signal::SignalPacket;
use crate::signal::Signo;
use crate::tls::ThreadContext;

/// Signals accepted while held, in arrival order.
type Deferred = Vec<(SigInfo, Option<Arc<ThreadContext>>)>;

pub(crate) fn run(process: Weak<Process>, mut recv: PacketRecv) {
  let span: Span = match process.upgrade() {
    Some(process) => {
      process.signals().mark_signal_thread();
      span!(target: "posix_shim", Level::DEBUG, "sigthread", pid = process.pid())
    }
    None => return,
  };

  debug!(target: "posix_shim", parent: &span, "running");

  let mut deferred: Deferred = Vec::new();

  while let Some(packet) = recv.blocking_recv() {
    let Some(process) = process.upgrade() else {
      packet.complete();
      break;
    };

    trace!(target: "posix_shim", parent: &span, ?packet, "packet received");

    if packet.info.signo == Signo::EXIT {
      packet.complete();
      break;
    }

    handle(&process, &packet, &mut deferred);
    packet.complete();
  }

  // Release every sender still waiting.
  while let Ok(packet) = recv.try_recv() {
    packet.complete();
  }

  debug!(target: "posix_shim", parent: &span, "exiting");
}

fn handle(process: &StdArc<Process>, packet: &SignalPacket, deferred: &mut Deferred) {
  let signals = process.signals();

  match packet.info.signo {
    Signo::HOLD => {
      signals.enter_hold();
    }
    Signo::NOHOLD => {
      if signals.leave_hold() == 0 {
        for (info, target) in deferred.drain(..) {
          deliver(process, info, target.as_ref());
        }

        flush(process, None, None);
      }
    }
    Signo::FLUSH => {
      if !signals.is_held() {
        flush(process, packet.target.as_ref(), packet.mask);
      }
    }
    _ if signals.is_held() && packet.info.signo != Signo::SIGKILL => match packet.target.as_ref() {
      Some(target) => deferred.push((packet.info, Some(Arc::clone(target)))),
      None => {
        signals.pending_mut().push(packet.info);
      }
    },
    _ => deliver(process, packet.info, packet.target.as_ref()),
  }
}

/// Re-routes every process-pending signal.
///
/// `prefer` is tried first, with `mask` standing in for its signal mask
/// when given.
fn flush(process: &StdArc<Process>, prefer: Option<&Arc<ThreadContext>>, mask: Option<SigSet>) {
  let pending: Vec<SigInfo> = process.signals().pending_mut().drain();

  for info in pending {
    if !route(process, info, prefer, mask) {
      process.signals().pending_mut().push(info);
    }
  }
}

/// Delivers one signal generated for `process`, or for `target` only.
pub(crate) fn deliver(process: &StdArc<Process>, info: SigInfo, target: Option<&Arc<ThreadContext>>) {
  let signo: Signo = info.signo;

  if signo == Signo::SIGKILL {
    process.exit(ExitStatus::Signalled(signo));
    return;
  }

  if signo == Signo::SIGCONT {
    discard_everywhere(process, |signo| signo.is_stop());
    process.resume();
  } else if signo.is_stop() {
    discard_everywhere(process, |signo| signo == Signo::SIGCONT);
  }

  match target {
    // A thread-directed signal never moves to another thread. While the
    // target masks it, it waits in the target's pending set, whatever the
    // handler; the target applies it once unmasked.
    Some(target) => {
      let action: SigAction = process.signals().dispositions().get(signo);

      if action.ignores(signo) {
        trace!(target: "posix_shim", %signo, "ignored");
      } else if target.sigmask().contains(signo) {
        trace!(target: "posix_shim", %signo, tid = %target.tid(), "masked, pending on thread");
        target.post(info);
      } else if let Handler::Catch(_) = action.handler {
        target.post(info);
      } else {
        apply_default(process, info);
      }
    }
    None => {
      if !route(process, info, None, None) {
        process.signals().pending_mut().push(info);
      }
    }
  }
}

/// Hands a process-directed signal to a thread. Returns `false` if every
/// thread blocks it.
fn route(
  process: &StdArc<Process>,
  info: SigInfo,
  prefer: Option<&Arc<ThreadContext>>,
  mask: Option<SigSet>,
) -> bool {
  let signo: Signo = info.signo;

  // A thread in `sigwait` for this signal takes it before any handler.
  if let Some(waiter) = process
    .threads()
    .find(|ctx| ctx.sigwait_mask().contains(signo))
  {
    waiter.post(info);
    return true;
  }

  let action: SigAction = process.signals().dispositions().get(signo);

  if action.ignores(signo) {
    trace!(target: "posix_shim", %signo, "ignored");
    return true;
  }

  let preferred: Option<Arc<ThreadContext>> = prefer
    .filter(|ctx| !mask.unwrap_or_else(|| ctx.sigmask()).contains(signo))
    .cloned();

  let chosen: Option<Arc<ThreadContext>> = preferred.or_else(|| {
    process
      .threads()
      .find(|ctx| ctx.worker().is_none() && !ctx.sigmask().contains(signo))
  });

  let Some(chosen) = chosen else {
    trace!(target: "posix_shim", %signo, "blocked everywhere, pending");
    return false;
  };

  match action.handler {
    Handler::Catch(_) => {
      trace!(target: "posix_shim", %signo, tid = %chosen.tid(), "posted");
      chosen.post(info);
    }
    Handler::Default | Handler::Ignore => apply_default(process, info),
  }

  true
}

/// Applies the default action of `info.signo` to the whole process.
pub(crate) fn apply_default(process: &StdArc<Process>, info: SigInfo) {
  match info.signo.default_action() {
    DefaultAction::Terminate | DefaultAction::Core => {
      process.exit(ExitStatus::Signalled(info.signo));
    }
    DefaultAction::Stop => {
      process.stop(info.signo);
    }
    DefaultAction::Continue | DefaultAction::Ignore => {}
  }
}

fn discard_everywhere<F>(process: &StdArc<Process>, predicate: F)
where
  F: Fn(Signo) -> bool,
{
  let matching: Vec<Signo> = SigSet::FULL.iter().filter(|signo| predicate(*signo)).collect();

  for signo in matching {
    process.signals().pending_mut().discard(signo);

    for ctx in process.threads().snapshot() {
      ctx.discard_pending(signo);
    }
  }
}
