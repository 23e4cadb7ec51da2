//! POSIX-shaped signal entry points.

use std::sync::Arc as StdArc;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::trace;
use triomphe::Arc;

use crate::error::Errno;
use crate::host::Event;
use crate::proc::Pid;
use crate::proc::Process;
use crate::proc::ProcessTable;
use crate::signal::Dispatched;
use crate::signal::SiCode;
use crate::signal::SigAction;
use crate::signal::SigHow;
use crate::signal::SigInfo;
use crate::signal::SigSet;
use crate::signal::SignalPacket;
use crate::signal::Signo;
use crate::signal::Wakeup;
use crate::signal::cancelable_wait;
use crate::signal::dispatch_pending;
use crate::tls;
use crate::tls::ThreadContext;
use crate::utils::deadline;
use crate::utils::remaining;

/// Saves `errno` in the calling thread's error slot.
fn record(errno: Errno) -> Errno {
  if let Some(ctx) = tls::current() {
    ctx.set_errno(errno);
  }

  errno
}

impl Process {
  /// The context of the calling thread, which must belong to this process.
  pub fn current_context(self: &StdArc<Self>) -> Result<Arc<ThreadContext>, Errno> {
    match (tls::current(), tls::current_process()) {
      (Some(ctx), Some(process)) if StdArc::ptr_eq(&process, self) => Ok(ctx),
      _ => Err(Errno::ESRCH),
    }
  }

  // ---------------------------------------------------------------------------
  // Generation
  // ---------------------------------------------------------------------------

  /// Sends signal `sig` to process `pid`.
  ///
  /// Signal 0 only checks that `pid` exists. A signal sent to the calling
  /// process runs any handler it triggers for the caller before returning.
  pub fn kill(self: &StdArc<Self>, pid: Pid, sig: i32) -> Result<(), Errno> {
    let signo: Option<Signo> = match sig {
      0 => None,
      raw => Some(Signo::new(raw).map_err(record)?),
    };

    let target: StdArc<Self> = ProcessTable::global()
      .get(pid)
      .filter(|process| !process.state().is_exited())
      .ok_or_else(|| record(Errno::ESRCH))?;

    let Some(signo) = signo else {
      return Ok(());
    };

    debug!(target: "posix_shim", from = self.pid(), to = pid, %signo, "kill");

    let info: SigInfo = SigInfo::new(signo, SiCode::User, self.pid());

    target
      .signals()
      .send(SignalPacket::new(info), true)
      .map_err(record)?;

    if StdArc::ptr_eq(&target, self) {
      self.dispatch_signals();
    }

    Ok(())
  }

  /// Sends `sig` to one thread of this process.
  pub fn thread_kill(self: &StdArc<Self>, ctx: &Arc<ThreadContext>, sig: i32) -> Result<(), Errno> {
    let signo: Signo = Signo::new(sig).map_err(record)?;

    if self.threads().find(|other| Arc::ptr_eq(other, ctx)).is_none() {
      return Err(record(Errno::ESRCH));
    }

    trace!(target: "posix_shim", pid = self.pid(), tid = %ctx.tid(), %signo, "thread kill");

    let packet: SignalPacket = SignalPacket {
      target: Some(Arc::clone(ctx)),
      ..SignalPacket::new(SigInfo::new(signo, SiCode::Thread, self.pid()))
    };

    self.signals().send(packet, true).map_err(record)?;

    if ctx.is_current() {
      dispatch_pending(self, ctx);
    }

    Ok(())
  }

  /// Sends `sig` to the calling thread.
  pub fn raise(self: &StdArc<Self>, sig: i32) -> Result<(), Errno> {
    let ctx: Arc<ThreadContext> = self.current_context().map_err(record)?;
    self.thread_kill(&ctx, sig)
  }

  // ---------------------------------------------------------------------------
  // Dispositions
  // ---------------------------------------------------------------------------

  /// Reads, and optionally replaces, the action of `sig`.
  ///
  /// Installing an action that ignores the signal discards its pending
  /// instances.
  pub fn sigaction(&self, sig: i32, action: Option<SigAction>) -> Result<SigAction, Errno> {
    let signo: Signo = Signo::new(sig).map_err(record)?;

    let Some(action) = action else {
      return Ok(self.signals().dispositions().get(signo));
    };

    let ignores: bool = action.ignores(signo);
    let previous: SigAction = self.signals().dispositions().set(signo, action).map_err(record)?;

    if ignores {
      self.signals().pending_mut().discard(signo);

      for ctx in self.threads().snapshot() {
        ctx.discard_pending(signo);
      }
    }

    Ok(previous)
  }

  // ---------------------------------------------------------------------------
  // Masks
  // ---------------------------------------------------------------------------

  /// Examines and changes the signal mask of the calling thread.
  ///
  /// Returns the previous mask. Signals unblocked by the change are
  /// delivered, and their handlers run, before this returns.
  pub fn sigprocmask(self: &StdArc<Self>, how: SigHow, set: Option<SigSet>) -> Result<SigSet, Errno> {
    let ctx: Arc<ThreadContext> = self.current_context().map_err(record)?;
    let old: SigSet = ctx.sigmask();

    let Some(set) = set else {
      return Ok(old);
    };

    let new: SigSet = match how {
      SigHow::Block => old.union(set),
      SigHow::Unblock => old.difference(set),
      SigHow::SetMask => set,
    };

    ctx.swap_sigmask(new);

    if !old.difference(ctx.sigmask()).is_empty() {
      if !self.signals().pending().is_empty() {
        self.request_flush(&ctx, None);
      }

      dispatch_pending(self, &ctx);
    }

    Ok(old)
  }

  /// The blocked signals pending on the calling thread or the process.
  pub fn sigpending(self: &StdArc<Self>) -> Result<SigSet, Errno> {
    let ctx: Arc<ThreadContext> = self.current_context().map_err(record)?;

    Ok(
      ctx
        .pending()
        .union(self.signals().pending())
        .intersection(ctx.sigmask()),
    )
  }

  /// Replaces the mask with `mask` and waits for a handler to run.
  ///
  /// Like its POSIX namesake this always fails: with `EINTR` once a handler
  /// ran or the thread was cancelled, or with `ETIMEDOUT`. The previous
  /// mask is restored before returning.
  pub fn sigsuspend(self: &StdArc<Self>, mask: SigSet, timeout: Option<Duration>) -> Errno {
    let ctx: Arc<ThreadContext> = match self.current_context() {
      Ok(ctx) => ctx,
      Err(errno) => return record(errno),
    };

    let saved: SigSet = ctx.swap_sigmask(mask);

    if !self.signals().pending().is_empty() {
      self.request_flush(&ctx, Some(ctx.sigmask()));
    }

    if !ctx.pending().difference(ctx.sigmask()).is_empty() {
      ctx.signal_arrived().set();
    }

    let deadline: Option<Instant> = deadline(timeout);
    let events: [&Event; 2] = [ctx.signal_arrived(), ctx.cancel_event()];

    let errno: Errno = loop {
      match Event::wait_any(&events, remaining(deadline)) {
        Some(0) => {
          if !self.wait_while_stopped(&ctx) {
            break Errno::EINTR;
          }

          let outcome: Dispatched = dispatch_pending(self, &ctx);

          if outcome.ran > 0 {
            break Errno::EINTR;
          }
        }
        Some(_) => break Errno::EINTR,
        None => break Errno::ETIMEDOUT,
      }
    };

    ctx.swap_sigmask(saved);

    // Anything the restored mask no longer blocks.
    dispatch_pending(self, &ctx);

    record(errno)
  }

  /// Waits for one of the signals in `set` and takes it without running a
  /// handler.
  ///
  /// Fails with `EAGAIN` on timeout and `EINTR` if the thread is cancelled.
  pub fn sigwait(self: &StdArc<Self>, set: SigSet, timeout: Option<Duration>) -> Result<SigInfo, Errno> {
    let ctx: Arc<ThreadContext> = self.current_context().map_err(record)?;
    let set: SigSet = set.maskable();

    if set.is_empty() {
      return Err(record(Errno::EINVAL));
    }

    ctx.set_sigwait_mask(set);

    let deadline: Option<Instant> = deadline(timeout);
    let events: [&Event; 2] = [ctx.signal_arrived(), ctx.cancel_event()];

    let result: Result<SigInfo, Errno> = loop {
      if let Some(info) = ctx.pending_mut().take_first(set) {
        break Ok(info);
      }

      if let Some(info) = self.signals().pending_mut().take_first(set) {
        break Ok(info);
      }

      // Other signals still run their handlers.
      dispatch_pending(self, &ctx);

      match Event::wait_any(&events, remaining(deadline)) {
        Some(0) => continue,
        Some(_) => break Err(Errno::EINTR),
        None => break Err(Errno::EAGAIN),
      }
    };

    ctx.set_sigwait_mask(SigSet::EMPTY);

    if let Ok(info) = result.as_ref() {
      trace!(target: "posix_shim", tid = %ctx.tid(), signo = %info.signo, "sigwait taken");
    }

    result.map_err(record)
  }

  // ---------------------------------------------------------------------------
  // Interruption Points
  // ---------------------------------------------------------------------------

  /// Runs the handlers of every signal deliverable to the calling thread.
  ///
  /// Returns the number of handlers run.
  pub fn dispatch_signals(self: &StdArc<Self>) -> u32 {
    match self.current_context() {
      Ok(ctx) => dispatch_pending(self, &ctx).ran,
      Err(_) => 0,
    }
  }

  /// [`cancelable_wait`] for the calling thread.
  pub fn wait_interruptible(
    self: &StdArc<Self>,
    handles: &[&Event],
    timeout: Option<Duration>,
  ) -> Result<Wakeup, Errno> {
    let ctx: Arc<ThreadContext> = self.current_context().map_err(record)?;
    Ok(cancelable_wait(self, &ctx, handles, timeout))
  }

  /// Asks the signal thread to re-route process-pending signals, preferring
  /// `ctx` (with `mask` in place of its mask), and waits for it.
  fn request_flush(&self, ctx: &Arc<ThreadContext>, mask: Option<SigSet>) {
    let packet: SignalPacket = SignalPacket {
      target: Some(Arc::clone(ctx)),
      mask,
      ..SignalPacket::new(SigInfo::control(Signo::FLUSH))
    };

    if let Err(error) = self.signals().send(packet, true) {
      debug!(target: "posix_shim", pid = self.pid(), %error, "flush not sent");
    }
  }
}
