use parking_lot::Mutex;
use std::sync::Arc as StdArc;
use std::thread;
use std::time::Duration;
use tracing::Level;
use tracing::Span;
use tracing::debug;
use tracing::info;
use tracing::span;
use tracing::trace;
use tracing::warn;
use triomphe::Arc;

use crate::config::Config;
use crate::consts::E_CODE_FORK_ABANDONED;
use crate::error::Errno;
use crate::fork::ChildMain;
use crate::fork::ForkFailure;
use crate::fork::ForkPhase;
use crate::fork::child;
use crate::fork::copy;
use crate::fork::state::Handshake;
use crate::fork::state::ParentSnapshot;
use crate::host::ChildProcess;
use crate::host::Event;
use crate::host::Host;
use crate::host::HostErrorKind;
use crate::host::ProcessSpec;
use crate::proc::LoadedModule;
use crate::proc::Pid;
use crate::proc::Process;
use crate::proc::ProcessImage;
use crate::proc::ProcessTable;
use crate::signal::SignalHold;
use crate::sync::ForkLocks;
use crate::sync::PoolLocked;
use crate::tls::ThreadContext;

// -----------------------------------------------------------------------------
// Half-Created Child
// -----------------------------------------------------------------------------

/// Terminates the child on drop unless the fork completed.
struct Pending<'a> {
  host: &'a dyn Host,
  child: ChildProcess,
  armed: bool,
}

impl<'a> Pending<'a> {
  fn new(host: &'a dyn Host, child: ChildProcess) -> Self {
    Self {
      host,
      child,
      armed: true,
    }
  }

  #[inline]
  fn child(&self) -> &ChildProcess {
    &self.child
  }

  fn complete(mut self) -> ChildProcess {
    self.armed = false;
    self.child.clone()
  }
}

impl Drop for Pending<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }

    if let Err(error) = self.host.terminate_process(&self.child, E_CODE_FORK_ABANDONED) {
      debug!(target: "posix_shim", host_pid = self.child.host_pid(), %error, "child already gone");
    }
  }
}

// -----------------------------------------------------------------------------
// Parent Side
// -----------------------------------------------------------------------------

pub(crate) fn run(process: &StdArc<Process>, child_main: ChildMain) -> Result<Pid, Errno> {
  let ctx: Arc<ThreadContext> = process.current_context()?;

  let span: Span = span!(target: "posix_shim", Level::DEBUG, "fork", pid = process.pid());

  trace!(target: "posix_shim", parent: &span, phase = %ForkPhase::Locking);

  let locks: ForkLocks<'_, SignalHold<'_>> = PoolLocked::lock(process.pool().fork_lock())
    .try_hold_signals(|| process.signals().hold())
    .map_err(|errno| {
      warn!(
        target: "posix_shim",
        parent: &span,
        phase = %ForkPhase::Failed,
        %errno,
        "signals could not be held",
      );

      ctx.set_errno(errno);
      errno
    })?
    .lock_process(process.lock());

  let snapshot: StdArc<ParentSnapshot> = StdArc::new(capture(process, &ctx));
  let child_main: StdArc<Mutex<Option<ChildMain>>> = StdArc::new(Mutex::new(Some(child_main)));
  let seq: u32 = process.next_fork_seq();
  let retries: u32 = process.config().fork_retries;

  let mut attempt: u32 = 0;

  let result: Result<ChildProcess, ForkFailure> = loop {
    match attempt_once(process, &ctx, &snapshot, &child_main, seq, attempt, &span) {
      Ok(child) => break Ok(child),
      Err(failure) if failure.is_retryable() && attempt < retries => {
        attempt += 1;

        let backoff: Duration = process.config().fork_retry_backoff * attempt;

        warn!(
          target: "posix_shim",
          parent: &span,
          %failure,
          attempt,
          ?backoff,
          "retrying fork",
        );

        thread::sleep(backoff);
      }
      Err(failure) => break Err(failure),
    }
  };

  drop(locks);

  match result {
    Ok(child) => {
      process.add_child(snapshot.child_pid, child.clone());

      info!(
        target: "posix_shim",
        parent: &span,
        child = snapshot.child_pid,
        host_pid = child.host_pid(),
        attempts = attempt + 1,
        "forked",
      );

      Ok(snapshot.child_pid)
    }
    Err(failure) => {
      warn!(
        target: "posix_shim",
        parent: &span,
        phase = %ForkPhase::Failed,
        %failure,
        attempts = attempt + 1,
        "fork failed",
      );

      let errno: Errno = failure.errno();
      ctx.set_errno(errno);
      Err(errno)
    }
  }
}

/// Captures what the child inherits. Runs under the fork locks.
fn capture(process: &StdArc<Process>, ctx: &ThreadContext) -> ParentSnapshot {
  let image: ProcessImage = ProcessImage {
    stack: ctx.stack(),
    ..*process.image()
  };

  ParentSnapshot {
    parent_pid: process.pid(),
    parent_host_pid: process.host_pid(),
    child_pid: ProcessTable::global().next_pid(),
    host: StdArc::clone(process.host()),
    config: process.config().clone(),
    image,
    modules: process.modules().snapshot(),
    dispositions: process.signals().dispositions().snapshot(),
    sigmask: ctx.sigmask(),
    reent: ctx.reent(),
    hooks: process.hooks(),
    loader: process.loader(),
  }
}

fn attempt_once(
  process: &StdArc<Process>,
  ctx: &ThreadContext,
  snapshot: &StdArc<ParentSnapshot>,
  child_main: &StdArc<Mutex<Option<ChildMain>>>,
  seq: u32,
  attempt: u32,
  span: &Span,
) -> Result<ChildProcess, ForkFailure> {
  let host: &dyn Host = &**process.host();
  let config: &Config = process.config();
  let timeout: Duration = config.fork_wait_timeout;

  let handshake: Arc<Handshake> = Arc::new(Handshake::new(StdArc::clone(snapshot), StdArc::clone(child_main)));
  let entry_handshake: Arc<Handshake> = Arc::clone(&handshake);

  let spec: ProcessSpec = ProcessSpec {
    name: format!("posix_shim.{}.fork{seq}.{attempt}", process.host_pid()),
    suspended: true,
    inherit_handles: true,
    image: snapshot.startup_regions(),
    entry: Box::new(move |handle: ChildProcess| child::run(entry_handshake, handle)),
  };

  let child: ChildProcess = host.create_process(spec).map_err(|error| {
    debug!(target: "posix_shim", parent: span, %error, "child creation failed");

    match error.kind() {
      HostErrorKind::NameCollision | HostErrorKind::NoResources => ForkFailure::Startup,
      _ => ForkFailure::Host,
    }
  })?;

  let pending: Pending<'_> = Pending::new(host, child);

  trace!(
    target: "posix_shim",
    parent: span,
    phase = %ForkPhase::ChildCreatedSuspended,
    host_pid = pending.child().host_pid(),
  );

  for hook in &snapshot.hooks {
    hook.fixup_before_fork(pending.child()).map_err(|errno| {
      warn!(target: "posix_shim", parent: span, hook = hook.name(), %errno, "fork hook failed");
      ForkFailure::Host
    })?;
  }

  host.resume_process(pending.child()).map_err(|error| {
    debug!(target: "posix_shim", parent: span, %error, "child resume failed");
    ForkFailure::Startup
  })?;

  trace!(target: "posix_shim", parent: span, phase = %ForkPhase::ChildReadyWait);

  if !wait_ready(&handshake, pending.child(), timeout) {
    debug!(target: "posix_shim", parent: span, ?timeout, "child never became ready");
    return Err(ForkFailure::Startup);
  }

  trace!(target: "posix_shim", parent: span, phase = %ForkPhase::MemoryCopy);

  let copied: usize = copy::copy_identity(
    host,
    ctx,
    process.memory(),
    pending.child(),
    &snapshot.startup_regions(),
    config.fork_chunk_size,
  )?;

  trace!(target: "posix_shim", parent: span, phase = %ForkPhase::ChildResumed, copied);

  handshake.finished.set();

  if snapshot.has_dynamic() {
    if !wait_ready(&handshake, pending.child(), timeout) {
      return Err(ForkFailure::Handshake);
    }

    let relocated: Vec<LoadedModule> = handshake.relocated.lock().take().ok_or(ForkFailure::Handshake)?;

    for (old, new) in snapshot.dynamic().zip(relocated.iter()) {
      copy::copy_region(host, ctx, process.memory(), pending.child(), old.data, new.data.base, config.fork_chunk_size)?;
      copy::copy_region(host, ctx, process.memory(), pending.child(), old.bss, new.bss.base, config.fork_chunk_size)?;
    }

    trace!(target: "posix_shim", parent: span, modules = relocated.len(), "relocated modules copied");

    handshake.finished.set();
  }

  trace!(target: "posix_shim", parent: span, phase = %ForkPhase::ChildFixupWait);

  if !wait_ready(&handshake, pending.child(), timeout) {
    return Err(ForkFailure::Handshake);
  }

  trace!(target: "posix_shim", parent: span, phase = %ForkPhase::Done);

  Ok(pending.complete())
}

/// Waits for the child's next ready signal. Returns `false` if the child
/// died or the wait timed out.
fn wait_ready(handshake: &Handshake, child: &ChildProcess, timeout: Duration) -> bool {
  let events: [&Event; 2] = [&handshake.ready, child.exited()];
  Event::wait_any(&events, Some(timeout)) == Some(0)
}
