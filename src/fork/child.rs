use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc as StdArc;
use std::time::Duration;
use tracing::Level;
use tracing::Span;
use tracing::debug;
use tracing::span;
use tracing::trace;
use tracing::warn;
use triomphe::Arc;

use crate::consts::E_CODE_FAILURE;
use crate::consts::E_CODE_FORK_ABANDONED;
use crate::fork::ChildMain;
use crate::fork::state::Handshake;
use crate::fork::state::ParentSnapshot;
use crate::host::ChildProcess;
use crate::host::Event;
use crate::proc::ExitStatus;
use crate::proc::LoadedModule;
use crate::proc::Process;
use crate::proc::ProcessInit;
use crate::signal::Dispositions;
use crate::tls;
use crate::tls::ThreadContext;
use crate::tls::ThreadInit;
use crate::utils::panic_message;

/// Entry of a forked host process.
///
/// Rebuilds the process from the parent snapshot, waits for the parent's
/// memory copy, applies the local fixups and then runs the child body.
/// Returns the host exit code.
pub(crate) fn run(handshake: Arc<Handshake>, handle: ChildProcess) -> i32 {
  let snapshot: &ParentSnapshot = &handshake.snapshot;
  let timeout: Duration = snapshot.config.fork_wait_timeout;

  let span: Span = span!(
    target: "posix_shim",
    Level::DEBUG,
    "fork-child",
    pid = snapshot.child_pid,
    ppid = snapshot.parent_pid,
  );

  let process: StdArc<Process> = Process::build(ProcessInit {
    pid: snapshot.child_pid,
    ppid: snapshot.parent_pid,
    host: StdArc::clone(&snapshot.host),
    handle: handle.clone(),
    config: snapshot.config.clone(),
    image: snapshot.image,
    modules: snapshot.modules.clone(),
    dispositions: Dispositions::from_snapshot(snapshot.dispositions.clone()),
    hooks: snapshot.hooks.clone(),
    loader: StdArc::clone(&snapshot.loader),
  });

  // The only thread of the child continues the forking thread.
  let init: ThreadInit = ThreadInit {
    sigmask: snapshot.sigmask,
    reent: snapshot.reent.clone(),
    ..ThreadInit::new("main", snapshot.image.stack)
  };

  let ctx: Arc<ThreadContext> = tls::init(&process, init, false);

  trace!(target: "posix_shim", parent: &span, "ready for copy");

  handshake.ready.set();

  if !wait_parent(&handshake, &handle, timeout) {
    return abandon(&span, "memory copy");
  }

  if snapshot.has_dynamic() {
    let mut relocated: Vec<LoadedModule> = Vec::new();

    for module in snapshot.dynamic() {
      match process.loader().load_after_fork(&process, module) {
        Ok(loaded) => relocated.push(loaded),
        Err(errno) => {
          warn!(target: "posix_shim", parent: &span, name = %module.name, %errno, "module reload failed");
          return abandon(&span, "module reload");
        }
      }
    }

    process.modules().replace_dynamic(relocated.clone());
    *handshake.relocated.lock() = Some(relocated);

    handshake.ready.set();

    if !wait_parent(&handshake, &handle, timeout) {
      return abandon(&span, "relocated copy");
    }
  }

  for hook in process.hooks() {
    hook.fixup_after_fork(&process, snapshot.parent_host_pid);
  }

  ctx.reset_after_fork();
  process.start();

  debug!(target: "posix_shim", parent: &span, host_pid = handle.host_pid(), "child running");

  let child_main: Option<ChildMain> = handshake.child_main.lock().take();

  handshake.ready.set();

  let code: i32 = match child_main {
    Some(child_main) => match panic::catch_unwind(AssertUnwindSafe(|| child_main(StdArc::clone(&process)))) {
      Ok(code) => code,
      Err(payload) => {
        warn!(
          target: "posix_shim",
          parent: &span,
          panic = panic_message(&*payload),
          "child body panicked",
        );
        E_CODE_FAILURE
      }
    },
    None => E_CODE_FAILURE,
  };

  process.exit(ExitStatus::Code(code));
  tls::remove();

  code
}

/// Waits for the parent to finish a copy round. Returns `false` if the
/// parent gave up on this child.
fn wait_parent(handshake: &Handshake, handle: &ChildProcess, timeout: Duration) -> bool {
  let events: [&Event; 2] = [&handshake.finished, handle.killed()];
  Event::wait_any(&events, Some(timeout)) == Some(0)
}

fn abandon(span: &Span, step: &str) -> i32 {
  debug!(target: "posix_shim", parent: span, step, "abandoned by parent");
  tls::remove();
  E_CODE_FORK_ABANDONED
}
