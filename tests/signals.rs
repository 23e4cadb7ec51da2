use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use posix_shim::Config;
use posix_shim::error::Errno;
use posix_shim::host::Event;
use posix_shim::host::SimHost;
use posix_shim::proc::ExitStatus;
use posix_shim::proc::Process;
use posix_shim::proc::ProcessImage;
use posix_shim::proc::ProcessState;
use posix_shim::signal::Handler;
use posix_shim::signal::SigAction;
use posix_shim::signal::SigHow;
use posix_shim::signal::SigInfo;
use posix_shim::signal::SigSet;
use posix_shim::signal::Signo;
use posix_shim::signal::Wakeup;
use posix_shim::tls;

const USR1: i32 = Signo::SIGUSR1.raw();
const USR2: i32 = Signo::SIGUSR2.raw();

fn boot() -> Arc<Process> {
  Process::boot(Arc::new(SimHost::new()), Config::default(), ProcessImage::default()).unwrap()
}

fn counting_handler(process: &Arc<Process>, sig: i32) -> Arc<AtomicU32> {
  let count: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
  let inner: Arc<AtomicU32> = Arc::clone(&count);

  process
    .sigaction(
      sig,
      Some(SigAction::new(Handler::catch(move |_: &SigInfo| {
        inner.fetch_add(1, Ordering::SeqCst);
      }))),
    )
    .unwrap();

  count
}

#[test]
fn test_kill_self_runs_handler() {
  let process: Arc<Process> = boot();
  let count: Arc<AtomicU32> = counting_handler(&process, USR1);

  process.kill(process.pid(), USR1).unwrap();

  assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_kill_rejects_bad_input() {
  let process: Arc<Process> = boot();

  assert_eq!(process.kill(process.pid(), 0), Ok(()));
  assert_eq!(process.kill(process.pid(), 99), Err(Errno::EINVAL));
  assert_eq!(process.kill(process.pid(), -1), Err(Errno::EINVAL));
  assert_eq!(process.kill(u32::MAX, USR1), Err(Errno::ESRCH));

  let ctx = process.current_context().unwrap();
  assert_eq!(ctx.errno(), Some(Errno::ESRCH));
}

#[test]
fn test_hold_nesting() {
  let process: Arc<Process> = boot();
  let count: Arc<AtomicU32> = counting_handler(&process, USR1);

  let outer = process.signals().hold().unwrap();
  let inner = process.signals().hold().unwrap();

  assert_eq!(process.signals().held(), 2);

  drop(inner);

  assert_eq!(process.signals().held(), 1);

  process.kill(process.pid(), USR1).unwrap();

  assert_eq!(count.load(Ordering::SeqCst), 0);
  assert!(process.signals().pending().contains(Signo::SIGUSR1));

  drop(outer);

  assert_eq!(process.signals().held(), 0);
  assert_eq!(process.dispatch_signals(), 1);
  assert_eq!(count.load(Ordering::SeqCst), 1);
  assert!(process.signals().pending().is_empty());
}

#[test]
fn test_masked_signal_is_kept_pending() {
  let process: Arc<Process> = boot();
  let count: Arc<AtomicU32> = counting_handler(&process, USR1);
  let usr1: SigSet = SigSet::EMPTY.with(Signo::SIGUSR1);

  assert_eq!(process.sigprocmask(SigHow::Block, Some(usr1)), Ok(SigSet::EMPTY));

  process.kill(process.pid(), USR1).unwrap();

  assert_eq!(count.load(Ordering::SeqCst), 0);
  assert!(process.sigpending().unwrap().contains(Signo::SIGUSR1));

  assert_eq!(process.sigprocmask(SigHow::Unblock, Some(usr1)), Ok(usr1));

  assert_eq!(count.load(Ordering::SeqCst), 1);
  assert!(process.sigpending().unwrap().is_empty());
}

#[test]
fn test_masked_thread_signal_waits_for_unmask() {
  let process: Arc<Process> = boot();
  let term: SigSet = SigSet::EMPTY.with(Signo::SIGTERM);
  let ctx = process.current_context().unwrap();

  process.sigprocmask(SigHow::Block, Some(term)).unwrap();

  process.thread_kill(&ctx, Signo::SIGTERM.raw()).unwrap();
  process.raise(Signo::SIGTERM.raw()).unwrap();

  assert_eq!(process.state(), ProcessState::Running);
  assert!(process.sigpending().unwrap().contains(Signo::SIGTERM));

  // The default action runs once the mask is lifted.
  process.sigprocmask(SigHow::Unblock, Some(term)).unwrap();

  let status: ExitStatus = process.wait_exit(Some(Duration::from_secs(5))).unwrap();

  assert_eq!(status, ExitStatus::Signalled(Signo::SIGTERM));
}

#[test]
fn test_sigaction_rules() {
  let process: Arc<Process> = boot();
  let usr1: SigSet = SigSet::EMPTY.with(Signo::SIGUSR1);

  let catch: SigAction = SigAction::new(Handler::catch(|_: &SigInfo| {}));

  assert_eq!(
    process.sigaction(Signo::SIGKILL.raw(), Some(catch.clone())).err(),
    Some(Errno::EINVAL),
  );
  assert_eq!(
    process.sigaction(Signo::SIGSTOP.raw(), Some(SigAction::new(Handler::Ignore))).err(),
    Some(Errno::EINVAL),
  );
  assert_eq!(process.sigaction(0, None).err(), Some(Errno::EINVAL));

  // Ignoring discards what is pending.
  process.sigprocmask(SigHow::Block, Some(usr1)).unwrap();
  process.kill(process.pid(), USR1).unwrap();

  assert!(process.sigpending().unwrap().contains(Signo::SIGUSR1));

  process.sigaction(USR1, Some(SigAction::new(Handler::Ignore))).unwrap();

  assert!(!process.sigpending().unwrap().contains(Signo::SIGUSR1));
}

#[test]
fn test_sigwait_takes_blocked_signal() {
  let process: Arc<Process> = boot();
  let count: Arc<AtomicU32> = counting_handler(&process, USR2);
  let usr2: SigSet = SigSet::EMPTY.with(Signo::SIGUSR2);

  process.sigprocmask(SigHow::Block, Some(usr2)).unwrap();
  process.kill(process.pid(), USR2).unwrap();

  let info: SigInfo = process.sigwait(usr2, Some(Duration::from_secs(5))).unwrap();

  assert_eq!(info.signo, Signo::SIGUSR2);
  assert_eq!(info.pid, process.pid());
  assert_eq!(count.load(Ordering::SeqCst), 0);

  assert_eq!(
    process.sigwait(usr2, Some(Duration::from_millis(20))).err(),
    Some(Errno::EAGAIN),
  );
}

#[test]
fn test_sigwait_on_other_thread() {
  let process: Arc<Process> = boot();
  let usr2: SigSet = SigSet::EMPTY.with(Signo::SIGUSR2);

  process.sigprocmask(SigHow::Block, Some(usr2)).unwrap();

  let waiting: Arc<Process> = Arc::clone(&process);

  let waiter = process
    .spawn_thread("waiter", move |_| waiting.sigwait(usr2, Some(Duration::from_secs(5))))
    .unwrap();

  thread::sleep(Duration::from_millis(20));
  process.kill(process.pid(), USR2).unwrap();

  let info: SigInfo = waiter.join().unwrap().unwrap();

  assert_eq!(info.signo, Signo::SIGUSR2);
}

#[test]
fn test_thread_kill_interrupts_wait() {
  let process: Arc<Process> = boot();
  let (send, recv) = mpsc::channel();
  let names: Arc<Mutex<Vec<String>>> = Arc::default();

  {
    let names = Arc::clone(&names);

    process
      .sigaction(
        USR1,
        Some(SigAction::new(Handler::catch(move |_: &SigInfo| {
          let ctx = tls::current().unwrap();
          names.lock().unwrap().push(ctx.name().to_owned());
        }))),
      )
      .unwrap();
  }

  let waiting: Arc<Process> = Arc::clone(&process);
  let never: Event = Event::manual(false);

  let target = process
    .spawn_thread("target", move |ctx| {
      send.send(ctx.clone()).unwrap();
      waiting.wait_interruptible(&[&never], Some(Duration::from_secs(5)))
    })
    .unwrap();

  let ctx = recv.recv().unwrap();

  process.thread_kill(&ctx, USR1).unwrap();

  assert_eq!(target.join().unwrap(), Ok(Wakeup::Signalled));
  assert_eq!(*names.lock().unwrap(), ["target"]);
}

#[test]
fn test_sigsuspend() {
  let process: Arc<Process> = boot();
  let count: Arc<AtomicU32> = counting_handler(&process, USR1);
  let usr1: SigSet = SigSet::EMPTY.with(Signo::SIGUSR1);

  process.sigprocmask(SigHow::Block, Some(usr1)).unwrap();

  assert_eq!(
    process.sigsuspend(SigSet::EMPTY.with(Signo::SIGUSR2), Some(Duration::from_millis(20))),
    Errno::ETIMEDOUT,
  );

  let sender = {
    let process: Arc<Process> = Arc::clone(&process);

    thread::spawn(move || {
      thread::sleep(Duration::from_millis(20));
      process.kill(process.pid(), USR1).unwrap();
    })
  };

  assert_eq!(process.sigsuspend(SigSet::EMPTY, Some(Duration::from_secs(5))), Errno::EINTR);
  assert_eq!(count.load(Ordering::SeqCst), 1);
  assert_eq!(process.sigprocmask(SigHow::Block, None), Ok(usr1));

  sender.join().unwrap();
}

#[test]
fn test_stop_and_continue() {
  let process: Arc<Process> = boot();

  process.kill(process.pid(), Signo::SIGSTOP.raw()).unwrap();

  assert_eq!(process.state(), ProcessState::Stopped(Signo::SIGSTOP));

  process.kill(process.pid(), Signo::SIGCONT.raw()).unwrap();

  assert_eq!(process.state(), ProcessState::Running);
}

#[test]
fn test_sigkill_always_terminates() {
  let process: Arc<Process> = boot();
  // SIGKILL cannot be blocked.
  process.sigprocmask(SigHow::SetMask, Some(SigSet::FULL)).unwrap();
  process.kill(process.pid(), Signo::SIGKILL.raw()).unwrap();

  let status: ExitStatus = process.wait_exit(Some(Duration::from_secs(5))).unwrap();

  assert_eq!(status, ExitStatus::Signalled(Signo::SIGKILL));
  assert_eq!(status.code(), 0x80 | 9);
  assert_eq!(process.handle().exit_code(), Some(0x80 | 9));

  assert_eq!(process.kill(process.pid(), 0), Err(Errno::ESRCH));
}
