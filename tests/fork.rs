use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use posix_shim::Config;
use posix_shim::error::Errno;
use posix_shim::fork::ForkChild;
use posix_shim::fork::fork;
use posix_shim::host::ChildProcess;
use posix_shim::host::HostPid;
use posix_shim::host::Region;
use posix_shim::host::SimHost;
use posix_shim::proc::ForkHook;
use posix_shim::proc::LoadedModule;
use posix_shim::proc::ModuleKind;
use posix_shim::proc::ModuleLoader;
use posix_shim::proc::Process;
use posix_shim::proc::ProcessImage;
use posix_shim::signal::Handler;
use posix_shim::signal::SigAction;
use posix_shim::signal::SigHow;
use posix_shim::signal::SigInfo;
use posix_shim::signal::SigSet;
use posix_shim::signal::Signo;

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

fn boot_with(config: Config) -> (Arc<SimHost>, Arc<Process>) {
  let host: Arc<SimHost> = Arc::new(SimHost::new());
  let process: Arc<Process> = Process::boot(host.clone(), config, ProcessImage::default()).unwrap();

  (host, process)
}

fn boot() -> (Arc<SimHost>, Arc<Process>) {
  boot_with(Config::default())
}

fn quick_config() -> Config {
  Config {
    fork_wait_timeout: Duration::from_millis(100),
    fork_retries: 1,
    fork_retry_backoff: Duration::from_millis(1),
    ..Config::default()
  }
}

#[test]
fn test_fork_copies_memory() {
  let (host, process) = boot();
  let heap: Region = process.image().heap;
  let parent: u32 = process.pid();

  process.memory().write(heap.base, b"parent heap").unwrap();

  let pid: u32 = fork(&process, move |child: ForkChild| {
    let bytes: Vec<u8> = child.memory().read_vec(heap.base, 11).unwrap();

    if bytes == b"parent heap" && child.ppid() == parent { 7 } else { 1 }
  })
  .unwrap();

  assert_ne!(pid, parent);
  assert_eq!(process.wait_child(pid, WAIT), Ok(7));
  assert_eq!(host.created(), 2);
  assert_eq!(host.terminated(), 0);
  assert!(process.children().is_empty());
}

#[test]
fn test_parent_receives_sigchld() {
  let (_host, process) = boot();
  let status: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));

  {
    let status: Arc<AtomicU32> = Arc::clone(&status);

    process
      .sigaction(
        Signo::SIGCHLD.raw(),
        Some(SigAction::new(Handler::catch(move |info: &SigInfo| {
          status.store(info.value as u32, Ordering::SeqCst);
        }))),
      )
      .unwrap();
  }

  let pid: u32 = fork(&process, |_| 5).unwrap();

  assert_eq!(process.wait_child(pid, WAIT), Ok(5));

  let deadline: Instant = Instant::now() + Duration::from_secs(10);

  while status.load(Ordering::SeqCst) == 0 {
    assert!(Instant::now() < deadline, "SIGCHLD never arrived");
    process.dispatch_signals();
    thread::sleep(Duration::from_millis(1));
  }

  assert_eq!(status.load(Ordering::SeqCst), 5);
}

#[test]
fn test_child_inherits_mask_and_dispositions() {
  let (_host, process) = boot();
  let usr1: SigSet = SigSet::EMPTY.with(Signo::SIGUSR1);

  process.sigprocmask(SigHow::Block, Some(usr1)).unwrap();
  process
    .sigaction(Signo::SIGUSR2.raw(), Some(SigAction::new(Handler::Ignore)))
    .unwrap();

  // Pending signals stay with the parent.
  process.kill(process.pid(), Signo::SIGUSR1.raw()).unwrap();

  let pid: u32 = fork(&process, move |child: ForkChild| {
    let mask: SigSet = child.sigprocmask(SigHow::Block, None).unwrap();
    let action: SigAction = child.sigaction(Signo::SIGUSR2.raw(), None).unwrap();
    let pending: SigSet = child.sigpending().unwrap();

    if mask == usr1 && action.ignores(Signo::SIGUSR2) && pending.is_empty() { 0 } else { 1 }
  })
  .unwrap();

  assert_eq!(process.wait_child(pid, WAIT), Ok(0));
  assert!(process.sigpending().unwrap().contains(Signo::SIGUSR1));
}

#[test]
fn test_stalled_child_times_out() {
  let (host, process) = boot_with(quick_config());
  let ran: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

  host.inject_stalled_startups(2);

  let flag: Arc<AtomicBool> = Arc::clone(&ran);
  let result: Result<u32, Errno> = fork(&process, move |_| {
    flag.store(true, Ordering::SeqCst);
    0
  });

  assert_eq!(result, Err(Errno::EAGAIN));
  assert_eq!(host.created(), 3);
  assert_eq!(host.terminated(), 2);
  assert_eq!(host.live(), 1);
  assert!(!ran.load(Ordering::SeqCst));
  assert!(process.children().is_empty());

  let ctx = process.current_context().unwrap();
  assert_eq!(ctx.errno(), Some(Errno::EAGAIN));
}

#[test]
fn test_stall_then_success_is_retried() {
  let (host, process) = boot_with(quick_config());

  host.inject_stalled_startups(1);

  let pid: u32 = fork(&process, |_| 3).unwrap();

  assert_eq!(process.wait_child(pid, WAIT), Ok(3));
  assert_eq!(host.terminated(), 1);
}

#[test]
fn test_name_collision_is_retried() {
  let (host, process) = boot();

  host.inject_name_collisions(2);

  let pid: u32 = fork(&process, |_| 0).unwrap();

  assert_eq!(process.wait_child(pid, WAIT), Ok(0));
  assert_eq!(host.created(), 2);
}

#[test]
fn test_name_collisions_exhaust_retries() {
  let (host, process) = boot_with(quick_config());

  host.inject_name_collisions(5);

  assert_eq!(fork(&process, |_| 0), Err(Errno::EAGAIN));
  assert_eq!(host.created(), 1);
}

#[test]
fn test_copy_failure_terminates_child() {
  let (host, process) = boot();
  let heap: Region = process.image().heap;
  let ran: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

  host.inject_write_fault(heap.base + 0x100..heap.base + 0x101);

  let flag: Arc<AtomicBool> = Arc::clone(&ran);
  let result: Result<u32, Errno> = fork(&process, move |_| {
    flag.store(true, Ordering::SeqCst);
    0
  });

  assert_eq!(result, Err(Errno::EAGAIN));
  // Copy failures are not retried.
  assert_eq!(host.created(), 2);
  assert_eq!(host.terminated(), 1);
  assert_eq!(host.live(), 1);
  assert!(!ran.load(Ordering::SeqCst));
  assert!(process.children().is_empty());
}

#[test]
fn test_fork_requires_attached_thread() {
  let (_host, process) = boot();

  let result: Result<u32, Errno> = thread::spawn(move || fork(&process, |_| 0)).join().unwrap();

  assert_eq!(result, Err(Errno::ESRCH));
}

#[test]
fn test_fork_from_spawned_thread() {
  let (_host, process) = boot();
  let forking: Arc<Process> = Arc::clone(&process);

  let pid: u32 = process
    .spawn_thread("forker", move |ctx| {
      let stack: Region = ctx.stack();
      fork(&forking, move |child: ForkChild| if child.image().stack == stack { 0 } else { 1 })
    })
    .unwrap()
    .join()
    .unwrap()
    .unwrap();

  assert_eq!(process.wait_child(pid, WAIT), Ok(0));
}

#[test]
fn test_kill_child() {
  let (_host, process) = boot();

  // The default action ends the child before the closure returns.
  let pid: u32 = fork(&process, |child: ForkChild| match child.wait_interruptible(&[], None) {
    Ok(_) => 0,
    Err(_) => 1,
  })
  .unwrap();

  process.kill(pid, Signo::SIGTERM.raw()).unwrap();

  assert_eq!(process.wait_child(pid, WAIT), Ok(0x80 | Signo::SIGTERM.raw()));
}

// -----------------------------------------------------------------------------
// Hooks And Modules
// -----------------------------------------------------------------------------

#[derive(Default)]
struct CountingHook {
  before: AtomicU32,
  after: AtomicU32,
  parent: AtomicU32,
}

impl ForkHook for CountingHook {
  fn name(&self) -> &str {
    "counting"
  }

  fn fixup_before_fork(&self, _child: &ChildProcess) -> Result<(), Errno> {
    self.before.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn fixup_after_fork(&self, _child: &Process, parent: HostPid) {
    self.after.fetch_add(1, Ordering::SeqCst);
    self.parent.store(parent, Ordering::SeqCst);
  }
}

struct RefusingHook;

impl ForkHook for RefusingHook {
  fn name(&self) -> &str {
    "refusing"
  }

  fn fixup_before_fork(&self, _child: &ChildProcess) -> Result<(), Errno> {
    Err(Errno::ENOMEM)
  }
}

/// Reloads every module 1 MiB above its parent address.
struct ShiftingLoader;

const SHIFT: usize = 0x10_0000;

impl ModuleLoader for ShiftingLoader {
  fn load_after_fork(&self, child: &Process, module: &LoadedModule) -> Result<LoadedModule, Errno> {
    let moved: LoadedModule = LoadedModule::new(
      module.name.clone(),
      Region::new(module.data.base + SHIFT, module.data.len),
      Region::new(module.bss.base + SHIFT, module.bss.len),
      module.kind,
    );

    for region in moved.regions() {
      child.memory().map(region).map_err(|_| Errno::ENOMEM)?;
    }

    Ok(moved)
  }
}

#[test]
fn test_fork_hooks_run_on_both_sides() {
  let (_host, process) = boot();
  let hook: Arc<CountingHook> = Arc::default();

  process.add_fork_hook(hook.clone());

  let pid: u32 = fork(&process, |_| 0).unwrap();

  assert_eq!(process.wait_child(pid, WAIT), Ok(0));
  assert_eq!(hook.before.load(Ordering::SeqCst), 1);
  assert_eq!(hook.after.load(Ordering::SeqCst), 1);
  assert_eq!(hook.parent.load(Ordering::SeqCst), process.host_pid());
}

#[test]
fn test_refusing_hook_fails_fork() {
  let (host, process) = boot();

  process.add_fork_hook(Arc::new(RefusingHook));

  assert_eq!(fork(&process, |_| 0), Err(Errno::EAGAIN));
  assert_eq!(host.terminated(), 1);
}

#[test]
fn test_linked_module_is_copied() {
  let (_host, process) = boot();
  let data: Region = Region::new(0x3000_0000, 0x40);

  process
    .load_module(LoadedModule::new("libc", data, Region::EMPTY, ModuleKind::Linked))
    .unwrap();
  process.memory().write(data.base, &[0xab; 0x40]).unwrap();

  let pid: u32 = fork(&process, move |child: ForkChild| {
    match child.memory().read_vec(data.base, data.len) {
      Ok(bytes) if bytes == [0xab; 0x40] => 0,
      _ => 1,
    }
  })
  .unwrap();

  assert_eq!(process.wait_child(pid, WAIT), Ok(0));
}

#[test]
fn test_dynamic_module_is_relocated() {
  let (_host, process) = boot();
  let data: Region = Region::new(0x2000_0000, 0x100);
  let bss: Region = Region::new(0x2000_1000, 0x80);

  process
    .load_module(LoadedModule::new("plugin", data, bss, ModuleKind::Dynamic))
    .unwrap();
  process.memory().write(data.base, &[1; 0x100]).unwrap();
  process.memory().write(bss.base, &[2; 0x80]).unwrap();
  process.set_loader(Arc::new(ShiftingLoader));

  let pid: u32 = fork(&process, move |child: ForkChild| {
    let Some(module) = child.modules().snapshot().into_iter().find(|module| module.name == "plugin") else {
      return 1;
    };

    let data_ok: bool = child.memory().read_vec(data.base + SHIFT, data.len).ok() == Some(vec![1; 0x100]);
    let bss_ok: bool = child.memory().read_vec(bss.base + SHIFT, bss.len).ok() == Some(vec![2; 0x80]);

    if module.data.base == data.base + SHIFT && data_ok && bss_ok { 0 } else { 2 }
  })
  .unwrap();

  assert_eq!(process.wait_child(pid, WAIT), Ok(0));
}
