use parking_lot::Mutex;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc as StdArc;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;
use tracing::info;
use tracing::trace;
use triomphe::Arc;

use crate::config::Config;
use crate::consts::THREAD_STACK_SIZE;
use crate::error::Errno;
use crate::host::AddressSpace;
use crate::host::ChildProcess;
use crate::host::Event;
use crate::host::Host;
use crate::host::HostPid;
use crate::host::Region;
use crate::pool::PoolConfig;
use crate::pool::SlotRef;
use crate::pool::StartHook;
use crate::pool::WorkerPool;
use crate::proc::ExitStatus;
use crate::proc::ForkHook;
use crate::proc::LoadedModule;
use crate::proc::ModuleList;
use crate::proc::ModuleLoader;
use crate::proc::Pid;
use crate::proc::ProcessImage;
use crate::proc::ProcessState;
use crate::proc::ProcessTable;
use crate::proc::SameAddressLoader;
use crate::signal::Dispositions;
use crate::signal::SaFlags;
use crate::signal::SiCode;
use crate::signal::SigInfo;
use crate::signal::SigSet;
use crate::signal::SignalState;
use crate::signal::Signo;
use crate::sync::LazyMuto;
use crate::sync::LockLevel;
use crate::sync::Muto;
use crate::tls;
use crate::tls::ThreadContext;
use crate::tls::ThreadInit;
use crate::tls::ThreadList;

/// Base address of the stacks given to additional threads.
const THREAD_STACK_BASE: usize = 0x6000_0000;

/// Unmapped gap between two thread stacks.
const THREAD_STACK_GUARD: usize = 0x1000;

/// Stack slots tried before `spawn_thread` gives up.
const THREAD_STACK_PROBES: usize = 8;

// -----------------------------------------------------------------------------
// Process Init
// -----------------------------------------------------------------------------

/// Everything needed to build a [`Process`].
pub(crate) struct ProcessInit {
  pub(crate) pid: Pid,
  pub(crate) ppid: Pid,
  pub(crate) host: StdArc<dyn Host>,
  pub(crate) handle: ChildProcess,
  pub(crate) config: Config,
  pub(crate) image: ProcessImage,
  pub(crate) modules: Vec<LoadedModule>,
  pub(crate) dispositions: Dispositions,
  pub(crate) hooks: Vec<StdArc<dyn ForkHook>>,
  pub(crate) loader: StdArc<dyn ModuleLoader>,
}

/// A forked child, as recorded by its parent.
#[derive(Clone, Debug)]
pub struct ChildRecord {
  pub pid: Pid,
  pub handle: ChildProcess,
}

// -----------------------------------------------------------------------------
// Process
// -----------------------------------------------------------------------------

/// One emulated POSIX process.
pub struct Process {
  pid: Pid,
  ppid: Pid,
  host: StdArc<dyn Host>,
  handle: ChildProcess,
  config: Config,
  image: ProcessImage,
  modules: ModuleList,
  threads: ThreadList<Arc<ThreadContext>>,
  signals: SignalState,
  pool: WorkerPool,
  lock: LazyMuto,
  hooks: RwLock<Vec<StdArc<dyn ForkHook>>>,
  loader: RwLock<StdArc<dyn ModuleLoader>>,
  state: Mutex<ProcessState>,
  /// Manual-reset; clear while stopped.
  continued: Event,
  /// Manual-reset; set once the process exited.
  exited: Event,
  children: Mutex<Vec<ChildRecord>>,
  next_stack: AtomicUsize,
  fork_seq: AtomicU32,
}

impl Process {
  /// Boots a process on `host` and attaches the calling thread as its main
  /// thread.
  pub fn boot(host: StdArc<dyn Host>, config: Config, image: ProcessImage) -> Result<StdArc<Self>, Errno> {
    let pid: Pid = ProcessTable::global().next_pid();
    let handle: ChildProcess = host.attach_process(&format!("posix_shim.{pid}"))?;

    image.map_into(handle.memory())?;

    let process: StdArc<Self> = Self::build(ProcessInit {
      pid,
      ppid: 0,
      host,
      handle,
      config,
      image,
      modules: Vec::new(),
      dispositions: Dispositions::new(),
      hooks: Vec::new(),
      loader: StdArc::new(SameAddressLoader),
    });

    tls::init(&process, ThreadInit::new("main", image.stack), true);

    process.start();

    info!(
      target: "posix_shim",
      pid,
      host_pid = process.host_pid(),
      "process booted",
    );

    Ok(process)
  }

  pub(crate) fn build(init: ProcessInit) -> StdArc<Self> {
    StdArc::new_cyclic(|this: &Weak<Self>| {
      let pool: WorkerPool = WorkerPool::new(init.config.pool_slots, PoolConfig {
        on_thread_start: Some(worker_start_hook(this.clone())),
        ..init.config.pool_config()
      });

      let signals: SignalState = SignalState::new(init.dispositions, init.config.signal_complete_timeout);

      Self {
        pid: init.pid,
        ppid: init.ppid,
        host: init.host,
        handle: init.handle,
        config: init.config,
        image: init.image,
        modules: ModuleList::new(init.modules),
        threads: ThreadList::new(),
        signals,
        pool,
        lock: LazyMuto::with_level("process", LockLevel::Process),
        hooks: RwLock::new(init.hooks),
        loader: RwLock::new(init.loader),
        state: Mutex::new(ProcessState::Running),
        continued: Event::manual(true),
        exited: Event::manual(false),
        children: Mutex::new(Vec::new()),
        next_stack: AtomicUsize::new(THREAD_STACK_BASE),
        fork_seq: AtomicU32::new(0),
      }
    })
  }

  /// Publishes the process and starts its signal thread.
  pub(crate) fn start(self: &StdArc<Self>) {
    ProcessTable::global().insert(self);
    self.signals.start(self);
  }

  // ---------------------------------------------------------------------------
  // Accessors
  // ---------------------------------------------------------------------------

  #[inline]
  pub fn pid(&self) -> Pid {
    self.pid
  }

  /// Pid of the parent; zero for a booted process.
  #[inline]
  pub fn ppid(&self) -> Pid {
    self.ppid
  }

  #[inline]
  pub fn host_pid(&self) -> HostPid {
    self.handle.host_pid()
  }

  #[inline]
  pub fn host(&self) -> &StdArc<dyn Host> {
    &self.host
  }

  /// The host handle of this process.
  #[inline]
  pub fn handle(&self) -> &ChildProcess {
    &self.handle
  }

  #[inline]
  pub fn memory(&self) -> &Arc<AddressSpace> {
    self.handle.memory()
  }

  #[inline]
  pub fn config(&self) -> &Config {
    &self.config
  }

  #[inline]
  pub fn image(&self) -> &ProcessImage {
    &self.image
  }

  #[inline]
  pub fn modules(&self) -> &ModuleList {
    &self.modules
  }

  #[inline]
  pub fn threads(&self) -> &ThreadList<Arc<ThreadContext>> {
    &self.threads
  }

  #[inline]
  pub fn signals(&self) -> &SignalState {
    &self.signals
  }

  #[inline]
  pub fn pool(&self) -> &WorkerPool {
    &self.pool
  }

  /// The process-wide lock.
  #[inline]
  pub fn lock(&self) -> &Muto {
    self.lock.get()
  }

  pub fn state(&self) -> ProcessState {
    *self.state.lock()
  }

  pub fn hooks(&self) -> Vec<StdArc<dyn ForkHook>> {
    self.hooks.read().clone()
  }

  pub fn add_fork_hook(&self, hook: StdArc<dyn ForkHook>) {
    debug!(target: "posix_shim", pid = self.pid, hook = hook.name(), "fork hook added");
    self.hooks.write().push(hook);
  }

  pub fn loader(&self) -> StdArc<dyn ModuleLoader> {
    StdArc::clone(&self.loader.read())
  }

  pub fn set_loader(&self, loader: StdArc<dyn ModuleLoader>) {
    *self.loader.write() = loader;
  }

  pub(crate) fn next_fork_seq(&self) -> u32 {
    self.fork_seq.fetch_add(1, Ordering::Relaxed)
  }

  // ---------------------------------------------------------------------------
  // Modules
  // ---------------------------------------------------------------------------

  /// Maps a module into this process and records it.
  pub fn load_module(&self, module: LoadedModule) -> Result<(), Errno> {
    for region in module.regions() {
      self.memory().map(region).map_err(|_| Errno::ENOMEM)?;
    }

    debug!(
      target: "posix_shim",
      pid = self.pid,
      name = %module.name,
      kind = ?module.kind,
      "module loaded",
    );

    self.modules.push(module);

    Ok(())
  }

  // ---------------------------------------------------------------------------
  // Threads
  // ---------------------------------------------------------------------------

  /// Runs `f` on a new host thread with its own context and stack.
  ///
  /// The thread inherits the signal mask of the caller when the caller
  /// belongs to this process. Fails with `EAGAIN` if no stack can be mapped
  /// or the host refuses a new thread.
  pub fn spawn_thread<F, T>(self: &StdArc<Self>, name: &str, f: F) -> Result<JoinHandle<T>, Errno>
  where
    F: FnOnce(&Arc<ThreadContext>) -> T + Send + 'static,
    T: Send + 'static,
  {
    let stack: Region = self.alloc_stack()?;

    let sigmask: SigSet = match tls::current_process() {
      Some(process) if StdArc::ptr_eq(&process, self) => tls::current_mask(),
      _ => SigSet::EMPTY,
    };

    let process: StdArc<Self> = StdArc::clone(self);

    let init: ThreadInit = ThreadInit {
      sigmask,
      ..ThreadInit::new(name, stack)
    };

    let spawned = thread::Builder::new()
      .name(format!("posix-shim-{}-{name}", self.pid))
      .spawn(move || {
        let ctx: Arc<ThreadContext> = tls::init(&process, init, true);
        let value: T = f(&ctx);

        tls::remove();
        process.memory().unmap(stack.base);

        value
      });

    spawned.map_err(|error| {
      self.memory().unmap(stack.base);
      debug!(target: "posix_shim", pid = self.pid, %error, "thread spawn failed");
      Errno::EAGAIN
    })
  }

  fn alloc_stack(&self) -> Result<Region, Errno> {
    // A forked child already owns the stack of the thread that forked it.
    for _ in 0..THREAD_STACK_PROBES {
      let base: usize = self
        .next_stack
        .fetch_add(THREAD_STACK_SIZE + THREAD_STACK_GUARD, Ordering::Relaxed);

      let stack: Region = Region::new(base, THREAD_STACK_SIZE);

      if self.memory().map(stack).is_ok() {
        return Ok(stack);
      }
    }

    Err(Errno::EAGAIN)
  }

  // ---------------------------------------------------------------------------
  // Run State
  // ---------------------------------------------------------------------------

  /// Ends the process.
  ///
  /// Cancels every thread, stops the signal thread, notifies the parent with
  /// `SIGCHLD` and reports the status to the host. Returns `false` if the
  /// process had already exited.
  pub fn exit(&self, status: ExitStatus) -> bool {
    {
      let mut state = self.state.lock();

      if state.is_exited() {
        return false;
      }

      *state = ProcessState::Exited(status);
    }

    info!(target: "posix_shim", pid = self.pid, %status, "process exiting");

    self.continued.set();

    for ctx in self.threads.snapshot() {
      ctx.cancel();
    }

    self.signals.shutdown();

    ProcessTable::global().remove(self.pid);

    self.notify_parent(SigInfo::new(Signo::SIGCHLD, SiCode::Child, self.pid).with_value(status.code() as i64), false);

    self.host.exit_process(self.host_pid(), status.code());
    self.exited.set();

    true
  }

  /// Waits for the process to exit.
  pub fn wait_exit(&self, timeout: Option<Duration>) -> Option<ExitStatus> {
    if !self.exited.wait(timeout) {
      return None;
    }

    match self.state() {
      ProcessState::Exited(status) => Some(status),
      _ => None,
    }
  }

  /// Stops the process on a job-control signal.
  pub(crate) fn stop(&self, signo: Signo) {
    {
      let mut state = self.state.lock();

      if !state.is_running() {
        return;
      }

      *state = ProcessState::Stopped(signo);
    }

    self.continued.reset();

    debug!(target: "posix_shim", pid = self.pid, %signo, "process stopped");

    self.notify_parent(SigInfo::new(Signo::SIGCHLD, SiCode::Child, self.pid).with_value(signo.raw() as i64), true);
  }

  /// Continues a stopped process.
  pub(crate) fn resume(&self) {
    {
      let mut state = self.state.lock();

      if !state.is_stopped() {
        return;
      }

      *state = ProcessState::Running;
    }

    debug!(target: "posix_shim", pid = self.pid, "process continued");

    self.continued.set();
  }

  /// Parks the calling thread while the process is stopped. Returns `false`
  /// if the thread was cancelled instead.
  pub(crate) fn wait_while_stopped(&self, ctx: &ThreadContext) -> bool {
    while self.state().is_stopped() {
      match Event::wait_any(&[&self.continued, ctx.cancel_event()], None) {
        Some(0) => continue,
        _ => return false,
      }
    }

    true
  }

  fn notify_parent(&self, info: SigInfo, is_stop: bool) {
    let Some(parent) = ProcessTable::global().get(self.ppid) else {
      return;
    };

    if is_stop
      && parent
        .signals()
        .dispositions()
        .get(Signo::SIGCHLD)
        .flags
        .contains(SaFlags::NOCLDSTOP)
    {
      return;
    }

    trace!(target: "posix_shim", pid = self.pid, ppid = self.ppid, "notifying parent");

    if let Err(error) = parent.signals().post(info) {
      debug!(target: "posix_shim", ppid = self.ppid, %error, "parent gone");
    }
  }

  // ---------------------------------------------------------------------------
  // Children
  // ---------------------------------------------------------------------------

  pub(crate) fn add_child(&self, pid: Pid, handle: ChildProcess) {
    self.children.lock().push(ChildRecord { pid, handle });
  }

  /// The forked children not yet reaped.
  pub fn children(&self) -> Vec<ChildRecord> {
    self.children.lock().clone()
  }

  /// Waits for child `pid` to end and reaps it.
  ///
  /// Fails with `ESRCH` for an unknown child and `ETIMEDOUT` if it is still
  /// running when `timeout` elapses.
  pub fn wait_child(&self, pid: Pid, timeout: Option<Duration>) -> Result<i32, Errno> {
    let handle: ChildProcess = self
      .children
      .lock()
      .iter()
      .find(|child| child.pid == pid)
      .map(|child| child.handle.clone())
      .ok_or(Errno::ESRCH)?;

    let code: i32 = handle.wait(timeout).ok_or(Errno::ETIMEDOUT)?;

    self.children.lock().retain(|child| child.pid != pid);

    Ok(code)
  }
}

impl Drop for Process {
  fn drop(&mut self) {
    trace!(target: "posix_shim", pid = self.pid, "process dropped");
  }
}

impl Debug for Process {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Process")
      .field("pid", &self.pid)
      .field("ppid", &self.ppid)
      .field("host_pid", &self.host_pid())
      .field("state", &self.state())
      .field("threads", &self.threads.len())
      .field("signals", &self.signals)
      .field("pool", &self.pool)
      .finish_non_exhaustive()
  }
}

/// Attaches every pool thread of a process as a worker context that blocks
/// all maskable signals.
fn worker_start_hook(process: Weak<Process>) -> StartHook {
  StdArc::new(move |slot: SlotRef| {
    if let Some(process) = process.upgrade() {
      let init: ThreadInit = ThreadInit {
        sigmask: SigSet::FULL,
        worker: Some(slot),
        ..ThreadInit::new(format!("worker {slot}"), Region::EMPTY)
      };

      tls::init(&process, init, true);
    }
  })
}
