//! The boundary to the host kernel.
//!
//! The emulation core never calls into an operating system directly. It
//! talks to a [`Host`] that provides:
//!
//! - process creation with a "start suspended" flag
//! - manual- and auto-reset [`Event`] objects
//! - a cross-process memory read/write primitive
//! - forced process termination
//!
//! [`SimHost`] implements the boundary in-process: every emulated process
//! is an [`AddressSpace`] plus a host thread that runs the process entry once
//! it is resumed.

mod event;
mod memory;
mod sim;

pub use self::event::Event;
pub use self::memory::AddressSpace;
pub use self::memory::MemoryFault;
pub use self::memory::Region;
pub use self::sim::SimHost;

use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::time::Duration;
use triomphe::Arc;

use crate::error::Errno;

/// Host-level process identifier.
pub type HostPid = u32;

/// Entry point of a created process, run once the process is resumed.
pub type ProcessEntry = Box<dyn FnOnce(ChildProcess) -> i32 + Send + 'static>;

// -----------------------------------------------------------------------------
// Host
// -----------------------------------------------------------------------------

/// Kernel primitives required by the emulation core.
pub trait Host: Send + Sync + 'static {
  /// Creates a new process.
  ///
  /// The regions listed in [`ProcessSpec::image`] are mapped (zero-filled)
  /// before the call returns. If [`ProcessSpec::suspended`] is set, no code
  /// runs in the new process until [`resume_process`] is called.
  ///
  /// [`resume_process`]: Host::resume_process
  fn create_process(&self, spec: ProcessSpec) -> Result<ChildProcess, HostError>;

  /// Returns a handle for the calling, already running, process.
  fn attach_process(&self, name: &str) -> Result<ChildProcess, HostError>;

  /// Starts a process created suspended.
  fn resume_process(&self, child: &ChildProcess) -> Result<(), HostError>;

  /// Writes `data` into the address space of `child`.
  fn write_memory(&self, child: &ChildProcess, addr: usize, data: &[u8]) -> Result<(), HostError>;

  /// Reads `buf.len()` bytes from the address space of `child`.
  fn read_memory(&self, child: &ChildProcess, addr: usize, buf: &mut [u8]) -> Result<(), HostError>;

  /// Forcibly terminates `child` with the given exit code.
  fn terminate_process(&self, child: &ChildProcess, code: i32) -> Result<(), HostError>;

  /// Ends the process identified by `host_pid` with the given exit code.
  fn exit_process(&self, host_pid: HostPid, code: i32);

  /// Returns the address space of a live process.
  fn memory_of(&self, host_pid: HostPid) -> Option<Arc<AddressSpace>>;
}

// -----------------------------------------------------------------------------
// Process Spec
// -----------------------------------------------------------------------------

/// Parameters of [`Host::create_process`].
pub struct ProcessSpec {
  /// Process-unique kernel object name.
  pub name: String,
  /// Do not run the entry until the process is resumed.
  pub suspended: bool,
  /// Let the new process see the creator's inheritable handles.
  pub inherit_handles: bool,
  /// Regions mapped by the loader before the process starts.
  pub image: Vec<Region>,
  pub entry: ProcessEntry,
}

impl Debug for ProcessSpec {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("ProcessSpec")
      .field("name", &self.name)
      .field("suspended", &self.suspended)
      .field("inherit_handles", &self.inherit_handles)
      .field("image", &self.image)
      .finish_non_exhaustive()
  }
}

// -----------------------------------------------------------------------------
// Child Process
// -----------------------------------------------------------------------------

/// A handle to a host process.
#[derive(Clone)]
pub struct ChildProcess {
  inner: Arc<ChildInner>,
}

struct ChildInner {
  host_pid: HostPid,
  name: String,
  memory: Arc<AddressSpace>,
  exited: Event,
  killed: Event,
  code: Mutex<Option<i32>>,
}

impl ChildProcess {
  pub fn new(host_pid: HostPid, name: String, memory: Arc<AddressSpace>) -> Self {
    Self {
      inner: Arc::new(ChildInner {
        host_pid,
        name,
        memory,
        exited: Event::manual(false),
        killed: Event::manual(false),
        code: Mutex::new(None),
      }),
    }
  }

  #[inline]
  pub fn host_pid(&self) -> HostPid {
    self.inner.host_pid
  }

  #[inline]
  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// The process address space.
  #[inline]
  pub fn memory(&self) -> &Arc<AddressSpace> {
    &self.inner.memory
  }

  /// Signalled once the process has ended.
  #[inline]
  pub fn exited(&self) -> &Event {
    &self.inner.exited
  }

  /// Signalled when the process was forcibly terminated.
  #[inline]
  pub fn killed(&self) -> &Event {
    &self.inner.killed
  }

  /// Returns the exit code, or `None` if the process is still running.
  pub fn exit_code(&self) -> Option<i32> {
    *self.inner.code.lock()
  }

  /// Waits for the process to end and returns its exit code.
  pub fn wait(&self, timeout: Option<Duration>) -> Option<i32> {
    if self.inner.exited.wait(timeout) {
      self.exit_code()
    } else {
      None
    }
  }

  /// Records the exit code. Only the first call has any effect.
  ///
  /// Returns `false` if the process had already ended.
  pub fn finish(&self, code: i32) -> bool {
    let mut slot = self.inner.code.lock();

    if slot.is_some() {
      return false;
    }

    *slot = Some(code);
    drop(slot);

    self.inner.exited.set();
    true
  }

  /// Marks the process as forcibly terminated with `code`.
  pub fn kill(&self, code: i32) -> bool {
    self.inner.killed.set();
    self.finish(code)
  }
}

impl Debug for ChildProcess {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("ChildProcess")
      .field("host_pid", &self.inner.host_pid)
      .field("name", &self.inner.name)
      .field("exit_code", &self.exit_code())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Host Error
// -----------------------------------------------------------------------------

/// Categories of host failure.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum HostErrorKind {
  /// A process-unique kernel object name is already in use.
  NameCollision,
  /// The host ran out of processes, threads or memory.
  NoResources,
  /// A memory access touched an unmapped or protected address.
  AccessViolation,
  /// Only part of a cross-process copy completed.
  PartialCopy,
  /// The handle does not refer to a live object.
  InvalidHandle,
}

/// A failed host call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostError {
  kind: HostErrorKind,
  detail: Cow<'static, str>,
}

impl HostError {
  pub fn new(kind: HostErrorKind, detail: impl Into<Cow<'static, str>>) -> Self {
    Self {
      kind,
      detail: detail.into(),
    }
  }

  #[inline]
  pub fn kind(&self) -> HostErrorKind {
    self.kind
  }

  #[inline]
  pub fn detail(&self) -> &str {
    &self.detail
  }
}

impl Display for HostError {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "{:?}: {}", self.kind, self.detail)
  }
}

impl std::error::Error for HostError {}

impl From<MemoryFault> for HostError {
  fn from(other: MemoryFault) -> Self {
    Self::new(HostErrorKind::AccessViolation, other.to_string())
  }
}

impl From<HostError> for Errno {
  fn from(other: HostError) -> Self {
    match other.kind {
      HostErrorKind::NameCollision => Self::EAGAIN,
      HostErrorKind::NoResources => Self::EAGAIN,
      HostErrorKind::AccessViolation => Self::EFAULT,
      HostErrorKind::PartialCopy => Self::EFAULT,
      HostErrorKind::InvalidHandle => Self::ESRCH,
    }
  }
}
