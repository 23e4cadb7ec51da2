use parking_lot::Mutex;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc as StdArc;

use crate::config::Config;
use crate::error::Errno;
use crate::fork::ChildMain;
use crate::host::Event;
use crate::host::Host;
use crate::host::HostPid;
use crate::host::Region;
use crate::proc::ForkHook;
use crate::proc::LoadedModule;
use crate::proc::ModuleKind;
use crate::proc::ModuleLoader;
use crate::proc::Pid;
use crate::proc::ProcessImage;
use crate::signal::SigAction;
use crate::signal::SigSet;
use crate::tls::Reent;

// -----------------------------------------------------------------------------
// Fork Phase
// -----------------------------------------------------------------------------

/// Progress of one fork, as reported in traces.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ForkPhase {
  /// Acquiring the pool, signal-hold and process locks.
  Locking,
  /// The host process exists but runs nothing yet.
  ChildCreatedSuspended,
  /// Waiting for the child to report it is initialized.
  ChildReadyWait,
  /// Copying parent memory into the child.
  MemoryCopy,
  /// The child was told its memory is in place.
  ChildResumed,
  /// Waiting for the child to finish its own fixups.
  ChildFixupWait,
  Done,
  Failed,
}

impl Display for ForkPhase {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self {
      Self::Locking => f.write_str("locking"),
      Self::ChildCreatedSuspended => f.write_str("child-created-suspended"),
      Self::ChildReadyWait => f.write_str("child-ready-wait"),
      Self::MemoryCopy => f.write_str("memory-copy"),
      Self::ChildResumed => f.write_str("child-resumed"),
      Self::ChildFixupWait => f.write_str("child-fixup-wait"),
      Self::Done => f.write_str("done"),
      Self::Failed => f.write_str("failed"),
    }
  }
}

// -----------------------------------------------------------------------------
// Fork Failure
// -----------------------------------------------------------------------------

/// Why one fork attempt failed.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ForkFailure {
  /// The child could not be created or never reported ready.
  Startup,
  /// Writing parent memory into the child failed.
  Copy,
  /// The child stopped answering after the first handshake.
  Handshake,
  /// The host or a fork hook refused the child.
  Host,
}

impl ForkFailure {
  /// Returns `true` if another attempt may succeed.
  #[inline]
  pub const fn is_retryable(self) -> bool {
    matches!(self, Self::Startup)
  }

  /// The error reported to the caller of `fork`.
  #[inline]
  pub const fn errno(self) -> Errno {
    Errno::EAGAIN
  }
}

impl Display for ForkFailure {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self {
      Self::Startup => f.write_str("child startup failed"),
      Self::Copy => f.write_str("memory copy failed"),
      Self::Handshake => f.write_str("child handshake failed"),
      Self::Host => f.write_str("host refused child"),
    }
  }
}

// -----------------------------------------------------------------------------
// Parent Snapshot
// -----------------------------------------------------------------------------

/// What the child inherits, captured once per fork under the fork locks.
pub(crate) struct ParentSnapshot {
  pub(crate) parent_pid: Pid,
  pub(crate) parent_host_pid: HostPid,
  pub(crate) child_pid: Pid,
  pub(crate) host: StdArc<dyn Host>,
  pub(crate) config: Config,
  /// Layout of the child; `stack` is the forking thread's stack.
  pub(crate) image: ProcessImage,
  pub(crate) modules: Vec<LoadedModule>,
  pub(crate) dispositions: Vec<SigAction>,
  pub(crate) sigmask: SigSet,
  pub(crate) reent: Reent,
  pub(crate) hooks: Vec<StdArc<dyn ForkHook>>,
  pub(crate) loader: StdArc<dyn ModuleLoader>,
}

impl ParentSnapshot {
  /// Regions the host maps into the child before it starts. The first copy
  /// round fills exactly these, at identical addresses.
  pub(crate) fn startup_regions(&self) -> Vec<Region> {
    let mut regions: Vec<Region> = self.image.regions();
    regions.extend(self.linked().flat_map(LoadedModule::regions));
    regions
  }

  pub(crate) fn linked(&self) -> impl Iterator<Item = &LoadedModule> {
    self
      .modules
      .iter()
      .filter(|module| module.kind == ModuleKind::Linked)
  }

  pub(crate) fn dynamic(&self) -> impl Iterator<Item = &LoadedModule> {
    self
      .modules
      .iter()
      .filter(|module| module.kind == ModuleKind::Dynamic)
  }

  pub(crate) fn has_dynamic(&self) -> bool {
    self.dynamic().next().is_some()
  }
}

impl Debug for ParentSnapshot {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("ParentSnapshot")
      .field("parent_pid", &self.parent_pid)
      .field("parent_host_pid", &self.parent_host_pid)
      .field("child_pid", &self.child_pid)
      .field("image", &self.image)
      .field("modules", &self.modules)
      .field("sigmask", &self.sigmask)
      .finish_non_exhaustive()
  }
}

// -----------------------------------------------------------------------------
// Handshake
// -----------------------------------------------------------------------------

/// The events and data the parent and one child attempt share.
pub(crate) struct Handshake {
  /// Set by the child at every step it completes.
  pub(crate) ready: Event,
  /// Set by the parent once a copy round is done.
  pub(crate) finished: Event,
  pub(crate) snapshot: StdArc<ParentSnapshot>,
  /// Where the child reloaded its dynamic modules.
  pub(crate) relocated: Mutex<Option<Vec<LoadedModule>>>,
  /// Shared by every attempt; taken by the child that completes.
  pub(crate) child_main: StdArc<Mutex<Option<ChildMain>>>,
}

impl Handshake {
  pub(crate) fn new(snapshot: StdArc<ParentSnapshot>, child_main: StdArc<Mutex<Option<ChildMain>>>) -> Self {
    Self {
      ready: Event::auto(false),
      finished: Event::auto(false),
      snapshot,
      relocated: Mutex::new(None),
      child_main,
    }
  }
}

impl Debug for Handshake {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Handshake")
      .field("ready", &self.ready)
      .field("finished", &self.finished)
      .field("snapshot", &self.snapshot)
      .finish_non_exhaustive()
  }
}
