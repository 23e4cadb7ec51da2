use crate::error::Errno;
use crate::host::ChildProcess;
use crate::host::HostPid;
use crate::proc::Process;

/// A subsystem with resources that need fixing up across a fork.
///
/// Hooks are inherited by the child, so the same object sees both sides.
pub trait ForkHook: Send + Sync + 'static {
  fn name(&self) -> &str;

  /// Runs in the parent while the child is created but not yet resumed.
  ///
  /// An error aborts the fork.
  fn fixup_before_fork(&self, _child: &ChildProcess) -> Result<(), Errno> {
    Ok(())
  }

  /// Runs once in the child, on its main thread, before it starts running
  /// user code.
  fn fixup_after_fork(&self, _child: &Process, _parent: HostPid) {}
}
