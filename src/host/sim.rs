use hashbrown::HashMap;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::ops::Range;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use triomphe::Arc;

use crate::consts::E_CODE_FAILURE;
use crate::host::AddressSpace;
use crate::host::ChildProcess;
use crate::host::Host;
use crate::host::HostError;
use crate::host::HostErrorKind;
use crate::host::HostPid;
use crate::host::ProcessEntry;
use crate::host::ProcessSpec;

/// An in-process [`Host`].
///
/// Each process is an [`AddressSpace`] plus a host thread that runs the
/// process entry once the process is resumed. Terminating a process marks
/// it as ended and signals its `killed` event; code still running on its
/// thread observes that event at its next wait.
///
/// `SimHost` supports fault injection for exercising failure paths:
///
/// - [`inject_name_collisions`]: the next creations fail with a name clash
/// - [`inject_stalled_startups`]: the next resumed processes never run
/// - [`inject_write_fault`]: cross-process writes into a range fail
///
/// [`inject_name_collisions`]: Self::inject_name_collisions
/// [`inject_stalled_startups`]: Self::inject_stalled_startups
/// [`inject_write_fault`]: Self::inject_write_fault
pub struct SimHost {
  table: Mutex<HashMap<HostPid, SimProcess>>,
  faults: Mutex<Faults>,
  next_pid: AtomicU32,
  created: AtomicU32,
  terminated: AtomicU32,
}

struct SimProcess {
  handle: ChildProcess,
  entry: Option<ProcessEntry>,
}

#[derive(Default)]
struct Faults {
  name_collisions: u32,
  stalled_startups: u32,
  write_fault: Option<Range<usize>>,
}

impl SimHost {
  pub fn new() -> Self {
    Self {
      table: Mutex::new(HashMap::new()),
      faults: Mutex::new(Faults::default()),
      next_pid: AtomicU32::new(1000),
      created: AtomicU32::new(0),
      terminated: AtomicU32::new(0),
    }
  }

  /// Makes the next `count` process creations fail with a name collision.
  pub fn inject_name_collisions(&self, count: u32) {
    self.faults.lock().name_collisions = count;
  }

  /// Makes the next `count` resumed processes never run their entry.
  pub fn inject_stalled_startups(&self, count: u32) {
    self.faults.lock().stalled_startups = count;
  }

  /// Makes every cross-process write touching `range` fail.
  pub fn inject_write_fault(&self, range: Range<usize>) {
    self.faults.lock().write_fault = Some(range);
  }

  pub fn clear_faults(&self) {
    *self.faults.lock() = Faults::default();
  }

  /// Number of processes created (suspended or not) so far.
  pub fn created(&self) -> u32 {
    self.created.load(Ordering::Relaxed)
  }

  /// Number of forced terminations so far.
  pub fn terminated(&self) -> u32 {
    self.terminated.load(Ordering::Relaxed)
  }

  /// Number of processes that have not ended.
  pub fn live(&self) -> usize {
    self
      .table
      .lock()
      .values()
      .filter(|process| process.handle.exit_code().is_none())
      .count()
  }

  fn register(&self, name: String, entry: Option<ProcessEntry>) -> Result<ChildProcess, HostError> {
    let mut table = self.table.lock();

    let collision: bool = table
      .values()
      .any(|process| process.handle.name() == name && process.handle.exit_code().is_none());

    if collision {
      return Err(HostError::new(HostErrorKind::NameCollision, name));
    }

    let host_pid: HostPid = self.next_pid.fetch_add(1, Ordering::Relaxed);
    let memory: Arc<AddressSpace> = Arc::new(AddressSpace::new());
    let handle: ChildProcess = ChildProcess::new(host_pid, name, memory);

    table.insert(
      host_pid,
      SimProcess {
        handle: handle.clone(),
        entry,
      },
    );

    Ok(handle)
  }

  fn take_fault(counter: &mut u32) -> bool {
    if *counter == 0 {
      return false;
    }

    *counter -= 1;
    true
  }

  fn live_handle(&self, child: &ChildProcess) -> Result<(), HostError> {
    match self.table.lock().get(&child.host_pid()) {
      Some(process) if process.handle.exit_code().is_none() => Ok(()),
      _ => Err(HostError::new(
        HostErrorKind::InvalidHandle,
        format!("process {} is gone", child.host_pid()),
      )),
    }
  }
}

impl Host for SimHost {
  fn create_process(&self, spec: ProcessSpec) -> Result<ChildProcess, HostError> {
    if Self::take_fault(&mut self.faults.lock().name_collisions) {
      debug!(target: "posix_shim", name = %spec.name, "injected name collision");
      return Err(HostError::new(HostErrorKind::NameCollision, spec.name));
    }

    let ProcessSpec {
      name,
      suspended,
      inherit_handles,
      image,
      entry,
    } = spec;

    let handle: ChildProcess = self.register(name, Some(entry))?;

    for region in image {
      if let Err(error) = handle.memory().ensure(region) {
        handle.kill(E_CODE_FAILURE);
        return Err(HostError::new(HostErrorKind::NoResources, error.to_string()));
      }
    }

    self.created.fetch_add(1, Ordering::Relaxed);

    trace!(
      target: "posix_shim",
      host_pid = handle.host_pid(),
      name = handle.name(),
      suspended,
      inherit_handles,
      "process created",
    );

    if !suspended {
      self.resume_process(&handle)?;
    }

    Ok(handle)
  }

  fn attach_process(&self, name: &str) -> Result<ChildProcess, HostError> {
    let handle: ChildProcess = self.register(name.to_owned(), None)?;
    self.created.fetch_add(1, Ordering::Relaxed);
    Ok(handle)
  }

  fn resume_process(&self, child: &ChildProcess) -> Result<(), HostError> {
    let entry: Option<ProcessEntry> = match self.table.lock().get_mut(&child.host_pid()) {
      Some(process) => process.entry.take(),
      None => {
        return Err(HostError::new(HostErrorKind::InvalidHandle, "resume of unknown process"));
      }
    };

    // Resuming twice is a no-op.
    let Some(entry) = entry else {
      return Ok(());
    };

    if Self::take_fault(&mut self.faults.lock().stalled_startups) {
      debug!(target: "posix_shim", host_pid = child.host_pid(), "injected stalled startup");
      return Ok(());
    }

    let handle: ChildProcess = child.clone();

    thread::Builder::new()
      .name(format!("sim-{}", child.host_pid()))
      .spawn(move || {
        let code: i32 = entry(handle.clone());
        handle.finish(code);
      })
      .map(drop)
      .map_err(|error| HostError::new(HostErrorKind::NoResources, error.to_string()))
  }

  fn write_memory(&self, child: &ChildProcess, addr: usize, data: &[u8]) -> Result<(), HostError> {
    self.live_handle(child)?;

    if let Some(range) = self.faults.lock().write_fault.as_ref() {
      if addr < range.end && range.start < addr + data.len() {
        return Err(HostError::new(
          HostErrorKind::PartialCopy,
          format!("write of {} bytes at {addr:#x} failed", data.len()),
        ));
      }
    }

    child.memory().write(addr, data).map_err(HostError::from)
  }

  fn read_memory(&self, child: &ChildProcess, addr: usize, buf: &mut [u8]) -> Result<(), HostError> {
    self.live_handle(child)?;
    child.memory().read(addr, buf).map_err(HostError::from)
  }

  fn terminate_process(&self, child: &ChildProcess, code: i32) -> Result<(), HostError> {
    self.live_handle(child)?;

    if let Some(process) = self.table.lock().get_mut(&child.host_pid()) {
      process.entry = None;
    }

    if child.kill(code) {
      self.terminated.fetch_add(1, Ordering::Relaxed);
      warn!(target: "posix_shim", host_pid = child.host_pid(), code, "process terminated");
    }

    Ok(())
  }

  fn exit_process(&self, host_pid: HostPid, code: i32) {
    if let Some(process) = self.table.lock().get(&host_pid) {
      process.handle.finish(code);
    }
  }

  fn memory_of(&self, host_pid: HostPid) -> Option<Arc<AddressSpace>> {
    self
      .table
      .lock()
      .get(&host_pid)
      .filter(|process| process.handle.exit_code().is_none())
      .map(|process| Arc::clone(process.handle.memory()))
  }
}

impl Default for SimHost {
  fn default() -> Self {
    Self::new()
  }
}

impl Debug for SimHost {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("SimHost")
      .field("created", &self.created())
      .field("terminated", &self.terminated())
      .field("live", &self.live())
      .finish_non_exhaustive()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use crate::host::ChildProcess;
  use crate::host::Host;
  use crate::host::HostErrorKind;
  use crate::host::ProcessSpec;
  use crate::host::Region;
  use crate::host::SimHost;

  const WAIT: Option<Duration> = Some(Duration::from_secs(5));

  fn spec(name: &str, suspended: bool) -> ProcessSpec {
    ProcessSpec {
      name: name.to_owned(),
      suspended,
      inherit_handles: true,
      image: vec![Region::new(0x1000, 0x100)],
      entry: Box::new(|child: ChildProcess| child.memory().read_vec(0x1000, 1).unwrap()[0] as i32),
    }
  }

  #[test]
  fn test_suspended_runs_after_resume() {
    let host: SimHost = SimHost::new();
    let child: ChildProcess = host.create_process(spec("a", true)).unwrap();

    host.write_memory(&child, 0x1000, &[7]).unwrap();

    assert_eq!(child.exit_code(), None);

    host.resume_process(&child).unwrap();

    assert_eq!(child.wait(WAIT), Some(7));
  }

  #[test]
  fn test_name_collision() {
    let host: SimHost = SimHost::new();
    let _child: ChildProcess = host.create_process(spec("same", true)).unwrap();
    let error = host.create_process(spec("same", true)).unwrap_err();

    assert_eq!(error.kind(), HostErrorKind::NameCollision);

    host.inject_name_collisions(1);

    let error = host.create_process(spec("other", true)).unwrap_err();

    assert_eq!(error.kind(), HostErrorKind::NameCollision);
    assert!(host.create_process(spec("other", true)).is_ok());
  }

  #[test]
  fn test_stalled_and_terminated() {
    let host: SimHost = SimHost::new();

    host.inject_stalled_startups(1);

    let child: ChildProcess = host.create_process(spec("stall", false)).unwrap();

    assert_eq!(child.wait(Some(Duration::from_millis(20))), None);

    host.terminate_process(&child, 9).unwrap();

    assert_eq!(child.wait(WAIT), Some(9));
    assert!(child.killed().is_set());
    assert_eq!(host.terminated(), 1);
    assert!(host.write_memory(&child, 0x1000, &[1]).is_err());
  }

  #[test]
  fn test_write_fault() {
    let host: SimHost = SimHost::new();
    let child: ChildProcess = host.create_process(spec("fault", true)).unwrap();

    host.inject_write_fault(0x1080..0x1090);

    assert!(host.write_memory(&child, 0x1000, &[0; 0x80]).is_ok());

    let error = host.write_memory(&child, 0x1000, &[0; 0x81]).unwrap_err();

    assert_eq!(error.kind(), HostErrorKind::PartialCopy);
  }
}
