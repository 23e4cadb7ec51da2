use hashbrown::HashMap;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use crate::proc::Pid;
use crate::proc::Process;

/// First emulated process id handed out.
const FIRST_PID: Pid = 100;

static TABLE: LazyLock<ProcessTable> = LazyLock::new(ProcessTable::new);

/// Registry of the live emulated processes, by emulated pid.
///
/// Holds weak references only; a process leaves the table when it exits.
pub struct ProcessTable {
  map: RwLock<HashMap<Pid, Weak<Process>>>,
  next: AtomicU32,
}

impl ProcessTable {
  fn new() -> Self {
    Self {
      map: RwLock::new(HashMap::new()),
      next: AtomicU32::new(FIRST_PID),
    }
  }

  /// The table shared by every process of this host process.
  #[inline]
  pub fn global() -> &'static Self {
    &TABLE
  }

  /// Reserves a fresh pid.
  pub fn next_pid(&self) -> Pid {
    self.next.fetch_add(1, Ordering::Relaxed)
  }

  pub(crate) fn insert(&self, process: &Arc<Process>) {
    self.map.write().insert(process.pid(), Arc::downgrade(process));
  }

  pub(crate) fn remove(&self, pid: Pid) -> bool {
    self.map.write().remove(&pid).is_some()
  }

  /// Looks up a live process.
  pub fn get(&self, pid: Pid) -> Option<Arc<Process>> {
    self.map.read().get(&pid).and_then(Weak::upgrade)
  }

  pub fn contains(&self, pid: Pid) -> bool {
    self.get(pid).is_some()
  }

  pub fn len(&self) -> usize {
    self.map.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn pids(&self) -> Vec<Pid> {
    let mut pids: Vec<Pid> = self.map.read().keys().copied().collect();
    pids.sort_unstable();
    pids
  }
}

impl Debug for ProcessTable {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("ProcessTable")
      .field("pids", &self.pids())
      .field("next", &self.next.load(Ordering::Relaxed))
      .finish()
  }
}
