use parking_lot::RwLock;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use crate::consts::REENT_SIZE;
use crate::consts::THREAD_STACK_SIZE;
use crate::error::Errno;
use crate::host::AddressSpace;
use crate::host::Region;
use crate::proc::Process;

// -----------------------------------------------------------------------------
// Process Image
// -----------------------------------------------------------------------------

/// The replicated memory layout of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessImage {
  /// Initialized data of the executable.
  pub data: Region,
  /// Zero-initialized data of the executable.
  pub bss: Region,
  pub heap: Region,
  /// Stack of the main thread.
  pub stack: Region,
  /// Reentrant C-library state.
  pub reent: Region,
}

impl ProcessImage {
  /// Every non-empty region, in copy order.
  pub fn regions(&self) -> Vec<Region> {
    [self.data, self.bss, self.heap, self.stack, self.reent]
      .into_iter()
      .filter(|region| !region.is_empty())
      .collect()
  }

  /// Maps every region into `memory`.
  pub(crate) fn map_into(&self, memory: &AddressSpace) -> Result<(), Errno> {
    for region in self.regions() {
      memory.ensure(region).map_err(|_| Errno::ENOMEM)?;
    }

    Ok(())
  }
}

impl Default for ProcessImage {
  fn default() -> Self {
    Self {
      data: Region::new(0x0040_0000, 0x1000),
      bss: Region::new(0x0040_1000, 0x1000),
      heap: Region::new(0x0100_0000, 0x1_0000),
      stack: Region::new(0x7fff_0000, THREAD_STACK_SIZE),
      reent: Region::new(0x7ffe_0000, REENT_SIZE),
    }
  }
}

// -----------------------------------------------------------------------------
// Loaded Module
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ModuleKind {
  /// Linked at startup; lands at the same address in a child.
  Linked,
  /// Loaded at runtime; a child reloads it and may relocate it.
  Dynamic,
}

/// The mutable regions of one loaded module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedModule {
  pub name: String,
  pub data: Region,
  pub bss: Region,
  pub kind: ModuleKind,
}

impl LoadedModule {
  pub fn new(name: impl Into<String>, data: Region, bss: Region, kind: ModuleKind) -> Self {
    Self {
      name: name.into(),
      data,
      bss,
      kind,
    }
  }

  pub fn regions(&self) -> impl Iterator<Item = Region> + use<> {
    [self.data, self.bss].into_iter().filter(|region| !region.is_empty())
  }
}

// -----------------------------------------------------------------------------
// Module List
// -----------------------------------------------------------------------------

/// The modules loaded into a process.
#[derive(Default)]
pub struct ModuleList {
  modules: RwLock<Vec<LoadedModule>>,
}

impl ModuleList {
  pub fn new(modules: Vec<LoadedModule>) -> Self {
    Self {
      modules: RwLock::new(modules),
    }
  }

  pub fn snapshot(&self) -> Vec<LoadedModule> {
    self.modules.read().clone()
  }

  pub fn len(&self) -> usize {
    self.modules.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.modules.read().is_empty()
  }

  /// Returns `true` if any module must be reloaded by a forked child.
  pub fn has_dynamic(&self) -> bool {
    self
      .modules
      .read()
      .iter()
      .any(|module| module.kind == ModuleKind::Dynamic)
  }

  pub(crate) fn push(&self, module: LoadedModule) {
    self.modules.write().push(module);
  }

  /// Replaces the dynamic modules, keeping the linked ones.
  pub(crate) fn replace_dynamic(&self, dynamic: Vec<LoadedModule>) {
    let mut modules = self.modules.write();
    modules.retain(|module| module.kind == ModuleKind::Linked);
    modules.extend(dynamic);
  }
}

impl Debug for ModuleList {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_list().entries(self.modules.read().iter()).finish()
  }
}

// -----------------------------------------------------------------------------
// Module Loader
// -----------------------------------------------------------------------------

/// Loader collaborator consulted by a forked child.
pub trait ModuleLoader: Send + Sync + 'static {
  /// Reloads a dynamic module in `child` and returns where it landed.
  ///
  /// The default maps the module at its parent addresses.
  fn load_after_fork(&self, child: &Process, module: &LoadedModule) -> Result<LoadedModule, Errno> {
    for region in module.regions() {
      child.memory().ensure(region).map_err(|_| Errno::ENOMEM)?;
    }

    Ok(module.clone())
  }
}

/// A [`ModuleLoader`] that reloads every module at its original address.
#[derive(Clone, Copy, Debug, Default)]
pub struct SameAddressLoader;

impl ModuleLoader for SameAddressLoader {}

#[cfg(test)]
mod tests {
  use crate::host::Region;
  use crate::proc::LoadedModule;
  use crate::proc::ModuleKind;
  use crate::proc::ModuleList;
  use crate::proc::ProcessImage;

  #[test]
  fn test_default_image_is_disjoint() {
    let regions: Vec<Region> = ProcessImage::default().regions();

    for (index, a) in regions.iter().enumerate() {
      for b in &regions[index + 1..] {
        assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
      }
    }
  }

  #[test]
  fn test_replace_dynamic_keeps_linked() {
    let list: ModuleList = ModuleList::new(vec![
      LoadedModule::new("libc", Region::new(0x1000, 0x10), Region::EMPTY, ModuleKind::Linked),
      LoadedModule::new("plugin", Region::new(0x2000, 0x10), Region::EMPTY, ModuleKind::Dynamic),
    ]);

    assert!(list.has_dynamic());

    list.replace_dynamic(vec![LoadedModule::new(
      "plugin",
      Region::new(0x9000, 0x10),
      Region::EMPTY,
      ModuleKind::Dynamic,
    )]);

    let names: Vec<(String, usize)> = list
      .snapshot()
      .into_iter()
      .map(|module| (module.name, module.data.base))
      .collect();

    assert_eq!(names, [("libc".to_owned(), 0x1000), ("plugin".to_owned(), 0x9000)]);
  }
}
