use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::ops::Range;
use std::panic;

// -----------------------------------------------------------------------------
// Region
// -----------------------------------------------------------------------------

/// A contiguous range of virtual addresses.
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Region {
  pub base: usize,
  pub len: usize,
}

impl Region {
  /// An empty region.
  pub const EMPTY: Self = Self::new(0, 0);

  #[inline]
  pub const fn new(base: usize, len: usize) -> Self {
    Self { base, len }
  }

  /// Returns the address one past the end of the region.
  #[inline]
  pub const fn end(&self) -> usize {
    self.base + self.len
  }

  #[inline]
  pub const fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  pub const fn range(&self) -> Range<usize> {
    self.base..self.end()
  }

  /// Returns `true` if the two regions share at least one address.
  #[inline]
  pub const fn overlaps(&self, other: &Self) -> bool {
    self.base < other.end() && other.base < self.end()
  }

  /// Returns `true` if `other` lies entirely within this region.
  #[inline]
  pub const fn contains(&self, other: &Self) -> bool {
    other.base >= self.base && other.end() <= self.end()
  }

  /// Splits the region into pieces of at most `size` bytes.
  ///
  /// A `size` of zero yields the whole region as one piece.
  pub fn chunks(&self, size: usize) -> impl Iterator<Item = Region> + use<> {
    let this: Region = *self;
    let step: usize = if size == 0 { this.len.max(1) } else { size };

    (this.base..this.end())
      .step_by(step)
      .map(move |base| Region::new(base, step.min(this.end() - base)))
  }
}

impl Debug for Region {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "{:#x}..{:#x}", self.base, self.end())
  }
}

// -----------------------------------------------------------------------------
// Memory Fault
// -----------------------------------------------------------------------------

/// An access to memory that is not fully mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryFault {
  pub addr: usize,
  pub len: usize,
}

impl MemoryFault {
  /// Raises this fault as an unwinding access violation.
  ///
  /// The unwind is caught by an enclosing [`FaultScope`]; the panic hook is
  /// not invoked.
  ///
  /// [`FaultScope`]: crate::tls::FaultScope
  pub fn raise(self) -> ! {
    panic::resume_unwind(Box::new(self))
  }
}

impl Display for MemoryFault {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "access violation at {:#x} ({} bytes)", self.addr, self.len)
  }
}

impl std::error::Error for MemoryFault {}

// -----------------------------------------------------------------------------
// Address Space
// -----------------------------------------------------------------------------

/// The memory image of one emulated process.
///
/// Regions never overlap. Every access must fall entirely inside a single
/// mapped region, otherwise it fails with a [`MemoryFault`].
pub struct AddressSpace {
  regions: RwLock<BTreeMap<usize, Box<[u8]>>>,
}

impl AddressSpace {
  pub fn new() -> Self {
    Self {
      regions: RwLock::new(BTreeMap::new()),
    }
  }

  /// Maps a zero-filled region.
  pub fn map(&self, region: Region) -> Result<(), MemoryFault> {
    if region.is_empty() {
      return Ok(());
    }

    let mut regions = self.regions.write();

    let overlap: bool = regions
      .range(..region.end())
      .next_back()
      .is_some_and(|(base, data)| Region::new(*base, data.len()).overlaps(&region));

    if overlap {
      return Err(MemoryFault {
        addr: region.base,
        len: region.len,
      });
    }

    regions.insert(region.base, vec![0; region.len].into_boxed_slice());

    Ok(())
  }

  /// Maps `region` unless exactly that region is already mapped.
  pub fn ensure(&self, region: Region) -> Result<(), MemoryFault> {
    if self.mapped_exactly(region) {
      Ok(())
    } else {
      self.map(region)
    }
  }

  /// Unmaps the region starting at `base`. Returns `false` if none did.
  pub fn unmap(&self, base: usize) -> bool {
    self.regions.write().remove(&base).is_some()
  }

  /// Returns `true` if `len` bytes at `addr` lie inside one mapped region.
  pub fn is_mapped(&self, addr: usize, len: usize) -> bool {
    let target: Region = Region::new(addr, len);

    self
      .regions
      .read()
      .range(..=addr)
      .next_back()
      .is_some_and(|(base, data)| Region::new(*base, data.len()).contains(&target))
  }

  fn mapped_exactly(&self, region: Region) -> bool {
    self
      .regions
      .read()
      .get(&region.base)
      .is_some_and(|data| data.len() == region.len)
  }

  /// Returns every mapped region in address order.
  pub fn regions(&self) -> Vec<Region> {
    self
      .regions
      .read()
      .iter()
      .map(|(base, data)| Region::new(*base, data.len()))
      .collect()
  }

  pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryFault> {
    let regions = self.regions.read();
    let (base, data) = Self::locate(&regions, addr, buf.len())?;
    let offset: usize = addr - base;

    buf.copy_from_slice(&data[offset..offset + buf.len()]);

    Ok(())
  }

  pub fn read_vec(&self, addr: usize, len: usize) -> Result<Vec<u8>, MemoryFault> {
    let mut buf: Vec<u8> = vec![0; len];
    self.read(addr, &mut buf)?;
    Ok(buf)
  }

  pub fn write(&self, addr: usize, data: &[u8]) -> Result<(), MemoryFault> {
    let mut regions = self.regions.write();

    let fault: MemoryFault = MemoryFault {
      addr,
      len: data.len(),
    };

    let Some((base, region)) = regions.range_mut(..=addr).next_back() else {
      return Err(fault);
    };

    let offset: usize = addr - *base;

    if offset + data.len() > region.len() {
      return Err(fault);
    }

    region[offset..offset + data.len()].copy_from_slice(data);

    Ok(())
  }

  fn locate<'a>(
    regions: &'a BTreeMap<usize, Box<[u8]>>,
    addr: usize,
    len: usize,
  ) -> Result<(usize, &'a [u8]), MemoryFault> {
    match regions.range(..=addr).next_back() {
      Some((base, data)) if addr - base + len <= data.len() => Ok((*base, data)),
      _ => Err(MemoryFault { addr, len }),
    }
  }
}

impl Default for AddressSpace {
  fn default() -> Self {
    Self::new()
  }
}

impl Debug for AddressSpace {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_list().entries(self.regions()).finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::host::AddressSpace;
  use crate::host::MemoryFault;
  use crate::host::Region;

  #[test]
  fn test_map_rejects_overlap() {
    let space: AddressSpace = AddressSpace::new();

    space.map(Region::new(0x1000, 0x100)).unwrap();

    assert!(space.map(Region::new(0x10f0, 0x20)).is_err());
    assert!(space.map(Region::new(0x0ff0, 0x20)).is_err());
    assert!(space.map(Region::new(0x1100, 0x20)).is_ok());
  }

  #[test]
  fn test_access_within_region() {
    let space: AddressSpace = AddressSpace::new();

    space.map(Region::new(0x1000, 0x10)).unwrap();
    space.write(0x1004, b"abcd").unwrap();

    assert_eq!(space.read_vec(0x1004, 4).unwrap(), b"abcd");
    assert!(space.is_mapped(0x1000, 0x10));
    assert!(!space.is_mapped(0x1008, 0x10));
  }

  #[test]
  fn test_access_across_boundary_faults() {
    let space: AddressSpace = AddressSpace::new();

    space.map(Region::new(0x1000, 0x10)).unwrap();
    space.map(Region::new(0x1010, 0x10)).unwrap();

    let fault: MemoryFault = space.read_vec(0x100c, 8).unwrap_err();

    assert_eq!(fault, MemoryFault { addr: 0x100c, len: 8 });
    assert!(space.write(0x0800, b"x").is_err());
  }

  #[test]
  fn test_chunks() {
    let chunks: Vec<Region> = Region::new(0x100, 10).chunks(4).collect();

    assert_eq!(
      chunks,
      [Region::new(0x100, 4), Region::new(0x104, 4), Region::new(0x108, 2)],
    );

    assert_eq!(Region::new(0x100, 10).chunks(0).count(), 1);
  }
}
