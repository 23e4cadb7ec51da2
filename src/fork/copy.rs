//! Parent-to-child memory copy.

use tracing::trace;
use tracing::warn;

use crate::error::Errno;
use crate::fork::ForkFailure;
use crate::host::AddressSpace;
use crate::host::ChildProcess;
use crate::host::Host;
use crate::host::Region;
use crate::tls::FaultScope;
use crate::tls::ThreadContext;

/// Copies `from` of the parent to `to_base` in the child, `chunk` bytes at a
/// time.
///
/// Reads run under a fault scope of the forking thread, so an unmapped
/// parent page fails the copy instead of crashing the parent. Any failed
/// chunk fails the whole copy.
pub(crate) fn copy_region(
  host: &dyn Host,
  ctx: &ThreadContext,
  source: &AddressSpace,
  child: &ChildProcess,
  from: Region,
  to_base: usize,
  chunk: usize,
) -> Result<usize, ForkFailure> {
  let mut scope: FaultScope<'_> = ctx.fault_scope(Errno::EFAULT);
  let mut copied: usize = 0;

  for piece in from.chunks(chunk) {
    let bytes: Vec<u8> = scope
      .probe(|| source.read_vec(piece.base, piece.len))
      .map_err(|errno| {
        warn!(target: "posix_shim", region = ?piece, %errno, "parent read failed");
        ForkFailure::Copy
      })?;

    let target: usize = to_base + (piece.base - from.base);

    host.write_memory(child, target, &bytes).map_err(|error| {
      warn!(
        target: "posix_shim",
        host_pid = child.host_pid(),
        addr = format_args!("{target:#x}"),
        %error,
        "child write failed",
      );
      ForkFailure::Copy
    })?;

    copied += bytes.len();
  }

  trace!(
    target: "posix_shim",
    host_pid = child.host_pid(),
    region = ?from,
    to = format_args!("{to_base:#x}"),
    copied,
    "region copied",
  );

  Ok(copied)
}

/// Copies every region to the same address in the child.
pub(crate) fn copy_identity(
  host: &dyn Host,
  ctx: &ThreadContext,
  source: &AddressSpace,
  child: &ChildProcess,
  regions: &[Region],
  chunk: usize,
) -> Result<usize, ForkFailure> {
  regions.iter().try_fold(0, |total, region| {
    copy_region(host, ctx, source, child, *region, region.base, chunk).map(|copied| total + copied)
  })
}

#[cfg(test)]
mod tests {
  use std::sync::Arc as StdArc;

  use crate::fork::ForkFailure;
  use crate::fork::copy::copy_region;
  use crate::host::AddressSpace;
  use crate::host::ChildProcess;
  use crate::host::Host;
  use crate::host::Region;
  use crate::host::SimHost;
  use crate::tls::ThreadContext;
  use crate::tls::ThreadInit;

  fn setup() -> (StdArc<SimHost>, ChildProcess, AddressSpace, ThreadContext) {
    let host: StdArc<SimHost> = StdArc::new(SimHost::new());
    let child: ChildProcess = host.attach_process("copy-test").unwrap();
    let source: AddressSpace = AddressSpace::new();
    let ctx: ThreadContext = ThreadContext::new(ThreadInit::default());

    (host, child, source, ctx)
  }

  #[test]
  fn test_relocating_copy_in_chunks() {
    let (host, child, source, ctx) = setup();

    source.map(Region::new(0x1000, 0x30)).unwrap();
    source.write(0x1000, &[7; 0x30]).unwrap();
    child.memory().map(Region::new(0x8000, 0x30)).unwrap();

    let copied: usize = copy_region(&*host, &ctx, &source, &child, Region::new(0x1000, 0x30), 0x8000, 0x10).unwrap();

    assert_eq!(copied, 0x30);
    assert_eq!(child.memory().read_vec(0x8000, 0x30).unwrap(), vec![7; 0x30]);
  }

  #[test]
  fn test_unmapped_source_fails_copy() {
    let (host, child, source, ctx) = setup();

    child.memory().map(Region::new(0x1000, 0x10)).unwrap();

    let result: Result<usize, ForkFailure> =
      copy_region(&*host, &ctx, &source, &child, Region::new(0x1000, 0x10), 0x1000, 0);

    assert_eq!(result, Err(ForkFailure::Copy));
    assert_eq!(ctx.recovery_depth(), 0);
  }

  #[test]
  fn test_write_fault_fails_copy() {
    let (host, child, source, ctx) = setup();

    source.map(Region::new(0x1000, 0x20)).unwrap();
    source.write(0x1000, &[5; 0x20]).unwrap();
    child.memory().map(Region::new(0x1000, 0x20)).unwrap();
    host.inject_write_fault(0x1010..0x1011);

    let result: Result<usize, ForkFailure> =
      copy_region(&*host, &ctx, &source, &child, Region::new(0x1000, 0x20), 0x1000, 0x10);

    assert_eq!(result, Err(ForkFailure::Copy));
    // The first chunk landed before the fault.
    assert_eq!(child.memory().read_vec(0x1000, 0x10).unwrap(), vec![5; 0x10]);
    assert_eq!(child.memory().read_vec(0x1010, 0x10).unwrap(), vec![0; 0x10]);
  }
}
