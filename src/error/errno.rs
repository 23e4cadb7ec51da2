use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

/// POSIX error code returned from emulation-layer operations.
///
/// Every fallible public operation of this crate reports one of these. The
/// variants map one-to-one onto the host's `errno` values via [`raw`].
///
/// [`raw`]: Self::raw
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[non_exhaustive]
pub enum Errno {
  /// Resource temporarily unavailable.
  EAGAIN,
  /// Interrupted by a signal.
  EINTR,
  /// Invalid argument.
  EINVAL,
  /// Out of memory.
  ENOMEM,
  /// Operation not permitted (also used for "not the owner").
  EPERM,
  /// No such process.
  ESRCH,
  /// Bad address.
  EFAULT,
  /// A bounded wait expired.
  ETIMEDOUT,
  /// Function not implemented or facility not running.
  ENOSYS,
}

impl Errno {
  /// Returns the host `errno` value for this code.
  #[inline]
  pub const fn raw(self) -> i32 {
    match self {
      Self::EAGAIN => libc::EAGAIN,
      Self::EINTR => libc::EINTR,
      Self::EINVAL => libc::EINVAL,
      Self::ENOMEM => libc::ENOMEM,
      Self::EPERM => libc::EPERM,
      Self::ESRCH => libc::ESRCH,
      Self::EFAULT => libc::EFAULT,
      Self::ETIMEDOUT => libc::ETIMEDOUT,
      Self::ENOSYS => libc::ENOSYS,
    }
  }

  /// Converts a host `errno` value back into an `Errno`.
  pub const fn from_raw(raw: i32) -> Option<Self> {
    match raw {
      libc::EAGAIN => Some(Self::EAGAIN),
      libc::EINTR => Some(Self::EINTR),
      libc::EINVAL => Some(Self::EINVAL),
      libc::ENOMEM => Some(Self::ENOMEM),
      libc::EPERM => Some(Self::EPERM),
      libc::ESRCH => Some(Self::ESRCH),
      libc::EFAULT => Some(Self::EFAULT),
      libc::ETIMEDOUT => Some(Self::ETIMEDOUT),
      libc::ENOSYS => Some(Self::ENOSYS),
      _ => None,
    }
  }

  #[inline]
  const fn label(self) -> &'static str {
    match self {
      Self::EAGAIN => "resource temporarily unavailable",
      Self::EINTR => "interrupted system call",
      Self::EINVAL => "invalid argument",
      Self::ENOMEM => "cannot allocate memory",
      Self::EPERM => "operation not permitted",
      Self::ESRCH => "no such process",
      Self::EFAULT => "bad address",
      Self::ETIMEDOUT => "timed out",
      Self::ENOSYS => "function not implemented",
    }
  }
}

impl Display for Errno {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "{:?}: {}", self, self.label())
  }
}

impl Error for Errno {}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::error::Errno;

  #[test]
  fn test_raw_round_trip() {
    for errno in [Errno::EAGAIN, Errno::EINVAL, Errno::EPERM, Errno::ESRCH] {
      assert_eq!(Errno::from_raw(errno.raw()), Some(errno));
    }

    assert_eq!(Errno::from_raw(0), None);
  }

  #[test]
  fn test_display() {
    let again: String = format!("{}", Errno::EAGAIN);
    let inval: String = format!("{}", Errno::EINVAL);

    assert!(again.starts_with("EAGAIN:"));
    assert!(inval.ends_with("invalid argument"));
  }
}
