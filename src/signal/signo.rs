use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use crate::error::Errno;

/// One past the highest public signal number.
pub const NSIG: i32 = 65;

// -----------------------------------------------------------------------------
// Signal Number
// -----------------------------------------------------------------------------

/// A signal number.
///
/// Public signals are `1..NSIG`. A few reserved numbers outside that range
/// carry control requests to the signal thread and are never visible to
/// callers.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Signo(i32);

macro_rules! signals {
  ($($name:ident = $value:literal,)+) => {
    impl Signo {
      $(
        pub const $name: Self = Self($value);
      )+

      const fn public_name(self) -> Option<&'static str> {
        match self.0 {
          $($value => Some(stringify!($name)),)+
          _ => None,
        }
      }
    }
  };
}

signals! {
  SIGHUP = 1,
  SIGINT = 2,
  SIGQUIT = 3,
  SIGILL = 4,
  SIGTRAP = 5,
  SIGABRT = 6,
  SIGEMT = 7,
  SIGFPE = 8,
  SIGKILL = 9,
  SIGBUS = 10,
  SIGSEGV = 11,
  SIGSYS = 12,
  SIGPIPE = 13,
  SIGALRM = 14,
  SIGTERM = 15,
  SIGURG = 16,
  SIGSTOP = 17,
  SIGTSTP = 18,
  SIGCONT = 19,
  SIGCHLD = 20,
  SIGTTIN = 21,
  SIGTTOU = 22,
  SIGIO = 23,
  SIGXCPU = 24,
  SIGXFSZ = 25,
  SIGVTALRM = 26,
  SIGPROF = 27,
  SIGWINCH = 28,
  SIGPWR = 29,
  SIGUSR1 = 30,
  SIGUSR2 = 31,
  SIGRTMIN = 32,
  SIGRTMAX = 64,
}

impl Signo {
  /// Re-examine pending signals.
  pub(crate) const FLUSH: Self = Self(-(NSIG + 1));
  /// Enter a hold section.
  pub(crate) const HOLD: Self = Self(-(NSIG + 2));
  /// Leave a hold section.
  pub(crate) const NOHOLD: Self = Self(-(NSIG + 3));
  /// Stop the signal thread.
  pub(crate) const EXIT: Self = Self(-(NSIG + 4));

  /// Validates a raw public signal number.
  ///
  /// Fails with `EINVAL` outside `1..NSIG`.
  pub const fn new(raw: i32) -> Result<Self, Errno> {
    if raw > 0 && raw < NSIG {
      Ok(Self(raw))
    } else {
      Err(Errno::EINVAL)
    }
  }

  #[inline]
  pub const fn raw(self) -> i32 {
    self.0
  }

  /// Returns `true` for the control numbers used by the signal thread.
  #[inline]
  pub const fn is_internal(self) -> bool {
    self.0 < 0
  }

  /// Returns `true` for signals that cannot be blocked, caught or ignored.
  #[inline]
  pub const fn is_unblockable(self) -> bool {
    matches!(self, Self::SIGKILL | Self::SIGSTOP)
  }

  /// Returns `true` for the job-control stop signals.
  #[inline]
  pub const fn is_stop(self) -> bool {
    matches!(self, Self::SIGSTOP | Self::SIGTSTP | Self::SIGTTIN | Self::SIGTTOU)
  }

  /// Returns the action taken when the disposition is the default.
  pub const fn default_action(self) -> DefaultAction {
    match self {
      Self::SIGCHLD | Self::SIGURG | Self::SIGWINCH | Self::SIGIO | Self::SIGPWR => {
        DefaultAction::Ignore
      }
      Self::SIGCONT => DefaultAction::Continue,
      Self::SIGSTOP | Self::SIGTSTP | Self::SIGTTIN | Self::SIGTTOU => DefaultAction::Stop,
      Self::SIGQUIT
      | Self::SIGILL
      | Self::SIGTRAP
      | Self::SIGABRT
      | Self::SIGEMT
      | Self::SIGFPE
      | Self::SIGBUS
      | Self::SIGSEGV
      | Self::SIGSYS
      | Self::SIGXCPU
      | Self::SIGXFSZ => DefaultAction::Core,
      _ => DefaultAction::Terminate,
    }
  }

  #[inline]
  const fn bit(self) -> u64 {
    if self.0 > 0 { 1 << (self.0 - 1) } else { 0 }
  }
}

impl Debug for Signo {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match *self {
      Self::FLUSH => f.write_str("__SIGFLUSH"),
      Self::HOLD => f.write_str("__SIGHOLD"),
      Self::NOHOLD => f.write_str("__SIGNOHOLD"),
      Self::EXIT => f.write_str("__SIGEXIT"),
      this => match this.public_name() {
        Some(name) => f.write_str(name),
        None if this.0 > Self::SIGRTMIN.0 && this.0 < Self::SIGRTMAX.0 => {
          write!(f, "SIGRTMIN+{}", this.0 - Self::SIGRTMIN.0)
        }
        None => write!(f, "SIG{}", this.0),
      },
    }
  }
}

impl Display for Signo {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    Debug::fmt(self, f)
  }
}

// -----------------------------------------------------------------------------
// Default Action
// -----------------------------------------------------------------------------

/// What happens to a process when a signal with default disposition arrives.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum DefaultAction {
  Terminate,
  /// Terminate; a real kernel would also write a core image.
  Core,
  Ignore,
  Stop,
  Continue,
}

// -----------------------------------------------------------------------------
// Signal Set
// -----------------------------------------------------------------------------

/// A set of public signals.
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq)]
#[repr(transparent)]
pub struct SigSet(u64);

impl SigSet {
  pub const EMPTY: Self = Self(0);
  pub const FULL: Self = Self(u64::MAX);

  /// Signals that no mask can block.
  pub const UNMASKABLE: Self = Self::EMPTY
    .with(Signo::SIGKILL)
    .with(Signo::SIGSTOP)
    .with(Signo::SIGCONT);

  #[inline]
  pub const fn from_bits(bits: u64) -> Self {
    Self(bits)
  }

  #[inline]
  pub const fn bits(self) -> u64 {
    self.0
  }

  #[inline]
  pub const fn with(self, signo: Signo) -> Self {
    Self(self.0 | signo.bit())
  }

  #[inline]
  pub const fn without(self, signo: Signo) -> Self {
    Self(self.0 & !signo.bit())
  }

  #[inline]
  pub fn insert(&mut self, signo: Signo) {
    *self = self.with(signo);
  }

  #[inline]
  pub fn remove(&mut self, signo: Signo) {
    *self = self.without(signo);
  }

  #[inline]
  pub const fn contains(self, signo: Signo) -> bool {
    !signo.is_internal() && self.0 & signo.bit() != 0
  }

  #[inline]
  pub const fn is_empty(self) -> bool {
    self.0 == 0
  }

  #[inline]
  pub const fn union(self, other: Self) -> Self {
    Self(self.0 | other.0)
  }

  #[inline]
  pub const fn intersection(self, other: Self) -> Self {
    Self(self.0 & other.0)
  }

  #[inline]
  pub const fn difference(self, other: Self) -> Self {
    Self(self.0 & !other.0)
  }

  /// Removes the signals no mask may contain.
  #[inline]
  pub const fn maskable(self) -> Self {
    self.difference(Self::UNMASKABLE)
  }

  /// Returns the lowest-numbered member.
  #[inline]
  pub const fn first(self) -> Option<Signo> {
    if self.0 == 0 {
      None
    } else {
      Some(Signo(self.0.trailing_zeros() as i32 + 1))
    }
  }

  pub fn iter(self) -> impl Iterator<Item = Signo> {
    let mut bits: u64 = self.0;

    std::iter::from_fn(move || {
      if bits == 0 {
        return None;
      }

      let signo: Signo = Signo(bits.trailing_zeros() as i32 + 1);
      bits &= bits - 1;
      Some(signo)
    })
  }
}

impl FromIterator<Signo> for SigSet {
  fn from_iter<I: IntoIterator<Item = Signo>>(iter: I) -> Self {
    iter.into_iter().fold(Self::EMPTY, Self::with)
  }
}

impl Debug for SigSet {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_set().entries(self.iter()).finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::error::Errno;
  use crate::signal::DefaultAction;
  use crate::signal::NSIG;
  use crate::signal::SigSet;
  use crate::signal::Signo;

  #[test]
  fn test_range() {
    assert_eq!(Signo::new(0), Err(Errno::EINVAL));
    assert_eq!(Signo::new(NSIG), Err(Errno::EINVAL));
    assert_eq!(Signo::new(-1), Err(Errno::EINVAL));
    assert_eq!(Signo::new(64), Ok(Signo::SIGRTMAX));
    assert!(Signo::HOLD.is_internal());
  }

  #[test]
  fn test_names() {
    assert_eq!(format!("{}", Signo::SIGCHLD), "SIGCHLD");
    assert_eq!(format!("{}", Signo::new(34).unwrap()), "SIGRTMIN+2");
    assert_eq!(format!("{:?}", Signo::NOHOLD), "__SIGNOHOLD");
  }

  #[test]
  fn test_defaults() {
    assert_eq!(Signo::SIGCHLD.default_action(), DefaultAction::Ignore);
    assert_eq!(Signo::SIGTSTP.default_action(), DefaultAction::Stop);
    assert_eq!(Signo::SIGSEGV.default_action(), DefaultAction::Core);
    assert_eq!(Signo::SIGUSR1.default_action(), DefaultAction::Terminate);
  }

  #[test]
  fn test_set() {
    let set: SigSet = [Signo::SIGUSR2, Signo::SIGHUP, Signo::SIGKILL].into_iter().collect();

    assert_eq!(set.first(), Some(Signo::SIGHUP));
    assert_eq!(
      set.iter().collect::<Vec<_>>(),
      [Signo::SIGHUP, Signo::SIGKILL, Signo::SIGUSR2],
    );
    assert!(!set.maskable().contains(Signo::SIGKILL));
    assert!(!SigSet::FULL.contains(Signo::HOLD));
    assert!(SigSet::FULL.contains(Signo::SIGRTMAX));
  }
}
