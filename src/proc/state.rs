use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use crate::consts::E_CODE_SIGNALLED;
use crate::signal::Signo;

/// How a process ended.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ExitStatus {
  /// Normal exit with a status code.
  Code(i32),
  /// Killed by a signal.
  Signalled(Signo),
}

impl ExitStatus {
  /// The status code reported to the host and to the parent.
  pub const fn code(self) -> i32 {
    match self {
      Self::Code(code) => code,
      Self::Signalled(signo) => E_CODE_SIGNALLED | signo.raw(),
    }
  }

  /// The signal that killed the process, if any.
  pub const fn signal(self) -> Option<Signo> {
    match self {
      Self::Code(_) => None,
      Self::Signalled(signo) => Some(signo),
    }
  }
}

impl Display for ExitStatus {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self {
      Self::Code(code) => write!(f, "exit({code})"),
      Self::Signalled(signo) => write!(f, "killed by {signo}"),
    }
  }
}

/// Run state of a process.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ProcessState {
  Running,
  /// Stopped by a job-control signal until `SIGCONT`.
  Stopped(Signo),
  Exited(ExitStatus),
}

impl ProcessState {
  #[inline]
  pub const fn is_running(self) -> bool {
    matches!(self, Self::Running)
  }

  #[inline]
  pub const fn is_stopped(self) -> bool {
    matches!(self, Self::Stopped(_))
  }

  #[inline]
  pub const fn is_exited(self) -> bool {
    matches!(self, Self::Exited(_))
  }
}

#[cfg(test)]
mod tests {
  use crate::proc::ExitStatus;
  use crate::signal::Signo;

  #[test]
  fn test_exit_codes() {
    assert_eq!(ExitStatus::Code(3).code(), 3);
    assert_eq!(ExitStatus::Signalled(Signo::SIGTERM).code(), 0x80 | 15);
    assert_eq!(ExitStatus::Signalled(Signo::SIGKILL).signal(), Some(Signo::SIGKILL));
    assert_eq!(ExitStatus::Code(0).to_string(), "exit(0)");
  }
}
