use bitflags::bitflags;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc;

use crate::error::Errno;
use crate::signal::DefaultAction;
use crate::signal::NSIG;
use crate::signal::SigInfo;
use crate::signal::SigSet;
use crate::signal::Signo;

/// A signal-catching function.
pub type HandlerFn = Arc<dyn Fn(&SigInfo) + Send + Sync + 'static>;

bitflags! {
  /// Flags of a [`SigAction`].
  #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
  pub struct SaFlags: u32 {
    /// Do not notify the parent when a child stops.
    const NOCLDSTOP = 1 << 0;
    /// The handler wants the full `SigInfo`.
    const SIGINFO = 1 << 1;
    /// Interrupted waits resume after the handler returns.
    const RESTART = 1 << 2;
    /// Run the handler on the alternate signal stack.
    const ONSTACK = 1 << 3;
    /// Do not block the signal while its handler runs.
    const NODEFER = 1 << 4;
    /// Reset the disposition to the default before running the handler.
    const RESETHAND = 1 << 5;
  }
}

// -----------------------------------------------------------------------------
// Handler
// -----------------------------------------------------------------------------

/// How a signal is handled.
#[derive(Clone, Default)]
pub enum Handler {
  #[default]
  Default,
  Ignore,
  Catch(HandlerFn),
}

impl Handler {
  /// Wraps a closure as a catching handler.
  pub fn catch<F>(f: F) -> Self
  where
    F: Fn(&SigInfo) + Send + Sync + 'static,
  {
    Self::Catch(Arc::new(f))
  }
}

impl Debug for Handler {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self {
      Self::Default => f.write_str("SIG_DFL"),
      Self::Ignore => f.write_str("SIG_IGN"),
      Self::Catch(handler) => write!(f, "Catch({:p})", Arc::as_ptr(handler)),
    }
  }
}

// -----------------------------------------------------------------------------
// Signal Action
// -----------------------------------------------------------------------------

/// The disposition of one signal.
#[derive(Clone, Debug, Default)]
pub struct SigAction {
  pub handler: Handler,
  /// Signals blocked, in addition to the current mask, while the handler runs.
  pub mask: SigSet,
  pub flags: SaFlags,
}

impl SigAction {
  pub fn new(handler: Handler) -> Self {
    Self {
      handler,
      mask: SigSet::EMPTY,
      flags: SaFlags::empty(),
    }
  }

  pub fn with_mask(mut self, mask: SigSet) -> Self {
    self.mask = mask;
    self
  }

  pub fn with_flags(mut self, flags: SaFlags) -> Self {
    self.flags = flags;
    self
  }

  /// Returns `true` if delivering `signo` under this action does nothing.
  pub fn ignores(&self, signo: Signo) -> bool {
    match self.handler {
      Handler::Ignore => true,
      Handler::Default => signo.default_action() == DefaultAction::Ignore,
      Handler::Catch(_) => false,
    }
  }
}

// -----------------------------------------------------------------------------
// Dispositions
// -----------------------------------------------------------------------------

/// The process-wide disposition table.
///
/// Every entry is replaced as a whole under the table lock, so readers
/// never observe a partially updated action.
pub struct Dispositions {
  table: RwLock<Vec<SigAction>>,
}

impl Dispositions {
  pub fn new() -> Self {
    Self {
      table: RwLock::new(vec![SigAction::default(); NSIG as usize]),
    }
  }

  /// Returns the current action of `signo`.
  pub fn get(&self, signo: Signo) -> SigAction {
    self.table.read()[signo.raw() as usize].clone()
  }

  /// Installs a new action and returns the previous one.
  ///
  /// `SIGKILL` and `SIGSTOP` cannot be caught or ignored.
  pub fn set(&self, signo: Signo, action: SigAction) -> Result<SigAction, Errno> {
    if signo.is_unblockable() && !matches!(action.handler, Handler::Default) {
      return Err(Errno::EINVAL);
    }

    let action: SigAction = SigAction {
      mask: action.mask.maskable(),
      ..action
    };

    let mut table = self.table.write();
    let slot: &mut SigAction = &mut table[signo.raw() as usize];

    Ok(std::mem::replace(slot, action))
  }

  /// Resets `signo` to the default disposition.
  pub fn reset(&self, signo: Signo) {
    self.table.write()[signo.raw() as usize] = SigAction::default();
  }

  /// Returns a copy of the whole table, for a forked child.
  pub fn snapshot(&self) -> Vec<SigAction> {
    self.table.read().clone()
  }

  /// Builds a table from a snapshot.
  pub fn from_snapshot(snapshot: Vec<SigAction>) -> Self {
    debug_assert_eq!(snapshot.len(), NSIG as usize);

    Self {
      table: RwLock::new(snapshot),
    }
  }
}

impl Default for Dispositions {
  fn default() -> Self {
    Self::new()
  }
}

impl Debug for Dispositions {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    let table = self.table.read();

    f.debug_map()
      .entries(
        table
          .iter()
          .enumerate()
          .skip(1)
          .filter(|(_, action)| !matches!(action.handler, Handler::Default))
          .filter_map(|(index, action)| Some((Signo::new(index as i32).ok()?, action))),
      )
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
