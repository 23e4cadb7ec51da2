use std::collections::VecDeque;

use crate::signal::SigInfo;
use crate::signal::SigSet;
use crate::signal::Signo;

/// Signals generated but not yet delivered.
///
/// Standard signals do not queue: a second instance of a pending signal is
/// merged into the first. Real-time signals queue every instance in order.
#[derive(Clone, Debug, Default)]
pub(crate) struct Pending {
  set: SigSet,
  queue: VecDeque<SigInfo>,
}

impl Pending {
  pub(crate) const fn new() -> Self {
    Self {
      set: SigSet::EMPTY,
      queue: VecDeque::new(),
    }
  }

  #[inline]
  pub(crate) fn set(&self) -> SigSet {
    self.set
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  /// Adds a signal. Returns `false` if it merged into a pending instance.
  pub(crate) fn push(&mut self, info: SigInfo) -> bool {
    if self.set.contains(info.signo) && info.signo < Signo::SIGRTMIN {
      return false;
    }

    self.set.insert(info.signo);
    self.queue.push_back(info);
    true
  }

  /// Removes and returns the oldest instance of `signo`.
  pub(crate) fn take(&mut self, signo: Signo) -> Option<SigInfo> {
    let index: usize = self.queue.iter().position(|info| info.signo == signo)?;
    let info: Option<SigInfo> = self.queue.remove(index);

    if !self.queue.iter().any(|info| info.signo == signo) {
      self.set.remove(signo);
    }

    info
  }

  /// Removes and returns the lowest-numbered signal in `allowed`.
  pub(crate) fn take_first(&mut self, allowed: SigSet) -> Option<SigInfo> {
    let signo: Signo = self.set.intersection(allowed).first()?;
    self.take(signo)
  }

  /// Drops every instance of `signo`.
  pub(crate) fn discard(&mut self, signo: Signo) -> bool {
    if !self.set.contains(signo) {
      return false;
    }

    self.queue.retain(|info| info.signo != signo);
    self.set.remove(signo);
    true
  }

  /// Removes and returns every pending signal, oldest first.
  pub(crate) fn drain(&mut self) -> Vec<SigInfo> {
    self.set = SigSet::EMPTY;
    self.queue.drain(..).collect()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
