use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc as StdArc;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::debug;
use tracing::warn;

use crate::error::Errno;
use crate::host::Event;
use crate::proc::Process;
use crate::signal::Dispositions;
use crate::signal::PacketRecv;
use crate::signal::PacketSend;
use crate::signal::Pending;
use crate::signal::SigInfo;
use crate::signal::SigSet;
use crate::signal::SignalPacket;
use crate::signal::Signo;
use crate::signal::sigthread;
use crate::signal::unbounded_channel;
use crate::utils::ThreadId;

/// Per-process signal state.
///
/// Owns the disposition table, the process-wide pending set and the sending
/// half of the signal thread's packet queue.
pub struct SignalState {
  dispositions: Dispositions,
  /// Signals no thread could take when they arrived.
  pending: Mutex<Pending>,
  /// Hold nesting depth. Only the signal thread writes it.
  hold: AtomicU32,
  sender: PacketSend,
  receiver: Mutex<Option<PacketRecv>>,
  /// Id of the signal thread, zero until it runs.
  signal_tid: AtomicU32,
  complete_timeout: Duration,
}

impl SignalState {
  pub(crate) fn new(dispositions: Dispositions, complete_timeout: Duration) -> Self {
    let (sender, receiver): (PacketSend, PacketRecv) = unbounded_channel();

    Self {
      dispositions,
      pending: Mutex::new(Pending::new()),
      hold: AtomicU32::new(0),
      sender,
      receiver: Mutex::new(Some(receiver)),
      signal_tid: AtomicU32::new(0),
      complete_timeout,
    }
  }

  #[inline]
  pub fn dispositions(&self) -> &Dispositions {
    &self.dispositions
  }

  /// Current hold nesting depth.
  #[inline]
  pub fn held(&self) -> u32 {
    self.hold.load(Ordering::Acquire)
  }

  #[inline]
  pub fn is_held(&self) -> bool {
    self.held() > 0
  }

  /// Signals pending for the process as a whole.
  pub fn pending(&self) -> SigSet {
    self.pending.lock().set()
  }

  pub(crate) fn pending_mut(&self) -> MutexGuard<'_, Pending> {
    self.pending.lock()
  }

  /// Returns `true` once the signal thread stopped accepting packets.
  #[inline]
  pub fn is_closed(&self) -> bool {
    self.sender.is_closed()
  }

  // ---------------------------------------------------------------------------
  // Hold / Unhold
  // ---------------------------------------------------------------------------

  /// Suspends ordinary signal delivery until the guard drops.
  ///
  /// Holds nest; delivery resumes when the outermost guard drops. Fails
  /// with `EAGAIN` if the signal thread does not take the hold in time; the
  /// late hold is then paired with a queued release, so the depth stays
  /// balanced. Without a signal thread the guard holds nothing.
  pub fn hold(&self) -> Result<SignalHold<'_>, Errno> {
    let active: bool = match self.send(SignalPacket::new(SigInfo::control(Signo::HOLD)), true) {
      Ok(()) => true,
      Err(Errno::EAGAIN) => {
        // The queue is ordered: this release lands right after the hold.
        let _ignore: Result<(), Errno> = self.sender.send(SignalPacket::new(SigInfo::control(Signo::NOHOLD)));
        return Err(Errno::EAGAIN);
      }
      Err(error) => {
        debug!(target: "posix_shim", %error, "hold without signal thread");
        false
      }
    };

    Ok(SignalHold { state: self, active })
  }

  fn unhold(&self) {
    if let Err(error) = self.send(SignalPacket::new(SigInfo::control(Signo::NOHOLD)), true) {
      debug!(target: "posix_shim", %error, "unhold not confirmed by signal thread");
    }
  }

  pub(crate) fn enter_hold(&self) -> u32 {
    self.hold.fetch_add(1, Ordering::AcqRel) + 1
  }

  pub(crate) fn leave_hold(&self) -> u32 {
    match self.hold.fetch_update(Ordering::AcqRel, Ordering::Acquire, |hold| hold.checked_sub(1)) {
      Ok(hold) => hold - 1,
      Err(_) => {
        warn!(target: "posix_shim", "unbalanced signal unhold");
        0
      }
    }
  }

  // ---------------------------------------------------------------------------
  // Packet Queue
  // ---------------------------------------------------------------------------

  /// Queues a packet for the signal thread.
  ///
  /// With `wait` set, blocks until the packet has been processed, unless
  /// the caller is the signal thread itself. A packet not processed within
  /// the completion timeout stays queued and the call fails with `EAGAIN`.
  pub(crate) fn send(&self, mut packet: SignalPacket, wait: bool) -> Result<(), Errno> {
    if !wait || self.is_signal_thread() {
      return self.sender.send(packet);
    }

    let complete: Event = Event::manual(false);
    let signo: Signo = packet.info.signo;

    packet.complete = Some(complete.clone());

    self.sender.send(packet)?;

    if !complete.wait(Some(self.complete_timeout)) {
      warn!(
        target: "posix_shim",
        %signo,
        timeout = ?self.complete_timeout,
        "signal thread did not complete packet",
      );

      return Err(Errno::EAGAIN);
    }

    Ok(())
  }

  /// Queues a signal without waiting for it to be processed.
  pub(crate) fn post(&self, info: SigInfo) -> Result<(), Errno> {
    self.sender.send(SignalPacket::new(info))
  }

  /// Starts the signal thread on a slot of the process's pool.
  pub(crate) fn start(&self, process: &StdArc<Process>) {
    let Some(receiver) = self.receiver.lock().take() else {
      return;
    };

    let weak: Weak<Process> = StdArc::downgrade(process);

    process
      .pool()
      .spawn_detached("sig", move |_| sigthread::run(weak, receiver));
  }

  pub(crate) fn mark_signal_thread(&self) {
    self.signal_tid.store(ThreadId::current().as_u32(), Ordering::Release);
  }

  /// Returns `true` if the caller is the signal thread of this process.
  #[inline]
  pub fn is_signal_thread(&self) -> bool {
    self.signal_tid.load(Ordering::Acquire) == ThreadId::current().as_u32()
  }

  /// Asks the signal thread to exit once it drained its queue.
  pub(crate) fn shutdown(&self) {
    let _ignore: Result<(), Errno> = self.sender.send(SignalPacket::new(SigInfo::control(Signo::EXIT)));
  }
}

impl Debug for SignalState {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("SignalState")
      .field("dispositions", &self.dispositions)
      .field("pending", &self.pending())
      .field("held", &self.held())
      .field("closed", &self.is_closed())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Signal Hold
// -----------------------------------------------------------------------------

/// Guard of one hold level. See [`SignalState::hold`].
#[must_use = "signals are released as soon as the guard drops"]
pub struct SignalHold<'a> {
  state: &'a SignalState,
  active: bool,
}

impl Drop for SignalHold<'_> {
  fn drop(&mut self) {
    if self.active {
      self.state.unhold();
    }
  }
}

impl Debug for SignalHold<'_> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("SignalHold")
      .field("held", &self.state.held())
      .field("active", &self.active)
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(all(test, not(loom)))]
mod tests {
  use std::time::Duration;

  use crate::error::Errno;
  use crate::signal::Dispositions;
  use crate::signal::PacketRecv;
  use crate::signal::SigInfo;
  use crate::signal::SignalPacket;
  use crate::signal::SignalState;
  use crate::signal::Signo;

  fn stalled() -> (SignalState, PacketRecv) {
    let state: SignalState = SignalState::new(Dispositions::new(), Duration::from_millis(20));
    let receiver: PacketRecv = state.receiver.lock().take().unwrap();

    (state, receiver)
  }

  fn queued(receiver: &mut PacketRecv) -> Vec<Signo> {
    let mut signals: Vec<Signo> = Vec::new();

    while let Ok(packet) = receiver.try_recv() {
      signals.push(packet.info.signo);
    }

    signals
  }

  #[test]
  fn test_send_times_out() {
    let (state, mut receiver) = stalled();
    let packet: SignalPacket = SignalPacket::new(SigInfo::control(Signo::FLUSH));

    assert_eq!(state.send(packet, true), Err(Errno::EAGAIN));
    assert_eq!(queued(&mut receiver), [Signo::FLUSH]);
  }

  #[test]
  fn test_late_hold_is_paired_with_release() {
    let (state, mut receiver) = stalled();

    assert_eq!(state.hold().err(), Some(Errno::EAGAIN));
    assert_eq!(state.held(), 0);
    assert_eq!(queued(&mut receiver), [Signo::HOLD, Signo::NOHOLD]);
  }

  #[test]
  fn test_hold_without_signal_thread() {
    let (state, receiver) = stalled();

    drop(receiver);

    let hold = state.hold().unwrap();

    assert_eq!(state.held(), 0);
    drop(hold);
    assert!(state.is_closed());
  }
}
