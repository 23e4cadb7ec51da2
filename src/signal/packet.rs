use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::mpsc::error::TryRecvError;
use triomphe::Arc;

use crate::error::Errno;
use crate::host::Event;
use crate::proc::Pid;
use crate::signal::SigSet;
use crate::signal::Signo;
use crate::tls::ThreadContext;

// -----------------------------------------------------------------------------
// Signal Info
// -----------------------------------------------------------------------------

/// Origin of a signal.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum SiCode {
  /// Sent by `kill`.
  #[default]
  User,
  /// Sent by `raise` or a thread-directed kill.
  Thread,
  /// Sent by the emulation layer itself.
  Kernel,
  /// Child status change.
  Child,
  /// Queued with a value.
  Queue,
}

/// What a handler learns about the signal it runs for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigInfo {
  pub signo: Signo,
  pub code: SiCode,
  /// The originating process.
  pub pid: Pid,
  /// Payload (exit status for `SIGCHLD`, user value for queued signals).
  pub value: i64,
}

impl SigInfo {
  pub const fn new(signo: Signo, code: SiCode, pid: Pid) -> Self {
    Self {
      signo,
      code,
      pid,
      value: 0,
    }
  }

  pub const fn with_value(mut self, value: i64) -> Self {
    self.value = value;
    self
  }

  pub(crate) const fn control(signo: Signo) -> Self {
    Self::new(signo, SiCode::Kernel, 0)
  }
}

// -----------------------------------------------------------------------------
// Signal Packet
// -----------------------------------------------------------------------------

/// A signal in flight to the signal thread of a process.
///
/// Created at send time and consumed exactly once.
pub(crate) struct SignalPacket {
  pub(crate) info: SigInfo,
  /// Deliver to this thread only.
  pub(crate) target: Option<Arc<ThreadContext>>,
  /// Unblock exactly these signals at the target while delivering.
  pub(crate) mask: Option<SigSet>,
  /// Set once the signal thread has processed the packet.
  pub(crate) complete: Option<Event>,
}

impl SignalPacket {
  pub(crate) fn new(info: SigInfo) -> Self {
    Self {
      info,
      target: None,
      mask: None,
      complete: None,
    }
  }

  /// Signals the sender that this packet has been processed.
  pub(crate) fn complete(&self) {
    if let Some(event) = self.complete.as_ref() {
      event.set();
    }
  }
}

impl Debug for SignalPacket {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("SignalPacket")
      .field("info", &self.info)
      .field("target", &self.target.as_ref().map(|ctx| ctx.tid()))
      .field("mask", &self.mask)
      .field("wait", &self.complete.is_some())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Packet Recv
// -----------------------------------------------------------------------------

#[repr(transparent)]
pub(crate) struct PacketRecv {
  inner: UnboundedReceiver<SignalPacket>,
}

impl PacketRecv {
  /// Blocks the calling (non-async) thread until a packet arrives.
  #[inline]
  pub(crate) fn blocking_recv(&mut self) -> Option<SignalPacket> {
    self.inner.blocking_recv()
  }

  #[inline]
  pub(crate) fn try_recv(&mut self) -> Result<SignalPacket, TryRecvError> {
    self.inner.try_recv()
  }
}

impl Debug for PacketRecv {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.write_str("PacketRecv(..)")
  }
}

// -----------------------------------------------------------------------------
// Packet Send
// -----------------------------------------------------------------------------

#[derive(Clone)]
#[repr(transparent)]
pub(crate) struct PacketSend {
  inner: UnboundedSender<SignalPacket>,
}

impl PacketSend {
  /// Queues a packet. Fails with `ESRCH` once the signal thread is gone.
  #[inline]
  pub(crate) fn send(&self, packet: SignalPacket) -> Result<(), Errno> {
    self.inner.send(packet).map_err(|_| Errno::ESRCH)
  }

  #[inline]
  pub(crate) fn is_closed(&self) -> bool {
    self.inner.is_closed()
  }
}

impl Debug for PacketSend {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.write_str("PacketSend(..)")
  }
}

// -----------------------------------------------------------------------------
// Misc. Utilities
// -----------------------------------------------------------------------------

#[inline]
pub(crate) fn unbounded_channel() -> (PacketSend, PacketRecv) {
  let channel: _ = mpsc::unbounded_channel();
  let send: PacketSend = PacketSend { inner: channel.0 };
  let recv: PacketRecv = PacketRecv { inner: channel.1 };

  (send, recv)
}
