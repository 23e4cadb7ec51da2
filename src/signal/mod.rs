//! Signal delivery.
//!
//! Signals for a process travel as packets to its signal thread, which
//! applies default actions directly and posts caught signals to one thread.
//! Threads run their handlers at interruption points: [`cancelable_wait`],
//! the mask-changing calls, and right after signalling themselves.
//!
//! ```text
//! kill ──► packet queue ──► signal thread ──► ThreadContext::post
//!                                 │                   │
//!                           default action     signal_arrived
//!                                                     │
//!                                          handler at interruption point
//! ```
//!
//! Delivery can be held: [`SignalState::hold`] nests, and signals arriving
//! while held are queued until the outermost hold is released.

mod action;
mod dispatch;
mod packet;
mod pending;
mod signo;
mod state;
mod sigthread;

pub use self::action::Dispositions;
pub use self::action::Handler;
pub use self::action::HandlerFn;
pub use self::action::SaFlags;
pub use self::action::SigAction;
pub use self::dispatch::Wakeup;
pub use self::dispatch::cancelable_wait;
pub use self::packet::SiCode;
pub use self::packet::SigInfo;
pub use self::signo::DefaultAction;
pub use self::signo::NSIG;
pub use self::signo::SigSet;
pub use self::signo::Signo;
pub use self::state::SignalHold;
pub use self::state::SignalState;

pub(crate) use self::dispatch::Dispatched;
pub(crate) use self::dispatch::dispatch_pending;
pub(crate) use self::packet::PacketRecv;
pub(crate) use self::packet::PacketSend;
pub(crate) use self::packet::SignalPacket;
pub(crate) use self::packet::unbounded_channel;
pub(crate) use self::pending::Pending;

/// How [`sigprocmask`] combines the new set with the current mask.
///
/// [`sigprocmask`]: crate::proc::Process::sigprocmask
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum SigHow {
  Block,
  Unblock,
  SetMask,
}
