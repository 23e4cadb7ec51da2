//! Error handling for the emulation layer.
//!
//! Failures fall into two groups:
//!
//! 1. **Recoverable**: reported to the caller as an [`Errno`], exactly as a
//!    POSIX entry point would (bad signal number, fork handshake timeout,
//!    not-owner release).
//! 2. **Fatal**: raised with `fatal!`, which aborts the process. These are
//!    reserved for conditions that leave global state (the thread list, the
//!    lock order, a half-claimed worker slot) impossible to repair.
//!
//! Failing operations also record their code in the calling thread's saved
//! error slot, see [`ThreadContext::errno`].
//!
//! [`ThreadContext::errno`]: crate::tls::ThreadContext::errno

mod errno;
mod macros;

pub use self::errno::Errno;

pub(crate) use self::macros::fatal;

/// Result type of every fallible emulation-layer operation.
pub type Result<T> = core::result::Result<T, Errno>;
