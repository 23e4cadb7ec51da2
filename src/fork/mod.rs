//! Process replication.
//!
//! [`fork`] manufactures a new host process that continues the calling
//! process. The parent takes the pool, signal-hold and process locks (in
//! that order), creates the child suspended, and then runs a handshake over
//! two events:
//!
//! ```text
//!   parent                               child
//!   ------                               -----
//!   create suspended, run fork hooks
//!   resume                    ------->   rebuild process, attach thread
//!   wait ready                <-------   set ready
//!   copy stack, reent, data, bss,
//!   heap and linked modules
//!   set finished              ------->   (dynamic modules only)
//!                                        reload, publish new addresses
//!   wait ready                <-------   set ready
//!   copy relocated data/bss
//!   set finished              ------->   fixup hooks, reset context,
//!                                        start signal thread
//!   wait ready                <-------   set ready, run child body
//!   return child pid
//! ```
//!
//! Every wait is bounded by `Config::fork_wait_timeout`. A child that never
//! becomes ready, or a name collision when creating it, is retried up to
//! `Config::fork_retries` times; any later failure terminates the child and
//! fails the call with `EAGAIN`.
//!
//! A Rust closure cannot return twice, so the child's half of `fork` is the
//! `child_main` closure, which runs on the child's main thread and returns
//! its exit status.

mod child;
mod copy;
mod parent;
mod state;

pub use self::state::ForkFailure;
pub use self::state::ForkPhase;

use std::sync::Arc as StdArc;

use crate::error::Errno;
use crate::proc::Pid;
use crate::proc::Process;

/// The child process, as seen by the child body.
pub type ForkChild = StdArc<Process>;

pub(crate) type ChildMain = Box<dyn FnOnce(ForkChild) -> i32 + Send + 'static>;

/// Forks `process` from the calling thread.
///
/// Returns the pid of the child to the parent. The child runs `child_main`
/// and exits with the status it returns.
///
/// # Errors
///
/// - `ESRCH` if the calling thread is not attached to `process`.
/// - `EAGAIN` if the child could not be created, copied or started.
pub fn fork<F>(process: &StdArc<Process>, child_main: F) -> Result<Pid, Errno>
where
  F: FnOnce(ForkChild) -> i32 + Send + 'static,
{
  parent::run(process, Box::new(child_main))
}
