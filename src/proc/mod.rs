//! Emulated processes.
//!
//! A [`Process`] ties together everything one POSIX process owns: its
//! memory image and loaded modules, its threads, its signal state and the
//! worker pool that runs its blocking operations.
//!
//! # Architecture
//!
//! ```text
//!             ProcessTable (pid -> Weak<Process>)
//!                        |
//!                     Process
//!   +---------+---------+-----------+------------+
//!   |         |         |           |            |
//! image   modules   threads     signals        pool
//! (host   (loader)  (ThreadList (SignalState,  (WorkerPool;
//!  memory)           of contexts) dispositions) hosts the
//!                                               signal thread)
//! ```
//!
//! The POSIX-shaped entry points (`kill`, `raise`, `sigaction`,
//! `sigprocmask`, `sigpending`, `sigsuspend`, `sigwait`) are methods on
//! [`Process`]. Forking lives in [`crate::fork`].

mod hooks;
mod image;
mod process;
mod signals;
mod state;
mod table;

pub use self::hooks::ForkHook;
pub use self::image::LoadedModule;
pub use self::image::ModuleKind;
pub use self::image::ModuleList;
pub use self::image::ModuleLoader;
pub use self::image::ProcessImage;
pub use self::image::SameAddressLoader;
pub use self::process::ChildRecord;
pub use self::process::Process;
pub use self::state::ExitStatus;
pub use self::state::ProcessState;
pub use self::table::ProcessTable;

pub(crate) use self::process::ProcessInit;

/// An emulated process id.
pub type Pid = u32;
