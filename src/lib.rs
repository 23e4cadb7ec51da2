//! posix-shim - the core of a POSIX process model on a host without one.
//!
//! The crate emulates what a POSIX kernel gives a process and the host
//! lacks: `fork` by replicating a process image into a freshly created host
//! process, asynchronous signal delivery with masks and per-thread pending
//! sets, per-thread context blocks, a fast recursive lock, and a pool of
//! reusable worker threads for blocking, interruptible operations.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use posix_shim::Config;
//! use posix_shim::fork;
//! use posix_shim::host::SimHost;
//! use posix_shim::init;
//!
//! let process = init::start(Arc::new(SimHost::new()), Config::default()).unwrap();
//!
//! let child = fork::fork(&process, |child| {
//!   println!("hello from {}", child.pid());
//!   0
//! })
//! .unwrap();
//!
//! assert_eq!(process.wait_child(child, None), Ok(0));
//! ```
//!
//! # Core Modules
//!
//! - [`host`]: The host kernel boundary and its in-process simulation
//! - [`proc`]: Emulated processes and the POSIX-shaped signal calls
//! - [`fork`]: Process replication
//! - [`signal`]: Dispositions, masks and the per-process signal thread
//! - [`tls`]: Per-thread context blocks
//! - [`sync`]: The recursive lock and the fork lock order
//! - [`pool`]: Reusable worker threads
//! - [`error`]: Error codes and fatal conditions
//! - [`consts`]: Default tunables

mod config;
mod loom;
mod utils;

pub mod consts;
pub mod error;
pub mod fork;
pub mod host;
pub mod init;
pub mod pool;
pub mod proc;
pub mod signal;
pub mod sync;
pub mod tls;

pub use self::config::Config;
pub use self::utils::ThreadId;
