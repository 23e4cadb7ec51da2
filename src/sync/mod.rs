//! Synchronization primitives.
//!
//! - [`Muto`]: fast recursive lock that only blocks when contended
//! - [`LockLevel`]: the global acquisition order of the fork locks
//! - [`ClaimFlag`] and [`Rendezvous`]: the atomic handoffs behind worker
//!   slot ownership

mod claim;
mod muto;
mod order;

pub use self::claim::ClaimFlag;
pub use self::claim::Rendezvous;
pub use self::muto::LazyMuto;
pub use self::muto::Muto;
pub use self::muto::MutoGuard;
pub use self::order::ForkLocks;
pub use self::order::LockLevel;
pub use self::order::PoolLocked;
pub use self::order::SignalsHeld;

pub(crate) use self::order::LevelGuard;
