//! Utility types and functions used throughout the emulation layer.
//!
//! # Contents
//!
//! - [`ThreadId`]: Stable identifier for the calling host thread
//! - Timing helpers for bounded waits

mod measure;
mod thread;

pub(crate) use self::measure::deadline;
pub(crate) use self::measure::measure_fn;
pub(crate) use self::measure::remaining;

pub use self::thread::ThreadId;

use std::any::Any;

/// Extracts a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    message
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.as_str()
  } else {
    "<non-string panic payload>"
  }
}
