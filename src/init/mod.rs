//! Emulation-layer start-up.
//!
//! [`start`] is the usual entry point: it installs the tracing subscriber
//! described by the [`Config`] (once per host process) and boots the first
//! emulated process on the calling thread.

use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc as StdArc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::Level;
use tracing::Span;
use tracing::debug;
use tracing::info;
use tracing::span;

use crate::config::Config;
use crate::error::Errno;
use crate::host::Host;
use crate::proc::Process;
use crate::proc::ProcessImage;
use crate::utils::measure_fn;

static TRACING: AtomicBool = AtomicBool::new(false);

// -----------------------------------------------------------------------------
// Init Error
// -----------------------------------------------------------------------------

/// The tracing subscriber could not be installed.
#[derive(Debug)]
pub struct InitError {
  message: String,
}

impl InitError {
  #[cold]
  fn new<E>(error: E) -> Self
  where
    E: Display,
  {
    Self {
      message: error.to_string(),
    }
  }
}

impl Display for InitError {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "failed to set tracing subscriber: {}", self.message)
  }
}

impl Error for InitError {}

// -----------------------------------------------------------------------------
// Start
// -----------------------------------------------------------------------------

/// Installs tracing and boots a process with the default image on `host`.
///
/// The calling thread becomes the main thread of the new process.
pub fn start(host: StdArc<dyn Host>, config: Config) -> Result<StdArc<Process>, Errno> {
  if !TRACING.swap(true, Ordering::SeqCst) {
    if let Err(error) = install_tracing(&config) {
      eprintln!("{error}");
    }
  }

  let span: Span = span!(target: "posix_shim", Level::DEBUG, "init::start");

  debug!(target: "posix_shim", parent: &span, ?config, "booting");

  let (process, elapsed): (Result<StdArc<Process>, Errno>, Duration) =
    measure_fn(|| Process::boot(host, config, ProcessImage::default()));

  let process: StdArc<Process> = process?;

  info!(
    target: "posix_shim",
    parent: &span,
    pid = process.pid(),
    ?elapsed,
    "emulation layer started",
  );

  Ok(process)
}

/// Installs the global tracing subscriber configured by `config`.
///
/// Fails if a global subscriber is already set.
#[cfg(feature = "tracing")]
pub fn install_tracing(config: &Config) -> Result<(), InitError> {
  use tracing_subscriber::FmtSubscriber;
  use tracing_subscriber::fmt::format;
  use tracing_subscriber::util::SubscriberInitExt;

  FmtSubscriber::builder()
    .event_format(format().compact())
    .log_internal_errors(true)
    .with_ansi(true)
    .with_file(config.tracing_source_file)
    .with_level(true)
    .with_line_number(config.tracing_source_line)
    .with_max_level(config.tracing_filter())
    .with_target(config.tracing_source_name)
    .with_thread_ids(config.tracing_thread_info)
    .with_thread_names(config.tracing_thread_info)
    .finish()
    .try_init()
    .map_err(InitError::new)
}

#[cfg(not(feature = "tracing"))]
pub fn install_tracing(_config: &Config) -> Result<(), InitError> {
  Ok(())
}
