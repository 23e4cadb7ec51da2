use std::time::Duration;

use crate::consts;
use crate::pool::PoolConfig;

// -----------------------------------------------------------------------------
// Config
// -----------------------------------------------------------------------------

/// Tunables of one emulated process.
///
/// Inherited unchanged by forked children.
#[derive(Clone, Debug)]
pub struct Config {
  // ---------------------------------------------------------------------------
  // Fork Configuration
  // ---------------------------------------------------------------------------
  /// Bound on every wait of the fork handshake.
  pub fork_wait_timeout: Duration,
  /// Extra attempts after a transient child-startup failure.
  pub fork_retries: u32,
  /// Sleep between attempts, multiplied by the attempt number.
  pub fork_retry_backoff: Duration,
  /// Bytes per cross-process write; zero writes each region at once.
  pub fork_chunk_size: usize,
  // ---------------------------------------------------------------------------
  // Worker Pool Configuration
  // ---------------------------------------------------------------------------
  pub pool_slots: usize,
  pub detach_grace: Duration,
  pub terminate_join_timeout: Duration,
  pub worker_stack_size: usize,
  // ---------------------------------------------------------------------------
  // Signal Configuration
  // ---------------------------------------------------------------------------
  /// How long a sender waits for the signal thread.
  pub signal_complete_timeout: Duration,
  // ---------------------------------------------------------------------------
  // Tracing Subscriber Configuration
  // ---------------------------------------------------------------------------
  pub tracing_source_file: bool,
  pub tracing_source_line: bool,
  pub tracing_source_name: bool,
  pub tracing_thread_info: bool,
  pub tracing_verbose: bool,
  pub tracing_very_verbose: bool,
}

impl Config {
  #[inline]
  pub fn new() -> Self {
    Self {
      fork_wait_timeout: consts::FORK_WAIT_TIMEOUT,
      fork_retries: consts::FORK_RETRIES,
      fork_retry_backoff: consts::FORK_RETRY_BACKOFF,
      fork_chunk_size: consts::FORK_CHUNK_SIZE,
      pool_slots: consts::POOL_SLOTS,
      detach_grace: consts::DETACH_GRACE,
      terminate_join_timeout: consts::TERMINATE_JOIN_TIMEOUT,
      worker_stack_size: consts::WORKER_STACK_SIZE,
      signal_complete_timeout: consts::SIGNAL_COMPLETE_TIMEOUT,
      tracing_source_file: false,
      tracing_source_line: false,
      tracing_source_name: false,
      tracing_thread_info: true,
      tracing_verbose: true,
      tracing_very_verbose: false,
    }
  }

  #[inline]
  pub const fn tracing_filter(&self) -> tracing::Level {
    if self.tracing_very_verbose {
      tracing::Level::TRACE
    } else if self.tracing_verbose {
      tracing::Level::DEBUG
    } else {
      tracing::Level::INFO
    }
  }

  /// The worker-pool settings, without a thread start hook.
  pub fn pool_config(&self) -> PoolConfig {
    PoolConfig {
      stack_size: self.worker_stack_size,
      detach_grace: self.detach_grace,
      terminate_join_timeout: self.terminate_join_timeout,
      on_thread_start: None,
    }
  }
}

impl Default for Config {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}
