use std::time::Duration;

// -----------------------------------------------------------------------------
// Exit Codes
// -----------------------------------------------------------------------------

/// Execution success.
pub const E_CODE_SUCCESS: i32 = 0;

/// Generic execution failure.
pub const E_CODE_FAILURE: i32 = 1;

/// Exit status of a forked child that lost its parent mid-handshake.
pub const E_CODE_FORK_ABANDONED: i32 = 126;

/// Bit set in an exit status when the process terminated by a signal.
pub const E_CODE_SIGNALLED: i32 = 0x80;

// -----------------------------------------------------------------------------
// System - Fork
// -----------------------------------------------------------------------------

/// How long every step of the fork handshake may take.
pub const FORK_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Number of additional attempts after a transient child-startup failure.
pub const FORK_RETRIES: u32 = 5;

/// Base sleep between two fork attempts; multiplied by the attempt number.
pub const FORK_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Bytes per cross-process write. Zero copies each region in one write.
pub const FORK_CHUNK_SIZE: usize = 0;

// -----------------------------------------------------------------------------
// System - Worker Pool
// -----------------------------------------------------------------------------

/// Number of fixed slots in a worker pool.
pub const POOL_SLOTS: usize = 32;

/// Grace period granted to a worker after its extra wait handle fired.
pub const DETACH_GRACE: Duration = Duration::from_millis(100);

/// How long a forced termination waits for the host thread to go away.
pub const TERMINATE_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Stack size (in bytes) for worker threads.
pub const WORKER_STACK_SIZE: usize = 256 * 1024;

// -----------------------------------------------------------------------------
// System - Signals
// -----------------------------------------------------------------------------

/// How long a sender waits for the signal thread to process its packet.
pub const SIGNAL_COMPLETE_TIMEOUT: Duration = Duration::from_secs(60);

// -----------------------------------------------------------------------------
// System - Thread Context
// -----------------------------------------------------------------------------

/// Depth of the per-thread recovery-point stack.
pub const RECOVERY_DEPTH: usize = 16;

/// Syslog mask seeded into every new thread (`LOG_UPTO(LOG_DEBUG)`).
pub const DEFAULT_LOG_MASK: u32 = 0xff;

/// Locale seeded into every new thread.
pub const DEFAULT_LOCALE: &str = "C";

// -----------------------------------------------------------------------------
// System - Memory Image
// -----------------------------------------------------------------------------

/// Size of the emulated stack given to each thread.
pub const THREAD_STACK_SIZE: usize = 64 * 1024;

/// Size of the per-thread reentrant-state region.
pub const REENT_SIZE: usize = 1024;

/// Number of pre-allocated entries in a process thread list.
pub const CAP_THREAD_LIST: usize = 16;
