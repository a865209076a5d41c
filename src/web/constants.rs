// Timing and size constants shared across the master.

use std::time::Duration;

/// Default wait for the next fragment during job collection.
pub const WORKER_JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period after a SIGTERM before children are force-killed.
pub const PROCESS_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Budget for the fallback single-process terminate during stop.
pub const PROCESS_TERMINATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Watchdog poll interval for the master PID.
pub const WORKER_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Delay before auto-launch runs so the HTTP server is up first.
pub const WORKER_STARTUP_DELAY: Duration = Duration::from_secs(5);

/// Chunk size for reading worker logs backwards.
pub const LOG_CHUNK_SIZE: usize = 64 * 1024;

/// Log files above this size are tailed instead of read whole.
pub const LOG_TAIL_THRESHOLD: u64 = 1024 * 1024;
