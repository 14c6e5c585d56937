//! Stable exit codes for taskloop commands and child processes.

/// Loop reached `DONE`, dry run finished, or the gate passed.
pub const OK: i32 = 0;
/// Generic failure: no progress ledger, validation, lock conflict, exhausted caps.
pub const FAILURE: i32 = 1;
/// Default transient agent exit code (`EX_TEMPFAIL`), retried with backoff.
pub const AGENT_RETRYABLE: i32 = 75;
/// Reserved for gate commands killed by the runner's own timeout.
pub const TIMEOUT: i32 = 124;
/// Agent executable could not be found.
pub const NOT_FOUND: i32 = 127;
/// Stopped by SIGINT after cleanup ran (`128 + 2`).
pub const INTERRUPTED: i32 = from_signal(SIGINT);

pub const SIGINT: i32 = 2;

/// Shell convention for a process ended by `signal`.
pub const fn from_signal(signal: i32) -> i32 {
    128 + signal
}
