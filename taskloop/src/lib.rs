//! Local automation loop that drives a coding agent against a progress ledger.
//!
//! Each iteration reads the ledger, picks the phase for its state, invokes the
//! external agent, and runs verification gates, retrying fixes within a bound.
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (ledger parsing, state dispatch,
//!   retry arithmetic). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, ledger reads, lock file,
//!   child processes). Trait seams allow scripted doubles in tests.
//!
//! [`orchestrate`] composes both into the run loop; [`cleanup`] guarantees the
//! lock is released on signal-driven termination.

pub mod cleanup;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrate;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
