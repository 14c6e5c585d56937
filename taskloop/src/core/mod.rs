//! Deterministic, pure logic shared by the loop.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod ledger;
pub mod phase;
pub mod retry;
pub mod types;
