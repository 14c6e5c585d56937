//! I/O adapters for the loop: files, locks and child processes.

pub mod agent;
pub mod config;
pub mod gate;
pub mod ledger;
pub mod lock;
pub mod process;
