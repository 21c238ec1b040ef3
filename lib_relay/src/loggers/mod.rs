//! # Loggers Module
//!
//! Process-wide `tracing` setup for the relay binaries: console output plus
//! a timestamped log file per run, with old runs pruned on startup.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Subscriber installation and log directory housekeeping.
pub mod tracing_setup;

pub use tracing_setup::{cleanup_old_logs, init_tracing, level_directive, LoggerError};
