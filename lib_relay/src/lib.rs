//! # lib_relay
//!
//! Shared building blocks for the relay servers: a periodically refreshed
//! snapshot of topic-tagged records, fanned out to many websocket
//! subscribers, each receiving only the slice matching its topic.
//!
//! Modules other than `core` are gated behind cargo features so that light
//! consumers (tests, tools) only pay for what they use.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Snapshot store, topic filter, subscription registry, delivery engine,
/// refresh scheduler and connection lifecycle.
pub mod core;

/// Concrete data sources (local JSON file, remote HTTP).
#[cfg(feature = "ingestors")]
pub mod ingestors;

/// Tracing subscriber setup with a pruned log directory.
#[cfg(feature = "loggers")]
pub mod loggers;

/// Retrying HTTP client.
#[cfg(feature = "retrieve")]
pub mod retrieve;

pub use crate::core::{Relay, RelaySettings};
