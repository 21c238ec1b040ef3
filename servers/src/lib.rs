//! Server-side pieces of the relay: configuration, shared application
//! state and the axum transport, reused by the `server_relay` binary and
//! by the end-to-end tests.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod relay_logic;
