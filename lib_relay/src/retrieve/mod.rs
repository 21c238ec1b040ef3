//! # Data Retrieval Module
//!
//! Generic HTTP plumbing shared by the remote data sources.
//!
//! ## Contained Modules:
//!
//! - **`http_client`**: an `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, retrying transient failures with exponential
//!   backoff and returning status, headers and body in one `ApiResponse`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Retrying HTTP API client.
pub mod http_client;

pub use http_client::{ApiClient, ApiResponse, RetrieveError};
