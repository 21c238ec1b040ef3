//! # Data Ingestors Module
//!
//! Concrete [`DataSource`](crate::core::DataSource) implementations the
//! refresh scheduler can poll.
//!
//! ## Contained Modules:
//! - **`file_source`**: reads a JSON document from local disk and reports a
//!   change only when the file's modification time or size moves.
//! - **`http_source`**: fetches the document from a remote URL through the
//!   retrying `ApiClient`.
//!
//! Both accept either a bare record array or the `{ "predictions": [...] }`
//! envelope, and can stamp a `row_id` onto records that lack one.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Local JSON file source.
pub mod file_source;
/// Remote HTTP source.
pub mod http_source;

// --- Public API Re-exports ---
pub use file_source::JsonFileSource;
pub use http_source::HttpSource;
