pub mod config;
pub mod downstream;
pub mod ingest;
pub mod state;
