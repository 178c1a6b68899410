//! Fetch engine
//!
//! Retrying HTTP access for pages and files, plus the rules that decide where
//! a fetched file lands on disk.

mod http;
mod models;

pub use http::Downloader;
pub(crate) use http::write_new;
pub use models::{DownloadOutcome, FetchError};

// Re-export utility functions
pub use models::parse_content_disposition;
