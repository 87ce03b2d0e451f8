//! Error types for fleet orchestration
//!
//! This module defines the crate-wide error enum. Per-URL failures inside
//! the engines travel as `anyhow::Error` and are classified by message
//! pattern in [`crate::engine::classify`]; the variants here are the
//! structured errors that cross module boundaries.

use thiserror::Error;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, ScrapeError>;

/// Error types for orchestration operations
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Bad option combination or malformed proxy pool file
    #[error("configuration error: {0}")]
    Config(String),

    /// No proxy in the pool satisfies a site's requirement
    #[error("no suitable proxy for {domain}: {reason}")]
    NoSuitableProxy { domain: String, reason: String },

    /// No scraper module is registered for the given extractor id
    #[error("failed to load scraper '{0}': no scraper registered")]
    MissingScraper(String),

    /// Commit refused: a start page has not finished paginating
    #[error("not all paginations completed for {domain}")]
    PaginationIncomplete { domain: String },

    /// Commit refused: a completed pagination collected zero URLs
    #[error("aborting entire run for {domain}: {start_page} completed with no URLs")]
    EmptyPagination { domain: String, start_page: String },

    /// A pagination patch arrived for a start page no partial run owns
    #[error("no active partial run owns start page {0}")]
    UnknownStartPage(String),

    /// External run store rejected or failed a request
    #[error("store error: {0}")]
    Store(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error talking to the external store
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
