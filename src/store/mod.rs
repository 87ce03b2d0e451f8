//! External run store (ETL API) client
//!
//! All durable state lives behind this client: runs, their per-item
//! progress, uploaded product records, and the per-site scraping metadata.
//! The core owns no on-disk state beyond the read-only proxy pool file.

// Sub-modules
pub mod client;
pub mod types;

// Re-exports for public API
pub use client::EtlClient;
pub use types::{
    AddItemsOutcome, ItemRecord, RunStatus, ScrapeRun, ScrapeTarget, SelectorSpec, SiteMeta,
    TargetPatch,
};
