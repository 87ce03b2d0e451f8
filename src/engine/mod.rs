//! Orchestration engines
//!
//! Two pipelines share one skeleton: select work, distribute it over the
//! session fleet, fan out one task per (URL, session) pair, classify what
//! comes back, and update durable state. `paginate` walks start pages into
//! item-URL runs; `scrape_items` walks a run's items into uploaded product
//! records.

// Sub-modules
pub mod classify;
pub mod paginate;
pub mod scrape_item;

pub(crate) mod batch;
pub(crate) mod work;

// Re-exports for public API
pub use classify::{retry_backoff, FailureClass};
pub use paginate::{paginate, PaginateReport};
pub use scrape_item::{scrape_items, ScrapeItemReport};

use std::sync::Arc;

use crate::config::ProxyPool;
use crate::extract::ExtractorRegistry;
use crate::session::SessionManager;
use crate::site::SiteManager;
use crate::store::EtlClient;

/// Shared collaborators both engines run against
///
/// Built once per process; invocations borrow it.
pub struct EngineContext {
    pub store: Arc<EtlClient>,
    pub sites: Arc<SiteManager>,
    pub sessions: Arc<SessionManager>,
    pub proxies: Arc<ProxyPool>,
    pub extractors: Arc<ExtractorRegistry>,
}
