//! Headless-browser fleet orchestration for e-commerce scraping
//!
//! The core is the orchestration engine: a pure distributor that matches
//! URLs to browser sessions under proxy/geo/blocklist constraints, a session
//! manager that creates, reuses, and destroys browsers across batches, a
//! site manager that tracks pagination progress and commits runs atomically
//! to the external store, a shared request cache interposed on all browser
//! traffic, and a per-URL retry/classification state machine. Site-specific
//! extraction, the store itself, and the browser are collaborators behind
//! narrow interfaces.

pub mod cache;
pub mod config;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod extract;
pub mod session;
pub mod site;
pub mod store;

pub use cache::{CacheConfig, CacheStats, RequestCache};
pub use config::{
    PaginateOptions, ProviderKind, Proxy, ProxyPool, ProxyRequirement, ProxyStrategy, ProxyType,
    ScrapeItemOptions, SiteConfig,
};
pub use distributor::{distribute, domain_for_url, session_matches, Assignment, SessionInfo};
pub use engine::{
    paginate, scrape_items, EngineContext, FailureClass, PaginateReport, ScrapeItemReport,
};
pub use error::{Result, ScrapeError};
pub use extract::{Extractor, ExtractorRegistry, SelectorExtractor};
pub use session::{Session, SessionManager, SessionRequest, DEFAULT_SESSION_CAP};
pub use site::{PaginationPatch, PaginationState, PartialRun, SiteManager};
pub use store::{EtlClient, ItemRecord, RunStatus, ScrapeRun, ScrapeTarget, SiteMeta};
