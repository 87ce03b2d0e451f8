//! Configuration types for sites, proxies, and engine invocations
//!
//! This module holds the per-site scraping configuration, the proxy pool
//! loaded once at startup, and the option structs that parameterize the
//! paginate and scrape-item engines.

// Sub-modules
pub mod options;
pub mod pool;
pub mod types;

// Re-exports for public API
pub use options::{PaginateOptions, ProviderKind, ScrapeItemOptions};
pub use pool::{ProxyPool, ProxyPoolFile};
pub use types::{Proxy, ProxyCredentials, ProxyRequirement, ProxyStrategy, ProxyType, SiteConfig};
