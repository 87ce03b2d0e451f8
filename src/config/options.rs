//! Engine invocation options
//!
//! One struct per pipeline. Defaults match what the CLI advertises; the
//! binary populates these from flags and environment.

use chrono::{DateTime, Utc};

/// Which browser provider sessions are created against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    /// Launch a Chromium process on this machine per session
    #[default]
    Local,
    /// Attach to a remote browser service over its CDP websocket
    Remote,
}

/// Options for one paginate invocation
#[derive(Debug, Clone)]
pub struct PaginateOptions {
    /// Restrict to these domains; `None` means every site with start pages
    pub sites: Option<Vec<String>>,
    /// Domains to skip; takes precedence over `sites`
    pub exclude: Vec<String>,
    /// Skip sites that have any run newer than this cutoff
    pub since: Option<DateTime<Utc>>,
    /// Ignore the `since` cutoff
    pub force: bool,
    /// Max concurrent sessions this invocation may hold
    pub instance_limit: usize,
    /// Cap on pages walked per start page; `None` is unlimited
    pub max_pages: Option<usize>,
    pub disable_cache: bool,
    pub cache_size_mb: usize,
    pub cache_ttl_seconds: u64,
    pub block_images: bool,
    /// Collect URLs but skip committing runs to the store
    pub no_save: bool,
    pub provider: ProviderKind,
    /// Run local browsers with a visible window
    pub local_headed: bool,
    /// Hint forwarded to the remote provider; never enforced locally
    pub session_timeout_secs: Option<u64>,
    /// Retries for network-classified failures
    pub max_retries: u32,
    /// Force a direct connection for every site this invocation
    pub no_proxy: bool,
}

impl Default for PaginateOptions {
    fn default() -> Self {
        Self {
            sites: None,
            exclude: Vec::new(),
            since: None,
            force: false,
            instance_limit: 10,
            max_pages: None,
            disable_cache: false,
            cache_size_mb: 250,
            cache_ttl_seconds: 300,
            block_images: true,
            no_save: false,
            provider: ProviderKind::Local,
            local_headed: false,
            session_timeout_secs: None,
            max_retries: 2,
            no_proxy: false,
        }
    }
}

impl PaginateOptions {
    /// Wall-clock budget for a single page load
    #[must_use]
    pub fn page_load_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(15)
    }
}

/// Options for one scrape-item invocation
#[derive(Debug, Clone)]
pub struct ScrapeItemOptions {
    pub sites: Option<Vec<String>>,
    pub exclude: Vec<String>,
    pub instance_limit: usize,
    pub disable_cache: bool,
    pub cache_size_mb: usize,
    pub cache_ttl_seconds: u64,
    pub block_images: bool,
    /// Scrape but skip uploading items and marking targets
    pub no_save: bool,
    pub provider: ProviderKind,
    pub local_headed: bool,
    pub session_timeout_secs: Option<u64>,
    pub max_retries: u32,
    /// Also pick up targets that failed before (but never invalid ones)
    pub retry_failed_items: bool,
    pub no_proxy: bool,
}

impl Default for ScrapeItemOptions {
    fn default() -> Self {
        Self {
            sites: None,
            exclude: Vec::new(),
            instance_limit: 10,
            disable_cache: false,
            cache_size_mb: 250,
            cache_ttl_seconds: 300,
            block_images: true,
            no_save: false,
            provider: ProviderKind::Local,
            local_headed: false,
            session_timeout_secs: None,
            max_retries: 1,
            retry_failed_items: false,
            no_proxy: false,
        }
    }
}

impl ScrapeItemOptions {
    /// Item pages get a longer budget than listing pages
    #[must_use]
    pub fn page_load_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(30)
    }
}
