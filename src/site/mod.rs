//! Per-site state: config cache, proxy blocklist, partial pagination runs
//!
//! The site manager owns everything a site accumulates during an invocation:
//! its scraping config (fetched from the external store, merged with any
//! strategy override from the proxy pool file), the datacenter-proxy
//! blocklist with lazy TTL expiry, and the in-memory `PartialRun` that holds
//! pagination progress until a domain's full pagination commits as one run.
//!
//! One async mutex guards all of it; external-store I/O happens outside the
//! lock (snapshot, call, commit).

// Sub-modules
pub mod partial;

// Re-exports for public API
pub use partial::{PaginationPatch, PaginationState, PartialRun};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Proxy, ProxyPool, ProxyRequirement, ProxyType, SiteConfig};
use crate::error::{Result, ScrapeError};
use crate::store::client::ListRunsQuery;
use crate::store::{EtlClient, ScrapeRun, ScrapeTarget, SiteMeta, TargetPatch};

/// One blocked proxy for one site
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub proxy_id: String,
    pub failed_at: DateTime<Utc>,
    pub failure_count: u32,
    pub last_error: String,
}

#[derive(Default)]
struct SiteState {
    /// Domain -> merged scraping config
    sites: HashMap<String, SiteConfig>,
    /// Raw metadata as served by the store (selectors etc.)
    metas: HashMap<String, SiteMeta>,
    /// Domain -> proxy id -> block entry
    blocklist: HashMap<String, HashMap<String, BlockEntry>>,
    /// Domain -> in-flight pagination
    partials: HashMap<String, PartialRun>,
    /// Start page URL -> owning domain, rebuilt on `start_pagination`
    start_page_index: HashMap<String, String>,
}

/// Owner of per-site mutable state
pub struct SiteManager {
    store: Arc<EtlClient>,
    pool: Arc<ProxyPool>,
    state: tokio::sync::Mutex<SiteState>,
}

impl SiteManager {
    #[must_use]
    pub fn new(store: Arc<EtlClient>, pool: Arc<ProxyPool>) -> Arc<Self> {
        Arc::new(Self {
            store,
            pool,
            state: tokio::sync::Mutex::new(SiteState::default()),
        })
    }

    /// Fetch and cache every site's config from the external store
    ///
    /// A strategy override in the proxy pool file wins over what the store
    /// declares for the same domain.
    pub async fn load_sites(&self) -> Result<Vec<SiteConfig>> {
        let metas = self.store.get_sites().await?;
        let mut state = self.state.lock().await;
        state.sites.clear();
        state.metas.clear();
        for meta in metas {
            let proxy = self
                .pool
                .requirement_for(&meta.domain)
                .cloned()
                .or_else(|| meta.proxy.clone());
            let config = SiteConfig {
                domain: meta.domain.clone(),
                start_pages: meta.start_pages.clone(),
                proxy,
                extractor_id: meta.extractor_id.clone(),
                blocked_proxy_ids: HashSet::new(),
            };
            state.metas.insert(meta.domain.clone(), meta);
            state.sites.insert(config.domain.clone(), config);
        }
        info!(sites = state.sites.len(), "loaded site configs");
        Ok(state.sites.values().cloned().collect())
    }

    /// Raw store metadata for a domain (selector specs live here)
    pub async fn site_meta(&self, domain: &str) -> Option<SiteMeta> {
        self.state.lock().await.metas.get(domain).cloned()
    }

    /// Snapshot configs for distribution
    ///
    /// Each config carries the site's current (unexpired) blocklist; with
    /// `no_proxy` every requirement is replaced by a direct one while the
    /// session limit is kept.
    pub async fn configs_for(&self, domains: &[String], no_proxy: bool) -> Vec<SiteConfig> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut out = Vec::with_capacity(domains.len());
        for domain in domains {
            let Some(config) = state.sites.get(domain).cloned() else { continue };
            let blocked = Self::unexpired_blocks(&mut state, &config, now);
            let mut config = config;
            config.blocked_proxy_ids = blocked;
            if no_proxy {
                let limit = config.session_limit();
                config.proxy = Some(ProxyRequirement::direct(limit));
                config.blocked_proxy_ids.clear();
            }
            out.push(config);
        }
        out
    }

    // ------------------------------------------------------------------
    // Blocklist
    // ------------------------------------------------------------------

    /// Record a network failure against a proxy for this site
    ///
    /// Only datacenter proxies are penalized; a rotating residential pool is
    /// not burned by a single bad URL. Repeat offenders bump the counter and
    /// refresh the timestamp.
    pub async fn add_block(&self, domain: &str, proxy: &Proxy, error: &str) {
        if proxy.kind != ProxyType::Datacenter {
            debug!(domain, proxy = %proxy.id, "not blocking non-datacenter proxy");
            return;
        }
        let mut state = self.state.lock().await;
        let entry = state
            .blocklist
            .entry(domain.to_string())
            .or_default()
            .entry(proxy.id.clone());
        use std::collections::hash_map::Entry;
        match entry {
            Entry::Occupied(mut slot) => {
                let block = slot.get_mut();
                block.failure_count += 1;
                block.failed_at = Utc::now();
                block.last_error = error.to_string();
                warn!(domain, proxy = %proxy.id, failures = block.failure_count, "proxy re-blocked");
            }
            Entry::Vacant(slot) => {
                slot.insert(BlockEntry {
                    proxy_id: proxy.id.clone(),
                    failed_at: Utc::now(),
                    failure_count: 1,
                    last_error: error.to_string(),
                });
                warn!(domain, proxy = %proxy.id, "proxy blocked: {error}");
            }
        }
    }

    /// Unexpired blocked proxy ids for a site
    pub async fn get_blocklist(&self, domain: &str) -> HashSet<String> {
        let mut state = self.state.lock().await;
        let Some(config) = state.sites.get(domain).cloned() else {
            return HashSet::new();
        };
        Self::unexpired_blocks(&mut state, &config, Utc::now())
    }

    /// Expire stale entries in place and return the survivors
    fn unexpired_blocks(
        state: &mut SiteState,
        config: &SiteConfig,
        now: DateTime<Utc>,
    ) -> HashSet<String> {
        let cooldown = config
            .proxy
            .as_ref()
            .map_or(30, |p| p.cooldown_minutes);
        let Some(blocks) = state.blocklist.get_mut(&config.domain) else {
            return HashSet::new();
        };
        blocks.retain(|proxy_id, entry| {
            let live = entry.failed_at + ChronoDuration::minutes(cooldown) >= now;
            if !live {
                debug!(domain = %config.domain, proxy = %proxy_id, "blocklist entry expired");
            }
            live
        });
        blocks.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Partial runs
    // ------------------------------------------------------------------

    /// Begin tracking pagination for a domain
    ///
    /// Replaces any previous partial for the domain and rebuilds the
    /// start-page index. Multiple domains may have partials concurrently.
    pub async fn start_pagination(&self, domain: &str, start_pages: &[String]) {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.partials.get(domain) {
            let pages_to_remove: Vec<String> = previous.start_pages().to_vec();
            for page in &pages_to_remove {
                state.start_page_index.remove(page);
            }
        }
        let partial = PartialRun::new(domain, start_pages);
        for page in start_pages {
            state
                .start_page_index
                .insert(page.clone(), domain.to_string());
        }
        state.partials.insert(domain.to_string(), partial);
        debug!(domain, start_pages = start_pages.len(), "pagination started");
    }

    /// Apply a patch to the pagination state owning `start_page_url`
    pub async fn update_pagination_state(
        &self,
        start_page_url: &str,
        patch: PaginationPatch,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(domain) = state.start_page_index.get(start_page_url).cloned() else {
            return Err(ScrapeError::UnknownStartPage(start_page_url.to_string()));
        };
        let Some(partial) = state.partials.get_mut(&domain) else {
            return Err(ScrapeError::UnknownStartPage(start_page_url.to_string()));
        };
        partial.apply(start_page_url, patch)
    }

    /// Start pages still waiting for pagination, up to the site's session
    /// limit per domain
    ///
    /// Pages past the site's failure threshold are withheld so a dead start
    /// page cannot spin the batch loop forever.
    pub async fn unprocessed_start_pages(&self, domains: &[String]) -> Vec<(String, Vec<String>)> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        for domain in domains {
            let Some(partial) = state.partials.get(domain) else { continue };
            let (limit, threshold) = state.sites.get(domain).map_or((1, 3), |c| {
                (
                    c.session_limit(),
                    c.proxy.as_ref().map_or(3, |p| p.failure_threshold),
                )
            });
            let pending = partial.incomplete_start_pages(limit, threshold);
            if !pending.is_empty() {
                out.push((domain.clone(), pending));
            }
        }
        out
    }

    /// Whether a partial run is still being tracked for the domain
    pub async fn has_partial(&self, domain: &str) -> bool {
        self.state.lock().await.partials.contains_key(domain)
    }

    /// Whether every pagination of the domain's partial has finished
    pub async fn pagination_complete(&self, domain: &str) -> bool {
        self.state
            .lock()
            .await
            .partials
            .get(domain)
            .is_some_and(PartialRun::all_completed)
    }

    /// Atomically commit a domain's finished pagination as one run
    ///
    /// Verifies every pagination completed and none came back empty, unions
    /// the collected URLs preserving per-pagination order then start-page
    /// order, creates the run in the external store, and only then drops the
    /// partial. On any failure the partial stays so the caller can retry the
    /// offending start page.
    pub async fn commit(&self, domain: &str) -> Result<ScrapeRun> {
        // Lock, validate, snapshot the union; never hold the lock across
        // the store call.
        let urls = {
            let state = self.state.lock().await;
            let Some(partial) = state.partials.get(domain) else {
                return Err(ScrapeError::PaginationIncomplete {
                    domain: domain.to_string(),
                });
            };
            partial.union_urls()?
        };

        let run = self.store.create_run(domain, &urls).await?;

        let mut state = self.state.lock().await;
        if let Some(partial) = state.partials.remove(domain) {
            for page in partial.start_pages() {
                state.start_page_index.remove(page);
            }
        }
        info!(domain, run = %run.id, urls = urls.len(), "run committed");
        Ok(run)
    }

    /// Drop a domain's partial without committing
    pub async fn abandon(&self, domain: &str) {
        let mut state = self.state.lock().await;
        if let Some(partial) = state.partials.remove(domain) {
            for page in partial.start_pages() {
                state.start_page_index.remove(page);
            }
            warn!(domain, "partial run abandoned");
        }
    }

    // ------------------------------------------------------------------
    // Scrape-item selection and write-through
    // ------------------------------------------------------------------

    /// Pending items from the latest run of each domain
    ///
    /// Returns `(domain, run id, targets)` with at most `per_domain_max`
    /// targets per domain. `include_failed` folds previously failed (never
    /// invalid) targets back in.
    pub async fn pending_items(
        &self,
        domains: &[String],
        per_domain_max: usize,
        include_failed: bool,
    ) -> Result<Vec<(String, String, Vec<ScrapeTarget>)>> {
        let mut out = Vec::new();
        for domain in domains {
            let runs = self
                .store
                .list_runs(&ListRunsQuery {
                    domain: Some(domain.clone()),
                    status: None,
                    since: None,
                })
                .await?;
            let Some(latest) = runs.into_iter().max_by_key(|r| r.created_at) else {
                continue;
            };
            let pending = latest.pending_items(per_domain_max, include_failed);
            if !pending.is_empty() {
                out.push((domain.clone(), latest.id, pending));
            }
        }
        Ok(out)
    }

    /// Write one target's status change through to the store
    pub async fn update_item(&self, run_id: &str, url: &str, patch: &TargetPatch) -> Result<()> {
        self.store.update_run_item(run_id, url, patch).await
    }
}
