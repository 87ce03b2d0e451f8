//! Pagination pipeline
//!
//! Walks each chosen site's start pages, follows pagination through the
//! site's extractor, and commits every fully collected domain as one run in
//! the external store. Browsers stay open across batches; only excess,
//! invalidated, or shutdown sessions lose theirs.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batch::{assign_batch, BrowserOptions};
use super::classify::{retry_backoff, FailureClass};
use super::work::WorkPage;
use super::EngineContext;
use crate::cache::{CacheConfig, CacheStats, RequestCache};
use crate::config::{PaginateOptions, SiteConfig};
use crate::error::{Result, ScrapeError};
use crate::extract::Extractor;
use crate::session::Session;
use crate::site::{PaginationPatch, SiteManager};
use crate::store::client::ListRunsQuery;
use crate::store::ScrapeTarget;

/// What one paginate invocation accomplished
#[derive(Debug, Clone, Default, Serialize)]
pub struct PaginateReport {
    pub success: bool,
    pub sites_processed: usize,
    pub total_urls: usize,
    pub urls_by_site: HashMap<String, usize>,
    /// Domain or URL -> failure message
    pub errors: HashMap<String, String>,
    pub cache: CacheStats,
}

enum UnitOutcome {
    /// Pagination finished; this many URLs were collected
    Completed(usize),
    /// Session died; the start page stays pending for the next batch
    Deferred,
    /// Terminal failure recorded against the start page
    Terminal(String),
    /// Network retries exhausted
    Failed(String),
    Cancelled,
}

/// Run the pagination pipeline
///
/// Loops batches of unprocessed start pages through the distributor and the
/// session fleet until no pending work remains or the token cancels, then
/// destroys all sessions and reports.
pub async fn paginate(
    ctx: &EngineContext,
    options: PaginateOptions,
    cancel: CancellationToken,
) -> Result<PaginateReport> {
    let mut report = PaginateReport {
        success: true,
        ..PaginateReport::default()
    };

    let chosen = choose_sites(ctx, &options, &mut report).await?;

    // A domain with no extractor at all is skipped this invocation, not
    // blacklisted; it never gets a partial run started.
    let mut extractors: HashMap<String, Arc<dyn Extractor>> = HashMap::new();
    let mut chosen_with_extractor = Vec::with_capacity(chosen.len());
    for config in chosen {
        match ctx.extractors.lookup(&config.extractor_id) {
            Ok(extractor) => {
                extractors.insert(config.domain.clone(), extractor);
                chosen_with_extractor.push(config);
            }
            Err(e) => {
                warn!(domain = %config.domain, "skipping site: {e}");
                report.errors.insert(config.domain.clone(), e.to_string());
            }
        }
    }
    let chosen = chosen_with_extractor;
    report.sites_processed = chosen.len();
    if chosen.is_empty() {
        info!("no sites to paginate");
        return Ok(report);
    }
    let chosen_domains: Vec<String> = chosen.iter().map(|c| c.domain.clone()).collect();

    for config in &chosen {
        ctx.sites
            .start_pagination(&config.domain, &config.start_pages)
            .await;
    }

    let cache = RequestCache::new(CacheConfig {
        max_size_bytes: (options.cache_size_mb as u64) * 1024 * 1024,
        ttl: std::time::Duration::from_secs(options.cache_ttl_seconds),
        block_images: options.block_images,
        enabled: !options.disable_cache,
    });
    let browser = BrowserOptions {
        provider: options.provider,
        headless: !options.local_headed,
        session_timeout_secs: options.session_timeout_secs,
    };

    let mut failed_commits: HashSet<String> = HashSet::new();
    let mut cancelled = false;

    loop {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let pending = ctx.sites.unprocessed_start_pages(&chosen_domains).await;
        if pending.is_empty() {
            break;
        }

        let mut targets = Vec::new();
        let mut domain_of: HashMap<String, String> = HashMap::new();
        for (domain, pages) in &pending {
            for page in pages {
                domain_of.insert(page.clone(), domain.clone());
                targets.push(ScrapeTarget::new(page.clone()));
            }
        }

        let configs = ctx.sites.configs_for(&chosen_domains, options.no_proxy).await;
        let assignment =
            assign_batch(ctx, &targets, &configs, options.instance_limit, &browser).await;
        for (domain, message) in assignment.errors {
            report.success = false;
            report.errors.entry(domain).or_insert(message);
        }
        if assignment.pairs.is_empty() {
            warn!("no session could be assigned to any pending start page, stopping");
            report.success = false;
            break;
        }

        let mut tasks = FuturesUnordered::new();
        for (url, session) in assignment.pairs {
            let Some(domain) = domain_of.get(&url).cloned() else { continue };
            let Some(extractor) = extractors.get(&domain).cloned() else { continue };
            let sites = Arc::clone(&ctx.sites);
            let cache = Arc::clone(&cache);
            let cancel = cancel.clone();
            let max_pages = options.max_pages;
            let max_retries = options.max_retries;
            let timeout = options.page_load_timeout();
            tasks.push(tokio::spawn(async move {
                let outcome = paginate_one(
                    &sites, &session, &cache, extractor, &url, &domain, max_pages, max_retries,
                    timeout, cancel,
                )
                .await;
                (domain, url, outcome)
            }));
        }

        while let Some(joined) = tasks.next().await {
            match joined {
                Ok((domain, url, outcome)) => match outcome {
                    UnitOutcome::Completed(count) => {
                        report.total_urls += count;
                        *report.urls_by_site.entry(domain).or_insert(0) += count;
                    }
                    UnitOutcome::Deferred => {
                        debug!(%url, "start page deferred to next batch");
                    }
                    UnitOutcome::Terminal(message) | UnitOutcome::Failed(message) => {
                        report.errors.insert(url, message);
                    }
                    UnitOutcome::Cancelled => cancelled = true,
                },
                Err(e) => warn!("pagination task panicked: {e}"),
            }
        }

        if !options.no_save {
            commit_ready_domains(ctx, &chosen_domains, &mut failed_commits, &mut report).await;
        }
        if cancelled {
            break;
        }
    }

    // Cleanup always runs, cancelled or not.
    ctx.sessions.destroy_all().await;
    report.cache = cache.stats();
    cache.clear();

    if cancelled {
        report.success = false;
    }
    if !options.no_save {
        for domain in &chosen_domains {
            if ctx.sites.has_partial(domain).await {
                report.success = false;
                report
                    .errors
                    .entry(domain.clone())
                    .or_insert_with(|| "pagination did not commit".to_string());
            }
        }
    }

    info!(
        sites = report.sites_processed,
        urls = report.total_urls,
        success = report.success,
        "paginate finished"
    );
    Ok(report)
}

/// Apply `sites`/`exclude` and the `since` cutoff to the configured sites
async fn choose_sites(
    ctx: &EngineContext,
    options: &PaginateOptions,
    report: &mut PaginateReport,
) -> Result<Vec<SiteConfig>> {
    let all = ctx.sites.load_sites().await?;
    let mut chosen = Vec::new();
    for config in all {
        if config.start_pages.is_empty() {
            continue;
        }
        if let Some(sites) = &options.sites {
            if !sites.contains(&config.domain) {
                continue;
            }
        }
        if options.exclude.contains(&config.domain) {
            continue;
        }
        if let (Some(since), false) = (options.since, options.force) {
            // Any run newer than the cutoff skips the site, successful or not.
            let recent = ctx
                .store
                .list_runs(&ListRunsQuery {
                    domain: Some(config.domain.clone()),
                    status: None,
                    since: Some(since),
                })
                .await;
            match recent {
                Ok(runs) if !runs.is_empty() => {
                    debug!(domain = %config.domain, "skipped: has a run since the cutoff");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    report.errors.insert(config.domain.clone(), e.to_string());
                    report.success = false;
                    continue;
                }
            }
        }
        chosen.push(config);
    }
    Ok(chosen)
}

/// Try to commit every domain whose partial is whole
async fn commit_ready_domains(
    ctx: &EngineContext,
    domains: &[String],
    failed_commits: &mut HashSet<String>,
    report: &mut PaginateReport,
) {
    for domain in domains {
        if failed_commits.contains(domain) {
            continue;
        }
        if !ctx.sites.pagination_complete(domain).await {
            continue;
        }
        match ctx.sites.commit(domain).await {
            Ok(run) => {
                info!(%domain, run = %run.id, "committed run");
            }
            Err(e @ ScrapeError::EmptyPagination { .. }) => {
                report.errors.insert(domain.clone(), e.to_string());
                report.success = false;
                failed_commits.insert(domain.clone());
            }
            Err(e) => {
                // Store unreachable or similar; the partial stays for a
                // later attempt but this invocation is no longer clean.
                warn!(%domain, "commit failed: {e}");
                report.errors.insert(domain.clone(), e.to_string());
                report.success = false;
                failed_commits.insert(domain.clone());
            }
        }
    }
}

/// Paginate one start page on one session
#[allow(clippy::too_many_arguments)]
async fn paginate_one(
    sites: &Arc<SiteManager>,
    session: &Arc<Session>,
    cache: &Arc<RequestCache>,
    extractor: Arc<dyn Extractor>,
    start_page: &str,
    domain: &str,
    max_pages: Option<usize>,
    max_retries: u32,
    timeout: std::time::Duration,
    cancel: CancellationToken,
) -> UnitOutcome {
    let mut attempt = 0u32;
    loop {
        let run = attempt_pagination(session, cache, &extractor, start_page, max_pages, timeout);
        let result = tokio::select! {
            _ = cancel.cancelled() => return UnitOutcome::Cancelled,
            result = run => result,
        };

        match result {
            Ok(urls) => {
                let count = urls.len();
                if let Err(e) = sites
                    .update_pagination_state(start_page, PaginationPatch::completed(urls))
                    .await
                {
                    warn!(start_page, "could not record pagination result: {e}");
                }
                debug!(start_page, count, "pagination completed");
                return UnitOutcome::Completed(count);
            }
            Err(error) => match FailureClass::classify(&error) {
                FailureClass::BrowserClosed => {
                    warn!(start_page, "browser died mid-pagination: {error:#}");
                    session.invalidate();
                    return UnitOutcome::Deferred;
                }
                FailureClass::MissingExtractor | FailureClass::Other => {
                    let message = format!("{error:#}");
                    if let Err(e) = sites
                        .update_pagination_state(start_page, PaginationPatch::terminal(message.clone()))
                        .await
                    {
                        warn!(start_page, "could not record terminal failure: {e}");
                    }
                    return UnitOutcome::Terminal(message);
                }
                FailureClass::Network => {
                    if attempt < max_retries {
                        let backoff = retry_backoff(attempt);
                        debug!(start_page, attempt, "network failure, retrying in {backoff:?}");
                        tokio::select! {
                            _ = cancel.cancelled() => return UnitOutcome::Cancelled,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        attempt += 1;
                        continue;
                    }
                    let message = format!("{error:#}");
                    if let Err(e) = sites
                        .update_pagination_state(start_page, PaginationPatch::failed(message.clone()))
                        .await
                    {
                        warn!(start_page, "could not record failure: {e}");
                    }
                    if let Some(proxy) = session.proxy() {
                        sites.add_block(domain, proxy, &message).await;
                    }
                    return UnitOutcome::Failed(message);
                }
            },
        }
    }
}

/// One pagination attempt: open, walk, union, tear down
async fn attempt_pagination(
    session: &Arc<Session>,
    cache: &Arc<RequestCache>,
    extractor: &Arc<dyn Extractor>,
    start_page: &str,
    max_pages: Option<usize>,
    timeout: std::time::Duration,
) -> anyhow::Result<Vec<String>> {
    let page = WorkPage::open(session, cache).await?;
    let walked = walk_pages(&page, extractor, start_page, max_pages, timeout).await;
    page.close().await;
    walked
}

async fn walk_pages(
    work: &WorkPage,
    extractor: &Arc<dyn Extractor>,
    start_page: &str,
    max_pages: Option<usize>,
    timeout: std::time::Duration,
) -> anyhow::Result<Vec<String>> {
    work.load(start_page, timeout).await?;

    let mut seen = HashSet::new();
    let mut collected = Vec::new();
    let mut pages_walked = 1usize;
    loop {
        for url in extractor.get_item_urls(&work.page).await? {
            if seen.insert(url.clone()) {
                collected.push(url);
            }
        }
        if max_pages.is_some_and(|max| pages_walked >= max) {
            break;
        }
        if !extractor.paginate(&work.page).await? {
            break;
        }
        pages_walked += 1;
    }
    Ok(collected)
}
