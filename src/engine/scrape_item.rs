//! Item-scraping pipeline
//!
//! Same batch skeleton as pagination, but the work comes from the latest
//! run of each domain: visit an item URL, extract a product record, buffer
//! it, and upload the buffer at batch end. Uploaded targets are marked done
//! individually; partial upload failures still get their successes marked.

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
use crate::config::{ScrapeItemOptions, SiteConfig};
use crate::error::Result;
use crate::extract::Extractor;
use crate::session::Session;
use crate::site::SiteManager;
use crate::store::{ItemRecord, ScrapeTarget, TargetPatch};

/// What one scrape-item invocation accomplished
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeItemReport {
    pub success: bool,
    pub sites_processed: usize,
    pub items_scraped: usize,
    pub items_uploaded: usize,
    pub items_failed: usize,
    pub items_invalid: usize,
    /// Domain or URL -> failure message
    pub errors: HashMap<String, String>,
    pub cache: CacheStats,
}

enum UnitOutcome {
    Scraped(Box<ItemRecord>),
    /// Session died; the target stays pending for the next batch
    Deferred,
    /// Terminal for the URL (missing extractor, not a product page, 404)
    Invalid(String),
    /// Network retries exhausted; `failed` counter bumped
    Failed { error: String, previous_failures: u32 },
    Cancelled,
}

/// Run the item-scraping pipeline
pub async fn scrape_items(
    ctx: &EngineContext,
    options: ScrapeItemOptions,
    cancel: CancellationToken,
) -> Result<ScrapeItemReport> {
    let mut report = ScrapeItemReport {
        success: true,
        ..ScrapeItemReport::default()
    };

    let all = ctx.sites.load_sites().await?;
    let filtered: Vec<SiteConfig> = all
        .into_iter()
        .filter(|c| {
            options
                .sites
                .as_ref()
                .is_none_or(|sites| sites.contains(&c.domain))
        })
        .filter(|c| !options.exclude.contains(&c.domain))
        .collect();

    // A domain with no extractor at all is skipped, not blacklisted.
    let mut extractors: HashMap<String, Arc<dyn Extractor>> = HashMap::new();
    let mut chosen = Vec::with_capacity(filtered.len());
    for config in filtered {
        match ctx.extractors.lookup(&config.extractor_id) {
            Ok(extractor) => {
                extractors.insert(config.domain.clone(), extractor);
                chosen.push(config);
            }
            Err(e) => {
                warn!(domain = %config.domain, "skipping site: {e}");
                report.errors.insert(config.domain.clone(), e.to_string());
            }
        }
    }
    report.sites_processed = chosen.len();
    if chosen.is_empty() {
        info!("no sites to scrape");
        return Ok(report);
    }
    let chosen_domains: Vec<String> = chosen.iter().map(|c| c.domain.clone()).collect();

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

    // Targets handled this invocation; keeps a no-save or retry-failed run
    // from picking the same URL forever. Deferred targets are not recorded,
    // the next batch re-picks them.
    let mut handled: HashSet<String> = HashSet::new();
    let mut touched_runs: HashSet<String> = HashSet::new();
    let mut cancelled = false;

    loop {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let mut targets: Vec<ScrapeTarget> = Vec::new();
        let mut origin: HashMap<String, (String, String, u32)> = HashMap::new();
        for config in &chosen {
            let batches = ctx
                .sites
                .pending_items(
                    std::slice::from_ref(&config.domain),
                    config.session_limit(),
                    options.retry_failed_items,
                )
                .await;
            let batches = match batches {
                Ok(batches) => batches,
                Err(e) => {
                    report.errors.insert(config.domain.clone(), e.to_string());
                    report.success = false;
                    continue;
                }
            };
            for (domain, run_id, items) in batches {
                for item in items {
                    if handled.contains(&item.url) {
                        continue;
                    }
                    origin.insert(
                        item.url.clone(),
                        (domain.clone(), run_id.clone(), item.failed),
                    );
                    targets.push(item);
                }
            }
        }
        if targets.is_empty() {
            break;
        }

        let configs = ctx.sites.configs_for(&chosen_domains, options.no_proxy).await;
        let assignment =
            assign_batch(ctx, &targets, &configs, options.instance_limit, &browser).await;
        for (domain, message) in assignment.errors {
            report.success = false;
            report.errors.entry(domain).or_insert(message);
        }
        if assignment.pairs.is_empty() {
            warn!("no session could be assigned to any pending item, stopping");
            report.success = false;
            break;
        }

        let mut tasks = FuturesUnordered::new();
        for (url, session) in assignment.pairs {
            let Some((domain, run_id, previous_failures)) = origin.get(&url).cloned() else {
                continue;
            };
            let Some(extractor) = extractors.get(&domain).cloned() else { continue };
            let cache = Arc::clone(&cache);
            let sites = Arc::clone(&ctx.sites);
            let cancel = cancel.clone();
            let max_retries = options.max_retries;
            let timeout = options.page_load_timeout();
            tasks.push(tokio::spawn(async move {
                let outcome = scrape_one(
                    &sites,
                    &session,
                    &cache,
                    extractor,
                    &url,
                    &domain,
                    previous_failures,
                    max_retries,
                    timeout,
                    cancel,
                )
                .await;
                (url, run_id, outcome)
            }));
        }

        // Buffer records per batch; upload happens once the fan-out drains.
        let mut scraped: Vec<(String, String, ItemRecord)> = Vec::new();
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok((url, run_id, outcome)) => match outcome {
                    UnitOutcome::Scraped(record) => {
                        handled.insert(url.clone());
                        scraped.push((url, run_id, *record));
                    }
                    UnitOutcome::Deferred => {
                        debug!(%url, "item deferred to next batch");
                    }
                    UnitOutcome::Invalid(message) => {
                        handled.insert(url.clone());
                        report.items_invalid += 1;
                        if !options.no_save {
                            mark_target(ctx, &run_id, &url, &TargetPatch::invalid(), &mut report)
                                .await;
                            touched_runs.insert(run_id);
                        }
                        report.errors.insert(url, message);
                    }
                    UnitOutcome::Failed { error, previous_failures } => {
                        handled.insert(url.clone());
                        report.items_failed += 1;
                        if !options.no_save {
                            mark_target(
                                ctx,
                                &run_id,
                                &url,
                                &TargetPatch::failed(previous_failures + 1),
                                &mut report,
                            )
                            .await;
                            touched_runs.insert(run_id);
                        }
                        report.errors.insert(url, error);
                    }
                    UnitOutcome::Cancelled => cancelled = true,
                },
                Err(e) => warn!("scrape task panicked: {e}"),
            }
        }

        report.items_scraped += scraped.len();
        if !scraped.is_empty() && !options.no_save {
            upload_batch(ctx, scraped, &mut touched_runs, &mut report).await;
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
        finalize_exhausted_runs(ctx, &touched_runs, &mut report).await;
    }

    info!(
        scraped = report.items_scraped,
        uploaded = report.items_uploaded,
        failed = report.items_failed,
        success = report.success,
        "scrape-items finished"
    );
    Ok(report)
}

/// Upload the batch buffer atomically and mark the accepted targets done
async fn upload_batch(
    ctx: &EngineContext,
    scraped: Vec<(String, String, ItemRecord)>,
    touched_runs: &mut HashSet<String>,
    report: &mut ScrapeItemReport,
) {
    let records: Vec<ItemRecord> = scraped.iter().map(|(_, _, r)| r.clone()).collect();
    let outcome = match ctx.store.add_items(&records).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("batch upload failed: {e}");
            report.errors.insert("item-upload".to_string(), e.to_string());
            report.success = false;
            return;
        }
    };

    let accepted: HashSet<&str> = outcome.successful.iter().map(String::as_str).collect();
    for (url, reason) in &outcome.failed {
        warn!(%url, "store rejected item: {reason}");
        report.errors.insert(url.clone(), reason.clone());
    }

    for (url, run_id, record) in &scraped {
        if !accepted.contains(record.source_url.as_str()) {
            continue;
        }
        report.items_uploaded += 1;
        mark_target(ctx, run_id, url, &TargetPatch::done(), report).await;
        touched_runs.insert(run_id.clone());
    }
}

async fn mark_target(
    ctx: &EngineContext,
    run_id: &str,
    url: &str,
    patch: &TargetPatch,
    report: &mut ScrapeItemReport,
) {
    if let Err(e) = ctx.sites.update_item(run_id, url, patch).await {
        warn!(%url, "failed to update target status: {e}");
        report.errors.entry(url.to_string()).or_insert_with(|| e.to_string());
        report.success = false;
    }
}

/// Finalize runs whose items are all terminal now
async fn finalize_exhausted_runs(
    ctx: &EngineContext,
    touched_runs: &HashSet<String>,
    report: &mut ScrapeItemReport,
) {
    for run_id in touched_runs {
        match ctx.store.fetch_run(run_id).await {
            Ok(run) => {
                let exhausted = run.items.iter().all(|t| t.done || t.invalid);
                if exhausted {
                    if let Err(e) = ctx.store.finalize_run(run_id).await {
                        warn!(run = %run_id, "failed to finalize run: {e}");
                        report.errors.insert(run_id.clone(), e.to_string());
                        report.success = false;
                    } else {
                        info!(run = %run_id, "run finalized");
                    }
                }
            }
            Err(e) => {
                warn!(run = %run_id, "failed to re-fetch run: {e}");
            }
        }
    }
}

/// Scrape one item URL on one session
#[allow(clippy::too_many_arguments)]
async fn scrape_one(
    sites: &Arc<SiteManager>,
    session: &Arc<Session>,
    cache: &Arc<RequestCache>,
    extractor: Arc<dyn Extractor>,
    url: &str,
    domain: &str,
    previous_failures: u32,
    max_retries: u32,
    timeout: std::time::Duration,
    cancel: CancellationToken,
) -> UnitOutcome {
    let mut attempt = 0u32;
    loop {
        let run = attempt_scrape(session, cache, &extractor, url, domain, timeout);
        let result = tokio::select! {
            _ = cancel.cancelled() => return UnitOutcome::Cancelled,
            result = run => result,
        };

        match result {
            Ok(record) => {
                debug!(%url, "item scraped");
                return UnitOutcome::Scraped(Box::new(record));
            }
            Err(error) => match FailureClass::classify(&error) {
                FailureClass::BrowserClosed => {
                    warn!(%url, "browser died mid-scrape: {error:#}");
                    session.invalidate();
                    return UnitOutcome::Deferred;
                }
                FailureClass::MissingExtractor | FailureClass::Other => {
                    return UnitOutcome::Invalid(format!("{error:#}"));
                }
                FailureClass::Network => {
                    if attempt < max_retries {
                        let backoff = retry_backoff(attempt);
                        debug!(%url, attempt, "network failure, retrying in {backoff:?}");
                        tokio::select! {
                            _ = cancel.cancelled() => return UnitOutcome::Cancelled,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        attempt += 1;
                        continue;
                    }
                    let message = format!("{error:#}");
                    if let Some(proxy) = session.proxy() {
                        sites.add_block(domain, proxy, &message).await;
                    }
                    return UnitOutcome::Failed {
                        error: message,
                        previous_failures,
                    };
                }
            },
        }
    }
}

/// One scrape attempt: open, load, extract, tear down
async fn attempt_scrape(
    session: &Arc<Session>,
    cache: &Arc<RequestCache>,
    extractor: &Arc<dyn Extractor>,
    url: &str,
    domain: &str,
    timeout: std::time::Duration,
) -> anyhow::Result<ItemRecord> {
    let page = WorkPage::open(session, cache).await?;
    let result = async {
        page.load(url, timeout).await?;
        let mut record = extractor.scrape_item(&page.page).await?;
        if record.source_url.is_empty() {
            record.source_url = url.to_string();
        }
        if record.domain.is_empty() {
            record.domain = domain.to_string();
        }
        Ok(record)
    }
    .await;
    page.close().await;
    result
}
