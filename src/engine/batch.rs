//! Per-batch session reconciliation
//!
//! Both pipelines share the same dance at the top of every batch: reuse the
//! sessions that still match, destroy the excess, create sessions for the
//! targets nothing matched, then distribute again over the full fleet.
//! Excess sessions are destroyed after the first pass, before new ones are
//! created for the second.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::EngineContext;
use crate::config::{ProviderKind, SiteConfig};
use crate::distributor::{distribute, domain_for_url, Assignment, SessionInfo};
use crate::error::ScrapeError;
use crate::session::{Session, SessionRequest};
use crate::store::ScrapeTarget;

/// Browser knobs a batch passes to the session manager
#[derive(Debug, Clone)]
pub(crate) struct BrowserOptions {
    pub provider: ProviderKind,
    pub headless: bool,
    pub session_timeout_secs: Option<u64>,
}

/// Result of reconciling one batch
pub(crate) struct BatchAssignment {
    /// URL paired with the live session that will serve it
    pub pairs: Vec<(String, Arc<Session>)>,
    /// Per-domain failures (no proxy available, provider down); the domain
    /// is skipped this batch but not blacklisted
    pub errors: Vec<(String, String)>,
}

/// Match targets to sessions, creating and destroying sessions as needed
pub(crate) async fn assign_batch(
    ctx: &EngineContext,
    targets: &[ScrapeTarget],
    configs: &[SiteConfig],
    instance_limit: usize,
    browser: &BrowserOptions,
) -> BatchAssignment {
    let mut errors = Vec::new();

    // Sessions whose browser died since last batch are useless; reap them
    // before counting anything.
    ctx.sessions.destroy_invalidated().await;

    // First pass: current fleet only.
    let active = ctx.sessions.active().await;
    for session in &active {
        session.set_in_use(false);
    }
    let infos: Vec<SessionInfo> = active.iter().map(|s| s.info().clone()).collect();
    let first_pass = distribute(targets, &infos, configs);

    let matched_ids: HashSet<&str> = first_pass.iter().map(|a| a.session_id.as_str()).collect();
    let excess: Vec<String> = active
        .iter()
        .filter(|s| !matched_ids.contains(s.id()))
        .map(|s| s.id().to_string())
        .collect();
    for session in &active {
        if matched_ids.contains(session.id()) {
            session.set_in_use(true);
        }
    }
    drop(active);

    for id in &excess {
        debug!(session = %id, "destroying excess session");
        ctx.sessions.destroy(id).await;
    }

    // Second pass: create sessions for what nothing matched, bounded by the
    // invocation's instance limit (the manager separately enforces the
    // global cap).
    let assigned_urls: HashSet<&str> = first_pass.iter().map(|a| a.url.as_str()).collect();
    let unmatched: Vec<&ScrapeTarget> = targets
        .iter()
        .filter(|t| !t.done && !assigned_urls.contains(t.url.as_str()))
        .collect();
    let capacity = instance_limit.saturating_sub(matched_ids.len());

    let mut assignments: Vec<Assignment> = first_pass;
    if capacity > 0 && !unmatched.is_empty() {
        let requests = build_session_requests(ctx, &unmatched, configs, capacity, browser, &mut errors);
        if !requests.is_empty() {
            let created = ctx.sessions.create_sessions(requests).await;
            if created.is_empty() {
                errors.push((
                    "session-manager".to_string(),
                    "could not create any session this batch".to_string(),
                ));
            } else {
                // Re-distribute over the whole fleet, old and new.
                let all = ctx.sessions.active().await;
                for session in &all {
                    session.set_in_use(false);
                }
                let infos: Vec<SessionInfo> = all.iter().map(|s| s.info().clone()).collect();
                assignments = distribute(targets, &infos, configs);
            }
        }
    }

    // The invocation may hold at most instance_limit sessions at once, even
    // when the global cap let more stay alive.
    assignments.truncate(instance_limit);

    // Resolve session ids back to live handles.
    let live = ctx.sessions.active().await;
    let by_id: HashMap<&str, &Arc<Session>> = live.iter().map(|s| (s.id(), s)).collect();
    let mut pairs = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        match by_id.get(assignment.session_id.as_str()) {
            Some(session) => {
                session.set_in_use(true);
                pairs.push((assignment.url, Arc::clone(session)));
            }
            None => warn!(
                session = %assignment.session_id,
                url = %assignment.url,
                "assigned session vanished before the batch started"
            ),
        }
    }

    BatchAssignment { pairs, errors }
}

/// One create request per unmatched target, grouped by domain and clamped
/// to the site's session limit and the remaining capacity
fn build_session_requests(
    ctx: &EngineContext,
    unmatched: &[&ScrapeTarget],
    configs: &[SiteConfig],
    capacity: usize,
    browser: &BrowserOptions,
    errors: &mut Vec<(String, String)>,
) -> Vec<SessionRequest> {
    let configs_by_domain: HashMap<&str, &SiteConfig> =
        configs.iter().map(|c| (c.domain.as_str(), c)).collect();

    let mut domain_counts: Vec<(String, usize)> = Vec::new();
    for target in unmatched {
        let Some(domain) = domain_for_url(&target.url) else { continue };
        match domain_counts.iter_mut().find(|(d, _)| *d == domain) {
            Some((_, count)) => *count += 1,
            None => domain_counts.push((domain, 1)),
        }
    }

    let mut requests = Vec::new();
    for (domain, count) in domain_counts {
        if requests.len() >= capacity {
            break;
        }
        let config = configs_by_domain.get(domain.as_str());
        let per_site = config.map_or(1, |c| c.session_limit()).min(count);

        for _ in 0..per_site {
            if requests.len() >= capacity {
                break;
            }
            let proxy = match config.and_then(|c| c.proxy.as_ref()) {
                Some(requirement) => {
                    let blocked = config
                        .map(|c| c.blocked_proxy_ids.clone())
                        .unwrap_or_default();
                    match ctx.proxies.select(&domain, requirement, &blocked) {
                        Ok(proxy) => proxy,
                        Err(ScrapeError::NoSuitableProxy { reason, .. }) => {
                            errors.push((domain.clone(), reason));
                            break;
                        }
                        Err(e) => {
                            errors.push((domain.clone(), e.to_string()));
                            break;
                        }
                    }
                }
                None => None,
            };
            requests.push(SessionRequest {
                domain: domain.clone(),
                proxy,
                provider: browser.provider,
                headless: browser.headless,
                session_timeout_secs: browser.session_timeout_secs,
            });
        }
    }
    requests
}
