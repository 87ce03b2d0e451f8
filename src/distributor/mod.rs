//! URL-to-session matching
//!
//! The distributor is a pure function: given a batch of targets, the live
//! sessions, and the site configs, it pairs each URL with a compatible
//! session. No I/O, deterministic, greedy first-fit in input order. Targets
//! that cannot be matched are silently omitted; the engines treat "not in
//! the output" as "try again next batch".

use std::collections::{HashMap, HashSet};
use tracing::trace;

use crate::config::{ProxyStrategy, ProxyType, SiteConfig};
use crate::store::ScrapeTarget;

/// The distributor's view of a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Stable across batches; derived from a provider-assigned identifier
    pub id: String,
    pub proxy_type: Option<ProxyType>,
    pub proxy_id: Option<String>,
    pub proxy_geo: Option<String>,
}

impl SessionInfo {
    /// Session with no proxy attached
    #[must_use]
    pub fn direct(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            proxy_type: None,
            proxy_id: None,
            proxy_geo: None,
        }
    }
}

/// One unit of the distributor's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub url: String,
    pub session_id: String,
}

/// Hostname of a URL with a leading `www.` stripped, lowercased
///
/// Bare strings without a scheme fall back to their first path-ish segment
/// so configs keyed by domain still match.
#[must_use]
pub fn domain_for_url(url: &str) -> Option<String> {
    let host = match url::Url::parse(url) {
        Ok(parsed) => parsed.host_str()?.to_string(),
        Err(_) => url.split(['/', '?', '#', ':']).next()?.to_string(),
    };
    if host.is_empty() {
        return None;
    }
    let host = host.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Whether a session satisfies every active constraint of a site config
///
/// A missing config (or one without a proxy requirement) matches any
/// session. After that, blocklist and geo are checked before the strategy.
#[must_use]
pub fn session_matches(session: &SessionInfo, config: Option<&SiteConfig>) -> bool {
    let Some(config) = config else { return true };
    let Some(requirement) = &config.proxy else {
        return true;
    };

    if let Some(proxy_id) = &session.proxy_id {
        if config.blocked_proxy_ids.contains(proxy_id) {
            return false;
        }
    }

    if let (Some(want), Some(have)) = (&requirement.geo, &session.proxy_geo) {
        if !want.eq_ignore_ascii_case(have) {
            return false;
        }
    }

    match requirement.strategy {
        ProxyStrategy::None => matches!(session.proxy_type, None | Some(ProxyType::None)),
        ProxyStrategy::Datacenter => session.proxy_type == Some(ProxyType::Datacenter),
        ProxyStrategy::ResidentialStable | ProxyStrategy::ResidentialRotating => {
            session.proxy_type == Some(ProxyType::Residential)
        }
        ProxyStrategy::DatacenterToResidential => matches!(
            session.proxy_type,
            Some(ProxyType::Datacenter) | Some(ProxyType::Residential)
        ),
    }
}

/// Pair pending targets with compatible sessions
///
/// Greedy first-fit: targets in input order, sessions in input order. Each
/// URL and each session appears at most once in the output, and no site
/// receives more pairs than its session limit (default 1 when the site has
/// no proxy requirement, unlimited when the site has no config at all).
#[must_use]
pub fn distribute(
    targets: &[ScrapeTarget],
    sessions: &[SessionInfo],
    site_configs: &[SiteConfig],
) -> Vec<Assignment> {
    let configs_by_domain: HashMap<&str, &SiteConfig> = site_configs
        .iter()
        .map(|c| (c.domain.as_str(), c))
        .collect();

    let mut assigned_sessions: HashSet<&str> = HashSet::new();
    let mut assigned_urls: HashSet<&str> = HashSet::new();
    let mut per_site: HashMap<&str, usize> = HashMap::new();
    let mut out = Vec::new();

    for target in targets.iter().filter(|t| !t.done) {
        if assigned_urls.contains(target.url.as_str()) {
            continue;
        }
        let domain = domain_for_url(&target.url);
        let config = domain
            .as_deref()
            .and_then(|d| configs_by_domain.get(d).copied());

        if let Some(config) = config {
            let used = per_site.get(config.domain.as_str()).copied().unwrap_or(0);
            if used >= config.session_limit() {
                trace!(url = %target.url, "site session limit reached, skipping");
                continue;
            }
        }

        let Some(session) = sessions.iter().find(|s| {
            !assigned_sessions.contains(s.id.as_str()) && session_matches(s, config)
        }) else {
            trace!(url = %target.url, "no compatible session, skipping");
            continue;
        };

        assigned_sessions.insert(&session.id);
        assigned_urls.insert(&target.url);
        if let Some(config) = config {
            *per_site.entry(config.domain.as_str()).or_insert(0) += 1;
        }
        out.push(Assignment {
            url: target.url.clone(),
            session_id: session.id.clone(),
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyRequirement;

    fn target(url: &str) -> ScrapeTarget {
        ScrapeTarget::new(url)
    }

    fn done_target(url: &str) -> ScrapeTarget {
        ScrapeTarget {
            done: true,
            ..ScrapeTarget::new(url)
        }
    }

    fn session(id: &str, proxy_type: ProxyType, proxy_id: &str, geo: Option<&str>) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            proxy_type: Some(proxy_type),
            proxy_id: Some(proxy_id.to_string()),
            proxy_geo: geo.map(str::to_string),
        }
    }

    fn config(
        domain: &str,
        strategy: ProxyStrategy,
        geo: Option<&str>,
        session_limit: usize,
    ) -> SiteConfig {
        SiteConfig {
            domain: domain.to_string(),
            start_pages: Vec::new(),
            proxy: Some(ProxyRequirement {
                strategy,
                geo: geo.map(str::to_string),
                session_limit,
                cooldown_minutes: 30,
                failure_threshold: 3,
            }),
            extractor_id: "selector".to_string(),
            blocked_proxy_ids: Default::default(),
        }
    }

    #[test]
    fn domain_strips_www_and_lowercases() {
        assert_eq!(
            domain_for_url("https://www.Shop.Example/catalog"),
            Some("shop.example".to_string())
        );
        assert_eq!(
            domain_for_url("https://shop.example:8443/x"),
            Some("shop.example".to_string())
        );
        assert_eq!(domain_for_url("shop.example/x"), Some("shop.example".to_string()));
    }

    #[test]
    fn empty_sessions_yield_empty_output() {
        let targets = vec![target("https://a.com/1"), target("https://a.com/2")];
        assert!(distribute(&targets, &[], &[]).is_empty());
    }

    #[test]
    fn done_targets_are_filtered() {
        let targets = vec![
            done_target("u1"),
            target("u2"),
            done_target("u3"),
            target("u4"),
            target("u5"),
        ];
        let sessions = vec![
            SessionInfo::direct("s1"),
            SessionInfo::direct("s2"),
            SessionInfo::direct("s3"),
        ];
        let out = distribute(&targets, &sessions, &[]);
        assert_eq!(
            out,
            vec![
                Assignment { url: "u2".into(), session_id: "s1".into() },
                Assignment { url: "u4".into(), session_id: "s2".into() },
                Assignment { url: "u5".into(), session_id: "s3".into() },
            ]
        );
    }

    #[test]
    fn geo_filter_excludes_wrong_country() {
        let sessions = vec![
            session("s1", ProxyType::Datacenter, "proxy-dc-1", Some("US")),
            session("s2", ProxyType::Datacenter, "proxy-dc-2", Some("UK")),
        ];
        let configs = vec![config("uk.com", ProxyStrategy::Datacenter, Some("UK"), 3)];
        let targets = vec![target("https://uk.com/a"), target("https://uk.com/b")];
        let out = distribute(&targets, &sessions, &configs);
        assert_eq!(
            out,
            vec![Assignment { url: "https://uk.com/a".into(), session_id: "s2".into() }]
        );
    }

    #[test]
    fn blocked_proxy_session_is_skipped() {
        let sessions = vec![
            session("s1", ProxyType::Datacenter, "proxy-dc-1", Some("US")),
            session("s2", ProxyType::Datacenter, "proxy-dc-2", Some("US")),
        ];
        let mut cfg = config("shop.com", ProxyStrategy::Datacenter, Some("US"), 3);
        cfg.blocked_proxy_ids.insert("proxy-dc-1".to_string());
        let targets = vec![target("https://shop.com/t1"), target("https://shop.com/t2")];
        let out = distribute(&targets, &sessions, &[cfg]);
        assert_eq!(
            out,
            vec![Assignment { url: "https://shop.com/t1".into(), session_id: "s2".into() }]
        );
    }

    #[test]
    fn blocklist_is_inert_without_a_proxy_requirement() {
        let mut cfg = config("shop.com", ProxyStrategy::Datacenter, None, 3);
        cfg.proxy = None;
        cfg.blocked_proxy_ids.insert("proxy-dc-1".to_string());
        let session = session("s1", ProxyType::Datacenter, "proxy-dc-1", None);
        assert!(session_matches(&session, Some(&cfg)));
    }

    #[test]
    fn per_site_limit_caps_assignments() {
        let sessions: Vec<SessionInfo> = (0..10)
            .map(|i| session(&format!("s{i}"), ProxyType::Datacenter, &format!("p{i}"), Some("US")))
            .collect();
        let configs = vec![config("shop.com", ProxyStrategy::Datacenter, Some("US"), 3)];
        let targets: Vec<ScrapeTarget> = (0..5)
            .map(|i| target(&format!("https://shop.com/{i}")))
            .collect();
        assert_eq!(distribute(&targets, &sessions, &configs).len(), 3);
    }

    #[test]
    fn session_limit_defaults_to_one_without_proxy_requirement() {
        let mut cfg = config("shop.com", ProxyStrategy::Datacenter, None, 3);
        cfg.proxy = None;
        let sessions = vec![SessionInfo::direct("s1"), SessionInfo::direct("s2")];
        let targets = vec![target("https://shop.com/1"), target("https://shop.com/2")];
        assert_eq!(distribute(&targets, &sessions, &[cfg]).len(), 1);
    }

    #[test]
    fn direct_strategy_rejects_proxied_sessions() {
        let sessions = vec![
            session("s1", ProxyType::Residential, "res-1", None),
            SessionInfo::direct("s2"),
        ];
        let configs = vec![config("plain.com", ProxyStrategy::None, None, 2)];
        let targets = vec![target("https://plain.com/1")];
        let out = distribute(&targets, &sessions, &configs);
        assert_eq!(out[0].session_id, "s2");
    }

    #[test]
    fn datacenter_to_residential_accepts_both() {
        let configs = vec![config("shop.com", ProxyStrategy::DatacenterToResidential, None, 2)];
        let sessions = vec![
            session("s1", ProxyType::Residential, "res-1", None),
            session("s2", ProxyType::Datacenter, "dc-1", None),
        ];
        let targets = vec![target("https://shop.com/1"), target("https://shop.com/2")];
        assert_eq!(distribute(&targets, &sessions, &configs).len(), 2);
    }

    #[test]
    fn duplicate_urls_are_emitted_once() {
        let sessions = vec![SessionInfo::direct("s1"), SessionInfo::direct("s2")];
        let targets = vec![target("https://a.com/1"), target("https://a.com/1")];
        let out = distribute(&targets, &sessions, &[]);
        assert_eq!(out.len(), 1);
    }
}
