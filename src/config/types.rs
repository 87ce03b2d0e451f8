//! Site and proxy configuration types
//!
//! `SiteConfig` is the distributor's and engines' view of one site; it is
//! immutable for the duration of an invocation. Proxy types describe the pool
//! loaded from disk at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How a site wants its sessions proxied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyStrategy {
    /// Direct connection, no proxy
    None,
    /// Datacenter proxy required
    Datacenter,
    /// Residential proxy with a sticky session
    ResidentialStable,
    /// Residential proxy from a rotating pool
    ResidentialRotating,
    /// Prefer datacenter, fall back to residential
    DatacenterToResidential,
}

/// Concrete proxy flavor, as carried by pool entries and live sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Datacenter,
    Residential,
    None,
}

/// Per-site proxy constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequirement {
    pub strategy: ProxyStrategy,
    /// ISO-2 country code the exit node must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<String>,
    /// Max concurrent sessions targeting this site
    #[serde(default = "default_session_limit")]
    pub session_limit: usize,
    /// Minutes a blocked proxy stays excluded for this site
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    /// Failures before a datacenter proxy is considered burned for this site
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_session_limit() -> usize {
    1
}

fn default_cooldown_minutes() -> i64 {
    30
}

fn default_failure_threshold() -> u32 {
    3
}

impl ProxyRequirement {
    /// Requirement used when `--no-proxy` overrides a site's declared strategy
    #[must_use]
    pub fn direct(session_limit: usize) -> Self {
        Self {
            strategy: ProxyStrategy::None,
            geo: None,
            session_limit,
            cooldown_minutes: default_cooldown_minutes(),
            failure_threshold: default_failure_threshold(),
        }
    }

    /// Proxy types acceptable under this strategy, in preference order
    #[must_use]
    pub fn acceptable_types(&self) -> &'static [ProxyType] {
        match self.strategy {
            ProxyStrategy::None => &[ProxyType::None],
            ProxyStrategy::Datacenter => &[ProxyType::Datacenter],
            ProxyStrategy::ResidentialStable | ProxyStrategy::ResidentialRotating => {
                &[ProxyType::Residential]
            }
            ProxyStrategy::DatacenterToResidential => {
                &[ProxyType::Datacenter, ProxyType::Residential]
            }
        }
    }
}

/// Username/password pair for an authenticating proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

/// One entry of the proxy pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProxyType,
    /// ISO-2 country code of the exit node, when pinned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<String>,
    /// `scheme://host:port` the browser is pointed at
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ProxyCredentials>,
}

/// Per-site scraping configuration
///
/// Built by the site manager from the external store's site metadata merged
/// with any per-domain strategy override in the proxy pool file. The
/// `blocked_proxy_ids` set is a snapshot of the site's live blocklist taken
/// just before distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub domain: String,
    /// Seed URLs pagination starts from, in configured order
    pub start_pages: Vec<String>,
    /// Proxy constraints; `None` means any session may serve this site
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyRequirement>,
    /// Registry id of the extractor that understands this site's pages
    pub extractor_id: String,
    /// Proxy ids currently excluded for this site
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub blocked_proxy_ids: HashSet<String>,
}

impl SiteConfig {
    /// Per-site concurrent-session cap, defaulting to 1 when no proxy
    /// requirement is declared
    #[must_use]
    pub fn session_limit(&self) -> usize {
        self.proxy.as_ref().map_or(1, |p| p.session_limit)
    }
}
