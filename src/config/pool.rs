//! Proxy pool loading and selection
//!
//! The pool is a static JSON file loaded once at startup and cached
//! in-process. Besides the proxies themselves it may carry per-domain
//! strategy overrides that take precedence over what the external store
//! declares for a site.

use rand::prelude::IndexedRandom;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use super::types::{Proxy, ProxyRequirement, ProxyType};
use crate::error::{Result, ScrapeError};

/// On-disk shape of the proxy pool file
#[derive(Debug, Deserialize)]
pub struct ProxyPoolFile {
    pub proxies: Vec<Proxy>,
    /// Proxy id used when a strategy accepts several candidates and one of
    /// them is the configured default
    #[serde(default)]
    pub default: Option<String>,
    /// Per-domain strategy overrides, keyed by bare domain
    #[serde(default)]
    pub strategies: HashMap<String, ProxyRequirement>,
}

/// In-process proxy pool, loaded once and shared
#[derive(Debug)]
pub struct ProxyPool {
    proxies: Vec<Proxy>,
    by_id: HashMap<String, usize>,
    default_id: Option<String>,
    strategies: HashMap<String, ProxyRequirement>,
}

impl ProxyPool {
    /// Load the pool from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: ProxyPoolFile = serde_json::from_str(&raw)?;
        let pool = Self::from_file(file)?;
        info!(
            proxies = pool.proxies.len(),
            overrides = pool.strategies.len(),
            "loaded proxy pool from {}",
            path.display()
        );
        Ok(pool)
    }

    /// Build a pool from an already-parsed file
    pub fn from_file(file: ProxyPoolFile) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(file.proxies.len());
        for (idx, proxy) in file.proxies.iter().enumerate() {
            if by_id.insert(proxy.id.clone(), idx).is_some() {
                return Err(ScrapeError::Config(format!(
                    "duplicate proxy id '{}' in pool",
                    proxy.id
                )));
            }
        }
        if let Some(default) = &file.default {
            if !by_id.contains_key(default) {
                return Err(ScrapeError::Config(format!(
                    "default proxy '{default}' is not in the pool"
                )));
            }
        }
        Ok(Self {
            proxies: file.proxies,
            by_id,
            default_id: file.default,
            strategies: file.strategies,
        })
    }

    /// Empty pool for invocations that run everything direct
    #[must_use]
    pub fn empty() -> Self {
        Self {
            proxies: Vec::new(),
            by_id: HashMap::new(),
            default_id: None,
            strategies: HashMap::new(),
        }
    }

    /// Look up a proxy by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Proxy> {
        self.by_id.get(id).map(|&idx| &self.proxies[idx])
    }

    /// Per-domain strategy override from the pool file, if any
    #[must_use]
    pub fn requirement_for(&self, domain: &str) -> Option<&ProxyRequirement> {
        self.strategies.get(domain)
    }

    /// Pick a proxy satisfying `requirement`, skipping blocked ids
    ///
    /// Candidate types are tried in the strategy's preference order (this is
    /// where datacenter-to-residential falls back). Within one type the
    /// configured default wins when eligible, otherwise a random candidate is
    /// taken to spread sessions across the pool. Returns `Ok(None)` for the
    /// direct strategy and an error when a proxying strategy has no
    /// candidate left.
    pub fn select(
        &self,
        domain: &str,
        requirement: &ProxyRequirement,
        blocked: &std::collections::HashSet<String>,
    ) -> Result<Option<Proxy>> {
        for kind in requirement.acceptable_types() {
            if *kind == ProxyType::None {
                return Ok(None);
            }
            let candidates: Vec<&Proxy> = self
                .proxies
                .iter()
                .filter(|p| p.kind == *kind)
                .filter(|p| !blocked.contains(&p.id))
                .filter(|p| match (&requirement.geo, &p.geo) {
                    (Some(want), Some(have)) => want.eq_ignore_ascii_case(have),
                    (Some(_), None) => false,
                    (None, _) => true,
                })
                .collect();

            if let Some(default) = &self.default_id {
                if let Some(hit) = candidates.iter().find(|p| &p.id == default) {
                    debug!(domain, proxy = %hit.id, "selected default proxy");
                    return Ok(Some((*hit).clone()));
                }
            }
            if let Some(hit) = candidates.choose(&mut rand::rng()) {
                debug!(domain, proxy = %hit.id, "selected proxy");
                return Ok(Some((*hit).clone()));
            }
        }
        Err(ScrapeError::NoSuitableProxy {
            domain: domain.to_string(),
            reason: format!(
                "pool has no unblocked {:?} proxy{}",
                requirement.acceptable_types(),
                requirement
                    .geo
                    .as_deref()
                    .map(|g| format!(" in geo {g}"))
                    .unwrap_or_default()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ProxyStrategy;
    use std::collections::HashSet;

    fn pool() -> ProxyPool {
        let file: ProxyPoolFile = serde_json::from_str(
            r#"{
                "proxies": [
                    {"id": "dc-us", "type": "datacenter", "geo": "US", "url": "http://dc-us:8080"},
                    {"id": "dc-uk", "type": "datacenter", "geo": "UK", "url": "http://dc-uk:8080"},
                    {"id": "res-1", "type": "residential", "url": "http://res-1:9000",
                     "credentials": {"username": "u", "password": "p"}}
                ],
                "default": "dc-us",
                "strategies": {
                    "shop.example": {"strategy": "residential-stable", "session_limit": 2}
                }
            }"#,
        )
        .expect("pool file should parse");
        ProxyPool::from_file(file).expect("pool should build")
    }

    fn requirement(strategy: ProxyStrategy, geo: Option<&str>) -> ProxyRequirement {
        ProxyRequirement {
            strategy,
            geo: geo.map(str::to_string),
            session_limit: 1,
            cooldown_minutes: 30,
            failure_threshold: 3,
        }
    }

    #[test]
    fn selects_geo_matching_datacenter() {
        let pool = pool();
        let req = requirement(ProxyStrategy::Datacenter, Some("UK"));
        let picked = pool
            .select("uk.example", &req, &HashSet::new())
            .expect("selection should succeed")
            .expect("a proxy should be chosen");
        assert_eq!(picked.id, "dc-uk");
    }

    #[test]
    fn blocked_proxy_is_skipped() {
        let pool = pool();
        let req = requirement(ProxyStrategy::Datacenter, Some("US"));
        let blocked: HashSet<String> = ["dc-us".to_string()].into_iter().collect();
        assert!(pool.select("shop.example", &req, &blocked).is_err());
    }

    #[test]
    fn datacenter_to_residential_falls_back() {
        let pool = pool();
        let req = requirement(ProxyStrategy::DatacenterToResidential, None);
        let blocked: HashSet<String> =
            ["dc-us".to_string(), "dc-uk".to_string()].into_iter().collect();
        let picked = pool
            .select("shop.example", &req, &blocked)
            .expect("fallback should succeed")
            .expect("a proxy should be chosen");
        assert_eq!(picked.id, "res-1");
    }

    #[test]
    fn direct_strategy_yields_no_proxy() {
        let pool = pool();
        let req = requirement(ProxyStrategy::None, None);
        assert!(pool
            .select("shop.example", &req, &HashSet::new())
            .expect("direct selection should succeed")
            .is_none());
    }

    #[test]
    fn strategy_override_is_exposed() {
        let pool = pool();
        let req = pool.requirement_for("shop.example").expect("override should exist");
        assert_eq!(req.strategy, ProxyStrategy::ResidentialStable);
        assert_eq!(req.session_limit, 2);
    }
}
