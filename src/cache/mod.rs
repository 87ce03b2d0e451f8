//! Shared request cache with insertion-order eviction and TTL
//!
//! One `RequestCache` is shared by every session of an engine invocation and
//! interposed on every page's network traffic through the CDP Fetch domain.
//! Identical sub-resource fetches across concurrent page loads are served
//! from memory; image requests can be aborted outright.
//!
//! Policy: GET only, never requests carrying `Authorization` or `Cookie`
//! headers, only 2xx responses. The key is the exact request URL. Entries
//! expire after the TTL (checked lazily on read) and the oldest-inserted
//! entry is evicted while the cache is over its byte budget.

use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueResponseParams, ContinueWithAuthParams, EnableParams, EventAuthRequired,
    EventRequestPaused, FailRequestParams, FulfillRequestParams, GetResponseBodyParams,
    HeaderEntry, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::ProxyCredentials;

/// Tuning for one invocation's shared cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size_bytes: u64,
    pub ttl: Duration,
    pub block_images: bool,
    /// When false the interceptor still blocks images (if asked) but never
    /// stores or serves bodies
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 250 * 1024 * 1024,
            ttl: Duration::from_secs(300),
            block_images: true,
            enabled: true,
        }
    }
}

/// One cached response
#[derive(Debug, Clone)]
struct CacheEntry {
    body: Vec<u8>,
    headers: Vec<(String, String)>,
    status: i64,
    inserted_at: Instant,
    size_bytes: u64,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<String, CacheEntry>,
    /// Keys in insertion order; front is the eviction candidate
    order: VecDeque<String>,
    size_bytes: u64,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.map.remove(key)?;
        self.size_bytes -= entry.size_bytes;
        self.order.retain(|k| k != key);
        Some(entry)
    }
}

/// Snapshot of cache effectiveness counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size_bytes: u64,
    pub item_count: usize,
    pub bytes_saved: u64,
    pub bytes_downloaded: u64,
}

/// Shared in-memory response cache
pub struct RequestCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_saved: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl RequestCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size_bytes: inner.size_bytes,
            item_count: inner.map.len(),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    /// Drop every entry; counters are kept
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
        inner.size_bytes = 0;
    }

    /// Look up a body for the exact URL, expiring stale entries on the way
    fn lookup(&self, url: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let expired = match inner.map.get(url) {
            Some(entry) => entry.inserted_at.elapsed() > self.config.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            inner.remove(url);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let entry = inner.map.get(url).cloned();
        if let Some(entry) = &entry {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.bytes_saved.fetch_add(entry.size_bytes, Ordering::Relaxed);
        }
        entry
    }

    /// Store a 2xx response, evicting oldest-inserted entries while over
    /// budget
    fn insert(&self, url: &str, status: i64, headers: Vec<(String, String)>, body: Vec<u8>) {
        let size_bytes = body.len() as u64;
        self.bytes_downloaded.fetch_add(size_bytes, Ordering::Relaxed);
        if size_bytes > self.config.max_size_bytes {
            trace!(url, size_bytes, "response larger than cache budget, not storing");
            return;
        }
        let mut inner = self.inner.lock();
        if inner.map.contains_key(url) {
            inner.remove(url);
        }
        inner.map.insert(
            url.to_string(),
            CacheEntry {
                body,
                headers,
                status,
                inserted_at: Instant::now(),
                size_bytes,
            },
        );
        inner.order.push_back(url.to_string());
        inner.size_bytes += size_bytes;

        while inner.size_bytes > self.config.max_size_bytes {
            let Some(oldest) = inner.order.front().cloned() else { break };
            trace!(url = %oldest, "evicting oldest cache entry");
            inner.remove(&oldest);
        }
    }

    /// Intercept every network request of `page` through this cache
    ///
    /// Returns the handle of the interception task; it ends on its own when
    /// the page goes away, and aborting it detaches the cache early. When
    /// the session egresses through an authenticating proxy the credentials
    /// are answered here too, since the Fetch domain can only be enabled
    /// once per target.
    pub async fn attach(
        self: &Arc<Self>,
        page: &Page,
        proxy_credentials: Option<ProxyCredentials>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let enable = EnableParams::builder()
            .pattern(
                RequestPattern::builder()
                    .url_pattern("*")
                    .request_stage(RequestStage::Request)
                    .build(),
            )
            .pattern(
                RequestPattern::builder()
                    .url_pattern("*")
                    .request_stage(RequestStage::Response)
                    .build(),
            )
            .handle_auth_requests(proxy_credentials.is_some())
            .build();
        page.execute(enable).await?;

        let mut paused = page.event_listener::<EventRequestPaused>().await?;
        let mut auth = page.event_listener::<EventAuthRequired>().await?;

        let cache = Arc::clone(self);
        let page = page.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = paused.next() => {
                        let Some(event) = event else { break };
                        cache.on_request_paused(&page, &event).await;
                    }
                    event = auth.next() => {
                        let Some(event) = event else { break };
                        answer_auth(&page, &event, proxy_credentials.as_ref()).await;
                    }
                }
            }
            trace!("request interception ended");
        }))
    }

    async fn on_request_paused(&self, page: &Page, event: &EventRequestPaused) {
        if event.response_status_code.is_some() {
            self.on_response_stage(page, event).await;
        } else {
            self.on_request_stage(page, event).await;
        }
    }

    /// Request stage: abort images, serve hits, let everything else through
    async fn on_request_stage(&self, page: &Page, event: &EventRequestPaused) {
        let request_id = event.request_id.clone();

        if self.config.block_images && event.resource_type == ResourceType::Image {
            let fail = FailRequestParams::new(request_id, ErrorReason::BlockedByClient);
            if let Err(e) = page.execute(fail).await {
                trace!("failed to abort image request: {e}");
            }
            return;
        }

        if self.config.enabled && is_cacheable_request(event) {
            if let Some(entry) = self.lookup(&event.request.url) {
                debug!(url = %event.request.url, "cache hit");
                let mut fulfill = FulfillRequestParams::builder()
                    .request_id(request_id.clone())
                    .response_code(entry.status);
                for (name, value) in entry.headers {
                    fulfill = fulfill.response_header(HeaderEntry { name, value });
                }
                let encoded_body = {
                    use base64::Engine as _;
                    base64::engine::general_purpose::STANDARD.encode(&entry.body)
                };
                match fulfill.body(encoded_body).build() {
                    Ok(fulfill) => match page.execute(fulfill).await {
                        Ok(_) => return,
                        Err(e) => {
                            // Request may have vanished mid-flight; fall
                            // through so it is continued rather than left
                            // hanging.
                            trace!("failed to fulfill from cache: {e}");
                        }
                    },
                    Err(e) => warn!("failed to build fulfill params: {e}"),
                }
            }
        }

        if let Err(e) = page.execute(ContinueRequestParams::new(event.request_id.clone())).await {
            trace!("failed to continue request: {e}");
        }
    }

    /// Response stage: capture cacheable 2xx bodies, then release the
    /// response to the page
    async fn on_response_stage(&self, page: &Page, event: &EventRequestPaused) {
        let status = event.response_status_code.unwrap_or_default();
        let cacheable = self.config.enabled
            && is_cacheable_request(event)
            && (200..300).contains(&status)
            && !self.contains_fresh(&event.request.url);

        if cacheable {
            match page
                .execute(GetResponseBodyParams::new(event.request_id.clone()))
                .await
            {
                Ok(response) => {
                    let body = if response.result.base64_encoded {
                        use base64::Engine as _;
                        base64::engine::general_purpose::STANDARD
                            .decode(response.result.body.as_bytes())
                            .unwrap_or_default()
                    } else {
                        response.result.body.clone().into_bytes()
                    };
                    let headers = event
                        .response_headers
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .map(|h| (h.name.clone(), h.value.clone()))
                        .collect();
                    self.insert(&event.request.url, status, headers, body);
                }
                Err(e) => trace!(url = %event.request.url, "response body unavailable: {e}"),
            }
        }

        if let Err(e) = page
            .execute(ContinueResponseParams::new(event.request_id.clone()))
            .await
        {
            trace!("failed to continue response: {e}");
        }
    }

    fn contains_fresh(&self, url: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .map
            .get(url)
            .is_some_and(|e| e.inserted_at.elapsed() <= self.config.ttl)
    }
}

/// GET requests without credentials attached are fair game for the cache
fn is_cacheable_request(event: &EventRequestPaused) -> bool {
    if !event.request.method.eq_ignore_ascii_case("GET") {
        return false;
    }
    let Ok(headers) = serde_json::to_value(&event.request.headers) else {
        return false;
    };
    let Some(map) = headers.as_object() else {
        return true;
    };
    !map.keys()
        .any(|k| k.eq_ignore_ascii_case("authorization") || k.eq_ignore_ascii_case("cookie"))
}

/// Answer a proxy auth challenge with the session's credentials
async fn answer_auth(page: &Page, event: &EventAuthRequired, creds: Option<&ProxyCredentials>) {
    let response = match creds {
        Some(creds) => AuthChallengeResponse::builder()
            .response(AuthChallengeResponseResponse::ProvideCredentials)
            .username(creds.username.clone())
            .password(creds.password.clone())
            .build(),
        None => AuthChallengeResponse::builder()
            .response(AuthChallengeResponseResponse::Default)
            .build(),
    };
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            warn!("failed to build auth challenge response: {e}");
            return;
        }
    };
    let params = ContinueWithAuthParams::new(event.request_id.clone(), response);
    if let Err(e) = page.execute(params).await {
        warn!("failed to answer proxy auth challenge: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: u64, ttl: Duration) -> Arc<RequestCache> {
        RequestCache::new(CacheConfig {
            max_size_bytes: max_size,
            ttl,
            block_images: true,
            enabled: true,
        })
    }

    #[test]
    fn hit_after_insert_counts_saved_bytes() {
        let cache = cache(1024, Duration::from_secs(60));
        cache.insert("https://a.example/app.js", 200, vec![], vec![1, 2, 3]);
        let entry = cache.lookup("https://a.example/app.js").expect("entry should be cached");
        assert_eq!(entry.body, vec![1, 2, 3]);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.bytes_saved, 3);
        assert_eq!(stats.bytes_downloaded, 3);
    }

    #[test]
    fn size_budget_holds_after_every_insert() {
        let cache = cache(10, Duration::from_secs(60));
        for i in 0..20 {
            cache.insert(&format!("https://a.example/{i}"), 200, vec![], vec![0u8; 4]);
            assert!(cache.stats().size_bytes <= 10);
        }
        // 10-byte budget holds two 4-byte entries
        assert_eq!(cache.stats().item_count, 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn size_budget_is_an_invariant(
                bodies in proptest::collection::vec(0usize..64, 1..40),
                budget in 16u64..128,
            ) {
                let cache = RequestCache::new(CacheConfig {
                    max_size_bytes: budget,
                    ttl: Duration::from_secs(60),
                    block_images: false,
                    enabled: true,
                });
                for (i, len) in bodies.into_iter().enumerate() {
                    cache.insert(&format!("https://a.example/{i}"), 200, vec![], vec![0u8; len]);
                    prop_assert!(cache.stats().size_bytes <= budget);
                }
            }
        }
    }

    #[test]
    fn eviction_removes_oldest_inserted_first() {
        let cache = cache(12, Duration::from_secs(60));
        cache.insert("https://a.example/1", 200, vec![], vec![0u8; 4]);
        cache.insert("https://a.example/2", 200, vec![], vec![0u8; 4]);
        cache.insert("https://a.example/3", 200, vec![], vec![0u8; 4]);
        cache.insert("https://a.example/4", 200, vec![], vec![0u8; 4]);

        assert!(cache.lookup("https://a.example/1").is_none());
        assert!(cache.lookup("https://a.example/4").is_some());
    }

    #[test]
    fn stale_entries_miss_and_are_evicted() {
        let cache = cache(1024, Duration::from_millis(10));
        cache.insert("https://a.example/old", 200, vec![], vec![1]);
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.lookup("https://a.example/old").is_none());
        assert_eq!(cache.stats().item_count, 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn oversized_bodies_are_never_stored() {
        let cache = cache(8, Duration::from_secs(60));
        cache.insert("https://a.example/huge", 200, vec![], vec![0u8; 64]);
        assert_eq!(cache.stats().item_count, 0);
        assert_eq!(cache.stats().bytes_downloaded, 64);
    }

    #[test]
    fn ttl_refresh_happens_on_reinsert() {
        let cache = cache(1024, Duration::from_secs(60));
        cache.insert("https://a.example/x", 200, vec![], vec![1]);
        cache.insert("https://a.example/x", 200, vec![], vec![2, 3]);
        assert_eq!(cache.stats().item_count, 1);
        assert_eq!(cache.stats().size_bytes, 2);
    }

    #[test]
    fn clear_drops_entries_but_keeps_counters() {
        let cache = cache(1024, Duration::from_secs(60));
        cache.insert("https://a.example/x", 200, vec![], vec![1, 2]);
        cache.lookup("https://a.example/x");
        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.item_count, 0);
        assert_eq!(stats.size_bytes, 0);
        assert_eq!(stats.hits, 1);
    }
}
