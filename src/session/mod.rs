//! Session lifecycle management
//!
//! A session is one live browser (local process or remote connection) plus
//! the proxy identity the distributor matches against. Sessions are created
//! in batches so the global cap check is race-free, reused across batches,
//! and destroyed when in excess of current needs, invalidated by a browser
//! crash, or at engine shutdown.

// Sub-modules
pub mod provider;

// Re-exports for public API
pub use provider::{connect_remote, download_managed_browser, find_browser_executable, launch_local};

use chromiumoxide::browser::Browser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Proxy, ProviderKind, ProxyType};
use crate::distributor::SessionInfo;
use provider::{LaunchedBrowser, ProviderPayload};

/// Default global cap on concurrently live sessions
pub const DEFAULT_SESSION_CAP: usize = 5;

/// Parameters for one session in a batch create
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Site the session is being created for (logging only; sessions are
    /// matched by proxy identity, not domain)
    pub domain: String,
    /// Concrete proxy the browser egresses through, `None` for direct
    pub proxy: Option<Proxy>,
    pub provider: ProviderKind,
    pub headless: bool,
    /// Forwarded to the remote provider, never enforced locally
    pub session_timeout_secs: Option<u64>,
}

/// One live browser session
pub struct Session {
    info: SessionInfo,
    browser: Arc<Browser>,
    handler: parking_lot::Mutex<Option<JoinHandle<()>>>,
    payload: ProviderPayload,
    proxy: Option<Proxy>,
    /// Raised by the connection handler on unexpected disconnect, or by the
    /// engines when a page call fails with a browser-closed error
    invalidated: Arc<AtomicBool>,
    /// Set while a graceful close is in flight so the handler does not
    /// misreport it as a crash
    closing: Arc<AtomicBool>,
    /// Scratch flag the engines reset at the top of every batch
    in_use: AtomicBool,
}

impl Session {
    fn from_launched(launched: LaunchedBrowser, proxy: Option<Proxy>, closing: Arc<AtomicBool>) -> Self {
        let info = SessionInfo {
            id: launched.provider_id,
            proxy_type: Some(proxy.as_ref().map_or(ProxyType::None, |p| p.kind)),
            proxy_id: proxy.as_ref().map(|p| p.id.clone()),
            proxy_geo: proxy.as_ref().and_then(|p| p.geo.clone()),
        };
        Self {
            info,
            browser: Arc::new(launched.browser),
            handler: parking_lot::Mutex::new(Some(launched.handler)),
            payload: launched.payload,
            proxy,
            invalidated: launched.disconnected,
            closing,
            in_use: AtomicBool::new(false),
        }
    }

    /// Stable session id, derived from the provider's browser identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// The distributor's view of this session
    #[must_use]
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Shared handle to the live browser
    #[must_use]
    pub fn browser(&self) -> Arc<Browser> {
        Arc::clone(&self.browser)
    }

    /// Proxy this session egresses through
    #[must_use]
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    /// Mark the session unusable; it will be reaped at the next batch boundary
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub fn set_in_use(&self, value: bool) {
        self.in_use.store(value, Ordering::SeqCst);
    }

    #[must_use]
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Close the browser and release provider resources
    ///
    /// Graceful close needs exclusive ownership of the browser; when other
    /// clones of the handle are still around (a work unit racing shutdown)
    /// the close is skipped and the handler abort plus drop cleanup have to
    /// suffice, exactly like a pool reaping a browser with outstanding
    /// references.
    async fn shutdown(self) {
        self.closing.store(true, Ordering::SeqCst);

        match Arc::try_unwrap(self.browser) {
            Ok(mut browser) => {
                if let Err(e) = browser.close().await {
                    warn!(session = %self.info.id, "browser close failed: {e}");
                }
                if matches!(self.payload, ProviderPayload::Local { .. }) {
                    let _ = browser.wait().await;
                }
            }
            Err(arc) => {
                warn!(
                    session = %self.info.id,
                    refs = Arc::strong_count(&arc),
                    "browser still referenced, skipping graceful close"
                );
            }
        }

        if let Some(handler) = self.handler.lock().take() {
            handler.abort();
        }

        if let ProviderPayload::Local { user_data_dir } = &self.payload {
            if let Err(e) = std::fs::remove_dir_all(user_data_dir) {
                warn!(
                    "failed to remove profile directory {}: {e}",
                    user_data_dir.display()
                );
            }
        }
        debug!(session = %self.info.id, "session shut down");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.info.id)
            .field("proxy", &self.info.proxy_id)
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

/// How many of `requested` sessions a batch create may actually make
///
/// Counting live and in-flight creations together under one lock is what
/// keeps the global cap race-free.
fn grant(requested: usize, live: usize, reserved: usize, cap: usize) -> usize {
    requested.min(cap.saturating_sub(live + reserved))
}

#[derive(Default)]
struct ManagerState {
    /// Live sessions in creation order
    table: Vec<Arc<Session>>,
    /// Creations granted but not yet inserted
    reserved: usize,
}

/// Owner of every live session
///
/// All bookkeeping sits behind one async mutex; provider I/O (launching and
/// closing browsers) always happens outside it.
pub struct SessionManager {
    cap: usize,
    remote_endpoint: Option<String>,
    state: tokio::sync::Mutex<ManagerState>,
}

impl SessionManager {
    #[must_use]
    pub fn new(cap: usize, remote_endpoint: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            cap,
            remote_endpoint,
            state: tokio::sync::Mutex::new(ManagerState::default()),
        })
    }

    /// Create up to `cap - active` sessions from the batch of requests
    ///
    /// Partial success is legal: requests over the cap are dropped, and a
    /// request whose provider call fails is logged and skipped. The
    /// successful subset is returned in request order.
    pub async fn create_sessions(&self, requests: Vec<SessionRequest>) -> Vec<Arc<Session>> {
        let granted = {
            let mut state = self.state.lock().await;
            let granted = grant(requests.len(), state.table.len(), state.reserved, self.cap);
            state.reserved += granted;
            granted
        };
        if granted < requests.len() {
            warn!(
                requested = requests.len(),
                granted, cap = self.cap,
                "session cap reached, dropping excess create requests"
            );
        }
        if granted == 0 {
            return Vec::new();
        }

        let launches = requests.into_iter().take(granted).map(|request| async move {
            let closing = Arc::new(AtomicBool::new(false));
            let launched = match request.provider {
                ProviderKind::Local => {
                    launch_local(request.proxy.as_ref(), !request.headless, Arc::clone(&closing))
                        .await
                }
                ProviderKind::Remote => match &self.remote_endpoint {
                    Some(endpoint) => {
                        connect_remote(
                            endpoint,
                            request.proxy.as_ref(),
                            request.session_timeout_secs,
                            Arc::clone(&closing),
                        )
                        .await
                    }
                    None => Err(anyhow::anyhow!("no remote browser endpoint configured")),
                },
            };
            match launched {
                Ok(launched) => Some(Arc::new(Session::from_launched(
                    launched,
                    request.proxy,
                    closing,
                ))),
                Err(e) => {
                    warn!(domain = %request.domain, "session create failed: {e:#}");
                    None
                }
            }
        });
        let created: Vec<Arc<Session>> = futures::future::join_all(launches)
            .await
            .into_iter()
            .flatten()
            .collect();

        let mut state = self.state.lock().await;
        state.reserved -= granted;
        for session in &created {
            state.table.push(Arc::clone(session));
        }
        info!(created = created.len(), live = state.table.len(), "session batch created");
        created
    }

    /// Snapshot of live sessions in creation order
    pub async fn active(&self) -> Vec<Arc<Session>> {
        self.state.lock().await.table.clone()
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.table.len()
    }

    /// Destroy one session by id; returns whether it was tracked
    ///
    /// The handle is removed from tracking even if the provider-side close
    /// fails.
    pub async fn destroy(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            match state.table.iter().position(|s| s.id() == id) {
                Some(idx) => Some(state.table.remove(idx)),
                None => None,
            }
        };
        match removed {
            Some(session) => {
                Self::shutdown_arc(session).await;
                true
            }
            None => false,
        }
    }

    /// Destroy every live session
    pub async fn destroy_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.table)
        };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "destroying all sessions");
        futures::future::join_all(drained.into_iter().map(Self::shutdown_arc)).await;
    }

    /// Reap sessions whose browsers crashed or disconnected
    pub async fn destroy_invalidated(&self) {
        let reaped: Vec<Arc<Session>> = {
            let mut state = self.state.lock().await;
            let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.table)
                .into_iter()
                .partition(|s| s.is_invalidated());
            state.table = live;
            dead
        };
        for session in reaped {
            debug!(session = %session.id(), "reaping invalidated session");
            Self::shutdown_arc(session).await;
        }
    }

    async fn shutdown_arc(session: Arc<Session>) {
        match Arc::try_unwrap(session) {
            Ok(session) => session.shutdown().await,
            Err(arc) => {
                warn!(
                    session = %arc.id(),
                    "session still referenced at destroy, aborting handler only"
                );
                arc.closing.store(true, Ordering::SeqCst);
                if let Some(handler) = arc.handler.lock().take() {
                    handler.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_respects_cap_and_reservations() {
        assert_eq!(grant(3, 0, 0, 5), 3);
        assert_eq!(grant(10, 2, 0, 5), 3);
        assert_eq!(grant(10, 2, 2, 5), 1);
        assert_eq!(grant(10, 5, 0, 5), 0);
        assert_eq!(grant(10, 4, 3, 5), 0);
        assert_eq!(grant(0, 0, 0, 5), 0);
    }
}
