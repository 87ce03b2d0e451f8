//! Browser providers
//!
//! Sessions are backed either by a locally launched Chromium process or by a
//! remote browser service reached over its CDP websocket. Both paths yield
//! the same `LaunchedBrowser`, so the session manager never branches on the
//! provider beyond cleanup.

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use crate::config::Proxy;

/// Provider-specific cleanup payload for one launched browser
#[derive(Debug)]
pub enum ProviderPayload {
    /// Locally spawned process with its throwaway profile directory
    Local { user_data_dir: PathBuf },
    /// Connection to a browser service; nothing on local disk
    Remote,
}

/// A live browser plus everything needed to drive and tear it down
pub struct LaunchedBrowser {
    pub browser: Browser,
    /// Task draining the CDP connection; flips `disconnected` when the
    /// stream ends
    pub handler: JoinHandle<()>,
    pub payload: ProviderPayload,
    /// Identifier assigned by the provider (the DevTools browser target id)
    pub provider_id: String,
    /// Set when the CDP connection drops without a requested close
    pub disconnected: Arc<AtomicBool>,
}

/// Find a Chrome/Chromium executable on this machine
pub async fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!("CHROMIUM_PATH points to a non-existent file: {}", path.display());
    }

    let paths = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        vec![
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/usr/local/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };
    for path in paths {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("found browser at {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !found.is_empty() {
                        info!("found browser via 'which': {found}");
                        return Ok(PathBuf::from(found));
                    }
                }
            }
        }
    }

    warn!("no Chrome/Chromium executable found, falling back to managed download");
    Err(anyhow::anyhow!("Chrome/Chromium executable not found"))
}

/// Download a managed Chromium into the cache directory
pub async fn download_managed_browser() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("shopcrawl")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir).context("failed to create browser cache directory")?;

    info!("downloading managed Chromium to {}", cache_dir.display());
    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("failed to build fetcher options")?,
    );
    let revision = fetcher.fetch().await.context("failed to fetch browser")?;
    Ok(revision.executable_path)
}

/// Derive the provider id from the DevTools websocket address
///
/// The address ends in `/devtools/browser/<uuid>`; the uuid is what the
/// provider knows the browser as. Falls back to a fresh uuid when the
/// address has an unexpected shape.
fn provider_id_from_ws(ws_address: &str) -> String {
    ws_address
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Spawn the task that drives a browser's CDP connection
///
/// Benign deserialization noise from unrecognized CDP events is suppressed
/// the same way the connection handler always has to; when the stream ends
/// without a requested close the `disconnected` flag is raised so the owning
/// session can be invalidated.
fn spawn_handler(
    mut handler: chromiumoxide::Handler,
    disconnected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) -> JoinHandle<()> {
    task::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                let msg = e.to_string();
                let benign = msg.contains("data did not match any variant of untagged enum Message")
                    || msg.contains("Failed to deserialize WS response");
                if benign {
                    trace!("suppressed benign CDP serialization error: {msg}");
                } else {
                    error!("browser handler error: {msg}");
                }
            }
        }
        if !closing.load(Ordering::SeqCst) {
            disconnected.store(true, Ordering::SeqCst);
            warn!("browser CDP connection ended unexpectedly");
        }
    })
}

/// Launch a Chromium process for one session
///
/// The proxy, when present, is wired in with `--proxy-server`; credentials
/// are answered later through Fetch auth events by the request cache. Each
/// session gets a throwaway profile directory so concurrent sessions never
/// contend on a profile lock.
pub async fn launch_local(
    proxy: Option<&Proxy>,
    headed: bool,
    closing: Arc<AtomicBool>,
) -> Result<LaunchedBrowser> {
    let executable = match find_browser_executable().await {
        Ok(path) => path,
        Err(_) => download_managed_browser().await?,
    };

    let user_data_dir =
        std::env::temp_dir().join(format!("shopcrawl_session_{}", Uuid::new_v4().simple()));
    std::fs::create_dir_all(&user_data_dir).context("failed to create user data directory")?;

    let mut builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1440, 900)
        .user_data_dir(user_data_dir.clone())
        .chrome_executable(executable);

    builder = if headed {
        builder.with_head()
    } else {
        builder.headless_mode(HeadlessMode::default())
    };

    builder = builder
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-infobars")
        .arg("--disable-notifications")
        .arg("--disable-background-networking")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-breakpad")
        .arg("--disable-hang-monitor")
        .arg("--disable-ipc-flooding-protection")
        .arg("--disable-popup-blocking")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--no-sandbox")
        .arg("--metrics-recording-only")
        .arg("--password-store=basic")
        .arg("--mute-audio");

    if let Some(proxy) = proxy {
        builder = builder.arg(format!("--proxy-server={}", proxy.url));
    }

    let config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

    let (browser, handler) = Browser::launch(config)
        .await
        .context("failed to launch browser")?;

    let provider_id = format!("local-{}", provider_id_from_ws(browser.websocket_address()));
    let disconnected = Arc::new(AtomicBool::new(false));
    let handler = spawn_handler(handler, Arc::clone(&disconnected), closing);

    info!(session = %provider_id, proxy = ?proxy.map(|p| &p.id), "launched local browser");
    Ok(LaunchedBrowser {
        browser,
        handler,
        payload: ProviderPayload::Local { user_data_dir },
        provider_id,
        disconnected,
    })
}

/// Attach to a remote browser service for one session
///
/// The proxy, geo, and session-timeout hint travel as query parameters on
/// the service's websocket endpoint; the service owns enforcement of the
/// timeout, we only forward it.
pub async fn connect_remote(
    endpoint: &str,
    proxy: Option<&Proxy>,
    session_timeout_secs: Option<u64>,
    closing: Arc<AtomicBool>,
) -> Result<LaunchedBrowser> {
    let mut url = url::Url::parse(endpoint).context("invalid remote browser endpoint")?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(proxy) = proxy {
            query.append_pair("proxy", &proxy.url);
            if let Some(creds) = &proxy.credentials {
                query.append_pair("proxyUsername", &creds.username);
                query.append_pair("proxyPassword", &creds.password);
            }
            if let Some(geo) = &proxy.geo {
                query.append_pair("proxyCountry", geo);
            }
        }
        if let Some(timeout) = session_timeout_secs {
            query.append_pair("timeout", &(timeout * 1000).to_string());
        }
    }

    let (browser, handler) = Browser::connect(url.as_str())
        .await
        .context("failed to connect to remote browser service")?;

    let provider_id = format!("remote-{}", provider_id_from_ws(browser.websocket_address()));
    let disconnected = Arc::new(AtomicBool::new(false));
    let handler = spawn_handler(handler, Arc::clone(&disconnected), closing);

    info!(session = %provider_id, "connected to remote browser");
    Ok(LaunchedBrowser {
        browser,
        handler,
        payload: ProviderPayload::Remote,
        provider_id,
        disconnected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_uses_last_ws_segment() {
        let id = provider_id_from_ws("ws://127.0.0.1:9222/devtools/browser/abc-123");
        assert_eq!(id, "abc-123");
    }

    #[test]
    fn provider_id_falls_back_on_garbage() {
        let id = provider_id_from_ws("");
        assert!(!id.is_empty());
    }
}
