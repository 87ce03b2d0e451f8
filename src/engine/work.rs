//! Page-level plumbing shared by both pipelines
//!
//! One unit of work owns one page on one session: open it, interpose the
//! shared cache, load the target URL under a wall-clock timeout, hand the
//! page to the extractor, and always tear the page down afterwards.

use anyhow::Context;
use chromiumoxide::Page;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::cache::RequestCache;
use crate::session::Session;

/// A page with its cache interceptor, torn down as a unit
pub(crate) struct WorkPage {
    pub page: Page,
    interceptor: JoinHandle<()>,
}

impl WorkPage {
    /// Open a fresh page on the session's browser with the cache attached
    pub(crate) async fn open(
        session: &Session,
        cache: &Arc<RequestCache>,
    ) -> anyhow::Result<Self> {
        let browser = session.browser();
        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to open page")?;
        let credentials = session
            .proxy()
            .and_then(|p| p.credentials.clone());
        let interceptor = cache
            .attach(&page, credentials)
            .await
            .context("failed to attach request cache")?;
        Ok(Self { page, interceptor })
    }

    /// Navigate under a wall-clock timeout; exceeding it is a network-class
    /// failure
    pub(crate) async fn load(&self, url: &str, timeout: Duration) -> anyhow::Result<()> {
        tokio::time::timeout(timeout, self.page.goto(url))
            .await
            .map_err(|_| {
                anyhow::anyhow!("page load timed out after {}s: {url}", timeout.as_secs())
            })?
            .with_context(|| format!("navigation failed: {url}"))?;
        Ok(())
    }

    /// Close the page and stop intercepting
    pub(crate) async fn close(self) {
        if let Err(e) = self.page.close().await {
            trace!("page close failed: {e}");
        }
        self.interceptor.abort();
    }
}
