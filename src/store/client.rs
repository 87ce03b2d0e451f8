//! HTTP client for the external run store
//!
//! Thin reqwest wrapper over the store's REST surface. Idempotent reads are
//! retried twice on transport errors; writes are attempted once so that
//! commit atomicity stays with the caller.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{AddItemsOutcome, ItemRecord, RunStatus, ScrapeRun, SiteMeta, TargetPatch};
use crate::error::{Result, ScrapeError};

const READ_RETRIES: usize = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Client for the external run store
#[derive(Debug, Clone)]
pub struct EtlClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

/// Filters for listing runs
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListRunsQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

impl EtlClient {
    /// Build a client for the given endpoint
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// GET with retries on transport errors; status handling is the
    /// caller's business
    async fn get_with_retry(&self, path: &str) -> Result<reqwest::Response> {
        let mut last_err: Option<ScrapeError> = None;
        for attempt in 0..=READ_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF * attempt as u32).await;
            }
            let resp = self
                .http
                .get(self.url(path))
                .bearer_auth(&self.api_key)
                .send()
                .await;
            match resp {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    warn!(path, attempt, "store read failed: {err}");
                    last_err = Some(err.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ScrapeError::Store(format!("GET {path} failed"))))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.get_with_retry(path).await?;
        let resp = Self::check_status(resp, path).await?;
        Ok(resp.json().await?)
    }

    async fn check_status(resp: reqwest::Response, path: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(ScrapeError::Store(format!(
            "{path} returned {status}: {body}"
        )))
    }

    /// Fetch all configured sites
    pub async fn get_sites(&self) -> Result<Vec<SiteMeta>> {
        self.get_json("/sites").await
    }

    /// Fetch one site's metadata, `None` when the store has no such domain
    pub async fn get_site_by_id(&self, domain: &str) -> Result<Option<SiteMeta>> {
        let path = format!("/sites/{domain}");
        let resp = self.get_with_retry(&path).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check_status(resp, &path).await?;
        Ok(Some(resp.json().await?))
    }

    /// Create a run from a committed pagination's URL set
    pub async fn create_run(&self, domain: &str, urls: &[String]) -> Result<ScrapeRun> {
        debug!(domain, urls = urls.len(), "creating run");
        let resp = self
            .http
            .post(self.url("/runs"))
            .bearer_auth(&self.api_key)
            .json(&json!({ "domain": domain, "urls": urls }))
            .send()
            .await?;
        let resp = Self::check_status(resp, "/runs").await?;
        Ok(resp.json().await?)
    }

    /// Fetch a run with its per-item progress
    pub async fn fetch_run(&self, run_id: &str) -> Result<ScrapeRun> {
        self.get_json(&format!("/runs/{run_id}")).await
    }

    /// List runs matching the query, newest first
    pub async fn list_runs(&self, query: &ListRunsQuery) -> Result<Vec<ScrapeRun>> {
        let mut path = String::from("/runs?");
        if let Some(domain) = &query.domain {
            path.push_str(&format!("domain={domain}&"));
        }
        if let Some(status) = &query.status {
            let status = serde_json::to_string(status)?;
            path.push_str(&format!("status={}&", status.trim_matches('"')));
        }
        if let Some(since) = &query.since {
            path.push_str(&format!("since={}&", since.to_rfc3339()));
        }
        let path = path.trim_end_matches(['&', '?']).to_string();
        self.get_json(&path).await
    }

    /// Patch one target of a run
    pub async fn update_run_item(
        &self,
        run_id: &str,
        url: &str,
        patch: &TargetPatch,
    ) -> Result<()> {
        let resp = self
            .http
            .patch(self.url(&format!("/runs/{run_id}/items")))
            .bearer_auth(&self.api_key)
            .json(&json!({ "url": url, "changes": patch }))
            .send()
            .await?;
        Self::check_status(resp, "/runs/{id}/items").await?;
        Ok(())
    }

    /// Mark a run completed once every item is terminal
    pub async fn finalize_run(&self, run_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/runs/{run_id}/finalize")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::check_status(resp, "/runs/{id}/finalize").await?;
        Ok(())
    }

    /// Upload a batch of product records
    pub async fn add_items(&self, items: &[ItemRecord]) -> Result<AddItemsOutcome> {
        let resp = self
            .http
            .post(self.url("/items/batch"))
            .bearer_auth(&self.api_key)
            .json(items)
            .send()
            .await?;
        let resp = Self::check_status(resp, "/items/batch").await?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn client(server: &mockito::ServerGuard) -> EtlClient {
        EtlClient::new(server.url(), "test-key").expect("client should build")
    }

    #[tokio::test]
    async fn get_sites_deserializes_metadata() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/sites")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(
                r#"[{
                    "domain": "shop.example",
                    "start_pages": ["https://shop.example/catalog"],
                    "extractor_id": "selector",
                    "proxy": {"strategy": "datacenter", "geo": "US", "session_limit": 3}
                }]"#,
            )
            .create_async()
            .await;

        let sites = client(&server).await.get_sites().await.expect("sites should load");
        mock.assert_async().await;
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].domain, "shop.example");
        assert_eq!(sites[0].proxy.as_ref().map(|p| p.session_limit), Some(3));
    }

    #[tokio::test]
    async fn get_site_by_id_maps_404_to_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sites/gone.example")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/sites/shop.example")
            .with_status(200)
            .with_body(r#"{"domain": "shop.example", "extractor_id": "selector"}"#)
            .create_async()
            .await;

        let client = client(&server).await;
        assert!(client
            .get_site_by_id("gone.example")
            .await
            .expect("404 should not be an error")
            .is_none());
        let site = client
            .get_site_by_id("shop.example")
            .await
            .expect("lookup should succeed")
            .expect("site should exist");
        assert_eq!(site.extractor_id, "selector");
        assert!(site.start_pages.is_empty());
    }

    #[tokio::test]
    async fn create_run_posts_urls() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/runs")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "domain": "shop.example",
                "urls": ["https://shop.example/p/1"]
            })))
            .with_status(201)
            .with_body(
                r#"{
                    "id": "run-1",
                    "domain": "shop.example",
                    "created_at": "2026-01-10T12:00:00Z",
                    "status": "pending",
                    "items": [{"url": "https://shop.example/p/1"}]
                }"#,
            )
            .create_async()
            .await;

        let run = client(&server)
            .await
            .create_run("shop.example", &["https://shop.example/p/1".to_string()])
            .await
            .expect("run should be created");
        mock.assert_async().await;
        assert_eq!(run.id, "run-1");
        assert_eq!(run.items.len(), 1);
        assert!(run.items[0].is_pending(false));
    }

    #[tokio::test]
    async fn create_run_surfaces_store_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/runs")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let err = client(&server)
            .await
            .create_run("shop.example", &[])
            .await
            .expect_err("5xx should surface as an error");
        assert!(matches!(err, ScrapeError::Store(_)));
    }

    #[tokio::test]
    async fn list_runs_builds_query_string() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/runs?domain=shop.example&status=completed")
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let runs = client(&server)
            .await
            .list_runs(&ListRunsQuery {
                domain: Some("shop.example".into()),
                status: Some(RunStatus::Completed),
                since: None,
            })
            .await
            .expect("list should succeed");
        mock.assert_async().await;
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn update_run_item_patches_changes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/runs/run-1/items")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "url": "https://shop.example/p/1",
                "changes": {"done": true}
            })))
            .with_status(200)
            .create_async()
            .await;

        client(&server)
            .await
            .update_run_item("run-1", "https://shop.example/p/1", &TargetPatch::done())
            .await
            .expect("patch should succeed");
        mock.assert_async().await;
    }
}
