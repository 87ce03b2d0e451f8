//! Wire types shared with the external run store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ProxyRequirement;

/// One unit of scraping work inside a run
///
/// `done` is terminal success, `invalid` is terminal non-retryable, `failed`
/// counts retryable failures. A target is pending while neither terminal
/// flag is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub url: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub invalid: bool,
}

impl ScrapeTarget {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            done: false,
            failed: 0,
            invalid: false,
        }
    }

    /// Whether this target should be picked up for scraping.
    ///
    /// Targets that failed before are only revisited when the caller opts
    /// into retrying them.
    #[must_use]
    pub fn is_pending(&self, include_failed: bool) -> bool {
        !self.done && !self.invalid && (include_failed || self.failed == 0)
    }
}

/// Field patch applied to one target of a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid: Option<bool>,
}

impl TargetPatch {
    #[must_use]
    pub fn done() -> Self {
        Self {
            done: Some(true),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn invalid() -> Self {
        Self {
            invalid: Some(true),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failed(count: u32) -> Self {
        Self {
            failed: Some(count),
            ..Self::default()
        }
    }
}

/// Lifecycle of a run in the external store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
}

/// One committed pagination: a URL set and its per-item progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default)]
    pub items: Vec<ScrapeTarget>,
}

impl ScrapeRun {
    /// Items still worth scraping, capped at `limit`
    #[must_use]
    pub fn pending_items(&self, limit: usize, include_failed: bool) -> Vec<ScrapeTarget> {
        self.items
            .iter()
            .filter(|t| t.is_pending(include_failed))
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Structured product record produced by an extractor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Page the record was extracted from; always set before upload
    pub source_url: String,
    pub domain: String,
    /// Extractor-defined fields (title, price, currency, images, ...)
    pub data: serde_json::Value,
}

/// Result of a batch item upload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddItemsOutcome {
    /// Source URLs the store accepted
    #[serde(default)]
    pub successful: Vec<String>,
    /// Source URLs the store rejected, with reasons
    #[serde(default)]
    pub failed: HashMap<String, String>,
}

/// CSS selectors driving the generic extractor for one site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorSpec {
    /// Anchors whose hrefs are the item URLs on a listing page
    pub item_links: String,
    /// Element clicked to advance to the next listing page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page: Option<String>,
    /// Product-page field name -> selector
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

/// Per-site scraping metadata served by the external store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteMeta {
    pub domain: String,
    #[serde(default)]
    pub start_pages: Vec<String>,
    pub extractor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<SelectorSpec>,
}
