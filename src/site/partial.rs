//! In-memory pagination progress
//!
//! A `PartialRun` exists from `start_pagination` until the domain's
//! pagination commits as one run or is abandoned. Nothing in here is
//! durable; on restart pending work is reconstructed from the external
//! store.

use std::collections::HashMap;

use crate::error::{Result, ScrapeError};

/// Progress of one start page's pagination
#[derive(Debug, Clone, Default)]
pub struct PaginationState {
    /// Item URLs in collection order
    pub collected_urls: Vec<String>,
    pub completed: bool,
    pub failure_count: u32,
    pub failure_history: Vec<String>,
}

/// Patch applied to one `PaginationState`
#[derive(Debug, Clone, Default)]
pub struct PaginationPatch {
    /// Replace the collected URL set
    pub collected_urls: Option<Vec<String>>,
    pub completed: Option<bool>,
    /// Record one more retryable failure
    pub failure: Option<String>,
}

impl PaginationPatch {
    /// Pagination finished with these URLs
    #[must_use]
    pub fn completed(urls: Vec<String>) -> Self {
        Self {
            collected_urls: Some(urls),
            completed: Some(true),
            failure: None,
        }
    }

    /// Pagination hit a retryable failure
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            collected_urls: None,
            completed: None,
            failure: Some(error.into()),
        }
    }

    /// Pagination is terminally unusable (missing extractor, permanent
    /// error); completes with no URLs, which blocks the domain's commit
    #[must_use]
    pub fn terminal(error: impl Into<String>) -> Self {
        Self {
            collected_urls: Some(Vec::new()),
            completed: Some(true),
            failure: Some(error.into()),
        }
    }
}

/// Pagination progress for one domain
#[derive(Debug, Clone)]
pub struct PartialRun {
    domain: String,
    /// Start pages in configured order; drives commit-time URL ordering
    start_pages: Vec<String>,
    states: HashMap<String, PaginationState>,
}

impl PartialRun {
    #[must_use]
    pub fn new(domain: &str, start_pages: &[String]) -> Self {
        Self {
            domain: domain.to_string(),
            start_pages: start_pages.to_vec(),
            states: start_pages
                .iter()
                .map(|p| (p.clone(), PaginationState::default()))
                .collect(),
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn start_pages(&self) -> &[String] {
        &self.start_pages
    }

    #[must_use]
    pub fn state(&self, start_page: &str) -> Option<&PaginationState> {
        self.states.get(start_page)
    }

    /// Apply a patch to one start page's state
    pub fn apply(&mut self, start_page: &str, patch: PaginationPatch) -> Result<()> {
        let Some(state) = self.states.get_mut(start_page) else {
            return Err(ScrapeError::UnknownStartPage(start_page.to_string()));
        };
        if let Some(urls) = patch.collected_urls {
            state.collected_urls = urls;
        }
        if let Some(completed) = patch.completed {
            state.completed = completed;
        }
        if let Some(failure) = patch.failure {
            state.failure_count += 1;
            state.failure_history.push(failure);
        }
        Ok(())
    }

    /// Start pages whose pagination has not finished, capped at `limit`
    ///
    /// Pages that already burned `failure_threshold` attempts are withheld;
    /// they stay incomplete, which keeps the domain's commit from happening
    /// and surfaces the failure in the invocation report.
    #[must_use]
    pub fn incomplete_start_pages(&self, limit: usize, failure_threshold: u32) -> Vec<String> {
        self.start_pages
            .iter()
            .filter(|p| {
                self.states
                    .get(*p)
                    .is_some_and(|s| !s.completed && s.failure_count < failure_threshold)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.states.values().all(|s| s.completed)
    }

    /// Union of collected URLs in per-pagination order then start-page
    /// order, deduplicated
    ///
    /// Refuses when any pagination is still running, and aborts the entire
    /// run when a completed pagination collected nothing.
    pub fn union_urls(&self) -> Result<Vec<String>> {
        if !self.all_completed() {
            return Err(ScrapeError::PaginationIncomplete {
                domain: self.domain.clone(),
            });
        }
        for page in &self.start_pages {
            if self.states[page].collected_urls.is_empty() {
                return Err(ScrapeError::EmptyPagination {
                    domain: self.domain.clone(),
                    start_page: page.clone(),
                });
            }
        }
        let mut seen = std::collections::HashSet::new();
        let mut urls = Vec::new();
        for page in &self.start_pages {
            for url in &self.states[page].collected_urls {
                if seen.insert(url.clone()) {
                    urls.push(url.clone());
                }
            }
        }
        Ok(urls)
    }
}
