//! Extractor contract and registry
//!
//! Site-specific page understanding lives behind the `Extractor` trait:
//! pull item URLs off a listing page, advance the listing in place, and
//! turn a product page into a structured record. The engines only ever see
//! the registry; a missing extractor is a first-class error the retry
//! classifier treats as terminal, never a crash.

// Sub-modules
pub mod selector;

// Re-exports for public API
pub use selector::SelectorExtractor;

use async_trait::async_trait;
use chromiumoxide::Page;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, ScrapeError};
use crate::store::ItemRecord;

/// Site-specific extraction operations, invoked against a loaded page
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Item URLs visible on the currently loaded listing page
    async fn get_item_urls(&self, page: &Page) -> anyhow::Result<Vec<String>>;

    /// Advance to the next listing page in place
    ///
    /// Returns `false` when there are no more pages.
    async fn paginate(&self, page: &Page) -> anyhow::Result<bool>;

    /// Extract a structured product record from the currently loaded page
    async fn scrape_item(&self, page: &Page) -> anyhow::Result<ItemRecord>;
}

/// Lookup table from extractor id to implementation
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extractor under an id, replacing any previous one
    pub fn register(&mut self, id: impl Into<String>, extractor: Arc<dyn Extractor>) {
        self.extractors.insert(id.into(), extractor);
    }

    /// Resolve an extractor id
    pub fn lookup(&self, id: &str) -> Result<Arc<dyn Extractor>> {
        self.extractors
            .get(id)
            .cloned()
            .ok_or_else(|| ScrapeError::MissingScraper(id.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    #[async_trait]
    impl Extractor for Dummy {
        async fn get_item_urls(&self, _page: &Page) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn paginate(&self, _page: &Page) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn scrape_item(&self, _page: &Page) -> anyhow::Result<ItemRecord> {
            anyhow::bail!("not a product page")
        }
    }

    #[test]
    fn lookup_resolves_registered_ids() {
        let mut registry = ExtractorRegistry::new();
        registry.register("dummy", Arc::new(Dummy));
        assert!(registry.lookup("dummy").is_ok());
    }

    #[test]
    fn missing_extractor_is_a_typed_error() {
        let registry = ExtractorRegistry::new();
        let err = match registry.lookup("nope") {
            Err(err) => err,
            Ok(_) => panic!("lookup should fail"),
        };
        assert!(matches!(err, ScrapeError::MissingScraper(_)));
        assert!(err.to_string().contains("failed to load scraper"));
    }
}
