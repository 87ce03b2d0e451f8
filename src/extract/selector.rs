//! Selector-driven generic extractor
//!
//! Covers the common storefront shape without site-specific code: item
//! links matched by one CSS selector, a clickable next-page element, and a
//! field-name -> selector map for product pages. Sites that need more than
//! selectors get their own `Extractor` implementation.

use async_trait::async_trait;
use chromiumoxide::Page;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::trace;

use super::Extractor;
use crate::store::{ItemRecord, SelectorSpec};

/// Extractor configured entirely by CSS selectors
pub struct SelectorExtractor {
    domain: String,
    spec: SelectorSpec,
}

impl SelectorExtractor {
    #[must_use]
    pub fn new(domain: impl Into<String>, spec: SelectorSpec) -> Self {
        Self {
            domain: domain.into(),
            spec,
        }
    }
}

fn js_string_literal(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

#[async_trait]
impl Extractor for SelectorExtractor {
    async fn get_item_urls(&self, page: &Page) -> anyhow::Result<Vec<String>> {
        let script = format!(
            "Array.from(document.querySelectorAll({})).map(a => a.href).filter(Boolean)",
            js_string_literal(&self.spec.item_links)
        );
        let urls: Vec<String> = page.evaluate(script).await?.into_value()?;
        trace!(domain = %self.domain, count = urls.len(), "collected item urls");
        Ok(urls)
    }

    async fn paginate(&self, page: &Page) -> anyhow::Result<bool> {
        let Some(next_selector) = &self.spec.next_page else {
            return Ok(false);
        };
        // A disabled or missing next control means the listing is exhausted.
        let clickable: bool = page
            .evaluate(format!(
                "(() => {{ const el = document.querySelector({}); \
                 return !!el && !el.disabled && el.offsetParent !== null; }})()",
                js_string_literal(next_selector)
            ))
            .await?
            .into_value()?;
        if !clickable {
            return Ok(false);
        }

        let element = match page.find_element(next_selector.as_str()).await {
            Ok(element) => element,
            Err(_) => return Ok(false),
        };
        element.click().await?;
        let _ = tokio::time::timeout(Duration::from_secs(10), page.wait_for_navigation()).await;
        Ok(true)
    }

    async fn scrape_item(&self, page: &Page) -> anyhow::Result<ItemRecord> {
        let mut fields = Map::new();
        for (name, selector) in &self.spec.fields {
            let script = format!(
                "(() => {{ const el = document.querySelector({}); \
                 return el ? (el.content || el.textContent || '').trim() : null; }})()",
                js_string_literal(selector)
            );
            let value: Option<String> = page.evaluate(script).await?.into_value()?;
            fields.insert(name.clone(), value.map_or(Value::Null, Value::String));
        }

        let source_url = page
            .url()
            .await?
            .ok_or_else(|| anyhow::anyhow!("page has no url"))?;
        Ok(ItemRecord {
            source_url,
            domain: self.domain.clone(),
            data: Value::Object(fields),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn selectors_are_escaped_into_js_literals() {
        assert_eq!(js_string_literal("a.item\"x"), r#""a.item\"x""#);
    }

    #[test]
    fn spec_without_next_selector_parses() {
        let spec: SelectorSpec = serde_json::from_str(
            r#"{"item_links": "a.product", "fields": {"title": "h1"}}"#,
        )
        .expect("spec should parse");
        let extractor = SelectorExtractor::new("shop.example", spec);
        assert!(extractor.spec.next_page.is_none());
        let mut expected = HashMap::new();
        expected.insert("title".to_string(), "h1".to_string());
        assert_eq!(extractor.spec.fields, expected);
    }
}
