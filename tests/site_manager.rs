//! Site manager behavior against a mocked external store
//!
//! Covers the commit predicate (including the abort on a zero-URL
//! pagination), commit atomicity when the store is down, and blocklist
//! expiry.

use mockito::Matcher;
use serde_json::json;
use std::sync::Arc;

use shopcrawl::{EtlClient, PaginationPatch, Proxy, ProxyPool, ScrapeError, SiteManager};

const SITES_BODY: &str = r#"[
    {
        "domain": "test.com",
        "start_pages": ["https://test.com/catalog", "https://test.com/sale"],
        "extractor_id": "selector",
        "proxy": {"strategy": "datacenter", "session_limit": 1, "cooldown_minutes": 30}
    },
    {
        "domain": "fast.com",
        "start_pages": ["https://fast.com/all"],
        "extractor_id": "selector",
        "proxy": {"strategy": "datacenter", "session_limit": 2, "cooldown_minutes": 0}
    }
]"#;

fn datacenter_proxy(id: &str) -> Proxy {
    serde_json::from_value(json!({
        "id": id,
        "type": "datacenter",
        "geo": "US",
        "url": format!("http://{id}:8080")
    }))
    .expect("proxy json should parse")
}

fn residential_proxy(id: &str) -> Proxy {
    serde_json::from_value(json!({
        "id": id,
        "type": "residential",
        "url": format!("http://{id}:9000")
    }))
    .expect("proxy json should parse")
}

async fn manager(server: &mockito::ServerGuard) -> Arc<SiteManager> {
    let store = Arc::new(EtlClient::new(server.url(), "test-key").expect("client should build"));
    SiteManager::new(store, Arc::new(ProxyPool::empty()))
}

fn run_body(id: &str, domain: &str) -> String {
    json!({
        "id": id,
        "domain": domain,
        "created_at": "2026-02-01T10:00:00Z",
        "status": "pending",
        "items": []
    })
    .to_string()
}

#[tokio::test]
async fn commit_aborts_when_a_pagination_collected_nothing() {
    let mut server = mockito::Server::new_async().await;
    let create = server
        .mock("POST", "/runs")
        .with_status(201)
        .with_body(run_body("run-1", "test.com"))
        .expect(0)
        .create_async()
        .await;

    let sites = manager(&server).await;
    let start_pages = vec![
        "https://test.com/catalog".to_string(),
        "https://test.com/sale".to_string(),
    ];
    sites.start_pagination("test.com", &start_pages).await;
    sites
        .update_pagination_state(
            "https://test.com/catalog",
            PaginationPatch::completed(vec!["https://test.com/p/1".to_string()]),
        )
        .await
        .expect("catalog state should update");
    sites
        .update_pagination_state("https://test.com/sale", PaginationPatch::completed(Vec::new()))
        .await
        .expect("sale state should update");

    let err = sites.commit("test.com").await.expect_err("commit must abort");
    assert!(matches!(err, ScrapeError::EmptyPagination { .. }));
    assert!(err.to_string().contains("aborting entire run"));

    // No run was created and the partial survives for a retry.
    create.assert_async().await;
    assert!(sites.has_partial("test.com").await);
}

#[tokio::test]
async fn commit_refuses_while_a_pagination_is_running() {
    let server = mockito::Server::new_async().await;
    let sites = manager(&server).await;
    let start_pages = vec![
        "https://test.com/catalog".to_string(),
        "https://test.com/sale".to_string(),
    ];
    sites.start_pagination("test.com", &start_pages).await;
    sites
        .update_pagination_state(
            "https://test.com/catalog",
            PaginationPatch::completed(vec!["https://test.com/p/1".to_string()]),
        )
        .await
        .expect("catalog state should update");

    let err = sites.commit("test.com").await.expect_err("commit must refuse");
    assert!(matches!(err, ScrapeError::PaginationIncomplete { .. }));
    assert!(sites.has_partial("test.com").await);
}

#[tokio::test]
async fn commit_unions_urls_in_order_and_clears_the_partial() {
    let mut server = mockito::Server::new_async().await;
    let create = server
        .mock("POST", "/runs")
        .match_body(Matcher::PartialJson(json!({
            "domain": "test.com",
            "urls": [
                "https://test.com/p/1",
                "https://test.com/p/2",
                "https://test.com/p/3"
            ]
        })))
        .with_status(201)
        .with_body(run_body("run-1", "test.com"))
        .create_async()
        .await;

    let sites = manager(&server).await;
    let start_pages = vec![
        "https://test.com/catalog".to_string(),
        "https://test.com/sale".to_string(),
    ];
    sites.start_pagination("test.com", &start_pages).await;
    // Second start page finishes first; commit order still follows the
    // configured start-page order, with duplicates collapsed.
    sites
        .update_pagination_state(
            "https://test.com/sale",
            PaginationPatch::completed(vec![
                "https://test.com/p/2".to_string(),
                "https://test.com/p/3".to_string(),
            ]),
        )
        .await
        .expect("sale state should update");
    sites
        .update_pagination_state(
            "https://test.com/catalog",
            PaginationPatch::completed(vec![
                "https://test.com/p/1".to_string(),
                "https://test.com/p/2".to_string(),
            ]),
        )
        .await
        .expect("catalog state should update");

    let run = sites.commit("test.com").await.expect("commit should succeed");
    assert_eq!(run.id, "run-1");
    create.assert_async().await;
    assert!(!sites.has_partial("test.com").await);
}

#[tokio::test]
async fn commit_leaves_partial_intact_when_the_store_is_down() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/runs")
        .with_status(503)
        .with_body("unavailable")
        .create_async()
        .await;

    let sites = manager(&server).await;
    let start_pages = vec!["https://test.com/catalog".to_string()];
    sites.start_pagination("test.com", &start_pages).await;
    sites
        .update_pagination_state(
            "https://test.com/catalog",
            PaginationPatch::completed(vec!["https://test.com/p/1".to_string()]),
        )
        .await
        .expect("state should update");

    let err = sites.commit("test.com").await.expect_err("commit must fail");
    assert!(matches!(err, ScrapeError::Store(_)));
    assert!(sites.has_partial("test.com").await);
}

#[tokio::test]
async fn abandoned_partials_release_their_start_pages() {
    let server = mockito::Server::new_async().await;
    let sites = manager(&server).await;
    let start_pages = vec!["https://test.com/catalog".to_string()];
    sites.start_pagination("test.com", &start_pages).await;
    assert!(sites.has_partial("test.com").await);

    sites.abandon("test.com").await;
    assert!(!sites.has_partial("test.com").await);
    let err = sites
        .update_pagination_state(
            "https://test.com/catalog",
            PaginationPatch::completed(vec!["https://test.com/p/1".to_string()]),
        )
        .await
        .expect_err("patch after abandon must fail");
    assert!(matches!(err, ScrapeError::UnknownStartPage(_)));
}

#[tokio::test]
async fn pagination_patch_for_unknown_start_page_errors() {
    let server = mockito::Server::new_async().await;
    let sites = manager(&server).await;
    let err = sites
        .update_pagination_state("https://nowhere.example/x", PaginationPatch::failed("boom"))
        .await
        .expect_err("patch must fail");
    assert!(matches!(err, ScrapeError::UnknownStartPage(_)));
}

#[tokio::test]
async fn unprocessed_start_pages_are_capped_by_session_limit() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/sites")
        .with_status(200)
        .with_body(SITES_BODY)
        .create_async()
        .await;

    let sites = manager(&server).await;
    sites.load_sites().await.expect("sites should load");
    sites
        .start_pagination(
            "test.com",
            &[
                "https://test.com/catalog".to_string(),
                "https://test.com/sale".to_string(),
            ],
        )
        .await;

    let pending = sites
        .unprocessed_start_pages(&["test.com".to_string()])
        .await;
    assert_eq!(pending.len(), 1);
    let (domain, pages) = &pending[0];
    assert_eq!(domain, "test.com");
    // session_limit for test.com is 1, so only one of two start pages.
    assert_eq!(pages.len(), 1);
}

#[tokio::test]
async fn blocked_datacenter_proxy_shows_up_until_cooldown_passes() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/sites")
        .with_status(200)
        .with_body(SITES_BODY)
        .create_async()
        .await;

    let sites = manager(&server).await;
    sites.load_sites().await.expect("sites should load");

    // 30 minute cooldown: entry survives the read.
    sites
        .add_block("test.com", &datacenter_proxy("dc-1"), "timeout")
        .await;
    let blocked = sites.get_blocklist("test.com").await;
    assert!(blocked.contains("dc-1"));

    // Zero cooldown: the entry is already expired at the next read.
    sites
        .add_block("fast.com", &datacenter_proxy("dc-2"), "timeout")
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert!(sites.get_blocklist("fast.com").await.is_empty());
}

#[tokio::test]
async fn residential_proxies_are_never_blocked() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/sites")
        .with_status(200)
        .with_body(SITES_BODY)
        .create_async()
        .await;

    let sites = manager(&server).await;
    sites.load_sites().await.expect("sites should load");
    sites
        .add_block("test.com", &residential_proxy("res-1"), "timeout")
        .await;
    assert!(sites.get_blocklist("test.com").await.is_empty());
}

#[tokio::test]
async fn blocklist_snapshot_lands_in_distribution_configs() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/sites")
        .with_status(200)
        .with_body(SITES_BODY)
        .create_async()
        .await;

    let sites = manager(&server).await;
    sites.load_sites().await.expect("sites should load");
    sites
        .add_block("test.com", &datacenter_proxy("dc-1"), "connection reset")
        .await;

    let configs = sites.configs_for(&["test.com".to_string()], false).await;
    assert_eq!(configs.len(), 1);
    assert!(configs[0].blocked_proxy_ids.contains("dc-1"));

    // --no-proxy wipes the requirement and the blocklist snapshot.
    let direct = sites.configs_for(&["test.com".to_string()], true).await;
    assert!(direct[0].blocked_proxy_ids.is_empty());
    assert_eq!(
        direct[0].proxy.as_ref().map(|p| p.strategy),
        Some(shopcrawl::ProxyStrategy::None)
    );
}

#[tokio::test]
async fn pending_items_come_from_the_latest_run_only() {
    let mut server = mockito::Server::new_async().await;
    let runs = json!([
        {
            "id": "run-old",
            "domain": "test.com",
            "created_at": "2026-01-01T00:00:00Z",
            "status": "completed",
            "items": [{"url": "https://test.com/p/old"}]
        },
        {
            "id": "run-new",
            "domain": "test.com",
            "created_at": "2026-02-01T00:00:00Z",
            "status": "pending",
            "items": [
                {"url": "https://test.com/p/1"},
                {"url": "https://test.com/p/2", "done": true},
                {"url": "https://test.com/p/3", "failed": 1},
                {"url": "https://test.com/p/4", "invalid": true}
            ]
        }
    ]);
    server
        .mock("GET", "/runs?domain=test.com")
        .with_status(200)
        .with_body(runs.to_string())
        .expect_at_least(1)
        .create_async()
        .await;

    let sites = manager(&server).await;
    let pending = sites
        .pending_items(&["test.com".to_string()], 10, false)
        .await
        .expect("pending query should succeed");
    assert_eq!(pending.len(), 1);
    let (_, run_id, items) = &pending[0];
    assert_eq!(run_id, "run-new");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].url, "https://test.com/p/1");

    // retry-failed folds the failed target back in, never the invalid one.
    let with_failed = sites
        .pending_items(&["test.com".to_string()], 10, true)
        .await
        .expect("pending query should succeed");
    let (_, _, items) = &with_failed[0];
    assert_eq!(items.len(), 2);
}
