//! shopcrawl CLI
//!
//! Two pipelines against the configured site fleet: `paginate` turns start
//! pages into runs of item URLs, `scrape-items` turns pending run items into
//! uploaded product records. `sites` lists what the external store knows.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shopcrawl::engine::{paginate, scrape_items, EngineContext};
use shopcrawl::{
    EtlClient, ExtractorRegistry, PaginateOptions, ProviderKind, ProxyPool, ScrapeItemOptions,
    SelectorExtractor, SessionManager, SiteManager, DEFAULT_SESSION_CAP,
};

#[derive(Parser)]
#[command(name = "shopcrawl", about = "Browser-fleet orchestration for e-commerce scraping")]
struct Cli {
    /// External store endpoint
    #[arg(long, env = "SHOPCRAWL_API_URL")]
    api_url: String,

    /// External store API key
    #[arg(long, env = "SHOPCRAWL_API_KEY")]
    api_key: String,

    /// Proxy pool file; omit to run everything direct
    #[arg(long, env = "SHOPCRAWL_PROXY_FILE")]
    proxy_file: Option<PathBuf>,

    /// Global cap on concurrently live browser sessions
    #[arg(long, default_value_t = DEFAULT_SESSION_CAP)]
    session_cap: usize,

    /// Remote browser service websocket endpoint (enables --remote)
    #[arg(long, env = "SHOPCRAWL_REMOTE_ENDPOINT")]
    remote_endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct SharedFlags {
    /// Restrict to these domains (repeatable)
    #[arg(long = "site")]
    sites: Vec<String>,

    /// Domains to skip (repeatable, wins over --site)
    #[arg(long = "exclude")]
    exclude: Vec<String>,

    /// Max concurrent sessions for this invocation
    #[arg(long, default_value_t = 10)]
    instance_limit: usize,

    /// Disable the shared request cache
    #[arg(long)]
    disable_cache: bool,

    /// Cache budget in megabytes
    #[arg(long, default_value_t = 250)]
    cache_size_mb: usize,

    /// Cache entry TTL in seconds
    #[arg(long, default_value_t = 300)]
    cache_ttl_seconds: u64,

    /// Let image requests through instead of aborting them
    #[arg(long)]
    allow_images: bool,

    /// Do everything except writing to the external store
    #[arg(long)]
    no_save: bool,

    /// Use the remote browser service instead of local Chromium
    #[arg(long)]
    remote: bool,

    /// Run local browsers with a visible window
    #[arg(long)]
    headed: bool,

    /// Session timeout hint forwarded to the remote provider, in seconds
    #[arg(long)]
    session_timeout: Option<u64>,

    /// Force direct connections for every site
    #[arg(long)]
    no_proxy: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk start pages and commit runs of item URLs
    Paginate {
        #[command(flatten)]
        shared: SharedFlags,

        /// Skip sites with any run newer than this RFC 3339 timestamp
        #[arg(long)]
        since: Option<chrono::DateTime<chrono::Utc>>,

        /// Ignore the --since cutoff
        #[arg(long)]
        force: bool,

        /// Cap pages walked per start page
        #[arg(long)]
        max_pages: Option<usize>,

        /// Retries for network-classified failures
        #[arg(long, default_value_t = 2)]
        max_retries: u32,
    },
    /// Scrape pending items from the latest run of each site
    ScrapeItems {
        #[command(flatten)]
        shared: SharedFlags,

        /// Retries for network-classified failures
        #[arg(long, default_value_t = 1)]
        max_retries: u32,

        /// Also revisit previously failed items
        #[arg(long)]
        retry_failed: bool,
    },
    /// List configured sites and their proxy strategies
    Sites,
}

fn provider_for(shared: &SharedFlags) -> ProviderKind {
    if shared.remote {
        ProviderKind::Remote
    } else {
        ProviderKind::Local
    }
}

/// Build the extractor registry from the store's site metadata
///
/// Every site with a selector spec gets a selector-driven extractor under
/// its extractor id; anything else has to be compiled in.
async fn build_registry(sites: &SiteManager) -> Result<ExtractorRegistry> {
    let mut registry = ExtractorRegistry::new();
    let configs = sites.load_sites().await?;
    for config in configs {
        if let Some(meta) = sites.site_meta(&config.domain).await {
            if let Some(selectors) = meta.selectors {
                registry.register(
                    meta.extractor_id.clone(),
                    Arc::new(SelectorExtractor::new(meta.domain.clone(), selectors)),
                );
            }
        }
    }
    info!(extractors = registry.len(), "extractor registry built");
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shopcrawl=info")),
        )
        .init();

    let cli = Cli::parse();

    let store = Arc::new(EtlClient::new(&cli.api_url, &cli.api_key)?);
    let proxies = Arc::new(match &cli.proxy_file {
        Some(path) => ProxyPool::load(path).context("failed to load proxy pool")?,
        None => ProxyPool::empty(),
    });
    let sites = SiteManager::new(Arc::clone(&store), Arc::clone(&proxies));
    let sessions = SessionManager::new(cli.session_cap, cli.remote_endpoint.clone());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Paginate {
            shared,
            since,
            force,
            max_pages,
            max_retries,
        } => {
            let extractors = Arc::new(build_registry(&sites).await?);
            let ctx = EngineContext {
                store,
                sites,
                sessions,
                proxies,
                extractors,
            };
            let options = PaginateOptions {
                sites: (!shared.sites.is_empty()).then(|| shared.sites.clone()),
                exclude: shared.exclude.clone(),
                since,
                force,
                instance_limit: shared.instance_limit,
                max_pages,
                disable_cache: shared.disable_cache,
                cache_size_mb: shared.cache_size_mb,
                cache_ttl_seconds: shared.cache_ttl_seconds,
                block_images: !shared.allow_images,
                no_save: shared.no_save,
                provider: provider_for(&shared),
                local_headed: shared.headed,
                session_timeout_secs: shared.session_timeout,
                max_retries,
                no_proxy: shared.no_proxy,
            };
            let report = paginate(&ctx, options, cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                std::process::exit(1);
            }
        }
        Commands::ScrapeItems {
            shared,
            max_retries,
            retry_failed,
        } => {
            let extractors = Arc::new(build_registry(&sites).await?);
            let ctx = EngineContext {
                store,
                sites,
                sessions,
                proxies,
                extractors,
            };
            let options = ScrapeItemOptions {
                sites: (!shared.sites.is_empty()).then(|| shared.sites.clone()),
                exclude: shared.exclude.clone(),
                instance_limit: shared.instance_limit,
                disable_cache: shared.disable_cache,
                cache_size_mb: shared.cache_size_mb,
                cache_ttl_seconds: shared.cache_ttl_seconds,
                block_images: !shared.allow_images,
                no_save: shared.no_save,
                provider: provider_for(&shared),
                local_headed: shared.headed,
                session_timeout_secs: shared.session_timeout,
                max_retries,
                retry_failed_items: retry_failed,
                no_proxy: shared.no_proxy,
            };
            let report = scrape_items(&ctx, options, cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                std::process::exit(1);
            }
        }
        Commands::Sites => {
            let configs = sites.load_sites().await?;
            for config in configs {
                let strategy = config
                    .proxy
                    .as_ref()
                    .map_or_else(|| "any".to_string(), |p| format!("{:?}", p.strategy));
                println!(
                    "{:<32} sessions={} proxy={} start_pages={}",
                    config.domain,
                    config.session_limit(),
                    strategy,
                    config.start_pages.len()
                );
            }
        }
    }

    Ok(())
}
