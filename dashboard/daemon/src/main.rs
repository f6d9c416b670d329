//! WaG Daemon - Headless Dashboard Runner
//!
//! Loads a dashboard layout, submits one query, waits until every tile has
//! settled and prints the tiles' final states as JSON.
//!
//! # Usage
//!
//! ```bash
//! # Built-in layout against the public APIs
//! wag-daemon --query house
//!
//! # Custom layout, word comparison
//! wag-daemon --config ./dashboard.toml --query-type cmp --query house --query home
//!
//! # No network: scripted sample responses
//! wag-daemon --offline --query house
//!
//! # Verbose logging
//! RUST_LOG=debug wag-daemon --query house
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use wag_core::api::cache::{MemoryCache, NoCache, ResponseCache};
use wag_core::api::kontext::KontextProvider;
use wag_core::api::scripted::ScriptedProvider;
use wag_core::{
    load_config, load_config_from_path, ApiProvider, ConfigOverrides, Dashboard, DashboardConfig,
    PosTag, Query, QueryMatch, QueryType,
};

/// WaG Daemon - run a corpus dashboard layout headless
#[derive(Parser, Debug)]
#[command(name = "wag-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "WAG_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Word to query (repeat for comparison queries)
    #[arg(short = 'q', long = "query", value_name = "WORD", required = true)]
    words: Vec<String>,

    /// Query type (single, cmp, translat)
    #[arg(short = 't', long, value_name = "TYPE")]
    query_type: Option<String>,

    /// Primary language
    #[arg(long, default_value = "cs")]
    lang1: String,

    /// Target language of translation queries
    #[arg(long)]
    lang2: Option<String>,

    /// Seconds to wait for all tiles to settle
    #[arg(long, env = "WAG_TIMEOUT_SECS", default_value_t = 120)]
    timeout_secs: u64,

    /// Answer every API call from built-in sample data
    #[arg(long)]
    offline: bool,

    /// Disable the response cache
    #[arg(long)]
    no_cache: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "WAG_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("wag_daemon={level},wag_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(args: &Args) -> Result<DashboardConfig> {
    let mut config = match &args.config {
        Some(path) => {
            if !path.exists() {
                bail!("config file not found: {}", path.display());
            }
            load_config_from_path(Some(path.clone()))
                .with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => load_config().context("Failed to load config")?,
    };

    let mut overrides = ConfigOverrides::new();
    if let Some(ref query_type) = args.query_type {
        overrides = overrides.with_query_type(QueryType::parse(query_type, config.default_query_type)?);
    }
    if args.no_cache {
        overrides = overrides.with_cache_enabled(false);
    }
    overrides.apply(&mut config);

    info!(source = %config.source(), tiles = config.tiles.len(), "configuration resolved");
    Ok(config)
}

fn build_provider(config: &DashboardConfig, offline: bool) -> Result<Box<dyn ApiProvider>> {
    if offline {
        info!("offline mode, using scripted sample responses");
        return Ok(Box::new(ScriptedProvider::sample()));
    }
    let cache: Arc<dyn ResponseCache> = if config.cache_enabled {
        Arc::new(MemoryCache::new())
    } else {
        Arc::new(NoCache)
    };
    let provider = KontextProvider::new(config.request_timeout, cache)
        .context("Failed to create HTTP client")?;
    Ok(Box::new(provider))
}

fn build_query(args: &Args, query_type: QueryType) -> Result<Query> {
    if query_type == QueryType::Translat && args.lang2.is_none() {
        bail!("translation queries need --lang2");
    }
    if query_type != QueryType::Cmp && args.words.len() > 1 {
        warn!(words = args.words.len(), "only comparison queries use more than one word");
    }
    let matches = args
        .words
        .iter()
        .map(|word| vec![QueryMatch::new(word.as_str(), word.as_str(), PosTag::UNKNOWN).current()])
        .collect();
    Ok(Query {
        query_type,
        lang1: args.lang1.clone(),
        lang2: args.lang2.clone(),
        matches,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("WaG Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    let provider = build_provider(&config, args.offline)?;
    let mut dashboard =
        Dashboard::from_config(&config, provider.as_ref()).context("Failed to build dashboard")?;

    let query = build_query(&args, config.default_query_type)?;
    dashboard.submit(query)?;

    let limit = Duration::from_secs(args.timeout_secs);
    let settled = tokio::select! {
        result = dashboard.run_until_settled(limit) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, printing current state");
            Ok(())
        }
    };
    if let Err(e) = settled {
        warn!(error = %e, "dashboard did not settle");
    }

    let snapshot = dashboard.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    let failed = snapshot.iter().filter(|t| t.status.error.is_some()).count();
    info!(tiles = snapshot.len(), failed, "done");
    Ok(())
}
