mod config;

use crate::config::WatchConfig;
use anyhow::{Context, Result};
use dotenv::dotenv;
use rebase_core::{PriceCache, PriceQuote};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("Starting price_watch_rust...");

    let config = WatchConfig::from_env()?;
    config.cache.log_config();
    info!(
        "Watching {} tokens every {}s",
        config.addresses.len(),
        config.interval.as_secs()
    );

    let cache = PriceCache::geckoterminal(config.cache.clone())
        .context("Failed to initialize price cache")?;

    let mut ticker = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                refresh_once(&cache, &config).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down price_watch_rust");
                break;
            }
        }
    }

    Ok(())
}

async fn refresh_once(cache: &PriceCache, config: &WatchConfig) {
    let report = cache.refresh(&config.addresses).await;

    if let Some(error) = &report.error {
        warn!("Price refresh from {} failed: {}", cache.source_name(), error);
    }
    if !report.deferred.is_empty() {
        info!("{} tokens deferred to the next cycle", report.deferred.len());
    }

    for address in &config.addresses {
        match cache.quote(address) {
            PriceQuote::Fresh { price } => info!("{} ${}", address, price),
            PriceQuote::Stale { price, failures } => {
                warn!("{} ${} (stale, {} failed refreshes)", address, price, failures)
            }
            PriceQuote::Unknown { failures } => {
                warn!("{} price unknown ({} failed refreshes)", address, failures)
            }
        }
    }

    match serde_json::to_string(&report.prices) {
        Ok(json) => info!("Cache snapshot: {}", json),
        Err(e) => warn!("Failed to serialize cache snapshot: {}", e),
    }
}
