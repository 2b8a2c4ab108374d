//! Configuration for price_watch_rust

use anyhow::{anyhow, Context, Result};
use rebase_core::{PriceCacheConfig, TokenAddress};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Tokens to keep priced (WETH is always included)
    pub addresses: Vec<TokenAddress>,
    pub interval: Duration,
    pub cache: PriceCacheConfig,
}

impl WatchConfig {
    pub fn from_env() -> Result<Self> {
        let raw = env::var("PRICE_WATCH_ADDRESSES")
            .map_err(|_| anyhow!("PRICE_WATCH_ADDRESSES must be set"))?;
        let addresses = parse_watch_list(&raw)?;

        let interval_secs = match env::var("PRICE_WATCH_INTERVAL_SECS") {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|_| anyhow!("PRICE_WATCH_INTERVAL_SECS must be a valid u64"))?,
            Err(_) => 60,
        };
        if interval_secs == 0 {
            return Err(anyhow!("PRICE_WATCH_INTERVAL_SECS must be > 0"));
        }

        Ok(Self {
            addresses,
            interval: Duration::from_secs(interval_secs),
            cache: PriceCacheConfig::from_env()?,
        })
    }
}

/// Parse a comma separated watch list, appending WETH if it is not there.
pub fn parse_watch_list(raw: &str) -> Result<Vec<TokenAddress>> {
    let mut addresses = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let address = TokenAddress::parse(item)
            .with_context(|| format!("PRICE_WATCH_ADDRESSES contains {:?}", item))?;
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }

    let weth = TokenAddress::weth_base();
    if !addresses.contains(&weth) {
        addresses.push(weth);
    }
    Ok(addresses)
}
