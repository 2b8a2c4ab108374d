//! Configuration for the token price cache.
//!
//! Defaults match the Rebase frontend: 30 minute TTL, 30 addresses per
//! upstream request, GeckoTerminal on the Base network.

use crate::error::PriceError;
use anyhow::{anyhow, Result};
use std::env;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 30;
pub const DEFAULT_BASE_URL: &str = "https://api.geckoterminal.com/api/v2";
pub const DEFAULT_NETWORK: &str = "base";

#[derive(Debug, Clone)]
pub struct PriceCacheConfig {
    /// How long a fetched price stays fresh (default: 1800 seconds)
    pub ttl_secs: u64,
    /// Maximum addresses per upstream request (default: 30)
    pub max_batch_size: usize,
    /// Price API root (default: GeckoTerminal v2)
    pub base_url: String,
    /// Network slug in the price API path (default: "base")
    pub network: String,
    /// HTTP request timeout (default: 30 seconds)
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for PriceCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            base_url: DEFAULT_BASE_URL.to_string(),
            network: DEFAULT_NETWORK.to_string(),
            request_timeout_secs: 30,
            user_agent: "Rebase/1.0".to_string(),
        }
    }
}

impl PriceCacheConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            ttl_secs: parse_u64("PRICE_CACHE_TTL_SECS", defaults.ttl_secs)?,
            max_batch_size: parse_usize("PRICE_BATCH_SIZE", defaults.max_batch_size)?,
            base_url: env::var("PRICE_API_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            network: env::var("PRICE_API_NETWORK").unwrap_or(defaults.network),
            request_timeout_secs: parse_u64("PRICE_API_TIMEOUT_SECS", defaults.request_timeout_secs)?,
            user_agent: defaults.user_agent,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), PriceError> {
        if self.ttl_secs == 0 {
            return Err(PriceError::Config("ttl_secs must be > 0".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(PriceError::Config("max_batch_size must be > 0".to_string()));
        }
        if self.base_url.is_empty() {
            return Err(PriceError::Config("base_url must not be empty".to_string()));
        }
        if self.network.is_empty() {
            return Err(PriceError::Config("network must not be empty".to_string()));
        }
        if self.ttl_delta().is_none() {
            return Err(PriceError::Config(format!(
                "ttl_secs {} is out of range",
                self.ttl_secs
            )));
        }
        Ok(())
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl_delta().unwrap_or(chrono::Duration::MAX)
    }

    fn ttl_delta(&self) -> Option<chrono::Duration> {
        i64::try_from(self.ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Log current configuration (useful at startup)
    pub fn log_config(&self) {
        info!("PriceCacheConfig loaded:");
        info!("  ttl: {}s", self.ttl_secs);
        info!("  max_batch_size: {}", self.max_batch_size);
        info!("  endpoint: {}/simple/networks/{}/token_price", self.base_url, self.network);
        info!("  request_timeout: {}s", self.request_timeout_secs);
    }
}

fn parse_u64(var_name: &str, default: u64) -> Result<u64> {
    match env::var(var_name) {
        Ok(val) => val
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} must be a valid u64", var_name)),
        Err(_) => Ok(default),
    }
}

fn parse_usize(var_name: &str, default: usize) -> Result<usize> {
    match env::var(var_name) {
        Ok(val) => val
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} must be a valid usize", var_name)),
        Err(_) => Ok(default),
    }
}
