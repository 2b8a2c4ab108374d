//! Token Price Source Trait
//!
//! The upstream seam of the price cache. Implementations turn a batch of
//! token addresses into USD spot prices with a single request.

use crate::address::TokenAddress;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Common trait for token price data sources
///
/// Implementations must be Send + Sync so a cache can share one source
/// across spawned fetch tasks.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Display name for logging (e.g., "GeckoTerminal")
    fn name(&self) -> &str;

    /// Fetch USD prices for a batch of addresses in one request
    ///
    /// # Returns
    /// * `Ok(map)` - Prices for the addresses the upstream knows (missing ones excluded)
    /// * `Err` - Transport, status or decode failure for the whole batch
    async fn fetch_prices(&self, addresses: &[TokenAddress]) -> Result<HashMap<TokenAddress, f64>>;
}
