//! Rebase Core - token prices and USD valuation for the Rebase staking app.
//!
//! This module provides:
//! - Canonical EVM token addresses (case-insensitive in, EIP-55 out)
//! - A TTL price cache with batched, deduplicated upstream fetches
//! - A GeckoTerminal price source
//! - TVL, LP APY and reward APR helpers over cached prices
//!
//! Staking, reward accrual and pool deployment live on-chain; this crate
//! only reads prices and does display arithmetic.

pub mod address;
pub mod clients;
pub mod clock;
pub mod config;
pub mod error;
pub mod price_cache;
pub mod valuation;

pub use address::{TokenAddress, WETH_BASE};
pub use clients::{GeckoTerminalClient, PriceSource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PriceCacheConfig;
pub use error::{PriceError, Result};
pub use price_cache::{PriceCache, PriceEntry, PriceQuote, RefreshReport};
