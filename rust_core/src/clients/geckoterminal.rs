//! GeckoTerminal API Client
//!
//! Fetches USD spot prices for ERC-20 tokens by contract address from the
//! `simple/networks/{network}/token_price/{addresses}` endpoint.

use crate::address::TokenAddress;
use crate::clients::price_source::PriceSource;
use crate::config::PriceCacheConfig;
use crate::error::{PriceError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// GeckoTerminal simple token price client
pub struct GeckoTerminalClient {
    client: Client,
    base_url: String,
    network: String,
}

/// Envelope of the `/simple/networks/{network}/token_price` response
#[derive(Debug, Deserialize)]
struct SimpleTokenPriceResponse {
    data: SimpleTokenPriceData,
}

#[derive(Debug, Deserialize)]
struct SimpleTokenPriceData {
    attributes: SimpleTokenPriceAttributes,
}

#[derive(Debug, Deserialize)]
struct SimpleTokenPriceAttributes {
    #[serde(default)]
    token_prices: HashMap<String, Option<PriceValue>>,
}

/// Prices arrive as decimal strings, but numbers show up too
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PriceValue {
    Number(f64),
    Text(String),
}

impl PriceValue {
    fn as_f64(&self) -> Option<f64> {
        let value = match self {
            PriceValue::Number(n) => *n,
            PriceValue::Text(s) => s.trim().parse().ok()?,
        };
        (value.is_finite() && value >= 0.0).then_some(value)
    }
}

impl GeckoTerminalClient {
    /// Create a client with the default endpoint (Base network)
    pub fn new() -> Result<Self> {
        Self::from_config(&PriceCacheConfig::default())
    }

    pub fn from_config(config: &PriceCacheConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            network: config.network.clone(),
        })
    }

    /// Build the request URL for a batch of addresses
    pub fn token_price_url(&self, addresses: &[TokenAddress]) -> String {
        let joined = addresses
            .iter()
            .map(TokenAddress::to_lowercase_hex)
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "{}/simple/networks/{}/token_price/{}",
            self.base_url, self.network, joined
        )
    }
}

/// Decode a token price payload into normalized addresses.
///
/// Entries with unparseable keys, null prices or non-numeric prices are
/// dropped and treated as missing by the cache.
pub fn parse_token_prices(body: &str) -> Result<HashMap<TokenAddress, f64>> {
    let response: SimpleTokenPriceResponse =
        serde_json::from_str(body).map_err(|e| PriceError::Decode(e.to_string()))?;

    let mut prices = HashMap::with_capacity(response.data.attributes.token_prices.len());
    for (key, value) in response.data.attributes.token_prices {
        let address = match TokenAddress::parse(&key) {
            Ok(address) => address,
            Err(e) => {
                warn!("Skipping price entry with bad key: {}", e);
                continue;
            }
        };

        match value.as_ref().and_then(PriceValue::as_f64) {
            Some(price) => {
                prices.insert(address, price);
            }
            None => debug!("No usable price for {} ({:?})", address, value),
        }
    }

    Ok(prices)
}

#[async_trait]
impl PriceSource for GeckoTerminalClient {
    fn name(&self) -> &str {
        "GeckoTerminal"
    }

    async fn fetch_prices(&self, addresses: &[TokenAddress]) -> Result<HashMap<TokenAddress, f64>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }

        let url = self.token_price_url(addresses);
        debug!("Fetching prices for {} tokens from GeckoTerminal", addresses.len());

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PriceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        parse_token_prices(&body)
    }
}
