//! Error types for the price cache and its upstream clients.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PriceError {
    /// Address input that is not a 20-byte hex EVM address.
    #[error("Invalid token address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: String },

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Price API error: {status} - {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode price response: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Price fetch task failed: {0}")]
    TaskFailed(String),
}

impl PriceError {
    pub(crate) fn invalid_address(input: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PriceError>;
