//! Canonical EVM token addresses.
//!
//! Input is accepted in any letter case, with or without the `0x` prefix.
//! Output is always EIP-55 checksum case, so `0xabc...` and `0xABC...`
//! collapse to the same value and the same cache key.

use crate::error::{PriceError, Result};
use ethers::types::{Address, H160};
use ethers::utils::to_checksum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wrapped ether on Base, the quote side of Rebase LP positions.
pub const WETH_BASE: &str = "0x4200000000000000000000000000000000000006";

/// A normalized ERC-20 token address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenAddress(Address);

impl TokenAddress {
    /// Parse and normalize an address string.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if hex.len() != 40 {
            return Err(PriceError::invalid_address(
                input,
                format!("expected 40 hex digits, got {}", hex.len()),
            ));
        }
        if let Some(bad) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(PriceError::invalid_address(
                input,
                format!("non-hex character {:?}", bad),
            ));
        }

        Address::from_str(hex)
            .map(Self)
            .map_err(|e| PriceError::invalid_address(input, e.to_string()))
    }

    /// [`WETH_BASE`] without a runtime parse.
    pub const fn weth_base() -> Self {
        let mut bytes = [0u8; 20];
        bytes[19] = 0x06;
        Self(H160(bytes))
    }

    pub fn from_address(address: Address) -> Self {
        Self(address)
    }

    pub fn as_address(&self) -> &Address {
        &self.0
    }

    /// EIP-55 checksum form, e.g. `0x4200000000000000000000000000000000000006`.
    pub fn checksum(&self) -> String {
        to_checksum(&self.0, None)
    }

    /// Lowercase form used in upstream request paths.
    pub fn to_lowercase_hex(&self) -> String {
        format!("{:#x}", self.0)
    }

    /// Short display form: `0xAbCd...1234`.
    pub fn short(&self) -> String {
        let s = self.checksum();
        format!("{}...{}", &s[..6], &s[s.len() - 4..])
    }
}

impl fmt::Display for TokenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.checksum())
    }
}

impl FromStr for TokenAddress {
    type Err = PriceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TokenAddress {
    type Error = PriceError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TokenAddress> for String {
    fn from(value: TokenAddress) -> Self {
        value.checksum()
    }
}

impl From<Address> for TokenAddress {
    fn from(value: Address) -> Self {
        Self(value)
    }
}

/// Normalize a list of address strings, failing on the first malformed one.
pub fn parse_addresses<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<TokenAddress>> {
    inputs.iter().map(|s| TokenAddress::parse(s.as_ref())).collect()
}
