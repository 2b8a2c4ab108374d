//! USD valuation of staked balances and reward streams.
//!
//! On-chain quantities arrive as raw `U256` integers plus token decimals.
//! Prices come from the [`PriceCache`]; an unknown price yields `None` (or an
//! entry in `TvlSummary::unpriced`) so the UI can render "price unknown"
//! instead of a misleading zero.

use crate::address::TokenAddress;
use crate::price_cache::PriceCache;
use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};

pub const SECONDS_PER_YEAR: u64 = 31_536_000;

/// WETH always has 18 decimals
pub const WETH_DECIMALS: u8 = 18;

/// Convert a raw on-chain amount into token units.
pub fn to_units(amount: U256, decimals: u8) -> f64 {
    let raw: f64 = amount.to_string().parse().unwrap_or(f64::INFINITY);
    raw / 10f64.powi(i32::from(decimals))
}

pub fn usd_value(amount: U256, decimals: u8, price: Option<f64>) -> Option<f64> {
    price.map(|p| to_units(amount, decimals) * p)
}

/// Tokens held by one staking app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakedBalance {
    pub token: TokenAddress,
    pub amount: U256,
    pub decimals: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TvlSummary {
    /// Sum over balances with a known price
    pub total_usd: f64,
    pub priced: usize,
    /// Tokens whose value could not be included
    pub unpriced: Vec<TokenAddress>,
}

impl TvlSummary {
    pub fn is_complete(&self) -> bool {
        self.unpriced.is_empty()
    }
}

pub fn total_value_locked(cache: &PriceCache, balances: &[StakedBalance]) -> TvlSummary {
    let mut summary = TvlSummary::default();
    for balance in balances {
        match usd_value(balance.amount, balance.decimals, cache.get_price(&balance.token)) {
            Some(usd) => {
                summary.total_usd += usd;
                summary.priced += 1;
            }
            None => {
                if !summary.unpriced.contains(&balance.token) {
                    summary.unpriced.push(balance.token);
                }
            }
        }
    }
    summary
}

/// A project-token/WETH LP position and the rewards streamed to it.
/// Rewards are paid in the project token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LpRewardPosition {
    pub token: TokenAddress,
    pub decimals: u8,
    pub rewards_per_second: U256,
    pub token_amount: U256,
    pub weth_amount: U256,
}

/// Annualized reward yield in percent:
/// `100 * rewards_per_year_usd / (token_side_usd + weth_side_usd)`.
///
/// `None` when either price is unknown. `Some(0.0)` unless rewards, the
/// token side and the WETH side are all positive.
pub fn lp_reward_apy(
    position: &LpRewardPosition,
    token_price: Option<f64>,
    weth_price: Option<f64>,
) -> Option<f64> {
    let token_price = token_price?;
    let weth_price = weth_price?;

    let rewards_per_year = position
        .rewards_per_second
        .saturating_mul(U256::from(SECONDS_PER_YEAR));
    let rewards_usd = to_units(rewards_per_year, position.decimals) * token_price;
    let token_usd = to_units(position.token_amount, position.decimals) * token_price;
    let weth_usd = to_units(position.weth_amount, WETH_DECIMALS) * weth_price;

    if rewards_usd > 0.0 && token_usd > 0.0 && weth_usd > 0.0 {
        Some(100.0 * rewards_usd / (token_usd + weth_usd))
    } else {
        Some(0.0)
    }
}

/// [`lp_reward_apy`] with both prices taken from the cache.
pub fn lp_reward_apy_cached(cache: &PriceCache, position: &LpRewardPosition) -> Option<f64> {
    lp_reward_apy(
        position,
        cache.get_price(&position.token),
        cache.get_price(&TokenAddress::weth_base()),
    )
}

/// Percentage of a reward window that has elapsed, clamped to `[0, 100]`.
/// An empty or inverted window counts as complete.
pub fn reward_progress(start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let window = (end - start).num_milliseconds();
    if window <= 0 {
        return 100.0;
    }
    let elapsed = (now - start).num_milliseconds();
    (elapsed as f64 / window as f64).clamp(0.0, 1.0) * 100.0
}

/// Fixed-size reward pool shared pro rata by stakers of the same token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardCampaign {
    pub reward_total: U256,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_staked: U256,
    pub user_staked: U256,
    pub decimals: u8,
}

/// Return on the user's stake from their share of the rewards still to be
/// paid out, in percent. Zero when the user or the pool has nothing staked.
pub fn shared_reward_apr(campaign: &RewardCampaign, now: DateTime<Utc>) -> f64 {
    let user_staked = to_units(campaign.user_staked, campaign.decimals);
    let total_staked = to_units(campaign.total_staked, campaign.decimals);
    if user_staked <= 0.0 || total_staked <= 0.0 {
        return 0.0;
    }

    let progress = reward_progress(campaign.start, campaign.end, now);
    let remaining = to_units(campaign.reward_total, campaign.decimals) * (1.0 - progress / 100.0);
    let user_reward = remaining * (user_staked / total_staked);

    user_reward / user_staked * 100.0
}
