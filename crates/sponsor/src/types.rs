//! Data model shared by the sponsorship components and the HTTP surface.

use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::units::format_native;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Gas limit with `buffer_percent` headroom over the simulated amount, rounded up.
pub fn buffered_gas_limit(raw_gas: u64, buffer_percent: u64) -> u64 {
    let scaled = u128::from(raw_gas) * u128::from(100 + buffer_percent);
    u64::try_from(scaled.div_ceil(100)).unwrap_or(u64::MAX)
}

/// EIP-1559 fee parameters derived from the latest block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasPrices {
    pub base_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub max_fee_per_gas: u128,
}

impl GasPrices {
    /// Allows one full base-fee doubling between quoting and inclusion.
    pub fn from_fees(base_fee_per_gas: u128, max_priority_fee_per_gas: u128) -> Self {
        Self {
            base_fee_per_gas,
            max_priority_fee_per_gas,
            max_fee_per_gas: base_fee_per_gas
                .saturating_mul(2)
                .saturating_add(max_priority_fee_per_gas),
        }
    }
}

/// A buffered fee quote for one simulated call. Never cached.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasQuote {
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub total_cost_wei: U256,
    pub total_cost_native: String,
}

impl GasQuote {
    pub fn new(raw_gas: u64, prices: GasPrices, buffer_percent: u64) -> Self {
        let gas_limit = buffered_gas_limit(raw_gas, buffer_percent);
        let total_cost_wei = U256::from(gas_limit) * U256::from(prices.max_fee_per_gas);
        Self {
            gas_limit,
            max_fee_per_gas: prices.max_fee_per_gas,
            max_priority_fee_per_gas: prices.max_priority_fee_per_gas,
            total_cost_wei,
            total_cost_native: format_native(total_cost_wei),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SponsorshipStatus {
    Pending,
    Confirmed,
    Failed,
}

impl SponsorshipStatus {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Audit entry for one sponsor transfer. Records are never deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorshipRecord {
    pub id: B256,
    #[serde(rename = "recipientAddress")]
    pub recipient: Address,
    pub amount_sponsored_wei: U256,
    pub sponsor_tx_hash: B256,
    /// Sponsor-account nonce the transfer was signed with.
    pub nonce: u64,
    pub status: SponsorshipStatus,
    pub gas_quote: GasQuote,
    pub target_contract: Address,
    pub user_balance_before: U256,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<u64>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SponsorshipRecord {
    /// Age in seconds at `now`, zero for records stamped in the future.
    pub const fn age_at(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    pub fn confirm(&mut self, now: u64) {
        self.status = SponsorshipStatus::Confirmed;
        self.confirmed_at = Some(now);
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = SponsorshipStatus::Failed;
        self.failure_reason = Some(reason.into());
    }
}

/// Outcome of [`crate::SponsorshipDecisionEngine::check_and_sponsor`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorshipResult {
    pub user_had_sufficient_gas: bool,
    pub gas_sponsored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_sponsored_wei: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_sponsored: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sponsor_tx_hash: Option<B256>,
    pub gas_quote: GasQuote,
    pub message: String,
}

/// Aggregate over confirmed sponsorships in a time window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorshipStats {
    pub total_sponsored_wei: U256,
    pub total_sponsored: String,
    pub total_count: usize,
    pub unique_users: usize,
    pub average_amount_wei: U256,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendWalletStatus {
    pub address: Address,
    pub balance_wei: U256,
    pub balance: String,
    /// `None` until the first dispatch has read the nonce from the chain.
    pub next_nonce: Option<u64>,
    pub is_low: bool,
}
