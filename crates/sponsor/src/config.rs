//! Tunables for the sponsorship components.

use std::time::Duration;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

/// Gas of a plain native-token transfer.
pub const TRANSFER_GAS: u64 = 21_000;

const ONE_NATIVE: u128 = 1_000_000_000_000_000_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EstimatorConfig {
    /// Headroom added on top of the simulated gas, in percent.
    pub buffer_percent: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self { buffer_percent: 20 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Minimum spacing between two sponsorships of the same recipient.
    pub cooldown_secs: u64,
    /// Sponsorships allowed per rolling minute across all recipients.
    pub global_per_minute: Option<u32>,
    /// Sponsorships allowed per recipient in a rolling 24 hours.
    pub daily_per_recipient: Option<u32>,
}

impl RateLimitConfig {
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            global_per_minute: Some(30),
            daily_per_recipient: Some(10),
        }
    }
}

/// Limits on what the sponsor wallet is allowed to spend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SponsorPolicy {
    /// Largest single transfer; `None` disables the cap.
    pub max_sponsorship_wei: Option<U256>,
    /// Balance the sponsor keeps back on top of each transfer and its gas.
    pub reserve_wei: U256,
    /// Sponsor balance below which a warning is logged.
    pub low_balance_threshold_wei: U256,
}

impl Default for SponsorPolicy {
    fn default() -> Self {
        Self {
            max_sponsorship_wei: Some(U256::from(ONE_NATIVE / 10)),
            reserve_wei: U256::ZERO,
            low_balance_threshold_wei: U256::from(ONE_NATIVE),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    /// Pending records younger than this are not polled yet.
    pub min_age_secs: u64,
    /// Pending records without a receipt past this age are failed.
    pub timeout_secs: u64,
}

impl ReconcilerConfig {
    /// Never zero; a zero `interval_secs` polls every second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            min_age_secs: 15,
            timeout_secs: 600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() -> eyre::Result<()> {
        let config: RateLimitConfig = serde_json::from_str(r#"{"cooldownSecs": 60}"#)?;
        assert_eq!(config.cooldown(), Duration::from_secs(60));
        assert_eq!(config.daily_per_recipient, Some(10));

        let estimator: EstimatorConfig = serde_json::from_str("{}")?;
        assert_eq!(estimator.buffer_percent, 20);
        Ok(())
    }

    #[test]
    fn reconcile_interval_is_never_zero() -> eyre::Result<()> {
        let config: ReconcilerConfig = serde_json::from_str(r#"{"intervalSecs": 0}"#)?;
        assert_eq!(config.interval(), Duration::from_secs(1));
        assert_eq!(ReconcilerConfig::default().interval(), Duration::from_secs(30));
        Ok(())
    }
}
