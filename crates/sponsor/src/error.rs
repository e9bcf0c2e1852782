use std::{path::PathBuf, time::Duration};

use alloy_primitives::{B256, U256};
use gasbank_chain::ChainError;

/// Estimation failures, recovered into a value so callers can branch on the kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EstimateError {
    /// The call fails against current state. Caller-side problem, never retried.
    #[error("transaction simulation reverted: {reason}")]
    SimulationReverted { reason: String },
    /// Timeout or connectivity failure; the whole request can be retried.
    #[error("chain rpc unavailable: {0}")]
    RpcTransient(ChainError),
}

impl From<ChainError> for EstimateError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Reverted(reason) => Self::SimulationReverted { reason },
            other => Self::RpcTransient(other),
        }
    }
}

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    Cooldown,
    DailyLimit,
    GlobalThroughput,
}

impl std::fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Cooldown => "recipient was sponsored recently",
            Self::DailyLimit => "daily sponsorship limit reached for recipient",
            Self::GlobalThroughput => "sponsorship throughput limit reached",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sponsorship record {0} already exists")]
    Duplicate(B256),
    #[error("sponsorship store i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sponsorship store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Reading the sponsor nonce or chain id failed; nothing was signed.
    #[error("failed to prepare sponsor transaction: {0}")]
    Prepare(ChainError),
    #[error("failed to sign sponsor transaction: {0}")]
    Signing(String),
    /// The node refused the transaction or never received it. The nonce was released.
    #[error("sponsor transaction was not accepted: {0}")]
    Rejected(ChainError),
}

/// Everything [`crate::SponsorshipDecisionEngine`] can fail with.
#[derive(Debug, thiserror::Error)]
pub enum SponsorError {
    #[error(transparent)]
    Estimate(#[from] EstimateError),
    #[error("{reason}, retry in {}s", retry_after_secs(*retry_after))]
    RateLimited {
        reason: RateLimitReason,
        retry_after: Duration,
    },
    #[error("required sponsorship of {requested} wei exceeds the {cap} wei limit")]
    SponsorshipCapExceeded { requested: U256, cap: U256 },
    /// Operational condition: the sponsor cannot help right now.
    #[error("gas sponsorship temporarily unavailable: {0}")]
    SponsorWalletUnavailable(String),
    #[error("chain rpc unavailable: {0}")]
    RpcTransient(ChainError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SponsorError {
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Whole seconds to wait, rounded up so a hint is never zero while a wait remains.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_errors_split_into_estimate_kinds() {
        assert_eq!(
            EstimateError::from(ChainError::Reverted("paused".into())),
            EstimateError::SimulationReverted {
                reason: "paused".into()
            }
        );
        assert!(matches!(
            EstimateError::from(ChainError::Timeout(Duration::from_secs(5))),
            EstimateError::RpcTransient(ChainError::Timeout(_))
        ));
    }

    #[test]
    fn rate_limit_message_carries_hint() {
        let err = SponsorError::RateLimited {
            reason: RateLimitReason::Cooldown,
            retry_after: Duration::from_millis(120_500),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(120_500)));
        assert_eq!(
            err.to_string(),
            "recipient was sponsored recently, retry in 121s"
        );
    }
}
