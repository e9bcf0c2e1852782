//! The narrow slice of an EVM JSON-RPC node the sponsorship service relies on.
//!
//! Everything that touches the chain goes through [`ChainClient`], so the
//! estimation, dispatch and reconciliation logic can be exercised against
//! [`test_utils::MockChain`] without a node.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::time::Duration;

use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod rpc;
pub use rpc::RpcChainClient;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// A contract call to simulate, already ABI-encoded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// Account the call is simulated from.
    pub from: Address,
    /// Target contract.
    pub to: Address,
    /// Selector and encoded arguments.
    pub input: Bytes,
    /// Native value attached to the call.
    pub value: U256,
}

/// Outcome of a mined transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptStatus {
    pub success: bool,
    pub block_number: Option<u64>,
}

/// Which view of the account nonce to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NonceTag {
    /// Transactions included in the latest block.
    Latest,
    /// Latest plus whatever the node holds in its mempool.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// The simulated call reverts against current state.
    #[error("execution reverted: {0}")]
    Reverted(String),
    /// The node answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// The request never produced a response (connection refused, bad body...).
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc call timed out after {0:?}")]
    Timeout(Duration),
}

impl ChainError {
    /// Whether the request may have reached the node even though no answer came back.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub const fn is_revert(&self) -> bool {
        matches!(self, Self::Reverted(_))
    }
}

/// Chain access needed by estimation, dispatch and reconciliation.
///
/// Every method is an I/O suspension point and implementations must bound it
/// with a timeout, reporting [`ChainError::Timeout`] when it elapses.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Simulates `call` and returns the gas it consumed.
    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, ChainError>;

    /// Base fee of the latest block, `None` before fee-market activation.
    async fn latest_base_fee(&self) -> Result<Option<u128>, ChainError>;

    /// Suggested priority fee per gas.
    async fn max_priority_fee(&self) -> Result<u128, ChainError>;

    async fn balance(&self, address: Address) -> Result<U256, ChainError>;

    /// Receipt of `tx_hash`, `None` while it is not mined.
    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptStatus>, ChainError>;

    /// Broadcasts an EIP-2718 encoded signed transaction.
    async fn send_raw_transaction(&self, encoded: Bytes) -> Result<B256, ChainError>;

    async fn nonce(&self, address: Address, tag: NonceTag) -> Result<u64, ChainError>;

    async fn chain_id(&self) -> Result<u64, ChainError>;
}
