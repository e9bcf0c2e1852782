//! [`ChainClient`] over an HTTP JSON-RPC endpoint.

use std::{future::IntoFuture, time::Duration};

use alloy::{
    eips::BlockNumberOrTag,
    network::ReceiptResponse as _,
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    transports::{TransportError, http::reqwest::Url},
};
use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::{CallRequest, ChainClient, ChainError, NonceTag, ReceiptStatus};

/// JSON-RPC error code geth-style nodes use for reverted `eth_call`/`eth_estimateGas`.
const EXECUTION_REVERTED_CODE: i64 = 3;

/// Client for an EVM-compatible node with every request bounded by `timeout`.
#[derive(Clone)]
pub struct RpcChainClient {
    provider: DynProvider,
    timeout: Duration,
}

impl RpcChainClient {
    /// Create a client for `rpc_url`. No request is made until first use.
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self, ChainError> {
        let url: Url = rpc_url
            .parse()
            .map_err(|err| ChainError::Transport(format!("invalid rpc url `{rpc_url}`: {err}")))?;

        let provider = ProviderBuilder::new().connect_http(url).erased();

        info!(rpc_url = %rpc_url, timeout = ?timeout, "Configured chain client");

        Ok(Self { provider, timeout })
    }

    async fn timed<F, T>(&self, request: F) -> Result<T, ChainError>
    where
        F: IntoFuture<Output = Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(ChainError::Timeout(self.timeout)),
        }
    }
}

/// Maps alloy transport failures onto the service's error kinds.
fn classify(err: TransportError) -> ChainError {
    if let Some(payload) = err.as_error_resp() {
        let message = payload.message.to_string();
        if payload.code == EXECUTION_REVERTED_CODE || message.to_lowercase().contains("revert") {
            return ChainError::Reverted(message);
        }
        return ChainError::Rpc {
            code: payload.code,
            message,
        };
    }
    ChainError::Transport(err.to_string())
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, ChainError> {
        let tx = TransactionRequest::default()
            .from(call.from)
            .to(call.to)
            .value(call.value)
            .input(call.input.clone().into());

        let gas = self.timed(self.provider.estimate_gas(tx)).await?;
        debug!(to = %call.to, gas, "Simulated call");
        Ok(gas)
    }

    async fn latest_base_fee(&self) -> Result<Option<u128>, ChainError> {
        let block = self
            .timed(self.provider.get_block_by_number(BlockNumberOrTag::Latest))
            .await?;

        Ok(block.and_then(|block| block.header.base_fee_per_gas.map(u128::from)))
    }

    async fn max_priority_fee(&self) -> Result<u128, ChainError> {
        self.timed(self.provider.get_max_priority_fee_per_gas()).await
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        self.timed(self.provider.get_balance(address)).await
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptStatus>, ChainError> {
        let receipt = self
            .timed(self.provider.get_transaction_receipt(tx_hash))
            .await?;

        Ok(receipt.map(|receipt| ReceiptStatus {
            success: receipt.status(),
            block_number: receipt.block_number,
        }))
    }

    async fn send_raw_transaction(&self, encoded: Bytes) -> Result<B256, ChainError> {
        let pending = self
            .timed(self.provider.send_raw_transaction(&encoded))
            .await?;

        Ok(*pending.tx_hash())
    }

    async fn nonce(&self, address: Address, tag: NonceTag) -> Result<u64, ChainError> {
        let request = self.provider.get_transaction_count(address);
        match tag {
            NonceTag::Latest => self.timed(request.latest()).await,
            NonceTag::Pending => self.timed(request.pending()).await,
        }
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.timed(self.provider.get_chain_id()).await
    }
}
