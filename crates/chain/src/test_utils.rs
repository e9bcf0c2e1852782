//! In-process [`ChainClient`] with scripted answers.

use std::collections::HashMap;

use alloy::{
    consensus::{Transaction as _, TxEnvelope},
    eips::eip2718::Decodable2718,
};
use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{CallRequest, ChainClient, ChainError, NonceTag, ReceiptStatus};

pub const MOCK_CHAIN_ID: u64 = 1337;

/// How [`MockChain::send_raw_transaction`] answers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SendMode {
    #[default]
    Accept,
    /// The request times out; the transaction may or may not have landed.
    Timeout,
    /// The node refuses the transaction with an RPC error.
    Reject(String),
    /// The connection fails before anything reaches the node.
    Unreachable,
}

/// A transaction the mock accepted for broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentTransaction {
    pub hash: B256,
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: Option<u128>,
}

#[derive(Debug)]
struct MockState {
    raw_gas: u64,
    revert: Option<String>,
    reverting_targets: HashMap<Address, String>,
    base_fee: Option<u128>,
    priority_fee: u128,
    balances: HashMap<Address, U256>,
    receipts: HashMap<B256, ReceiptStatus>,
    mined_nonces: HashMap<Address, u64>,
    pending_nonces: HashMap<Address, u64>,
    send_mode: SendMode,
    unreachable: bool,
    sent: Vec<SentTransaction>,
    estimate_calls: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            raw_gas: 100_000,
            revert: None,
            reverting_targets: HashMap::new(),
            base_fee: Some(1_000_000_000),
            priority_fee: 1_000_000_000,
            balances: HashMap::new(),
            receipts: HashMap::new(),
            mined_nonces: HashMap::new(),
            pending_nonces: HashMap::new(),
            send_mode: SendMode::Accept,
            unreachable: false,
            sent: Vec::new(),
            estimate_calls: 0,
        }
    }
}

/// Scriptable chain. Every setter takes `&self` so a shared `Arc<MockChain>`
/// can be re-scripted while components hold it.
#[derive(Debug, Default)]
pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_raw_gas(&self, gas: u64) {
        self.state.lock().raw_gas = gas;
    }

    /// Makes every simulation revert with `reason`, or stop reverting with `None`.
    pub fn set_revert(&self, reason: Option<&str>) {
        self.state.lock().revert = reason.map(str::to_owned);
    }

    /// Makes simulations against `target` revert with `reason`.
    pub fn set_revert_for(&self, target: Address, reason: &str) {
        self.state
            .lock()
            .reverting_targets
            .insert(target, reason.to_owned());
    }

    pub fn set_base_fee(&self, base_fee: Option<u128>) {
        self.state.lock().base_fee = base_fee;
    }

    pub fn set_priority_fee(&self, priority_fee: u128) {
        self.state.lock().priority_fee = priority_fee;
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state.lock().balances.insert(address, balance);
    }

    pub fn set_receipt(&self, tx_hash: B256, success: bool) {
        self.state.lock().receipts.insert(
            tx_hash,
            ReceiptStatus {
                success,
                block_number: Some(1),
            },
        );
    }

    /// Sets the nonce reported for mined transactions of `address`.
    pub fn set_mined_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().mined_nonces.insert(address, nonce);
    }

    /// Sets the nonce the mempool reports for `address`. Never below the
    /// mined nonce.
    pub fn set_pending_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().pending_nonces.insert(address, nonce);
    }

    pub fn set_send_mode(&self, mode: SendMode) {
        self.state.lock().send_mode = mode;
    }

    /// Makes every call fail with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Transactions the node has seen, in arrival order. Timed-out sends are
    /// included because they did reach the node.
    pub fn sent(&self) -> Vec<SentTransaction> {
        self.state.lock().sent.clone()
    }

    pub fn estimate_calls(&self) -> usize {
        self.state.lock().estimate_calls
    }

    fn ensure_reachable(&self) -> Result<(), ChainError> {
        if self.state.lock().unreachable {
            return Err(ChainError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

fn decode(encoded: &Bytes) -> Result<SentTransaction, ChainError> {
    let envelope = TxEnvelope::decode_2718(&mut encoded.as_ref()).map_err(|err| {
        ChainError::Rpc {
            code: -32602,
            message: format!("invalid raw transaction: {err}"),
        }
    })?;

    Ok(SentTransaction {
        hash: *envelope.tx_hash(),
        nonce: envelope.nonce(),
        to: envelope.to(),
        value: envelope.value(),
        gas_limit: envelope.gas_limit(),
        max_fee_per_gas: envelope.max_fee_per_gas(),
        max_priority_fee_per_gas: envelope.max_priority_fee_per_gas(),
    })
}

#[async_trait]
impl ChainClient for MockChain {
    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, ChainError> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        state.estimate_calls += 1;
        let revert = state
            .revert
            .as_ref()
            .or_else(|| state.reverting_targets.get(&call.to));
        match revert {
            Some(reason) => Err(ChainError::Reverted(reason.clone())),
            None => Ok(state.raw_gas),
        }
    }

    async fn latest_base_fee(&self) -> Result<Option<u128>, ChainError> {
        self.ensure_reachable()?;
        Ok(self.state.lock().base_fee)
    }

    async fn max_priority_fee(&self) -> Result<u128, ChainError> {
        self.ensure_reachable()?;
        Ok(self.state.lock().priority_fee)
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        self.ensure_reachable()?;
        Ok(self
            .state
            .lock()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptStatus>, ChainError> {
        self.ensure_reachable()?;
        Ok(self.state.lock().receipts.get(&tx_hash).copied())
    }

    async fn send_raw_transaction(&self, encoded: Bytes) -> Result<B256, ChainError> {
        // Let concurrent callers interleave the way a real round-trip would.
        tokio::task::yield_now().await;

        let mode = self.state.lock().send_mode.clone();
        match mode {
            SendMode::Unreachable => Err(ChainError::Transport("connection refused".into())),
            SendMode::Reject(message) => Err(ChainError::Rpc {
                code: -32000,
                message,
            }),
            SendMode::Accept | SendMode::Timeout => {
                let tx = decode(&encoded)?;
                let hash = tx.hash;
                self.state.lock().sent.push(tx);
                if mode == SendMode::Timeout {
                    return Err(ChainError::Timeout(std::time::Duration::from_secs(10)));
                }
                Ok(hash)
            }
        }
    }

    async fn nonce(&self, address: Address, tag: NonceTag) -> Result<u64, ChainError> {
        self.ensure_reachable()?;
        let state = self.state.lock();
        let mined = state.mined_nonces.get(&address).copied().unwrap_or_default();
        Ok(match tag {
            NonceTag::Latest => mined,
            NonceTag::Pending => state
                .pending_nonces
                .get(&address)
                .map_or(mined, |pending| (*pending).max(mined)),
        })
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.ensure_reachable()?;
        Ok(MOCK_CHAIN_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::{
        consensus::{SignableTransaction, TxEip1559},
        eips::eip2718::Encodable2718,
        network::TxSignerSync,
        primitives::TxKind,
        signers::local::PrivateKeySigner,
    };

    fn signed_transfer(nonce: u64) -> eyre::Result<Bytes> {
        let signer = PrivateKeySigner::random();
        let mut tx = TxEip1559 {
            chain_id: MOCK_CHAIN_ID,
            nonce,
            gas_limit: 21_000,
            max_fee_per_gas: 3,
            max_priority_fee_per_gas: 1,
            to: TxKind::Call(Address::repeat_byte(0x22)),
            value: U256::from(7),
            access_list: Default::default(),
            input: Bytes::new(),
        };
        let sig = signer.sign_transaction_sync(&mut tx)?;
        Ok(TxEnvelope::Eip1559(tx.into_signed(sig)).encoded_2718().into())
    }

    #[tokio::test]
    async fn records_accepted_transactions() -> eyre::Result<()> {
        let chain = MockChain::new();
        let hash = chain.send_raw_transaction(signed_transfer(4)?).await?;

        let sent = chain.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].hash, hash);
        assert_eq!(sent[0].nonce, 4);
        assert_eq!(sent[0].value, U256::from(7));
        Ok(())
    }

    #[tokio::test]
    async fn timed_out_send_still_reaches_node() -> eyre::Result<()> {
        let chain = MockChain::new();
        chain.set_send_mode(SendMode::Timeout);

        let err = chain
            .send_raw_transaction(signed_transfer(0)?)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(chain.sent().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn scripted_revert() {
        let chain = MockChain::new();
        chain.set_revert(Some("ERC20: insufficient allowance"));
        let err = chain
            .estimate_gas(&CallRequest::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ChainError::Reverted("ERC20: insufficient allowance".into())
        );
    }
}
