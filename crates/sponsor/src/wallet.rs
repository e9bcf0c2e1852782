//! The sponsor account: its key, its nonce and the critical section every
//! outgoing sponsor transaction passes through.
//!
//! Dispatch is split in two so callers can persist between signing and
//! broadcasting:
//!
//! ```text
//! reserve_nonce() --> NonceReservation::sign() --> (persist) --> NonceReservation::broadcast()
//! ```
//!
//! The reservation holds the nonce lock for its whole lifetime. The nonce
//! advances only when the node accepts the transaction or the send times out
//! (the transaction may have landed). Dropping the reservation, or a rejected
//! send, leaves it untouched for the next dispatch.

use std::{collections::BTreeMap, sync::Arc};

use alloy::{
    consensus::{SignableTransaction, TxEip1559, TxEnvelope},
    eips::eip2718::Encodable2718,
    network::TxSignerSync,
    signers::local::PrivateKeySigner,
};
use alloy_primitives::{Address, B256, Bytes, TxKind, U256};
use gasbank_chain::{ChainClient, ChainError, NonceTag};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{
    DispatchError,
    config::TRANSFER_GAS,
    types::{BackendWalletStatus, GasQuote},
    units::format_native,
};

#[derive(Debug, Default)]
struct NonceState {
    /// `None` until first read from the chain, and again after the node
    /// reports our view as stale.
    next: Option<u64>,
    chain_id: Option<u64>,
    /// Value and worst-case gas of broadcast transfers, by nonce, until the
    /// chain's mined nonce passes them.
    in_flight: BTreeMap<u64, U256>,
}

/// A signed transaction that has not been broadcast yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hash: B256,
    pub nonce: u64,
    /// Value plus `gas_limit * max_fee_per_gas`.
    pub max_cost: U256,
    pub encoded: Bytes,
}

/// What the node made of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Accepted,
    /// The send timed out; inclusion is unknown until reconciliation.
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub tx_hash: B256,
    pub nonce: u64,
    pub outcome: BroadcastOutcome,
}

pub struct BackendWalletManager {
    signer: PrivateKeySigner,
    chain: Arc<dyn ChainClient>,
    low_balance_threshold: U256,
    nonce: Mutex<NonceState>,
}

impl BackendWalletManager {
    pub fn new(
        signer: PrivateKeySigner,
        chain: Arc<dyn ChainClient>,
        low_balance_threshold: U256,
    ) -> Self {
        Self {
            signer,
            chain,
            low_balance_threshold,
            nonce: Mutex::default(),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Sponsor balance, warning when it has dropped below the threshold.
    pub async fn balance(&self) -> Result<U256, ChainError> {
        let balance = self.chain.balance(self.address()).await?;
        if balance < self.low_balance_threshold {
            warn!(
                address = %self.address(),
                balance = %format_native(balance),
                threshold = %format_native(self.low_balance_threshold),
                "Sponsor wallet balance is low"
            );
        }
        Ok(balance)
    }

    pub async fn status(&self) -> Result<BackendWalletStatus, ChainError> {
        let balance = self.balance().await?;
        let next_nonce = self.nonce.lock().await.next;
        Ok(BackendWalletStatus {
            address: self.address(),
            balance_wei: balance,
            balance: format_native(balance),
            next_nonce,
            is_low: balance < self.low_balance_threshold,
        })
    }

    /// Enters the critical section and pins the nonce the next transaction
    /// will use. Concurrent callers queue here.
    pub async fn reserve_nonce(&self) -> Result<NonceReservation<'_>, DispatchError> {
        let mut state = self.nonce.lock().await;

        let chain_id = match state.chain_id {
            Some(chain_id) => chain_id,
            None => {
                let chain_id = self.chain.chain_id().await.map_err(DispatchError::Prepare)?;
                state.chain_id = Some(chain_id);
                chain_id
            }
        };

        let nonce = match state.next {
            Some(next) => next,
            None => {
                let next = self
                    .chain
                    .nonce(self.address(), NonceTag::Pending)
                    .await
                    .map_err(DispatchError::Prepare)?;
                debug!(address = %self.address(), nonce = next, "Loaded sponsor nonce");
                state.next = Some(next);
                next
            }
        };

        Ok(NonceReservation {
            wallet: self,
            state,
            nonce,
            chain_id,
        })
    }

    /// Signs, broadcasts and releases the nonce in one step, for callers that
    /// persist nothing in between. `build` receives the reserved nonce and
    /// the chain id.
    pub async fn reserve_nonce_and_send<F>(&self, build: F) -> Result<Dispatched, DispatchError>
    where
        F: FnOnce(u64, u64) -> TxEip1559,
    {
        let reservation = self.reserve_nonce().await?;
        let tx = build(reservation.nonce(), reservation.chain_id());
        let signed = reservation.sign(tx)?;
        let outcome = reservation.broadcast(&signed).await?;
        Ok(Dispatched {
            tx_hash: signed.hash,
            nonce: signed.nonce,
            outcome,
        })
    }

    /// Lets `nonce` be used again after its transaction was given up on.
    ///
    /// Only rewinds when `nonce` is the last one handed out and the node
    /// neither mined it nor holds it in its mempool. Rewinding below a later
    /// in-flight nonce would re-sign nonces that were never given up on.
    /// Returns whether the counter moved.
    pub async fn reclaim_nonce(&self, nonce: u64) -> Result<bool, ChainError> {
        let mut state = self.nonce.lock().await;
        let Some(next) = state.next else {
            return Ok(false);
        };
        if nonce.saturating_add(1) != next {
            debug!(nonce, next, "Later nonces in flight, not reclaiming");
            return Ok(false);
        }

        let pending = self.chain.nonce(self.address(), NonceTag::Pending).await?;
        if pending > nonce {
            debug!(nonce, pending, "Nonce already known to the node, not reclaiming");
            return Ok(false);
        }

        state.next = Some(nonce);
        state.in_flight.remove(&nonce);
        info!(nonce, previous_next = next, "Reclaimed sponsor nonce");
        Ok(true)
    }
}

/// Exclusive hold on the sponsor nonce. See the module docs.
#[must_use = "dropping the reservation releases the nonce"]
pub struct NonceReservation<'a> {
    wallet: &'a BackendWalletManager,
    state: MutexGuard<'a, NonceState>,
    nonce: u64,
    chain_id: u64,
}

impl NonceReservation<'_> {
    pub const fn nonce(&self) -> u64 {
        self.nonce
    }

    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Sponsor balance minus what broadcast but unmined transfers may still
    /// spend. Read inside the critical section so concurrent dispatches see
    /// each other's commitments.
    pub async fn available_balance(&mut self) -> Result<U256, ChainError> {
        let address = self.wallet.address();
        let (balance, mined) = tokio::try_join!(
            self.wallet.balance(),
            self.wallet.chain.nonce(address, NonceTag::Latest)
        )?;

        self.state.in_flight.retain(|nonce, _| *nonce >= mined);
        let committed = self
            .state
            .in_flight
            .values()
            .fold(U256::ZERO, |acc, cost| acc.saturating_add(*cost));
        Ok(balance.saturating_sub(committed))
    }

    /// Native transfer of `value` to `to`, priced from `quote`.
    pub fn transfer(&self, to: Address, value: U256, quote: &GasQuote) -> TxEip1559 {
        TxEip1559 {
            chain_id: self.chain_id,
            nonce: self.nonce,
            gas_limit: TRANSFER_GAS,
            max_fee_per_gas: quote.max_fee_per_gas,
            max_priority_fee_per_gas: quote.max_priority_fee_per_gas,
            to: TxKind::Call(to),
            value,
            access_list: Default::default(),
            input: Bytes::new(),
        }
    }

    /// Signs `tx` with the reserved nonce and chain id, whatever it carried.
    pub fn sign(&self, mut tx: TxEip1559) -> Result<SignedTransaction, DispatchError> {
        tx.nonce = self.nonce;
        tx.chain_id = self.chain_id;
        let max_cost = tx.value.saturating_add(
            U256::from(tx.gas_limit).saturating_mul(U256::from(tx.max_fee_per_gas)),
        );

        let signature = self
            .wallet
            .signer
            .sign_transaction_sync(&mut tx)
            .map_err(|err| DispatchError::Signing(err.to_string()))?;
        let envelope = TxEnvelope::Eip1559(tx.into_signed(signature));

        Ok(SignedTransaction {
            hash: *envelope.tx_hash(),
            nonce: self.nonce,
            max_cost,
            encoded: envelope.encoded_2718().into(),
        })
    }

    /// Broadcasts `signed` and leaves the critical section.
    pub async fn broadcast(
        mut self,
        signed: &SignedTransaction,
    ) -> Result<BroadcastOutcome, DispatchError> {
        let result = self
            .wallet
            .chain
            .send_raw_transaction(signed.encoded.clone())
            .await;

        match result {
            Ok(_) => {
                self.state.next = Some(self.nonce + 1);
                self.state.in_flight.insert(self.nonce, signed.max_cost);
                info!(tx_hash = %signed.hash, nonce = self.nonce, "Broadcast sponsor transaction");
                Ok(BroadcastOutcome::Accepted)
            }
            Err(err) if err.is_timeout() => {
                self.state.next = Some(self.nonce + 1);
                self.state.in_flight.insert(self.nonce, signed.max_cost);
                warn!(
                    tx_hash = %signed.hash,
                    nonce = self.nonce,
                    %err,
                    "Sponsor broadcast outcome unknown, leaving it to reconciliation"
                );
                Ok(BroadcastOutcome::Ambiguous)
            }
            Err(err) => {
                if is_stale_nonce(&err) {
                    self.state.next = None;
                    self.state.in_flight.clear();
                }
                warn!(tx_hash = %signed.hash, nonce = self.nonce, %err, "Sponsor transaction rejected");
                Err(DispatchError::Rejected(err))
            }
        }
    }
}

fn is_stale_nonce(err: &ChainError) -> bool {
    matches!(err, ChainError::Rpc { message, .. } if message.to_lowercase().contains("nonce too low"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use futures::future::join_all;
    use gasbank_chain::test_utils::{MOCK_CHAIN_ID, MockChain, SendMode};

    fn wallet(chain: &Arc<MockChain>) -> BackendWalletManager {
        BackendWalletManager::new(
            PrivateKeySigner::random(),
            chain.clone(),
            U256::from(1_000),
        )
    }

    fn transfer(nonce: u64, chain_id: u64) -> TxEip1559 {
        TxEip1559 {
            chain_id,
            nonce,
            gas_limit: TRANSFER_GAS,
            max_fee_per_gas: 2,
            max_priority_fee_per_gas: 1,
            to: TxKind::Call(Address::repeat_byte(0x11)),
            value: U256::from(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn starts_from_pending_nonce() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = wallet(&chain);
        chain.set_mined_nonce(wallet.address(), 7);

        let dispatched = wallet.reserve_nonce_and_send(transfer).await?;
        assert_eq!(dispatched.nonce, 7);
        assert_eq!(dispatched.outcome, BroadcastOutcome::Accepted);

        let sent = chain.sent();
        assert_eq!(sent[0].hash, dispatched.tx_hash);
        assert_eq!(sent[0].nonce, 7);
        assert_eq!(wallet.status().await?.next_nonce, Some(8));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_use_contiguous_nonces() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = Arc::new(wallet(&chain));
        chain.set_mined_nonce(wallet.address(), 3);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let wallet = wallet.clone();
                tokio::spawn(async move { wallet.reserve_nonce_and_send(transfer).await })
            })
            .collect();

        let mut nonces = BTreeSet::new();
        for result in join_all(handles).await {
            let dispatched = result??;
            assert!(nonces.insert(dispatched.nonce), "nonce reused");
        }
        assert_eq!(nonces, (3..35).collect::<BTreeSet<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn rejected_send_releases_nonce() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = wallet(&chain);

        chain.set_send_mode(SendMode::Reject("insufficient funds".into()));
        let err = wallet.reserve_nonce_and_send(transfer).await.unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(ChainError::Rpc { .. })));

        chain.set_send_mode(SendMode::Unreachable);
        assert!(wallet.reserve_nonce_and_send(transfer).await.is_err());

        chain.set_send_mode(SendMode::Accept);
        assert_eq!(wallet.reserve_nonce_and_send(transfer).await?.nonce, 0);
        Ok(())
    }

    #[tokio::test]
    async fn timed_out_send_consumes_nonce() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = wallet(&chain);

        chain.set_send_mode(SendMode::Timeout);
        let dispatched = wallet.reserve_nonce_and_send(transfer).await?;
        assert_eq!(dispatched.outcome, BroadcastOutcome::Ambiguous);

        chain.set_send_mode(SendMode::Accept);
        assert_eq!(wallet.reserve_nonce_and_send(transfer).await?.nonce, 1);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_reservation_broadcasts_nothing() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = wallet(&chain);

        {
            let reservation = wallet.reserve_nonce().await?;
            let signed = reservation.sign(transfer(99, 1))?;
            assert_eq!(signed.nonce, 0);
        }
        assert!(chain.sent().is_empty());

        let reservation = wallet.reserve_nonce().await?;
        assert_eq!(reservation.nonce(), 0);
        assert_eq!(reservation.chain_id(), MOCK_CHAIN_ID);
        Ok(())
    }

    #[tokio::test]
    async fn stale_nonce_is_reloaded() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = wallet(&chain);
        wallet.reserve_nonce_and_send(transfer).await?;

        // Someone else spent nonces 1..=4 from the same key.
        chain.set_mined_nonce(wallet.address(), 5);
        chain.set_send_mode(SendMode::Reject("nonce too low".into()));
        assert!(wallet.reserve_nonce_and_send(transfer).await.is_err());

        chain.set_send_mode(SendMode::Accept);
        assert_eq!(wallet.reserve_nonce_and_send(transfer).await?.nonce, 5);
        Ok(())
    }

    #[tokio::test]
    async fn reclaim_rewinds_only_the_last_unmined_nonce() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = wallet(&chain);
        for _ in 0..3 {
            wallet.reserve_nonce_and_send(transfer).await?;
        }

        chain.set_mined_nonce(wallet.address(), 1);
        // Mined already.
        assert!(!wallet.reclaim_nonce(0).await?);
        // Nonce 2 is still in flight behind it.
        assert!(!wallet.reclaim_nonce(1).await?);
        // Never handed out.
        assert!(!wallet.reclaim_nonce(3).await?);

        assert!(wallet.reclaim_nonce(2).await?);
        assert_eq!(wallet.reserve_nonce_and_send(transfer).await?.nonce, 2);
        Ok(())
    }

    #[tokio::test]
    async fn reclaim_never_reissues_later_in_flight_nonces() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = wallet(&chain);
        for _ in 0..3 {
            wallet.reserve_nonce_and_send(transfer).await?;
        }

        assert!(!wallet.reclaim_nonce(0).await?);
        wallet.reserve_nonce_and_send(transfer).await?;
        wallet.reserve_nonce_and_send(transfer).await?;

        let nonces: Vec<_> = chain.sent().iter().map(|tx| tx.nonce).collect();
        assert_eq!(nonces, [0, 1, 2, 3, 4]);
        Ok(())
    }

    #[tokio::test]
    async fn reclaim_skips_nonce_still_in_mempool() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = wallet(&chain);
        wallet.reserve_nonce_and_send(transfer).await?;

        chain.set_pending_nonce(wallet.address(), 1);
        assert!(!wallet.reclaim_nonce(0).await?);
        assert_eq!(wallet.status().await?.next_nonce, Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn in_flight_transfers_reduce_available_balance() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = wallet(&chain);
        chain.set_balance(wallet.address(), U256::from(1_000_000));

        // value 5 + 21_000 gas at fee cap 2
        let cost = U256::from(5 + 21_000 * 2);
        wallet.reserve_nonce_and_send(transfer).await?;
        wallet.reserve_nonce_and_send(transfer).await?;

        let mut reservation = wallet.reserve_nonce().await?;
        assert_eq!(
            reservation.available_balance().await?,
            U256::from(1_000_000) - cost * U256::from(2)
        );
        drop(reservation);

        // Once mined, the chain balance already reflects the first transfer.
        chain.set_mined_nonce(wallet.address(), 1);
        let mut reservation = wallet.reserve_nonce().await?;
        assert_eq!(
            reservation.available_balance().await?,
            U256::from(1_000_000) - cost
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejected_transfer_commits_nothing() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = wallet(&chain);
        chain.set_balance(wallet.address(), U256::from(1_000_000));

        chain.set_send_mode(SendMode::Reject("insufficient funds".into()));
        assert!(wallet.reserve_nonce_and_send(transfer).await.is_err());

        let mut reservation = wallet.reserve_nonce().await?;
        assert_eq!(reservation.available_balance().await?, U256::from(1_000_000));
        Ok(())
    }

    #[tokio::test]
    async fn status_flags_low_balance() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        let wallet = wallet(&chain);

        chain.set_balance(wallet.address(), U256::from(999));
        let status = wallet.status().await?;
        assert!(status.is_low);
        assert_eq!(status.next_nonce, None);

        chain.set_balance(wallet.address(), U256::from(1_000));
        assert!(!wallet.status().await?.is_low);
        Ok(())
    }
}
