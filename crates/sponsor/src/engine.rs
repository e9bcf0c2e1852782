//! Decides whether a user needs gas and, if so, sends it.

use std::{collections::HashSet, sync::Arc};

use alloy_primitives::{Address, B256, U256};
use gasbank_chain::{CallRequest, ChainClient};
use tracing::{debug, error, info};

use crate::{
    SponsorError,
    config::{SponsorPolicy, TRANSFER_GAS},
    estimator::GasEstimator,
    rate_limit::RateLimiter,
    store::SponsorshipStore,
    types::{
        BackendWalletStatus, GasQuote, SponsorshipRecord, SponsorshipResult, SponsorshipStats,
        SponsorshipStatus, unix_now,
    },
    units::format_native,
    wallet::{BackendWalletManager, BroadcastOutcome, NonceReservation},
};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

pub struct SponsorshipDecisionEngine {
    chain: Arc<dyn ChainClient>,
    estimator: Arc<GasEstimator>,
    limiter: Arc<RateLimiter>,
    wallet: Arc<BackendWalletManager>,
    store: Arc<dyn SponsorshipStore>,
    policy: SponsorPolicy,
}

impl SponsorshipDecisionEngine {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        estimator: Arc<GasEstimator>,
        limiter: Arc<RateLimiter>,
        wallet: Arc<BackendWalletManager>,
        store: Arc<dyn SponsorshipStore>,
        policy: SponsorPolicy,
    ) -> Self {
        Self {
            chain,
            estimator,
            limiter,
            wallet,
            store,
            policy,
        }
    }

    pub fn estimator(&self) -> &GasEstimator {
        &self.estimator
    }

    /// Estimates `call` for `user` and tops up the user's balance with the
    /// shortfall when it does not cover the quote.
    ///
    /// The pending record is persisted before the transfer is broadcast, so a
    /// crash after broadcast still leaves it for the reconciler.
    pub async fn check_and_sponsor(
        &self,
        user: Address,
        call: &CallRequest,
    ) -> Result<SponsorshipResult, SponsorError> {
        let quote = self.estimator.estimate(call).await?;

        let balance = self
            .chain
            .balance(user)
            .await
            .map_err(SponsorError::RpcTransient)?;
        if balance >= quote.total_cost_wei {
            debug!(%user, balance = %balance, required = %quote.total_cost_wei, "User can pay for gas");
            return Ok(SponsorshipResult {
                user_had_sufficient_gas: true,
                gas_sponsored: false,
                amount_sponsored_wei: None,
                amount_sponsored: None,
                sponsor_tx_hash: None,
                gas_quote: quote,
                message: "User has sufficient gas".into(),
            });
        }

        let shortfall = quote.total_cost_wei - balance;
        if let Some(cap) = self.policy.max_sponsorship_wei
            && shortfall > cap
        {
            return Err(SponsorError::SponsorshipCapExceeded {
                requested: shortfall,
                cap,
            });
        }

        let reservation = self.limiter.try_reserve(user)?;

        let mut nonce = self.wallet.reserve_nonce().await?;
        self.ensure_sponsor_can_cover(&mut nonce, shortfall, &quote).await?;
        let signed = nonce.sign(nonce.transfer(user, shortfall, &quote))?;

        let mut record = SponsorshipRecord {
            id: B256::random(),
            recipient: user,
            amount_sponsored_wei: shortfall,
            sponsor_tx_hash: signed.hash,
            nonce: signed.nonce,
            status: SponsorshipStatus::Pending,
            gas_quote: quote.clone(),
            target_contract: call.to,
            user_balance_before: balance,
            created_at: unix_now(),
            confirmed_at: None,
            attempts: 0,
            failure_reason: None,
        };
        // Nothing is broadcast unless this write lands.
        self.store.insert(record.clone()).await?;

        let outcome = match nonce.broadcast(&signed).await {
            Ok(outcome) => outcome,
            Err(err) => {
                record.fail(err.to_string());
                if let Err(store_err) = self.store.update_pending(record).await {
                    error!(tx_hash = %signed.hash, %store_err, "Failed to mark rejected sponsorship as failed");
                }
                return Err(err.into());
            }
        };
        reservation.commit();

        let amount = format_native(shortfall);
        info!(
            %user,
            amount = %amount,
            tx_hash = %signed.hash,
            nonce = signed.nonce,
            ambiguous = outcome == BroadcastOutcome::Ambiguous,
            "Sponsored gas"
        );

        let message = match outcome {
            BroadcastOutcome::Accepted => format!("Sponsored {amount} for gas"),
            BroadcastOutcome::Ambiguous => {
                format!("Sponsored {amount} for gas, transfer pending confirmation")
            }
        };
        Ok(SponsorshipResult {
            user_had_sufficient_gas: false,
            gas_sponsored: true,
            amount_sponsored_wei: Some(shortfall),
            amount_sponsored: Some(amount),
            sponsor_tx_hash: Some(signed.hash),
            gas_quote: quote,
            message,
        })
    }

    /// The sponsor must cover the transfer, its own gas and the configured
    /// reserve, on top of whatever earlier transfers still have in flight.
    async fn ensure_sponsor_can_cover(
        &self,
        nonce: &mut NonceReservation<'_>,
        shortfall: U256,
        quote: &GasQuote,
    ) -> Result<(), SponsorError> {
        let available = nonce.available_balance().await.map_err(|err| {
            SponsorError::SponsorWalletUnavailable(format!("sponsor balance unreadable: {err}"))
        })?;

        let transfer_gas = U256::from(TRANSFER_GAS) * U256::from(quote.max_fee_per_gas);
        let required = shortfall
            .saturating_add(transfer_gas)
            .saturating_add(self.policy.reserve_wei);
        if available < required {
            error!(
                available = %format_native(available),
                required = %format_native(required),
                "Sponsor wallet cannot cover sponsorship"
            );
            return Err(SponsorError::SponsorWalletUnavailable(
                "sponsor wallet balance too low".into(),
            ));
        }
        Ok(())
    }

    /// Sponsorships of `user`, most recent first.
    pub async fn sponsorship_history(
        &self,
        user: Address,
        limit: usize,
    ) -> Result<Vec<SponsorshipRecord>, SponsorError> {
        Ok(self.store.by_recipient(user, limit).await?)
    }

    /// Totals over confirmed sponsorships created in the last `days` days.
    pub async fn sponsorship_stats(&self, days: u64) -> Result<SponsorshipStats, SponsorError> {
        let since = unix_now().saturating_sub(days.saturating_mul(SECONDS_PER_DAY));
        let confirmed: Vec<_> = self
            .store
            .created_since(since)
            .await?
            .into_iter()
            .filter(|record| record.status == SponsorshipStatus::Confirmed)
            .collect();

        let total: U256 = confirmed
            .iter()
            .map(|record| record.amount_sponsored_wei)
            .fold(U256::ZERO, U256::saturating_add);
        let unique_users = confirmed
            .iter()
            .map(|record| record.recipient)
            .collect::<HashSet<_>>()
            .len();
        let average = total
            .checked_div(U256::from(confirmed.len()))
            .unwrap_or_default();

        Ok(SponsorshipStats {
            total_sponsored_wei: total,
            total_sponsored: format_native(total),
            total_count: confirmed.len(),
            unique_users,
            average_amount_wei: average,
        })
    }

    pub async fn backend_wallet_status(&self) -> Result<BackendWalletStatus, SponsorError> {
        self.wallet
            .status()
            .await
            .map_err(SponsorError::RpcTransient)
    }
}
