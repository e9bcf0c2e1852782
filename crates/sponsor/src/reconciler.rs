//! Background resolution of pending sponsorships against chain receipts.

use std::sync::Arc;

use gasbank_chain::ChainClient;
use serde::Serialize;
use tokio::{sync::Mutex, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    StoreError,
    config::ReconcilerConfig,
    store::SponsorshipStore,
    types::{SponsorshipStatus, unix_now},
    wallet::BackendWalletManager,
};

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Another pass was already running; nothing was done.
    pub skipped: bool,
    pub scanned: usize,
    pub confirmed: usize,
    pub failed: usize,
    /// Failed because no receipt appeared before the timeout.
    pub timed_out: usize,
    pub still_pending: usize,
    /// Receipt lookups that errored; those records are retried next pass.
    pub errors: usize,
}

enum Resolution {
    Confirmed,
    Reverted,
    TimedOut,
    StillPending,
}

pub struct TransactionReconciler {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn SponsorshipStore>,
    wallet: Option<Arc<BackendWalletManager>>,
    config: ReconcilerConfig,
    pass: Mutex<()>,
}

impl TransactionReconciler {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn SponsorshipStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            chain,
            store,
            wallet: None,
            config,
            pass: Mutex::default(),
        }
    }

    /// Hands nonces of timed-out transfers back to `wallet`.
    pub fn with_wallet(mut self, wallet: Arc<BackendWalletManager>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    /// Polls on the configured interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.config.interval(), "Starting reconciler");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconciler stopped");
                    return;
                }
                _ = interval.tick() => {
                    match self.reconcile().await {
                        Ok(report) if report.scanned > 0 => info!(?report, "Reconciliation pass finished"),
                        Ok(_) => {}
                        Err(err) => error!(%err, "Reconciliation pass failed"),
                    }
                }
            }
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        self.reconcile_at(unix_now()).await
    }

    /// One pass over pending records old enough to poll, as of `now`.
    ///
    /// Writes go through [`SponsorshipStore::update_pending`], so a record that
    /// reached a terminal status is never touched again.
    pub async fn reconcile_at(&self, now: u64) -> Result<ReconcileReport, StoreError> {
        let Ok(_pass) = self.pass.try_lock() else {
            debug!("Reconciliation already running, skipping");
            return Ok(ReconcileReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = ReconcileReport::default();
        let mut abandoned = Vec::new();
        let pending = self.store.by_status(SponsorshipStatus::Pending).await?;

        for mut record in pending {
            let age = record.age_at(now);
            if age < self.config.min_age_secs {
                continue;
            }
            report.scanned += 1;

            let receipt = match self.chain.receipt(record.sponsor_tx_hash).await {
                Ok(receipt) => receipt,
                Err(err) => {
                    warn!(tx_hash = %record.sponsor_tx_hash, %err, "Receipt lookup failed");
                    report.errors += 1;
                    continue;
                }
            };

            let resolution = match receipt {
                Some(receipt) if receipt.success => {
                    record.confirm(now);
                    Resolution::Confirmed
                }
                Some(_) => {
                    record.fail("sponsor transfer reverted");
                    Resolution::Reverted
                }
                None if age >= self.config.timeout_secs => {
                    record.fail(format!("no receipt after {age}s"));
                    Resolution::TimedOut
                }
                None => {
                    record.attempts += 1;
                    Resolution::StillPending
                }
            };

            if !self.store.update_pending(record.clone()).await? {
                continue;
            }

            match resolution {
                Resolution::Confirmed => {
                    report.confirmed += 1;
                    info!(tx_hash = %record.sponsor_tx_hash, recipient = %record.recipient, "Sponsorship confirmed");
                }
                Resolution::Reverted => {
                    report.failed += 1;
                    warn!(tx_hash = %record.sponsor_tx_hash, recipient = %record.recipient, "Sponsor transfer reverted");
                }
                Resolution::TimedOut => {
                    report.failed += 1;
                    report.timed_out += 1;
                    warn!(
                        tx_hash = %record.sponsor_tx_hash,
                        recipient = %record.recipient,
                        nonce = record.nonce,
                        age,
                        "Sponsorship timed out without a receipt, needs operator follow-up"
                    );
                    abandoned.push(record.nonce);
                }
                Resolution::StillPending => {
                    report.still_pending += 1;
                    debug!(tx_hash = %record.sponsor_tx_hash, attempts = record.attempts, "Sponsorship still pending");
                }
            }
        }

        self.reclaim(abandoned).await;
        Ok(report)
    }

    /// Highest first, so a run of abandoned nonces at the tip unwinds fully.
    async fn reclaim(&self, mut nonces: Vec<u64>) {
        let Some(wallet) = &self.wallet else {
            return;
        };
        nonces.sort_unstable_by(|a, b| b.cmp(a));
        nonces.dedup();
        for nonce in nonces {
            match wallet.reclaim_nonce(nonce).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    warn!(nonce, %err, "Could not check nonce for reclaim");
                    break;
                }
            }
        }
    }
}
