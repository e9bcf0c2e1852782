//! Gas sponsorship core.
//!
//! [`GasEstimator`] prices a user's call, [`SponsorshipDecisionEngine`] decides
//! whether the user can pay for it and otherwise sends the shortfall from the
//! sponsor account held by [`BackendWalletManager`], gated by [`RateLimiter`].
//! Every transfer leaves a [`SponsorshipRecord`] in a [`SponsorshipStore`],
//! which [`TransactionReconciler`] later resolves against chain receipts.
//!
//! Components are constructed once and shared by handle; nothing here is a
//! process global.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod config;
mod engine;
mod error;
mod estimator;
mod rate_limit;
mod reconciler;
mod store;
pub mod types;
pub mod units;
mod wallet;

pub use config::{EstimatorConfig, RateLimitConfig, ReconcilerConfig, SponsorPolicy};
pub use engine::SponsorshipDecisionEngine;
pub use error::{
    DispatchError, EstimateError, RateLimitReason, SponsorError, StoreError, retry_after_secs,
};
pub use estimator::GasEstimator;
pub use rate_limit::{Denied, RateLimiter, Reservation};
pub use reconciler::{ReconcileReport, TransactionReconciler};
pub use store::{LedgerStore, SponsorshipStore};
pub use types::{
    BackendWalletStatus, GasPrices, GasQuote, SponsorshipRecord, SponsorshipResult,
    SponsorshipStats, SponsorshipStatus,
};
pub use wallet::{
    BackendWalletManager, BroadcastOutcome, Dispatched, NonceReservation, SignedTransaction,
};
