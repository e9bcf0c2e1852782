//! Gas sponsorship service
//!
//! Prices contract calls, tops up users who cannot pay for their own gas from
//! a sponsor account and reconciles the resulting transfers against the chain.

use std::{
    net::SocketAddr, num::NonZeroU32, path::PathBuf, str::FromStr, sync::Arc, time::Duration,
};

use alloy::signers::local::PrivateKeySigner;
use alloy_primitives::U256;
use clap::Parser;
use eyre::{Result, WrapErr};
use gasbank_api::{AppState, CronGuard, router};
use gasbank_chain::RpcChainClient;
use gasbank_sponsor::{
    BackendWalletManager, EstimatorConfig, GasEstimator, LedgerStore, RateLimitConfig,
    RateLimiter, ReconcilerConfig, SponsorPolicy, SponsorshipDecisionEngine, SponsorshipStore,
    TransactionReconciler, types::unix_now, units::parse_native,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Parser, Debug)]
#[command(name = "gasbank")]
#[command(about = "Sponsors gas for users who cannot pay for their own transactions")]
struct Args {
    /// Chain RPC URL
    #[arg(long, env = "RPC_URL")]
    rpc_url: String,

    /// Sponsor wallet private key (hex, with or without 0x prefix)
    #[arg(long, env = "SPONSOR_PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    /// Address the HTTP server binds to
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// File the sponsorship ledger is kept in; in-memory when unset
    #[arg(long, env = "LEDGER_PATH")]
    ledger_path: Option<PathBuf>,

    /// API key required by the cron endpoints; they refuse everything when unset
    #[arg(long, env = "CRON_API_KEY", hide_env_values = true)]
    cron_api_key: Option<String>,

    /// Cron requests allowed per minute
    #[arg(long, default_value = "5")]
    cron_per_minute: NonZeroU32,

    /// Timeout of a single RPC request in seconds
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    rpc_timeout: u64,

    /// Headroom added to simulated gas, in percent
    #[arg(long, default_value = "20")]
    gas_buffer_percent: u64,

    /// Seconds between two sponsorships of the same user
    #[arg(long, default_value = "300")]
    cooldown: u64,

    /// Sponsorships per minute across all users, 0 disables the limit
    #[arg(long, default_value = "30")]
    global_per_minute: u32,

    /// Sponsorships per user per day, 0 disables the limit
    #[arg(long, default_value = "10")]
    daily_per_user: u32,

    /// Largest single sponsorship in native tokens, 0 disables the cap
    #[arg(long, default_value = "0.1", value_parser = native_amount)]
    max_sponsorship: U256,

    /// Balance the sponsor wallet always keeps, in native tokens
    #[arg(long, default_value = "0", value_parser = native_amount)]
    sponsor_reserve: U256,

    /// Sponsor balance below which a warning is logged, in native tokens
    #[arg(long, default_value = "1", value_parser = native_amount)]
    low_balance_threshold: U256,

    /// Seconds between reconciliation passes
    #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    reconcile_interval: u64,

    /// Seconds a sponsorship stays pending before its receipt is polled
    #[arg(long, default_value = "15")]
    min_pending_age: u64,

    /// Seconds after which a sponsorship without a receipt is failed
    #[arg(long, default_value = "600")]
    pending_timeout: u64,
}

fn native_amount(raw: &str) -> Result<U256, String> {
    parse_native(raw).map_err(|err| err.to_string())
}

const fn limit(value: u32) -> Option<u32> {
    if value == 0 { None } else { Some(value) }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("gasbank=info".parse()?))
        .init();

    let args = Args::parse();

    let chain = Arc::new(
        RpcChainClient::new(&args.rpc_url, Duration::from_secs(args.rpc_timeout))
            .wrap_err("failed to build RPC client")?,
    );

    let store = Arc::new(match &args.ledger_path {
        Some(path) => LedgerStore::new_persistent(path)
            .wrap_err_with(|| format!("failed to open ledger at {}", path.display()))?,
        None => {
            warn!("No ledger path configured, sponsorships are kept in memory only");
            LedgerStore::new_in_memory()
        }
    });

    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        cooldown_secs: args.cooldown,
        global_per_minute: limit(args.global_per_minute),
        daily_per_recipient: limit(args.daily_per_user),
    }));
    let now = unix_now();
    let recent = store.created_since(now.saturating_sub(DAY_SECS)).await?;
    limiter.hydrate(&recent, now);

    let signer = PrivateKeySigner::from_str(args.private_key.trim().trim_start_matches("0x"))
        .wrap_err("invalid sponsor private key")?;
    let policy = SponsorPolicy {
        max_sponsorship_wei: (!args.max_sponsorship.is_zero()).then_some(args.max_sponsorship),
        reserve_wei: args.sponsor_reserve,
        low_balance_threshold_wei: args.low_balance_threshold,
    };
    let wallet = Arc::new(BackendWalletManager::new(
        signer,
        chain.clone(),
        policy.low_balance_threshold_wei,
    ));

    info!(
        rpc_url = %args.rpc_url,
        sponsor = %wallet.address(),
        listen = %args.listen,
        restored = recent.len(),
        "Starting gas sponsorship service"
    );

    let estimator = Arc::new(GasEstimator::new(
        chain.clone(),
        EstimatorConfig {
            buffer_percent: args.gas_buffer_percent,
        },
    ));
    let engine = Arc::new(SponsorshipDecisionEngine::new(
        chain.clone(),
        estimator,
        limiter,
        wallet.clone(),
        store.clone(),
        policy,
    ));
    let reconciler = Arc::new(
        TransactionReconciler::new(
            chain,
            store,
            ReconcilerConfig {
                interval_secs: args.reconcile_interval,
                min_age_secs: args.min_pending_age,
                timeout_secs: args.pending_timeout,
            },
        )
        .with_wallet(wallet),
    );

    let cancel = CancellationToken::new();
    let background = tokio::spawn({
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        async move { reconciler.run(cancel).await }
    });

    let state = AppState::new(
        engine,
        reconciler,
        CronGuard::new(args.cron_api_key, args.cron_per_minute),
    );
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .wrap_err_with(|| format!("failed to bind {}", args.listen))?;

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(%err, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
        })
        .await?;

    cancel.cancel();
    background.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const REQUIRED: [&str; 5] = [
        "gasbank",
        "--rpc-url",
        "http://localhost:8545",
        "--private-key",
        "0x01",
    ];

    fn parse(extra: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(REQUIRED.iter().chain(extra))
    }

    #[test]
    fn defaults() -> eyre::Result<()> {
        let args = parse(&[])?;
        assert_eq!(args.cron_per_minute.get(), 5);
        assert_eq!(args.rpc_timeout, 10);
        assert_eq!(args.reconcile_interval, 30);
        assert_eq!(args.min_pending_age, 15);
        assert_eq!(args.pending_timeout, 600);
        Ok(())
    }

    #[test_case("--rpc-timeout" ; "rpc timeout")]
    #[test_case("--reconcile-interval" ; "reconcile interval")]
    #[test_case("--cron-per-minute" ; "cron rate")]
    fn zero_is_rejected(flag: &str) {
        assert!(parse(&[flag, "0"]).is_err());
        assert!(parse(&[flag, "1"]).is_ok());
    }

    #[test]
    fn min_pending_age_is_configurable() -> eyre::Result<()> {
        assert_eq!(parse(&["--min-pending-age", "0"])?.min_pending_age, 0);
        Ok(())
    }
}
