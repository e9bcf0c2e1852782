//! HTTP surface of the gas sponsorship service.
//!
//! | Route | |
//! |---|---|
//! | `POST /gas/estimate` | quote for an ABI-described call |
//! | `GET /gas/estimate` | current fee parameters |
//! | `POST /gas/estimate/batch` | per-item quotes, input order kept |
//! | `POST /gas/check-and-sponsor` | sponsor the caller's gas shortfall |
//! | `GET /gas/check-and-sponsor` | sponsorship history of a user |
//! | `GET /gas/stats` | sponsorship totals and sponsor wallet status |
//! | `GET`/`POST /cron/reconcile` | one reconciliation pass, API-key guarded |

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    routing::{get, post},
};
use gasbank_sponsor::{SponsorshipDecisionEngine, TransactionReconciler};
use serde_json::{Value, json};

pub mod calldata;
mod cron;
mod error;
mod extract;
mod gas;

pub use cron::CronGuard;
pub use error::ApiError;
pub use gas::EstimateRequest;

/// Shared handles for every handler.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<SponsorshipDecisionEngine>,
    reconciler: Arc<TransactionReconciler>,
    cron: Arc<CronGuard>,
}

impl AppState {
    pub fn new(
        engine: Arc<SponsorshipDecisionEngine>,
        reconciler: Arc<TransactionReconciler>,
        cron: CronGuard,
    ) -> Self {
        Self {
            engine,
            reconciler,
            cron: Arc::new(cron),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/gas/estimate", get(gas::current_prices).post(gas::estimate))
        .route("/gas/estimate/batch", post(gas::estimate_batch))
        .route(
            "/gas/check-and-sponsor",
            get(gas::history).post(gas::check_and_sponsor),
        )
        .route("/gas/stats", get(gas::stats))
        .route("/cron/reconcile", get(reconcile).post(reconcile))
        .with_state(state)
}

async fn reconcile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.cron.authorize(&headers)?;
    let report = state.reconciler.reconcile().await?;
    Ok(Json(json!({ "success": true, "report": report })))
}
