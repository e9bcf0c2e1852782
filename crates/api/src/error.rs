//! Error kinds of the HTTP boundary and their status codes.

use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use gasbank_sponsor::{EstimateError, SponsorError, StoreError, retry_after_secs};
use serde_json::json;
use tracing::{error, warn};

use crate::calldata::CalldataError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("transaction simulation failed: {0}")]
    SimulationReverted(String),
    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after: Duration,
    },
    /// The sponsor cannot help right now. Detail is logged, not returned.
    #[error("gas sponsorship unavailable: {0}")]
    Unavailable(String),
    /// The chain node failed or timed out. Detail is logged, not returned.
    #[error("chain rpc failure: {0}")]
    Rpc(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::SimulationReverted(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Rpc(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller.
    pub(crate) fn public_message(&self) -> String {
        match self {
            Self::Unavailable(_) => "Gas sponsorship service temporarily unavailable".into(),
            Self::Rpc(_) => "Chain node unavailable, please retry".into(),
            Self::Unauthorized => "Unauthorized".into(),
            Self::Internal(_) => "Internal server error".into(),
            other => other.to_string(),
        }
    }
}

impl From<EstimateError> for ApiError {
    fn from(err: EstimateError) -> Self {
        match err {
            EstimateError::SimulationReverted { reason } => Self::SimulationReverted(reason),
            EstimateError::RpcTransient(err) => Self::Rpc(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<CalldataError> for ApiError {
    fn from(err: CalldataError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<SponsorError> for ApiError {
    fn from(err: SponsorError) -> Self {
        let message = err.to_string();
        match err {
            SponsorError::Estimate(err) => err.into(),
            SponsorError::RateLimited { retry_after, .. } => Self::RateLimited {
                message,
                retry_after,
            },
            SponsorError::SponsorshipCapExceeded { .. } => Self::BadRequest(message),
            SponsorError::SponsorWalletUnavailable(_) | SponsorError::Dispatch(_) => {
                Self::Unavailable(message)
            }
            SponsorError::RpcTransient(_) => Self::Rpc(message),
            SponsorError::Store(_) => Self::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::Unavailable(_) | Self::Rpc(_) | Self::Internal(_) => {
                error!(%status, err = %self, "Request failed")
            }
            _ => warn!(%status, err = %self, "Request refused"),
        }

        let mut body = json!({
            "success": false,
            "error": self.public_message(),
        });

        let Self::RateLimited { retry_after, .. } = self else {
            return (status, Json(body)).into_response();
        };
        let secs = retry_after_secs(retry_after);
        body["retryAfter"] = secs.into();

        let mut response = (status, Json(body)).into_response();
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(secs));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gasbank_chain::ChainError;
    use gasbank_sponsor::{DispatchError, RateLimitReason};
    use test_case::test_case;

    #[test_case(
        SponsorError::Estimate(EstimateError::SimulationReverted { reason: "paused".into() }),
        StatusCode::BAD_REQUEST;
        "revert"
    )]
    #[test_case(
        SponsorError::Estimate(EstimateError::RpcTransient(ChainError::Timeout(Duration::from_secs(1)))),
        StatusCode::INTERNAL_SERVER_ERROR;
        "estimate rpc"
    )]
    #[test_case(
        SponsorError::RateLimited { reason: RateLimitReason::Cooldown, retry_after: Duration::from_secs(5) },
        StatusCode::TOO_MANY_REQUESTS;
        "rate limited"
    )]
    #[test_case(
        SponsorError::SponsorshipCapExceeded { requested: Default::default(), cap: Default::default() },
        StatusCode::BAD_REQUEST;
        "cap"
    )]
    #[test_case(
        SponsorError::SponsorWalletUnavailable("low".into()),
        StatusCode::SERVICE_UNAVAILABLE;
        "wallet"
    )]
    #[test_case(
        SponsorError::Dispatch(DispatchError::Signing("bad key".into())),
        StatusCode::SERVICE_UNAVAILABLE;
        "dispatch"
    )]
    #[test_case(
        SponsorError::RpcTransient(ChainError::Transport("refused".into())),
        StatusCode::INTERNAL_SERVER_ERROR;
        "balance rpc"
    )]
    fn sponsor_errors_map_to_status(err: SponsorError, expected: StatusCode) {
        assert_eq!(ApiError::from(err).status_code(), expected);
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let response = ApiError::RateLimited {
            message: "slow down".into(),
            retry_after: Duration::from_millis(1_500),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "2");
    }

    #[test]
    fn internal_detail_stays_in_logs() {
        let err = ApiError::Rpc("connection refused to 10.0.0.3:8545".into());
        assert!(!err.public_message().contains("10.0.0.3"));
    }
}
