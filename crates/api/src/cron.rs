//! Guard for the cron endpoints: API key, then a per-process rate limit.

use std::num::NonZeroU32;

use axum::http::{HeaderMap, header::AUTHORIZATION};
use governor::{
    DefaultDirectRateLimiter, Quota, RateLimiter,
    clock::{Clock, DefaultClock},
};
use tracing::warn;

use crate::ApiError;

const API_KEY_HEADER: &str = "x-api-key";

pub struct CronGuard {
    api_key: Option<String>,
    limiter: DefaultDirectRateLimiter,
}

impl CronGuard {
    /// Without an `api_key` every request is refused.
    pub fn new(api_key: Option<String>, per_minute: NonZeroU32) -> Self {
        let api_key = api_key.filter(|key| !key.is_empty());
        if api_key.is_none() {
            warn!("No cron API key configured, cron endpoints will refuse every request");
        }
        Self {
            api_key,
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        }
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = &self.api_key else {
            return Err(ApiError::Unauthorized);
        };
        let provided = provided_key(headers).ok_or(ApiError::Unauthorized)?;
        if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
            return Err(ApiError::Unauthorized);
        }

        self.limiter.check().map_err(|not_until| {
            let retry_after = not_until.wait_time_from(DefaultClock::default().now());
            ApiError::RateLimited {
                message: "cron rate limit exceeded".into(),
                retry_after,
            }
        })
    }
}

/// `x-api-key: <key>` or `Authorization: Bearer <key>`.
fn provided_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        return Some(key.trim());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
