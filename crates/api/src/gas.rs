//! `/gas/*` handlers.

use std::str::FromStr;

use alloy_primitives::{Address, U256};
use axum::{Json, extract::State};
use gasbank_chain::CallRequest;
use gasbank_sponsor::SponsorshipResult;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    ApiError, AppState,
    calldata::encode_call,
    extract::{ApiJson, ApiQuery},
};

const DEFAULT_HISTORY_LIMIT: usize = 10;
const MAX_HISTORY_LIMIT: usize = 100;
const DEFAULT_STATS_DAYS: u64 = 7;
const MAX_STATS_DAYS: u64 = 365;
const MAX_BATCH_SIZE: usize = 50;

/// A contract call described by ABI, as the caller sends it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateRequest {
    pub user_address: Option<String>,
    pub contract_address: Option<String>,
    pub abi: Option<Value>,
    pub function_name: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Wei as a decimal or `0x` string, or a JSON number.
    pub value: Option<Value>,
}

impl EstimateRequest {
    /// Validates the request and encodes it into a simulatable call.
    pub fn into_call(self) -> Result<CallRequest, ApiError> {
        let from = parse_address("userAddress", self.user_address.as_deref())?;
        let to = parse_address("contractAddress", self.contract_address.as_deref())?;
        let abi = self
            .abi
            .ok_or_else(|| ApiError::BadRequest("abi is required".into()))?;
        let function_name = self
            .function_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ApiError::BadRequest("functionName is required".into()))?;

        let input = encode_call(&abi, &function_name, &self.args)?;
        let value = parse_value(self.value.as_ref())?;

        Ok(CallRequest {
            from,
            to,
            input,
            value,
        })
    }
}

fn parse_address(field: &str, raw: Option<&str>) -> Result<Address, ApiError> {
    let raw = raw
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))?;
    Address::from_str(raw)
        .map_err(|_| ApiError::BadRequest(format!("{field} is not a valid address: {raw}")))
}

fn parse_value(raw: Option<&Value>) -> Result<U256, ApiError> {
    let invalid = || ApiError::BadRequest("value must be a non-negative integer amount of wei".into());
    match raw {
        None | Some(Value::Null) => Ok(U256::ZERO),
        Some(Value::String(raw)) if raw.trim().is_empty() => Ok(U256::ZERO),
        Some(Value::String(raw)) => U256::from_str(raw.trim()).map_err(|_| invalid()),
        Some(Value::Number(number)) => number.as_u64().map(U256::from).ok_or_else(invalid),
        Some(_) => Err(invalid()),
    }
}

pub(crate) async fn estimate(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<EstimateRequest>,
) -> Result<Json<Value>, ApiError> {
    let call = request.into_call()?;
    let quote = state.engine.estimator().estimate(&call).await?;
    Ok(Json(json!({ "success": true, "gasEstimate": quote })))
}

pub(crate) async fn current_prices(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let prices = state.engine.estimator().current_gas_prices().await?;
    Ok(Json(json!({ "success": true, "gasPrices": prices })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct BatchRequest {
    transactions: Vec<EstimateRequest>,
}

pub(crate) async fn estimate_batch(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<BatchRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.transactions.is_empty() {
        return Err(ApiError::BadRequest("transactions must not be empty".into()));
    }
    if request.transactions.len() > MAX_BATCH_SIZE {
        return Err(ApiError::BadRequest(format!(
            "at most {MAX_BATCH_SIZE} transactions per batch"
        )));
    }

    // Invalid items keep their slot so results line up with the input.
    let parsed: Vec<_> = request
        .transactions
        .into_iter()
        .map(EstimateRequest::into_call)
        .collect();
    let calls: Vec<_> = parsed.iter().filter_map(|call| call.as_ref().ok()).cloned().collect();
    let mut quotes = state
        .engine
        .estimator()
        .estimate_batch(&calls)
        .await
        .into_iter();

    let results: Vec<Value> = parsed
        .into_iter()
        .map(|call| {
            let outcome = call.and_then(|_| match quotes.next() {
                Some(quote) => quote.map_err(ApiError::from),
                None => Err(ApiError::Internal("batch result missing".into())),
            });
            match outcome {
                Ok(quote) => json!({ "success": true, "gasEstimate": quote }),
                Err(err) => json!({ "success": false, "error": err.public_message() }),
            }
        })
        .collect();

    Ok(Json(json!({ "success": true, "results": results })))
}

#[derive(Debug, Serialize)]
pub(crate) struct SponsorResponse {
    success: bool,
    #[serde(flatten)]
    result: SponsorshipResult,
}

pub(crate) async fn check_and_sponsor(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<EstimateRequest>,
) -> Result<Json<SponsorResponse>, ApiError> {
    let call = request.into_call()?;
    let result = state.engine.check_and_sponsor(call.from, &call).await?;
    Ok(Json(SponsorResponse {
        success: true,
        result,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HistoryQuery {
    user_address: Option<String>,
    limit: Option<usize>,
}

pub(crate) async fn history(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let user = parse_address("userAddress", query.user_address.as_deref())?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let sponsorships = state.engine.sponsorship_history(user, limit).await?;
    Ok(Json(json!({ "success": true, "sponsorships": sponsorships })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatsQuery {
    days: Option<u64>,
}

pub(crate) async fn stats(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    let days = query.days.unwrap_or(DEFAULT_STATS_DAYS);
    if days == 0 || days > MAX_STATS_DAYS {
        return Err(ApiError::BadRequest(format!(
            "days must be between 1 and {MAX_STATS_DAYS}"
        )));
    }

    let stats = state.engine.sponsorship_stats(days).await?;
    let wallet = state.engine.backend_wallet_status().await?;

    let mut stats = serde_json::to_value(stats).map_err(|err| ApiError::Internal(err.to_string()))?;
    stats["periodDays"] = days.into();

    Ok(Json(json!({
        "success": true,
        "stats": stats,
        "backendWallet": wallet,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn ping_request() -> EstimateRequest {
        EstimateRequest {
            user_address: Some("0x00000000000000000000000000000000000000aa".into()),
            contract_address: Some("0x00000000000000000000000000000000000000cc".into()),
            abi: Some(json!([{
                "type": "function",
                "name": "ping",
                "stateMutability": "payable",
                "inputs": [],
                "outputs": []
            }])),
            function_name: Some("ping".into()),
            args: vec![],
            value: None,
        }
    }

    #[test]
    fn builds_call() -> eyre::Result<()> {
        let call = ping_request().into_call()?;
        assert_eq!(call.from, Address::with_last_byte(0xaa));
        assert_eq!(call.to, Address::with_last_byte(0xcc));
        assert_eq!(call.input.len(), 4);
        assert_eq!(call.value, U256::ZERO);
        Ok(())
    }

    #[test_case(json!("1000"), 1000; "decimal string")]
    #[test_case(json!("0x3e8"), 1000; "hex string")]
    #[test_case(json!(1000), 1000; "number")]
    #[test_case(json!(""), 0; "empty")]
    fn parses_value(raw: Value, expected: u64) -> eyre::Result<()> {
        let request = EstimateRequest {
            value: Some(raw),
            ..ping_request()
        };
        assert_eq!(request.into_call()?.value, U256::from(expected));
        Ok(())
    }

    #[test_case(EstimateRequest { user_address: None, ..ping_request() }; "missing user")]
    #[test_case(EstimateRequest { contract_address: Some("0x1234".into()), ..ping_request() }; "short address")]
    #[test_case(EstimateRequest { abi: None, ..ping_request() }; "missing abi")]
    #[test_case(EstimateRequest { function_name: Some(String::new()), ..ping_request() }; "empty function")]
    #[test_case(EstimateRequest { value: Some(json!(-1)), ..ping_request() }; "negative value")]
    fn rejects_invalid(request: EstimateRequest) {
        assert!(matches!(request.into_call(), Err(ApiError::BadRequest(_))));
    }
}
