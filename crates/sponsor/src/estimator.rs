//! Turns a proposed call into a buffered EIP-1559 fee quote.

use std::sync::Arc;

use futures::future::join_all;
use gasbank_chain::{CallRequest, ChainClient};
use tracing::debug;

use crate::{
    EstimateError,
    config::EstimatorConfig,
    types::{GasPrices, GasQuote},
};

pub struct GasEstimator {
    chain: Arc<dyn ChainClient>,
    config: EstimatorConfig,
}

impl GasEstimator {
    pub fn new(chain: Arc<dyn ChainClient>, config: EstimatorConfig) -> Self {
        Self { chain, config }
    }

    /// Simulates `call` and prices it at the current fee market.
    pub async fn estimate(&self, call: &CallRequest) -> Result<GasQuote, EstimateError> {
        let raw_gas = self.chain.estimate_gas(call).await?;
        let prices = self.current_gas_prices().await?;
        let quote = GasQuote::new(raw_gas, prices, self.config.buffer_percent);

        debug!(
            from = %call.from,
            to = %call.to,
            raw_gas,
            gas_limit = quote.gas_limit,
            max_fee_per_gas = quote.max_fee_per_gas,
            total_cost_wei = %quote.total_cost_wei,
            "Computed gas quote"
        );

        Ok(quote)
    }

    /// Fee parameters without simulating anything. A chain without a base fee prices it at zero.
    pub async fn current_gas_prices(&self) -> Result<GasPrices, EstimateError> {
        let (base_fee, priority_fee) = tokio::try_join!(
            self.chain.latest_base_fee(),
            self.chain.max_priority_fee()
        )?;

        Ok(GasPrices::from_fees(
            base_fee.unwrap_or_default(),
            priority_fee,
        ))
    }

    /// Estimates every call concurrently. Results keep the input order and a
    /// failure only occupies its own slot.
    pub async fn estimate_batch(
        &self,
        calls: &[CallRequest],
    ) -> Vec<Result<GasQuote, EstimateError>> {
        join_all(calls.iter().map(|call| self.estimate(call))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};
    use gasbank_chain::{ChainError, test_utils::MockChain};

    fn estimator(chain: &Arc<MockChain>) -> GasEstimator {
        GasEstimator::new(chain.clone(), EstimatorConfig::default())
    }

    fn call_to(byte: u8) -> CallRequest {
        CallRequest {
            from: Address::repeat_byte(0xaa),
            to: Address::repeat_byte(byte),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn quote_from_simulation_and_fees() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        chain.set_raw_gas(50_000);
        chain.set_base_fee(Some(10));
        chain.set_priority_fee(3);

        let quote = estimator(&chain).estimate(&call_to(1)).await?;
        assert_eq!(quote.gas_limit, 60_000);
        assert_eq!(quote.max_fee_per_gas, 23);
        assert_eq!(quote.max_priority_fee_per_gas, 3);
        assert_eq!(quote.total_cost_wei, U256::from(60_000 * 23));
        Ok(())
    }

    #[tokio::test]
    async fn missing_base_fee_is_zero() -> eyre::Result<()> {
        let chain = Arc::new(MockChain::new());
        chain.set_base_fee(None);
        chain.set_priority_fee(7);

        let prices = estimator(&chain).current_gas_prices().await?;
        assert_eq!(prices.base_fee_per_gas, 0);
        assert_eq!(prices.max_fee_per_gas, 7);
        Ok(())
    }

    #[tokio::test]
    async fn revert_produces_no_quote() {
        let chain = Arc::new(MockChain::new());
        chain.set_revert(Some("insufficient allowance"));

        let result = estimator(&chain).estimate(&call_to(1)).await;
        assert_eq!(
            result,
            Err(EstimateError::SimulationReverted {
                reason: "insufficient allowance".into()
            })
        );
    }

    #[tokio::test]
    async fn unreachable_node_is_transient() {
        let chain = Arc::new(MockChain::new());
        chain.set_unreachable(true);

        let result = estimator(&chain).estimate(&call_to(1)).await;
        assert!(matches!(
            result,
            Err(EstimateError::RpcTransient(ChainError::Transport(_)))
        ));
    }

    #[tokio::test]
    async fn batch_keeps_order_and_isolates_failures() {
        let chain = Arc::new(MockChain::new());
        chain.set_revert_for(Address::repeat_byte(2), "paused");

        let calls = [call_to(1), call_to(2), call_to(3)];
        let results = estimator(&chain).estimate_batch(&calls).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(EstimateError::SimulationReverted { reason }) if reason == "paused"
        ));
        assert!(results[2].is_ok());
        assert_eq!(chain.estimate_calls(), 3);
    }
}
