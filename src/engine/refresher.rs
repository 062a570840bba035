//! Pool price refresh: updates the price rows and the moving-average ladder
//! for the trading pair, appends history, and notifies downstream that a
//! new cycle of data is ready.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::adapters::bus::BusMessage;
use crate::adapters::traits::{ChainProvider, MessageBus, MetricsSink, Store};
use crate::config::TradingConfig;
use crate::domain::tokens::{
    self, TokenInfo, WETH_USDC_PAIR, WETH_WMATIC_PAIR, WMATIC_USDC_PAIR,
};
use crate::domain::{compute_moving_averages, PriceHistoryRow, PriceRow};
use crate::error::Result;

pub struct PriceRefresher {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainProvider>,
    bus: Arc<dyn MessageBus>,
    metrics: Arc<dyn MetricsSink>,
    trading: TradingConfig,
}

impl PriceRefresher {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainProvider>,
        bus: Arc<dyn MessageBus>,
        metrics: Arc<dyn MetricsSink>,
        trading: TradingConfig,
    ) -> Self {
        Self {
            store,
            chain,
            bus,
            metrics,
            trading,
        }
    }

    /// Refresh the trading pair and both USDC quote pairs
    pub async fn refresh(&self) -> Result<()> {
        self.refresh_pair(
            WETH_WMATIC_PAIR,
            tokens::weth(),
            tokens::wmatic(),
            true,
            true,
        )
        .await?;
        self.refresh_pair(
            WMATIC_USDC_PAIR,
            tokens::usdc(),
            tokens::wmatic(),
            false,
            false,
        )
        .await?;
        self.refresh_pair(WETH_USDC_PAIR, tokens::usdc(), tokens::weth(), false, true)
            .await?;

        if !self.bus.publish(&BusMessage::PricesRefreshed).await {
            warn!("Cycle-complete notification failed to publish");
        }
        Ok(())
    }

    async fn refresh_pair(
        &self,
        pair: &str,
        token_a: TokenInfo,
        token_b: TokenInfo,
        include_moving_averages: bool,
        use_token1_price: bool,
    ) -> Result<()> {
        let state = self
            .chain
            .pool_state(token_a, token_b, use_token1_price)
            .await?;
        let price = state.price.round_dp(self.trading.price_decimals);
        let liquidity = state.liquidity.to_string();

        self.store
            .append_price_history(&PriceHistoryRow {
                pair: pair.to_string(),
                price,
                liquidity: liquidity.clone(),
            })
            .await?;

        let smas = if include_moving_averages {
            let prior = self
                .store
                .get_price(pair)
                .await?
                .map(|row| row.smas)
                .unwrap_or_default();
            compute_moving_averages(
                price,
                self.trading.sma_from,
                self.trading.sma_to,
                self.trading.sma_step,
                &prior,
            )
        } else {
            Vec::new()
        };
        debug!("Pair {pair}: price={price} buckets={}", smas.len());

        self.store
            .upsert_price(&PriceRow {
                pair: pair.to_string(),
                price,
                liquidity,
                smas,
                updated_on: None,
            })
            .await?;

        self.metrics
            .push_price(pair, 0, Decimal::ZERO, price)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::traits::{
        MockChainProvider, MockMessageBus, MockMetricsSink, MockStore, PoolState,
    };
    use ethers::types::U256;
    use rust_decimal_macros::dec;

    fn trading_config() -> TradingConfig {
        TradingConfig {
            pair: WETH_WMATIC_PAIR.to_string(),
            price_decimals: 5,
            sma_from: 15,
            sma_to: 180,
            sma_step: 15,
            min_fee_balance: dec!(0.5),
        }
    }

    #[tokio::test]
    async fn test_refresh_updates_three_pairs_and_notifies() {
        let mut store = MockStore::new();
        store
            .expect_append_price_history()
            .times(3)
            .returning(|_| Ok(()));
        // only the trading pair consults its prior ladder
        store
            .expect_get_price()
            .withf(|pair| pair == WETH_WMATIC_PAIR)
            .times(1)
            .returning(|_| Ok(None));
        store
            .expect_upsert_price()
            .withf(|row| {
                if row.pair == WETH_WMATIC_PAIR {
                    // cold start seeds the full ladder to the current price
                    row.smas.len() == 12 && row.smas.iter().all(|ma| *ma == row.price)
                } else {
                    row.smas.is_empty()
                }
            })
            .times(3)
            .returning(|_| Ok(()));

        let mut chain = MockChainProvider::new();
        chain.expect_pool_state().times(3).returning(|_, _, _| {
            Ok(PoolState {
                price: dec!(1813.4),
                liquidity: U256::from(1_000_000u64),
            })
        });

        let mut bus = MockMessageBus::new();
        bus.expect_publish()
            .withf(|m| matches!(m, BusMessage::PricesRefreshed))
            .times(1)
            .returning(|_| true);

        let mut metrics = MockMetricsSink::new();
        metrics.expect_push_price().times(3).returning(|_, _, _, _| ());

        let refresher = PriceRefresher::new(
            Arc::new(store),
            Arc::new(chain),
            Arc::new(bus),
            Arc::new(metrics),
            trading_config(),
        );
        refresher.refresh().await.unwrap();
    }
}
