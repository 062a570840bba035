//! Stage 2: consume a trade request, re-validate the agent and gas, and
//! submit the swap.
//!
//! Safe under at-least-once delivery: the agent row is reloaded and every
//! admission check re-run on each invocation. Any failure after the lock
//! was taken resolves toward deactivating the agent and releasing the lock.

use chrono::Utc;
use ethers::types::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::adapters::traits::{ChainProvider, GasEstimate, GasOracle, Store};
use crate::config::TradingConfig;
use crate::domain::tokens::{self, parse_address, to_wei, TokenInfo};
use crate::domain::{Agent, PendingTxn, Side, TradeRequest, TradeSubmission, TxnType};
use crate::error::{FleetError, Result};

pub struct ExecutionGateway {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainProvider>,
    gas: Arc<dyn GasOracle>,
    trading: TradingConfig,
    gas_ceiling_gwei: u64,
}

impl ExecutionGateway {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainProvider>,
        gas: Arc<dyn GasOracle>,
        trading: TradingConfig,
        gas_ceiling_gwei: u64,
    ) -> Self {
        Self {
            store,
            chain,
            gas,
            trading,
            gas_ceiling_gwei,
        }
    }

    /// Handle one trade request
    pub async fn handle(&self, request: &TradeRequest) -> Result<()> {
        let Some(agent) = self.store.load_agent(&request.agent_address).await? else {
            return Err(FleetError::Validation(format!(
                "trade {} references unknown agent {}",
                request.uuid, request.agent_address
            )));
        };

        // A request queued before the agent was deactivated must not touch
        // state until its trade settles
        if !agent.is_active {
            info!(
                "Agent {} with open trade '{}' is not active; trade request ignored",
                agent.agent_address, agent.open_trade_id
            );
            return Ok(());
        }

        // Active but unlocked is an inconsistency: halt the agent
        if !agent.has_open_trade() {
            warn!(
                "Agent {} is missing its expected open trade id; deactivating",
                agent.agent_address
            );
            self.store
                .set_activation(&agent.agent_address, false)
                .await?;
            return Ok(());
        }

        let estimate = self.gas.estimate().await?;
        if !estimate.is_acceptable(self.gas_ceiling_gwei) {
            // Abandon the trade so the agent is free for the next cycle
            self.store
                .release_open_trade(&agent.agent_address, &agent.open_trade_id)
                .await?;
            self.store.mark_trade_dropped(request.uuid).await?;
            return Err(FleetError::GasTooHigh(format!(
                "{} gwei; dropped trade {} and released agent {}",
                estimate.as_gwei(),
                request.uuid,
                agent.agent_address
            )));
        }

        match self.submit(&agent, request, estimate).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.quarantine(&agent, request, &e).await;
                Err(e)
            }
        }
    }

    /// Validate balances and submit the swap, recording the submission and
    /// the pending-queue row
    async fn submit(
        &self,
        agent: &Agent,
        request: &TradeRequest,
        gas: GasEstimate,
    ) -> Result<()> {
        let address = parse_address(&agent.agent_address)?;
        let weth = tokens::weth();
        let wmatic = tokens::wmatic();

        let native = self.chain.native_balance(address).await?;
        let weth_bal = self.chain.token_balance(weth.address, address).await?;
        let wmatic_bal = self.chain.token_balance(wmatic.address, address).await?;
        debug!(
            "Agent {} balances: native={native} wmatic={wmatic_bal} weth={weth_bal}",
            agent.agent_address
        );

        let (input, output, input_bal, input_value) =
            plan_swap(request.side, request.current_price, wmatic_bal, weth_bal)?;

        let fee_floor = to_wei(self.trading.min_fee_balance, 18)?;
        if native < fee_floor {
            return Err(FleetError::InsufficientBalance(format!(
                "wallet balance {native} is below the fee floor"
            )));
        }
        if input_value < fee_floor {
            return Err(FleetError::InsufficientBalance(format!(
                "input value {input_value} is too low"
            )));
        }

        let txn_hash = self
            .chain
            .submit_swap(agent.wallet_index, input, input_bal, output, gas)
            .await?;

        // The trade is settled downstream from the pending queue, which also
        // unlocks the agent; a swap stuck under-gassed keeps it locked until
        // the transaction finally resolves
        self.store
            .record_trade_submission(&TradeSubmission {
                uuid: request.uuid,
                txn_hash: txn_hash.clone(),
                input_token: input.symbol.to_string(),
                input_bal: input_bal.to_string(),
            })
            .await?;
        self.store
            .insert_pending_txn(&PendingTxn {
                txn_hash,
                trade_uuid: Some(request.uuid),
                agent_address: agent.agent_address.clone(),
                wallet_index: agent.wallet_index,
                symbol: input.symbol.to_string(),
                amount: input_bal.to_string(),
                txn_type: TxnType::Swap,
                created_on: Utc::now(),
            })
            .await?;

        Ok(())
    }

    /// Failure path: record the error, deactivate the agent, release the lock
    async fn quarantine(&self, agent: &Agent, request: &TradeRequest, cause: &FleetError) {
        error!(
            "Trade {} for agent {} failed: {cause}",
            request.uuid, agent.agent_address
        );
        if let Err(e) = self
            .store
            .record_trade_error(request.uuid, &agent.agent_address, &cause.to_string())
            .await
        {
            error!("Could not record trade error: {e}");
        }
        if let Err(e) = self.store.set_activation(&agent.agent_address, false).await {
            error!("Could not deactivate agent {}: {e}", agent.agent_address);
        }
        if let Err(e) = self
            .store
            .release_open_trade(&agent.agent_address, &agent.open_trade_id)
            .await
        {
            error!("Could not release agent {}: {e}", agent.agent_address);
        }
    }
}

/// Choose input/output tokens and amounts for a swap.
///
/// BUY spends the full quote-token (WMATIC) balance. SELL spends the full
/// WETH balance, with its admission value scaled by the current price to
/// approximate an equal-notional swap; the scaled value only feeds the
/// fee-floor check, the swap itself spends the full balance.
fn plan_swap(
    side: Side,
    current_price: Decimal,
    wmatic_bal: U256,
    weth_bal: U256,
) -> Result<(TokenInfo, TokenInfo, U256, U256)> {
    match side {
        Side::Buy => Ok((tokens::wmatic(), tokens::weth(), wmatic_bal, wmatic_bal)),
        Side::Sell => {
            let scaled = scale_by_price(weth_bal, current_price)?;
            Ok((tokens::weth(), tokens::wmatic(), weth_bal, scaled))
        }
    }
}

/// Multiply a raw balance by a price with 8 decimal places of precision
fn scale_by_price(balance: U256, price: Decimal) -> Result<U256> {
    let scaled_price = (price * Decimal::from(100_000_000u64))
        .round()
        .to_u64()
        .ok_or_else(|| FleetError::Validation(format!("price {price} out of range")))?;
    Ok(balance * U256::from(scaled_price) / U256::exp10(8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::traits::{gwei, MockChainProvider, MockGasOracle, MockStore};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    const AGENT_ADDR: &str = "0x00000000000000000000000000000000000000a1";

    fn trading_config() -> TradingConfig {
        TradingConfig {
            pair: "WETH/WMATIC".to_string(),
            price_decimals: 5,
            sma_from: 15,
            sma_to: 180,
            sma_step: 15,
            min_fee_balance: dec!(0.5),
        }
    }

    fn agent(open_trade_id: &str, is_active: bool) -> Agent {
        Agent {
            agent_address: AGENT_ADDR.to_string(),
            wallet_index: 1,
            ma_gain: dec!(1.05),
            ma_duration: 15,
            side: Some(Side::Buy),
            open_trade_id: open_trade_id.to_string(),
            is_active,
            balance: dec!(3),
        }
    }

    fn request(side: Side) -> TradeRequest {
        TradeRequest {
            uuid: Uuid::new_v4(),
            side,
            agent_address: AGENT_ADDR.to_string(),
            current_price: dec!(1813.4),
        }
    }

    fn acceptable_gas() -> MockGasOracle {
        let mut gas = MockGasOracle::new();
        gas.expect_estimate().returning(|| {
            Ok(GasEstimate {
                max_fee: gwei(300),
                max_priority_fee: gwei(100),
            })
        });
        gas
    }

    fn gateway(
        store: MockStore,
        chain: MockChainProvider,
        gas: MockGasOracle,
    ) -> ExecutionGateway {
        ExecutionGateway::new(
            Arc::new(store),
            Arc::new(chain),
            Arc::new(gas),
            trading_config(),
            444,
        )
    }

    fn one_matic() -> U256 {
        U256::exp10(18)
    }

    #[test]
    fn test_plan_swap_buy_spends_full_quote_balance() {
        let wmatic_bal = one_matic() * 10;
        let (input, output, input_bal, input_value) =
            plan_swap(Side::Buy, dec!(1813.4), wmatic_bal, one_matic()).unwrap();
        assert_eq!(input.symbol, "WMATIC");
        assert_eq!(output.symbol, "WETH");
        assert_eq!(input_bal, wmatic_bal);
        assert_eq!(input_value, wmatic_bal);
    }

    #[test]
    fn test_plan_swap_sell_scales_admission_value_by_price() {
        let weth_bal = one_matic(); // 1 WETH
        let (input, output, input_bal, input_value) =
            plan_swap(Side::Sell, dec!(1813.4), U256::zero(), weth_bal).unwrap();
        assert_eq!(input.symbol, "WETH");
        assert_eq!(output.symbol, "WMATIC");
        // the swap still spends the full balance
        assert_eq!(input_bal, weth_bal);
        // the admission value approximates the notional in WMATIC
        assert_eq!(input_value, one_matic() * 18134 / 10);
    }

    #[tokio::test]
    async fn test_inactive_agent_is_ignored_without_writes() {
        let mut store = MockStore::new();
        store
            .expect_load_agent()
            .returning(|_| Ok(Some(agent("some-open-trade", false))));

        let result = gateway(store, MockChainProvider::new(), MockGasOracle::new())
            .handle(&request(Side::Buy))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_active_agent_without_lock_is_deactivated() {
        let mut store = MockStore::new();
        store
            .expect_load_agent()
            .returning(|_| Ok(Some(agent("", true))));
        store
            .expect_set_activation()
            .withf(|addr, active| addr == AGENT_ADDR && !active)
            .times(1)
            .returning(|_, _| Ok(()));

        let result = gateway(store, MockChainProvider::new(), MockGasOracle::new())
            .handle(&request(Side::Buy))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unacceptable_gas_drops_trade_and_fails_loudly() {
        let req = request(Side::Buy);
        let uuid = req.uuid;

        let mut store = MockStore::new();
        store
            .expect_load_agent()
            .returning(|_| Ok(Some(agent("open-trade", true))));
        store
            .expect_release_open_trade()
            .withf(|_, expected| expected == "open-trade")
            .times(1)
            .returning(|_, _| Ok(true));
        store
            .expect_mark_trade_dropped()
            .withf(move |dropped| *dropped == uuid)
            .times(1)
            .returning(|_| Ok(()));

        let mut gas = MockGasOracle::new();
        gas.expect_estimate().returning(|| {
            Ok(GasEstimate {
                max_fee: gwei(500),
                max_priority_fee: gwei(50),
            })
        });

        let result = gateway(store, MockChainProvider::new(), gas)
            .handle(&req)
            .await;
        assert!(matches!(result, Err(FleetError::GasTooHigh(_))));
    }

    #[tokio::test]
    async fn test_insufficient_native_balance_quarantines_agent() {
        let mut store = MockStore::new();
        store
            .expect_load_agent()
            .returning(|_| Ok(Some(agent("open-trade", true))));
        store
            .expect_record_trade_error()
            .times(1)
            .returning(|_, _, _| Ok(()));
        store
            .expect_set_activation()
            .withf(|_, active| !active)
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_release_open_trade()
            .times(1)
            .returning(|_, _| Ok(true));

        let mut chain = MockChainProvider::new();
        // native below the 0.5 fee floor
        chain
            .expect_native_balance()
            .returning(|_| Ok(U256::exp10(17)));
        chain
            .expect_token_balance()
            .returning(|_, _| Ok(U256::exp10(18) * 10));

        let result = gateway(store, chain, acceptable_gas())
            .handle(&request(Side::Buy))
            .await;
        assert!(matches!(result, Err(FleetError::InsufficientBalance(_))));
    }

    #[tokio::test]
    async fn test_successful_swap_records_submission_and_pending_row() {
        let req = request(Side::Buy);
        let uuid = req.uuid;

        let mut store = MockStore::new();
        store
            .expect_load_agent()
            .returning(|_| Ok(Some(agent("open-trade", true))));
        store
            .expect_record_trade_submission()
            .withf(move |s| s.uuid == uuid && s.txn_hash == "0xhash" && s.input_token == "WMATIC")
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_insert_pending_txn()
            .withf(move |p| {
                p.trade_uuid == Some(uuid)
                    && p.txn_type == TxnType::Swap
                    && p.symbol == "WMATIC"
                    && p.agent_address == AGENT_ADDR
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut chain = MockChainProvider::new();
        chain
            .expect_native_balance()
            .returning(|_| Ok(U256::exp10(18) * 3));
        chain
            .expect_token_balance()
            .returning(|_, _| Ok(U256::exp10(18) * 10));
        chain
            .expect_submit_swap()
            .withf(|_, input, _, output, _| input.symbol == "WMATIC" && output.symbol == "WETH")
            .times(1)
            .returning(|_, _, _, _, _| Ok("0xhash".to_string()));

        let result = gateway(store, chain, acceptable_gas())
            .handle(&req)
            .await;
        assert!(result.is_ok());
    }
}
