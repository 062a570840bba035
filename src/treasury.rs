//! Treasury housekeeping: wrap/unwrap, fee refills, sweeps, and router
//! approvals. One-shot operations built on the fleet's shared primitives
//! (wallet derivation, gas admission, the pending-transaction queue).

use chrono::Utc;
use ethers::types::U256;
use std::sync::Arc;
use tracing::{info, warn};

use crate::adapters::bus::BusMessage;
use crate::adapters::traits::{admit_gas, ChainProvider, GasOracle, MessageBus, Store};
use crate::config::TreasuryConfig;
use crate::domain::tokens::{self, parse_address, to_wei};
use crate::domain::{Agent, PendingTxn, TxnType};
use crate::error::{FleetError, Result};

pub struct TreasuryOps {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainProvider>,
    gas: Arc<dyn GasOracle>,
    bus: Arc<dyn MessageBus>,
    config: TreasuryConfig,
    gas_ceiling_gwei: u64,
    /// Destination for swept funds; sweeping is refused when unset
    withdrawal_addr: Option<String>,
}

impl TreasuryOps {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainProvider>,
        gas: Arc<dyn GasOracle>,
        bus: Arc<dyn MessageBus>,
        config: TreasuryConfig,
        gas_ceiling_gwei: u64,
        withdrawal_addr: Option<String>,
    ) -> Self {
        Self {
            store,
            chain,
            gas,
            bus,
            config,
            gas_ceiling_gwei,
            withdrawal_addr,
        }
    }

    async fn select_agents(&self, only_addresses: &[String]) -> Result<Vec<Agent>> {
        let mut agents = self.store.load_all_agents().await?;
        if !only_addresses.is_empty() {
            agents.retain(|a| only_addresses.contains(&a.agent_address));
        }
        Ok(agents)
    }

    /// Wrap each selected agent's native balance, minus the reserve
    pub async fn wrap_all(&self, only_addresses: &[String]) -> Result<()> {
        let gas = admit_gas(self.gas.as_ref(), self.gas_ceiling_gwei).await?;
        let reserve = to_wei(self.config.reserve, 18)?;

        for agent in self.select_agents(only_addresses).await? {
            let address = parse_address(&agent.agent_address)?;
            let balance = self.chain.native_balance(address).await?;

            let Some(wrappable) = balance.checked_sub(reserve).filter(|w| !w.is_zero()) else {
                info!("Balance too low to wrap for agent {}", agent.agent_address);
                continue;
            };

            let txn_hash = self
                .chain
                .submit_wrap(agent.wallet_index, wrappable, gas)
                .await?;
            self.store
                .insert_pending_txn(&PendingTxn {
                    txn_hash,
                    trade_uuid: None,
                    agent_address: agent.agent_address.clone(),
                    wallet_index: agent.wallet_index,
                    symbol: tokens::WMATIC.to_string(),
                    amount: wrappable.to_string(),
                    txn_type: TxnType::Wrap,
                    created_on: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    /// Unwrap each selected agent's full wrapped balance
    pub async fn unwrap_all(&self, only_addresses: &[String]) -> Result<()> {
        let gas = admit_gas(self.gas.as_ref(), self.gas_ceiling_gwei).await?;
        let wmatic = tokens::wmatic();

        for agent in self.select_agents(only_addresses).await? {
            let address = parse_address(&agent.agent_address)?;
            let balance = self.chain.token_balance(wmatic.address, address).await?;

            if balance.is_zero() {
                info!("{} skipped (no balance to unwrap)", agent.agent_address);
                continue;
            }

            info!("{} submitting unwrap request", agent.agent_address);
            let txn_hash = self
                .chain
                .submit_unwrap(agent.wallet_index, balance, gas)
                .await?;
            self.store
                .insert_pending_txn(&PendingTxn {
                    txn_hash: txn_hash.clone(),
                    trade_uuid: None,
                    agent_address: agent.agent_address.clone(),
                    wallet_index: agent.wallet_index,
                    symbol: wmatic.symbol.to_string(),
                    amount: balance.to_string(),
                    txn_type: TxnType::Unwrap,
                    created_on: Utc::now(),
                })
                .await?;
            info!(
                "{} submitted txn {txn_hash} to unwrap balance {balance}",
                agent.agent_address
            );
        }
        Ok(())
    }

    /// Split the treasury wallet's spare balance across the selected agents
    /// by publishing one refill request per agent
    pub async fn refill_fees(&self, only_addresses: &[String]) -> Result<()> {
        let min_balance = to_wei(self.config.refill_min_balance, 18)?;
        let reserve = min_balance * 2;

        let treasury_addr = self.chain.wallet_address(0)?;
        let balance = self.chain.native_balance(treasury_addr).await?;
        info!("Current treasury balance is {balance} for {treasury_addr:?}");

        let agents = self.select_agents(only_addresses).await?;
        info!("{} agents selected for refill", agents.len());

        if balance < min_balance {
            return Err(FleetError::InsufficientBalance(
                "not enough treasury balance to refill".to_string(),
            ));
        }
        let spare = balance.checked_sub(reserve).ok_or_else(|| {
            FleetError::InsufficientBalance("treasury reserve exceeds balance".to_string())
        })?;
        if agents.is_empty() {
            return Ok(());
        }
        let per_agent = spare / U256::from(agents.len() as u64 + 1);
        info!("Refilling {per_agent} per agent");

        for agent in &agents {
            let published = self
                .bus
                .publish(&BusMessage::RefillRequest {
                    agent_address: agent.agent_address.clone(),
                    amount: per_agent.to_string(),
                })
                .await;
            if !published {
                warn!("Refill request for {} failed to publish", agent.agent_address);
            }
        }
        Ok(())
    }

    /// Transfer a refill amount from the treasury wallet to one agent
    pub async fn refill_fee(&self, agent_address: &str, amount: &str) -> Result<()> {
        // Only known agents receive funds
        let Some(agent) = self.store.load_agent(agent_address).await? else {
            return Err(FleetError::Validation(format!(
                "no agent exists with the address {agent_address}"
            )));
        };

        let treasury_addr = self.chain.wallet_address(0)?;
        let balance = self.chain.native_balance(treasury_addr).await?;
        if balance < to_wei(self.config.refill_min_balance, 18)? {
            return Err(FleetError::InsufficientBalance(
                "not enough treasury balance to refill".to_string(),
            ));
        }

        let amount = U256::from_dec_str(amount)
            .map_err(|e| FleetError::Validation(format!("bad refill amount '{amount}': {e}")))?;
        let gas = admit_gas(self.gas.as_ref(), self.gas_ceiling_gwei).await?;

        let to = parse_address(agent_address)?;
        let txn_hash = self.chain.submit_transfer(0, to, amount, gas).await?;
        self.store
            .insert_pending_txn(&PendingTxn {
                txn_hash: txn_hash.clone(),
                trade_uuid: None,
                agent_address: agent.agent_address.clone(),
                wallet_index: agent.wallet_index,
                symbol: tokens::WMATIC.to_string(),
                amount: amount.to_string(),
                txn_type: TxnType::Transfer,
                created_on: Utc::now(),
            })
            .await?;
        info!("Transfer {txn_hash} of {amount} to {agent_address} is submitted");
        Ok(())
    }

    /// Send each selected agent's native balance, minus the reserve, to the
    /// trusted withdrawal address. Transfers are awaited serially; the
    /// ledger is not touched for native movements.
    pub async fn sweep(&self, only_addresses: &[String]) -> Result<()> {
        let destination = self
            .withdrawal_addr
            .as_deref()
            .ok_or_else(|| {
                FleetError::Validation("trusted withdrawal address is not configured".to_string())
            })
            .and_then(parse_address)?;
        info!("Withdrawal address set to {destination:?}");

        let reserve = to_wei(self.config.reserve, 18)?;

        for agent in self.select_agents(only_addresses).await? {
            let gas = match admit_gas(self.gas.as_ref(), self.gas_ceiling_gwei).await {
                Ok(gas) => gas,
                Err(FleetError::GasTooHigh(detail)) => {
                    warn!("Sweep stopped: {detail}");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let address = parse_address(&agent.agent_address)?;
            let balance = self.chain.native_balance(address).await?;
            let Some(available) = balance.checked_sub(reserve).filter(|b| !b.is_zero()) else {
                info!("Balance too low to sweep for agent {}", agent.agent_address);
                continue;
            };

            info!(
                "Wallet {} sweep of {available} submitted",
                agent.wallet_index
            );
            let succeeded = self
                .chain
                .transfer_and_wait(agent.wallet_index, destination, available, gas)
                .await?;
            info!(
                "Sweep for wallet {} {}",
                agent.wallet_index,
                if succeeded { "succeeded" } else { "failed" }
            );
        }
        Ok(())
    }

    /// Grant (or revoke) the swap router's allowance over both trade tokens
    pub async fn set_approvals(&self, only_addresses: &[String], revoke: bool) -> Result<()> {
        let router = tokens::swap_router();
        let desired = if revoke { U256::zero() } else { U256::MAX };

        for agent in self.select_agents(only_addresses).await? {
            let owner = parse_address(&agent.agent_address)?;
            for token in [tokens::weth(), tokens::wmatic()] {
                let allowance = self.chain.allowance(token.address, owner, router).await?;
                let settled = if revoke {
                    allowance.is_zero()
                } else {
                    !allowance.is_zero()
                };
                if settled {
                    info!(
                        "No action needed on wallet {owner:?} for token {}",
                        token.symbol
                    );
                    continue;
                }

                let gas = admit_gas(self.gas.as_ref(), self.gas_ceiling_gwei).await?;
                let txn_hash = self
                    .chain
                    .submit_approval(agent.wallet_index, token.address, router, desired, gas)
                    .await?;
                info!(
                    "{} approval to {} in txn {txn_hash} for {owner:?}",
                    if revoke { "Revoking" } else { "Setting" },
                    token.symbol
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::traits::{
        gwei, GasEstimate, MockChainProvider, MockGasOracle, MockMessageBus, MockStore,
    };
    use ethers::types::Address;
    use rust_decimal_macros::dec;

    const AGENT_ADDR: &str = "0x00000000000000000000000000000000000000a1";

    fn agent() -> Agent {
        Agent {
            agent_address: AGENT_ADDR.to_string(),
            wallet_index: 1,
            ma_gain: dec!(1.05),
            ma_duration: 15,
            side: None,
            open_trade_id: String::new(),
            is_active: true,
            balance: dec!(3),
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

    fn ops(
        store: MockStore,
        chain: MockChainProvider,
        gas: MockGasOracle,
        bus: MockMessageBus,
        withdrawal: Option<&str>,
    ) -> TreasuryOps {
        TreasuryOps::new(
            Arc::new(store),
            Arc::new(chain),
            Arc::new(gas),
            Arc::new(bus),
            TreasuryConfig {
                reserve: dec!(2),
                refill_min_balance: dec!(1),
            },
            444,
            withdrawal.map(|s| s.to_string()),
        )
    }

    #[tokio::test]
    async fn test_wrap_skips_balances_below_reserve() {
        let mut store = MockStore::new();
        store.expect_load_all_agents().returning(|| Ok(vec![agent()]));
        // no pending-txn insert expected

        let mut chain = MockChainProvider::new();
        chain
            .expect_native_balance()
            .returning(|_| Ok(U256::exp10(18))); // 1 < 2 reserve

        ops(
            store,
            chain,
            acceptable_gas(),
            MockMessageBus::new(),
            None,
        )
        .wrap_all(&[])
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wrap_enqueues_pending_row_for_spare_balance() {
        let mut store = MockStore::new();
        store.expect_load_all_agents().returning(|| Ok(vec![agent()]));
        store
            .expect_insert_pending_txn()
            .withf(|p| {
                p.txn_type == TxnType::Wrap
                    && p.trade_uuid.is_none()
                    && p.symbol == "WMATIC"
                    && p.amount == U256::exp10(18).to_string()
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut chain = MockChainProvider::new();
        chain
            .expect_native_balance()
            .returning(|_| Ok(U256::exp10(18) * 3)); // 3 - 2 reserve = 1
        chain
            .expect_submit_wrap()
            .times(1)
            .returning(|_, _, _| Ok("0xwrap".to_string()));

        ops(
            store,
            chain,
            acceptable_gas(),
            MockMessageBus::new(),
            None,
        )
        .wrap_all(&[])
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_refill_fans_out_one_message_per_agent() {
        let mut store = MockStore::new();
        store
            .expect_load_all_agents()
            .returning(|| Ok(vec![agent(), agent()]));

        let mut chain = MockChainProvider::new();
        chain
            .expect_wallet_address()
            .returning(|_| Ok(Address::zero()));
        chain
            .expect_native_balance()
            .returning(|_| Ok(U256::exp10(18) * 8)); // spare 6, 2 per agent

        let mut bus = MockMessageBus::new();
        bus.expect_publish()
            .withf(|m| {
                matches!(
                    m,
                    BusMessage::RefillRequest { amount, .. } if amount == &(U256::exp10(18) * U256::from(2u64)).to_string()
                )
            })
            .times(2)
            .returning(|_| true);

        ops(store, chain, MockGasOracle::new(), bus, None)
            .refill_fees(&[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refill_rejects_unknown_agent() {
        let mut store = MockStore::new();
        store.expect_load_agent().returning(|_| Ok(None));

        let result = ops(
            store,
            MockChainProvider::new(),
            MockGasOracle::new(),
            MockMessageBus::new(),
            None,
        )
        .refill_fee(AGENT_ADDR, "1000")
        .await;
        assert!(matches!(result, Err(FleetError::Validation(_))));
    }

    #[tokio::test]
    async fn test_sweep_requires_withdrawal_address() {
        let result = ops(
            MockStore::new(),
            MockChainProvider::new(),
            MockGasOracle::new(),
            MockMessageBus::new(),
            None,
        )
        .sweep(&[])
        .await;
        assert!(matches!(result, Err(FleetError::Validation(_))));
    }

    #[tokio::test]
    async fn test_approvals_skip_when_already_in_desired_state() {
        let mut store = MockStore::new();
        store.expect_load_all_agents().returning(|| Ok(vec![agent()]));

        let mut chain = MockChainProvider::new();
        chain.expect_allowance().returning(|_, _, _| Ok(U256::MAX));
        // no submit_approval expected

        ops(
            store,
            chain,
            MockGasOracle::new(),
            MockMessageBus::new(),
            None,
        )
        .set_approvals(&[], false)
        .await
        .unwrap();
    }
}
