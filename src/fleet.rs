//! Fleet administration: onboarding, activation, and balance refresh.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::adapters::traits::{ChainProvider, Store};
use crate::domain::tokens::{from_wei, parse_address};
use crate::domain::Agent;
use crate::error::{FleetError, Result};

/// Moving-average parameters for one onboarded agent
#[derive(Debug, Clone, Copy)]
pub struct AgentParams {
    pub ma_gain: Decimal,
    pub ma_duration: u32,
}

pub struct FleetAdmin {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainProvider>,
}

impl FleetAdmin {
    pub fn new(store: Arc<dyn Store>, chain: Arc<dyn ChainProvider>) -> Self {
        Self { store, chain }
    }

    /// Create one agent row per parameter set, deriving wallet `i` for the
    /// i-th entry. New agents start inactive and unlocked.
    pub async fn onboard_agents(&self, params: &[AgentParams]) -> Result<()> {
        for (index, param) in params.iter().enumerate() {
            let wallet_index = index as u32;
            let address = self.chain.wallet_address(wallet_index)?;

            let agent = Agent {
                agent_address: format!("{address:?}"),
                wallet_index,
                ma_gain: param.ma_gain,
                ma_duration: param.ma_duration,
                side: None,
                open_trade_id: String::new(),
                is_active: false,
                balance: Decimal::ZERO,
            };
            self.store.insert_agent(&agent).await?;
            info!(
                "Onboarded agent {} (wallet {wallet_index}, gain {}, duration {})",
                agent.agent_address, param.ma_gain, param.ma_duration
            );
        }
        Ok(())
    }

    /// Bulk activation flip with per-agent overrides. Agents whose recorded
    /// balance cannot cover trading fees are refused activation.
    pub async fn set_activation(
        &self,
        activated: bool,
        overrides: &HashMap<String, bool>,
    ) -> Result<()> {
        let agents = self.store.load_all_agents().await?;

        let mut updates = Vec::new();
        for agent in &agents {
            let desired = overrides
                .get(&agent.agent_address)
                .copied()
                .unwrap_or(activated);
            if desired == agent.is_active {
                continue;
            }
            if desired && agent.balance < Decimal::ONE {
                warn!(
                    "Cannot activate {} due to their low trading fee balance ({})",
                    agent.agent_address, agent.balance
                );
                continue;
            }
            updates.push((agent.agent_address.clone(), desired));
        }

        for (address, desired) in &updates {
            self.store.set_activation(address, *desired).await?;
        }
        info!("Activation updates applied: {updates:?}");
        Ok(())
    }

    /// Store the observed native balance on each agent row
    pub async fn refresh_balances(&self, agent_address: Option<&str>) -> Result<()> {
        let agents = match agent_address {
            Some(address) => {
                let agent = self.store.load_agent(address).await?.ok_or_else(|| {
                    FleetError::Validation(format!("no agent exists with the address {address}"))
                })?;
                vec![agent]
            }
            None => self.store.load_all_agents().await?,
        };

        for agent in agents {
            let address = parse_address(&agent.agent_address)?;
            let raw = self.chain.native_balance(address).await?;
            let balance = from_wei(raw, 18)?;

            info!("Updating agent {} balance to {balance}", agent.agent_address);
            self.store
                .set_agent_balance(&agent.agent_address, balance)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::traits::{MockChainProvider, MockStore};
    use ethers::types::U256;
    use rust_decimal_macros::dec;

    const AGENT_ADDR: &str = "0x00000000000000000000000000000000000000a1";

    fn agent(is_active: bool, balance: Decimal) -> Agent {
        Agent {
            agent_address: AGENT_ADDR.to_string(),
            wallet_index: 0,
            ma_gain: dec!(1.05),
            ma_duration: 15,
            side: None,
            open_trade_id: String::new(),
            is_active,
            balance,
        }
    }

    #[tokio::test]
    async fn test_onboarding_creates_inactive_unlocked_agents() {
        let mut store = MockStore::new();
        store
            .expect_insert_agent()
            .withf(|a| !a.is_active && a.open_trade_id.is_empty() && a.side.is_none())
            .times(2)
            .returning(|_| Ok(()));

        let mut chain = MockChainProvider::new();
        chain
            .expect_wallet_address()
            .returning(|i| Ok(ethers::types::Address::repeat_byte(i as u8 + 1)));

        let admin = FleetAdmin::new(Arc::new(store), Arc::new(chain));
        admin
            .onboard_agents(&[
                AgentParams {
                    ma_gain: dec!(1.05),
                    ma_duration: 15,
                },
                AgentParams {
                    ma_gain: dec!(1.10),
                    ma_duration: 60,
                },
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_activation_refused_below_fee_balance() {
        let mut store = MockStore::new();
        store
            .expect_load_all_agents()
            .returning(|| Ok(vec![agent(false, dec!(0.4))]));
        // no set_activation expected: the low-balance agent is refused

        let admin = FleetAdmin::new(Arc::new(store), Arc::new(MockChainProvider::new()));
        admin.set_activation(true, &HashMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_activation_override_wins() {
        let mut store = MockStore::new();
        store
            .expect_load_all_agents()
            .returning(|| Ok(vec![agent(true, dec!(3))]));
        store
            .expect_set_activation()
            .withf(|addr, active| addr == AGENT_ADDR && !active)
            .times(1)
            .returning(|_, _| Ok(()));

        let overrides = HashMap::from([(AGENT_ADDR.to_string(), false)]);
        let admin = FleetAdmin::new(Arc::new(store), Arc::new(MockChainProvider::new()));
        admin.set_activation(true, &overrides).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_balances_stores_human_units() {
        let mut store = MockStore::new();
        store
            .expect_load_all_agents()
            .returning(|| Ok(vec![agent(true, dec!(0))]));
        store
            .expect_set_agent_balance()
            .withf(|_, balance| *balance == dec!(2.5))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut chain = MockChainProvider::new();
        chain
            .expect_native_balance()
            .returning(|_| Ok(U256::exp10(17) * 25));

        let admin = FleetAdmin::new(Arc::new(store), Arc::new(chain));
        admin.refresh_balances(None).await.unwrap();
    }
}
