//! Stage 1: evaluate the moving-average signal for every active agent and
//! apply the resulting trade adds/drops.
//!
//! The whole cycle aborts before touching any agent when gas is above the
//! admission ceiling or the trading pair has no price row.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::bus::BusMessage;
use crate::adapters::traits::{admit_gas, GasOracle, MessageBus, MetricsSink, Store};
use crate::config::TradingConfig;
use crate::domain::{Agent, PriceRow, Side, TradeAction, TradeRequest};
use crate::error::{FleetError, Result};

/// Outcome of one signal cycle
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleSummary {
    pub evaluated: usize,
    pub added: usize,
    pub dropped: usize,
}

/// The single agent closest to triggering, tracked across one cycle purely
/// for observability
#[derive(Debug, Clone)]
struct TradeProximity {
    price: Decimal,
    gap_pct: Decimal,
    wallet_index: Option<u32>,
    price_needed: Option<Decimal>,
    side: Option<Side>,
}

impl TradeProximity {
    fn new(price: Decimal) -> Self {
        Self {
            price,
            gap_pct: Decimal::ZERO,
            wallet_index: None,
            price_needed: None,
            side: None,
        }
    }
}

pub struct SignalEngine {
    store: Arc<dyn Store>,
    bus: Arc<dyn MessageBus>,
    gas: Arc<dyn GasOracle>,
    metrics: Arc<dyn MetricsSink>,
    trading: TradingConfig,
    gas_ceiling_gwei: u64,
}

impl SignalEngine {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn MessageBus>,
        gas: Arc<dyn GasOracle>,
        metrics: Arc<dyn MetricsSink>,
        trading: TradingConfig,
        gas_ceiling_gwei: u64,
    ) -> Self {
        Self {
            store,
            bus,
            gas,
            metrics,
            trading,
            gas_ceiling_gwei,
        }
    }

    /// Run one full cycle: admission, evaluation, then adds and drops
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        admit_gas(self.gas.as_ref(), self.gas_ceiling_gwei).await?;

        let agents = self.store.load_active_agents().await?;
        let price_row = self
            .store
            .get_price(&self.trading.pair)
            .await?
            .ok_or_else(|| FleetError::PriceUnavailable(self.trading.pair.clone()))?;
        if price_row.price <= Decimal::ZERO {
            return Err(FleetError::PriceUnavailable(format!(
                "non-positive price for {}",
                self.trading.pair
            )));
        }

        let actions = self.evaluate(&agents, &price_row).await;
        let mut summary = CycleSummary {
            evaluated: agents.len(),
            ..CycleSummary::default()
        };

        for (agent, action) in &actions {
            match action {
                TradeAction::AddTrade => {
                    if self.add_trade(agent, price_row.price).await? {
                        summary.added += 1;
                    }
                }
                TradeAction::DropTrade => {
                    if self.drop_trade(agent).await? {
                        summary.dropped += 1;
                    }
                }
                TradeAction::None => {}
            }
        }

        info!(
            "Signal cycle complete: {} agents, {} added, {} dropped",
            summary.evaluated, summary.added, summary.dropped
        );
        Ok(summary)
    }

    /// Decide the action for each agent and track the best proximity
    async fn evaluate(&self, agents: &[Agent], row: &PriceRow) -> Vec<(Agent, TradeAction)> {
        let price = row.price;
        let mut proximity = TradeProximity::new(price);
        let mut actions = Vec::with_capacity(agents.len());

        for agent in agents {
            let Some(ma) = self.bucket_for(agent, row) else {
                warn!(
                    "Agent {} duration {} has no moving-average bucket; skipped",
                    agent.agent_address, agent.ma_duration
                );
                continue;
            };

            let lower = ma / agent.ma_gain;
            let upper = ma * agent.ma_gain;
            track_proximity(&mut proximity, agent, lower, upper);

            let side = agent.effective_side();
            let threshold = if side == Side::Buy { lower } else { upper };
            self.metrics
                .push_price(&self.trading.pair, agent.ma_duration, agent.ma_gain, threshold)
                .await;

            let action = decide(side, price, lower, upper, agent.has_open_trade());
            debug!(
                "Agent {} side={side} ma={ma} band=[{lower:.4}, {upper:.4}] price={price} -> {action:?}",
                agent.agent_address
            );
            actions.push((agent.clone(), action));
        }

        info!(
            "Most favorable trade: wallet={:?} side={:?} needs {:?} (gap {} at price {})",
            proximity.wallet_index,
            proximity.side,
            proximity.price_needed,
            proximity.gap_pct,
            proximity.price
        );
        actions
    }

    fn bucket_for(&self, agent: &Agent, row: &PriceRow) -> Option<Decimal> {
        let index = self.trading.sma_bucket_index(agent.ma_duration)?;
        row.smas.get(index).copied()
    }

    /// Persist the trade, take the agent lock, then hand off to the gateway
    async fn add_trade(&self, agent: &Agent, price: Decimal) -> Result<bool> {
        let request = TradeRequest::new(
            &agent.agent_address,
            agent.effective_side(),
            price.round_dp(self.trading.price_decimals),
        );

        self.store.insert_trade(&request).await?;

        if !self
            .store
            .acquire_open_trade(&agent.agent_address, request.uuid)
            .await?
        {
            warn!(
                "Agent {} lock taken by a concurrent trade; dropping {}",
                agent.agent_address, request.uuid
            );
            self.store.mark_trade_dropped(request.uuid).await?;
            return Ok(false);
        }

        info!("Requesting trade {request:?}");
        if !self
            .bus
            .publish(&BusMessage::TradeRequest(request.clone()))
            .await
        {
            // No gateway invocation will ever arrive for this trade, so an
            // agent left locked here would be locked forever
            warn!(
                "Trade request {} failed to publish; releasing agent {}",
                request.uuid, agent.agent_address
            );
            self.store
                .release_open_trade(&agent.agent_address, &request.uuid.to_string())
                .await?;
            self.store.mark_trade_dropped(request.uuid).await?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Release the lock and mark the open trade dropped
    async fn drop_trade(&self, agent: &Agent) -> Result<bool> {
        let expected = agent.open_trade_id.clone();
        if !self
            .store
            .release_open_trade(&agent.agent_address, &expected)
            .await?
        {
            warn!(
                "Agent {} lock changed concurrently; drop of {expected} skipped",
                agent.agent_address
            );
            return Ok(false);
        }

        match Uuid::parse_str(&expected) {
            Ok(uuid) => self.store.mark_trade_dropped(uuid).await?,
            Err(_) => warn!(
                "Agent {} held a malformed trade id '{expected}'",
                agent.agent_address
            ),
        }
        Ok(true)
    }
}

/// Trade decision for one agent given the band around its moving average
fn decide(side: Side, price: Decimal, lower: Decimal, upper: Decimal, has_open: bool) -> TradeAction {
    match side {
        Side::Buy => {
            if price <= lower {
                if has_open {
                    TradeAction::None
                } else {
                    TradeAction::AddTrade
                }
            } else if has_open {
                TradeAction::DropTrade
            } else {
                TradeAction::None
            }
        }
        Side::Sell => {
            if price >= upper {
                if has_open {
                    TradeAction::None
                } else {
                    TradeAction::AddTrade
                }
            } else if has_open {
                TradeAction::DropTrade
            } else {
                TradeAction::None
            }
        }
    }
}

fn track_proximity(best: &mut TradeProximity, agent: &Agent, lower: Decimal, upper: Decimal) {
    if best.price <= Decimal::ZERO || upper <= Decimal::ZERO {
        return;
    }
    let buy_gap = lower / best.price;
    let sell_gap = best.price / upper;

    if buy_gap > best.gap_pct {
        best.wallet_index = Some(agent.wallet_index);
        best.gap_pct = buy_gap;
        best.price_needed = Some(lower);
        best.side = Some(Side::Buy);
    } else if sell_gap > best.gap_pct {
        best.wallet_index = Some(agent.wallet_index);
        best.gap_pct = sell_gap;
        best.price_needed = Some(upper);
        best.side = Some(Side::Sell);
    }
}
