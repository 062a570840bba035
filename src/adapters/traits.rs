//! Seams to the external collaborators: the key-value store, the chain
//! provider, the gas oracle, the message bus, and the metrics sink.
//!
//! Every stage takes these as injected dependencies so that stage logic can
//! be exercised against mocks.

use async_trait::async_trait;
use ethers::types::{Address, Log, U256};
use ethers::utils::format_units;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::adapters::bus::BusMessage;
use crate::domain::tokens::TokenInfo;
use crate::domain::{
    Agent, LedgerEntry, PendingTxn, PriceHistoryRow, PriceRow, Side, Trade, TradeReceiptUpdate,
    TradeRequest, TradeSettlement, TradeSubmission,
};
use crate::error::{FleetError, Result};

/// EIP-1559 fee estimate from the gas oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasEstimate {
    pub max_fee: U256,
    pub max_priority_fee: U256,
}

impl GasEstimate {
    pub fn total(&self) -> U256 {
        self.max_fee + self.max_priority_fee
    }

    /// Acceptable iff max_fee + max_priority_fee is strictly below the ceiling
    pub fn is_acceptable(&self, ceiling_gwei: u64) -> bool {
        self.total() < gwei(ceiling_gwei)
    }

    pub fn as_gwei(&self) -> String {
        format_units(self.total(), "gwei").unwrap_or_else(|_| self.total().to_string())
    }
}

/// Whole gwei as wei
pub fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::exp10(9)
}

/// Fetch an estimate and fail the calling operation when it is above the
/// admission ceiling. Called immediately before every chain-mutating action.
pub async fn admit_gas(oracle: &dyn GasOracle, ceiling_gwei: u64) -> Result<GasEstimate> {
    let estimate = oracle.estimate().await?;
    if !estimate.is_acceptable(ceiling_gwei) {
        return Err(FleetError::GasTooHigh(format!(
            "{} gwei (ceiling {ceiling_gwei})",
            estimate.as_gwei()
        )));
    }
    Ok(estimate)
}

/// Current gas price oracle
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GasOracle: Send + Sync {
    async fn estimate(&self) -> Result<GasEstimate>;
}

/// Best-effort metrics sink. Implementations swallow and log failures;
/// pushing a metric never fails the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn push_price(&self, pair: &str, ma_duration: u32, gain: Decimal, value: Decimal);
}

/// Publish/subscribe bus between stages. At-least-once; publishing reports
/// failure through the returned bool so the caller decides how to react.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: &BusMessage) -> bool;
}

/// Minimal view of a transaction known to the node
#[derive(Debug, Clone, Copy)]
pub struct TxnMeta {
    pub from: Address,
    /// None while the transaction is unmined
    pub block_number: Option<i64>,
}

/// Minimal view of a mined transaction receipt
#[derive(Debug, Clone)]
pub struct ReceiptMeta {
    pub to_addr: Option<Address>,
    pub block_number: i64,
    pub txn_idx: i32,
    pub status_ok: bool,
    pub cumulative_gas: U256,
    pub logs: Vec<Log>,
}

/// Pool price observation
#[derive(Debug, Clone, Copy)]
pub struct PoolState {
    pub price: Decimal,
    pub liquidity: U256,
}

/// Chain RPC provider plus the opaque execution capabilities (swap, wrap,
/// unwrap, transfer, approval) bound to the fleet's HD wallets.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Address of the HD wallet at a derivation index
    fn wallet_address(&self, wallet_index: u32) -> Result<Address>;

    async fn native_balance(&self, address: Address) -> Result<U256>;

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256>;

    async fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256>;

    async fn transaction_meta(&self, txn_hash: &str) -> Result<Option<TxnMeta>>;

    async fn transaction_receipt(&self, txn_hash: &str) -> Result<Option<ReceiptMeta>>;

    async fn block_timestamp(&self, block_number: i64) -> Result<i64>;

    /// Submit an exact-input swap; returns the transaction hash
    async fn submit_swap(
        &self,
        wallet_index: u32,
        token_in: TokenInfo,
        amount_in: U256,
        token_out: TokenInfo,
        gas: GasEstimate,
    ) -> Result<String>;

    /// Wrap native balance into the wrapped native token
    async fn submit_wrap(&self, wallet_index: u32, amount: U256, gas: GasEstimate)
        -> Result<String>;

    /// Withdraw wrapped native back to native
    async fn submit_unwrap(
        &self,
        wallet_index: u32,
        amount: U256,
        gas: GasEstimate,
    ) -> Result<String>;

    /// Fire-and-forget native transfer
    async fn submit_transfer(
        &self,
        wallet_index: u32,
        to: Address,
        amount: U256,
        gas: GasEstimate,
    ) -> Result<String>;

    /// Native transfer that waits for mining; returns whether it succeeded
    async fn transfer_and_wait(
        &self,
        wallet_index: u32,
        to: Address,
        amount: U256,
        gas: GasEstimate,
    ) -> Result<bool>;

    /// Set (or revoke) a router allowance; waits for mining
    async fn submit_approval(
        &self,
        wallet_index: u32,
        token: Address,
        spender: Address,
        amount: U256,
        gas: GasEstimate,
    ) -> Result<String>;

    /// Read the pool price and liquidity for a token pair
    async fn pool_state(
        &self,
        token_a: TokenInfo,
        token_b: TokenInfo,
        use_token1_price: bool,
    ) -> Result<PoolState>;
}

/// Key-value table access shared by all stages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    // ==================== Agents ====================

    async fn load_agent(&self, agent_address: &str) -> Result<Option<Agent>>;

    async fn load_all_agents(&self) -> Result<Vec<Agent>>;

    async fn load_active_agents(&self) -> Result<Vec<Agent>>;

    async fn insert_agent(&self, agent: &Agent) -> Result<()>;

    async fn set_agent_balance(&self, agent_address: &str, balance: Decimal) -> Result<()>;

    async fn set_activation(&self, agent_address: &str, is_active: bool) -> Result<()>;

    /// Flip the agent's side, or force it to a given side
    async fn switch_sides(&self, agent_address: &str, side: Option<Side>) -> Result<()>;

    /// Conditionally take the open-trade lock; false when already held
    async fn acquire_open_trade(&self, agent_address: &str, trade_uuid: Uuid) -> Result<bool>;

    /// Conditionally release the open-trade lock; false when the held value
    /// no longer matches the expected one
    async fn release_open_trade(&self, agent_address: &str, expected_uuid: &str) -> Result<bool>;

    // ==================== Trades ====================

    async fn insert_trade(&self, request: &TradeRequest) -> Result<()>;

    async fn mark_trade_dropped(&self, trade_uuid: Uuid) -> Result<()>;

    async fn record_trade_submission(&self, submission: &TradeSubmission) -> Result<()>;

    async fn update_trade_receipt(&self, update: &TradeReceiptUpdate) -> Result<()>;

    async fn settle_trade(&self, settlement: &TradeSettlement) -> Result<()>;

    async fn load_recent_trades(&self, limit: i64) -> Result<Vec<Trade>>;

    // ==================== Pending transactions ====================

    async fn load_pending_txns(&self) -> Result<Vec<PendingTxn>>;

    async fn insert_pending_txn(&self, txn: &PendingTxn) -> Result<()>;

    async fn delete_pending_txn(&self, txn_hash: &str) -> Result<()>;

    // ==================== Ledger ====================

    async fn append_ledger_entry(&self, entry: &LedgerEntry) -> Result<()>;

    // ==================== Prices ====================

    async fn get_price(&self, pair: &str) -> Result<Option<PriceRow>>;

    async fn upsert_price(&self, row: &PriceRow) -> Result<()>;

    async fn append_price_history(&self, row: &PriceHistoryRow) -> Result<()>;

    /// USDC-quoted prices for every known pair
    async fn load_usdc_prices(&self) -> Result<HashMap<String, Decimal>>;

    // ==================== Errors ====================

    async fn record_trade_error(
        &self,
        trade_uuid: Uuid,
        agent_address: &str,
        message: &str,
    ) -> Result<()>;
}
