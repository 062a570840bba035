//! Stage 4: consume receipt messages and settle their outcomes into the
//! ledger and the agent registry.
//!
//! Receipts are one tagged message shape; the dispatcher routes each to the
//! closer registered for its transaction type instead of duck-typing fields.

use chrono::Utc;
use ethers::abi::RawLog;
use ethers::contract::EthLogDecode;
use ethers::types::{Address, Log, U256};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapters::evm::TransferFilter;
use crate::adapters::traits::Store;
use crate::domain::tokens::{counter_symbol, parse_address, usdc_pair};
use crate::domain::{
    LedgerEntry, Side, TradeSettlement, TxnReceipt, TxnStatus, TxnType,
};
use crate::error::{FleetError, Result};

/// Routes receipt messages to the closer matching their transaction type
pub struct ReceiptDispatcher {
    trade: TradeCloser,
    treasury: TreasuryCloser,
}

impl ReceiptDispatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            trade: TradeCloser::new(store.clone()),
            treasury: TreasuryCloser::new(store),
        }
    }

    pub async fn dispatch(&self, receipt: &TxnReceipt) -> Result<()> {
        match receipt.pending.txn_type {
            TxnType::Swap => self.trade.handle(receipt).await,
            TxnType::Wrap | TxnType::Unwrap => self.treasury.handle(receipt).await,
            TxnType::Transfer => {
                debug!(
                    "No closer registered for {} receipt {}",
                    receipt.pending.txn_type, receipt.pending.txn_hash
                );
                Ok(())
            }
        }
    }
}

/// Settles SWAP receipts: ledger postings, trade settlement fields, side
/// flip, and the agent lock release
pub struct TradeCloser {
    store: Arc<dyn Store>,
}

impl TradeCloser {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn handle(&self, receipt: &TxnReceipt) -> Result<()> {
        match receipt.txn_status {
            TxnStatus::Applied => {
                self.settle_applied(receipt).await?;
                self.unlock(receipt).await
            }
            TxnStatus::Reverted => {
                // No ledger postings and no further trade-row changes
                info!(
                    "Trade txn {} reverted; reactivating agent {}",
                    receipt.pending.txn_hash, receipt.pending.agent_address
                );
                self.unlock(receipt).await
            }
            other => {
                info!("Taking no action for receipt status {other}");
                Ok(())
            }
        }
    }

    async fn settle_applied(&self, receipt: &TxnReceipt) -> Result<()> {
        let agent = parse_address(&receipt.pending.agent_address)?;
        let (input_bal, output_bal) = decode_swap_transfers(&receipt.logs, agent)?;
        debug!(
            "Swap {} moved {input_bal} in, {output_bal} out",
            receipt.pending.txn_hash
        );

        let input_symbol = receipt.pending.symbol.as_str();
        let output_symbol = counter_symbol(input_symbol)
            .ok_or_else(|| FleetError::UnsupportedSymbol(input_symbol.to_string()))?;

        let prices = self.store.load_usdc_prices().await?;
        let input_price = usdc_price(&prices, input_symbol)?;
        let output_price = usdc_price(&prices, output_symbol)?;

        self.store
            .append_ledger_entry(&ledger_entry(
                receipt,
                input_symbol,
                receipt.pending.amount.clone(),
                input_price,
                true,
            ))
            .await?;
        self.store
            .append_ledger_entry(&ledger_entry(
                receipt,
                output_symbol,
                output_bal.to_string(),
                output_price,
                false,
            ))
            .await?;

        let trade_uuid = receipt.pending.trade_uuid.ok_or_else(|| {
            FleetError::InconsistentState(format!(
                "swap receipt {} has no trade uuid",
                receipt.pending.txn_hash
            ))
        })?;
        self.store
            .settle_trade(&TradeSettlement {
                uuid: trade_uuid,
                output_bal: output_bal.to_string(),
                input_price,
                output_price,
            })
            .await?;

        self.store
            .switch_sides(&receipt.pending.agent_address, None)
            .await?;
        Ok(())
    }

    /// Clear the lock and reactivate, whatever the trade outcome was
    async fn unlock(&self, receipt: &TxnReceipt) -> Result<()> {
        match receipt.pending.trade_uuid {
            Some(uuid) => {
                if !self
                    .store
                    .release_open_trade(&receipt.pending.agent_address, &uuid.to_string())
                    .await?
                {
                    warn!(
                        "Agent {} no longer holds trade {uuid}; lock already released",
                        receipt.pending.agent_address
                    );
                }
            }
            None => warn!(
                "Swap receipt {} without a trade uuid; nothing to release",
                receipt.pending.txn_hash
            ),
        }
        self.store
            .set_activation(&receipt.pending.agent_address, true)
            .await
    }
}

/// Settles WRAP/UNWRAP receipts with a single-sided ledger posting
pub struct TreasuryCloser {
    store: Arc<dyn Store>,
}

impl TreasuryCloser {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn handle(&self, receipt: &TxnReceipt) -> Result<()> {
        if receipt.txn_status != TxnStatus::Applied {
            info!(
                "Taking no action for {} receipt status {}",
                receipt.pending.txn_type, receipt.txn_status
            );
            return Ok(());
        }

        let symbol = receipt.pending.symbol.as_str();
        let prices = self.store.load_usdc_prices().await?;
        let price = usdc_price(&prices, symbol)?;

        let entry = ledger_entry(
            receipt,
            symbol,
            receipt.pending.amount.clone(),
            price,
            receipt.pending.txn_type == TxnType::Unwrap,
        );
        info!("Adding ledger entry {entry:?}");

        // Treasury movements reset the agent to its initial trading side
        self.store
            .switch_sides(&receipt.pending.agent_address, Some(Side::Buy))
            .await?;
        self.store.append_ledger_entry(&entry).await
    }
}

fn usdc_price(prices: &HashMap<String, Decimal>, symbol: &str) -> Result<Decimal> {
    let pair = usdc_pair(symbol);
    prices
        .get(&pair)
        .copied()
        .ok_or_else(|| FleetError::PriceUnavailable(pair))
}

fn ledger_entry(
    receipt: &TxnReceipt,
    symbol: &str,
    amount: String,
    price: Decimal,
    debit: bool,
) -> LedgerEntry {
    // Swap postings disambiguate the shared hash; single-sided postings keep
    // it as-is
    let txn_hash = if receipt.pending.txn_type == TxnType::Swap {
        LedgerEntry::suffixed_hash(&receipt.pending.txn_hash, debit)
    } else {
        receipt.pending.txn_hash.clone()
    };

    LedgerEntry {
        txn_hash,
        txn_block: receipt.txn_block,
        txn_idx: receipt.txn_idx,
        gas: receipt.gas.clone(),
        agent_address: receipt.pending.agent_address.clone(),
        symbol: symbol.to_string(),
        price,
        txn_type: receipt.pending.txn_type,
        amount,
        debit,
        created_on: Utc::now(),
    }
}

/// Extract the swap amounts from the receipt's transfer events.
///
/// Log index 1 is the input-side transfer and must originate from the
/// agent; log index 0 is the output-side transfer and must pay the agent.
/// Any mismatch is fatal for the message.
fn decode_swap_transfers(logs: &[Log], agent: Address) -> Result<(U256, U256)> {
    let transfer_out = decode_transfer(logs.first().ok_or_else(|| {
        FleetError::InconsistentState("swap receipt has no output transfer log".to_string())
    })?)?;
    let transfer_in = decode_transfer(logs.get(1).ok_or_else(|| {
        FleetError::InconsistentState("swap receipt has no input transfer log".to_string())
    })?)?;

    if transfer_in.from != agent {
        return Err(FleetError::InconsistentState(format!(
            "unexpected input transfer from {:?}, wanted agent {agent:?}",
            transfer_in.from
        )));
    }
    if transfer_out.to != agent {
        return Err(FleetError::InconsistentState(format!(
            "unexpected output transfer to {:?}, wanted agent {agent:?}",
            transfer_out.to
        )));
    }

    Ok((transfer_in.value, transfer_out.value))
}

fn decode_transfer(log: &Log) -> Result<TransferFilter> {
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    TransferFilter::decode_log(&raw)
        .map_err(|e| FleetError::InconsistentState(format!("undecodable transfer log: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::traits::MockStore;
    use crate::domain::tokens::{WETH_USDC_PAIR, WMATIC_USDC_PAIR};
    use crate::domain::PendingTxn;
    use ethers::types::{Bytes, H256};
    use ethers::utils::keccak256;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    const AGENT_ADDR: &str = "0x00000000000000000000000000000000000000a1";

    fn agent_address() -> Address {
        AGENT_ADDR.parse().unwrap()
    }

    fn transfer_log(from: Address, to: Address, value: U256) -> Log {
        let mut data = [0u8; 32];
        value.to_big_endian(&mut data);
        Log {
            address: crate::domain::tokens::weth().address,
            topics: vec![
                H256::from(keccak256("Transfer(address,address,uint256)")),
                H256::from(from),
                H256::from(to),
            ],
            data: Bytes::from(data.to_vec()),
            ..Default::default()
        }
    }

    fn receipt(
        txn_type: TxnType,
        txn_status: TxnStatus,
        trade_uuid: Option<Uuid>,
        logs: Vec<Log>,
    ) -> TxnReceipt {
        TxnReceipt {
            pending: PendingTxn {
                txn_hash: "0xabc".to_string(),
                trade_uuid,
                agent_address: AGENT_ADDR.to_string(),
                wallet_index: 1,
                symbol: "WETH".to_string(),
                amount: "5000".to_string(),
                txn_type,
                created_on: Utc::now(),
            },
            to_addr: "0xrouter".to_string(),
            txn_block: 42,
            txn_idx: 3,
            block_timestamp: 1_700_000_000,
            gas: "21000".to_string(),
            txn_status,
            logs,
        }
    }

    fn prices() -> HashMap<String, Decimal> {
        HashMap::from([
            (WETH_USDC_PAIR.to_string(), dec!(3300)),
            (WMATIC_USDC_PAIR.to_string(), dec!(0.52)),
        ])
    }

    fn swap_logs() -> Vec<Log> {
        vec![
            // output-side: pool pays the agent
            transfer_log(Address::zero(), agent_address(), U256::from(9000u64)),
            // input-side: agent pays the pool
            transfer_log(agent_address(), Address::zero(), U256::from(5000u64)),
        ]
    }

    #[tokio::test]
    async fn test_reverted_trade_unlocks_without_ledger_postings() {
        let uuid = Uuid::new_v4();

        let mut store = MockStore::new();
        store
            .expect_release_open_trade()
            .withf(move |addr, expected| addr == AGENT_ADDR && expected == uuid.to_string())
            .times(1)
            .returning(|_, _| Ok(true));
        store
            .expect_set_activation()
            .withf(|addr, active| addr == AGENT_ADDR && *active)
            .times(1)
            .returning(|_, _| Ok(()));

        // no ledger/settle/switch expectations: those calls would panic
        let closer = TradeCloser::new(Arc::new(store));
        closer
            .handle(&receipt(TxnType::Swap, TxnStatus::Reverted, Some(uuid), vec![]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_applied_trade_posts_debit_and_credit_and_flips_side() {
        let uuid = Uuid::new_v4();

        let mut store = MockStore::new();
        store.expect_load_usdc_prices().returning(|| Ok(prices()));
        store
            .expect_append_ledger_entry()
            .withf(|entry| {
                entry.debit
                    && entry.symbol == "WETH"
                    && entry.amount == "5000"
                    && entry.txn_hash == "0xabc_d"
                    && entry.price == dec!(3300)
            })
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_append_ledger_entry()
            .withf(|entry| {
                !entry.debit
                    && entry.symbol == "WMATIC"
                    && entry.amount == "9000"
                    && entry.txn_hash == "0xabc_c"
                    && entry.price == dec!(0.52)
            })
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_settle_trade()
            .withf(move |s| {
                s.uuid == uuid && s.output_bal == "9000" && s.input_price == dec!(3300)
            })
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_switch_sides()
            .withf(|addr, side| addr == AGENT_ADDR && side.is_none())
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_release_open_trade()
            .times(1)
            .returning(|_, _| Ok(true));
        store
            .expect_set_activation()
            .withf(|_, active| *active)
            .times(1)
            .returning(|_, _| Ok(()));

        let closer = TradeCloser::new(Arc::new(store));
        closer
            .handle(&receipt(
                TxnType::Swap,
                TxnStatus::Applied,
                Some(uuid),
                swap_logs(),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unrecognized_status_is_a_noop() {
        let closer = TradeCloser::new(Arc::new(MockStore::new()));
        closer
            .handle(&receipt(TxnType::Swap, TxnStatus::Pending, None, vec![]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_transfer_addresses_are_fatal() {
        let stranger = Address::repeat_byte(0x77);
        let logs = vec![
            transfer_log(Address::zero(), stranger, U256::from(9000u64)),
            transfer_log(agent_address(), Address::zero(), U256::from(5000u64)),
        ];

        let mut store = MockStore::new();
        store.expect_load_usdc_prices().returning(|| Ok(prices()));

        let closer = TradeCloser::new(Arc::new(store));
        let result = closer
            .handle(&receipt(
                TxnType::Swap,
                TxnStatus::Applied,
                Some(Uuid::new_v4()),
                logs,
            ))
            .await;
        assert!(matches!(result, Err(FleetError::InconsistentState(_))));
    }

    #[tokio::test]
    async fn test_applied_unwrap_posts_single_debit_and_resets_side() {
        let mut store = MockStore::new();
        store.expect_load_usdc_prices().returning(|| Ok(prices()));
        store
            .expect_switch_sides()
            .withf(|addr, side| addr == AGENT_ADDR && *side == Some(Side::Buy))
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_append_ledger_entry()
            .withf(|entry| {
                entry.debit
                    && entry.symbol == "WETH"
                    && entry.txn_hash == "0xabc"
                    && entry.txn_type == TxnType::Unwrap
            })
            .times(1)
            .returning(|_| Ok(()));

        let closer = TreasuryCloser::new(Arc::new(store));
        closer
            .handle(&receipt(TxnType::Unwrap, TxnStatus::Applied, None, vec![]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wrap_credit_is_not_a_debit() {
        let mut store = MockStore::new();
        store.expect_load_usdc_prices().returning(|| Ok(prices()));
        store.expect_switch_sides().returning(|_, _| Ok(()));
        store
            .expect_append_ledger_entry()
            .withf(|entry| !entry.debit && entry.txn_type == TxnType::Wrap)
            .times(1)
            .returning(|_| Ok(()));

        let closer = TreasuryCloser::new(Arc::new(store));
        closer
            .handle(&receipt(TxnType::Wrap, TxnStatus::Applied, None, vec![]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_type() {
        // a TRANSFER receipt reaches no closer and touches no table
        let dispatcher = ReceiptDispatcher::new(Arc::new(MockStore::new()));
        dispatcher
            .dispatch(&receipt(TxnType::Transfer, TxnStatus::Applied, None, vec![]))
            .await
            .unwrap();
    }

    #[test]
    fn test_decode_swap_transfers_reads_both_amounts() {
        let (input, output) = decode_swap_transfers(&swap_logs(), agent_address()).unwrap();
        assert_eq!(input, U256::from(5000u64));
        assert_eq!(output, U256::from(9000u64));
    }
}
