//! Stage 3: sweep the pending-transaction queue and reconcile mined
//! transactions into receipts.
//!
//! Idempotent by construction: unmined or unknown transactions are skipped
//! and revisited on the next sweep, and a row is deleted only after its
//! receipt message published successfully. The queue is intentionally
//! unbounded; old rows are flagged but never dead-lettered.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapters::bus::BusMessage;
use crate::adapters::traits::{ChainProvider, MessageBus, Store};
use crate::domain::tokens::parse_address;
use crate::domain::{PendingTxn, TradeReceiptUpdate, TxnReceipt, TxnStatus};
use crate::error::Result;

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepSummary {
    pub scanned: usize,
    pub settled: usize,
    pub skipped: usize,
}

pub struct SettlementReconciler {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainProvider>,
    bus: Arc<dyn MessageBus>,
    age_warn_secs: i64,
}

impl SettlementReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainProvider>,
        bus: Arc<dyn MessageBus>,
        age_warn_secs: i64,
    ) -> Self {
        Self {
            store,
            chain,
            bus,
            age_warn_secs,
        }
    }

    /// Scan every pending row once
    pub async fn sweep(&self) -> Result<SweepSummary> {
        let pending = self.store.load_pending_txns().await?;
        let mut summary = SweepSummary {
            scanned: pending.len(),
            ..SweepSummary::default()
        };

        for row in pending {
            if self.reconcile(&row).await? {
                summary.settled += 1;
            } else {
                summary.skipped += 1;
            }
        }

        debug!(
            "Sweep complete: scanned={} settled={} skipped={}",
            summary.scanned, summary.settled, summary.skipped
        );
        Ok(summary)
    }

    /// Returns true when the row was settled and removed
    async fn reconcile(&self, row: &PendingTxn) -> Result<bool> {
        let age = Utc::now() - row.created_on;
        if age > Duration::seconds(self.age_warn_secs) {
            warn!(
                "Pending txn {} is {}s old and still unresolved",
                row.txn_hash,
                age.num_seconds()
            );
        }

        let Ok(expected_sender) = parse_address(&row.agent_address) else {
            warn!(
                "Pending txn {} carries a malformed agent address '{}'; skipped",
                row.txn_hash, row.agent_address
            );
            return Ok(false);
        };

        let Some(meta) = self.chain.transaction_meta(&row.txn_hash).await? else {
            debug!("Txn {} is not yet known to the node", row.txn_hash);
            return Ok(false);
        };

        if meta.from != expected_sender {
            warn!(
                "Txn {} sender {:?} does not match agent {}; skipped",
                row.txn_hash, meta.from, row.agent_address
            );
            return Ok(false);
        }

        if meta.block_number.is_none() {
            debug!("Txn {} is not yet mined", row.txn_hash);
            return Ok(false);
        }

        let Some(receipt) = self.chain.transaction_receipt(&row.txn_hash).await? else {
            debug!("Txn {} has no receipt yet", row.txn_hash);
            return Ok(false);
        };

        let block_timestamp = self.chain.block_timestamp(receipt.block_number).await?;
        let txn_status = if receipt.status_ok {
            TxnStatus::Applied
        } else {
            TxnStatus::Reverted
        };
        let to_addr = receipt
            .to_addr
            .map(|a| format!("{a:?}"))
            .unwrap_or_default();

        if let Some(trade_uuid) = row.trade_uuid {
            self.store
                .update_trade_receipt(&TradeReceiptUpdate {
                    uuid: trade_uuid,
                    to_addr: to_addr.clone(),
                    txn_block: receipt.block_number,
                    txn_idx: receipt.txn_idx,
                    block_timestamp,
                    gas: receipt.cumulative_gas.to_string(),
                    txn_status,
                })
                .await?;
        }

        let message = TxnReceipt {
            pending: row.clone(),
            to_addr,
            txn_block: receipt.block_number,
            txn_idx: receipt.txn_idx,
            block_timestamp,
            gas: receipt.cumulative_gas.to_string(),
            txn_status,
            logs: receipt.logs,
        };

        // Publish before delete: a failed publish leaves the row for the
        // next sweep (at-least-once)
        if !self.bus.publish(&BusMessage::Receipt(message)).await {
            warn!(
                "Receipt for {} failed to publish; row kept for next sweep",
                row.txn_hash
            );
            return Ok(false);
        }

        self.store.delete_pending_txn(&row.txn_hash).await?;
        info!("Settled txn {} as {txn_status}", row.txn_hash);
        Ok(true)
    }
}
