use chrono::{DateTime, Utc};
use ethers::types::Log;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::TxnStatus;

/// Kind of chain transaction tracked through the pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxnType {
    Wrap,
    Unwrap,
    Swap,
    Transfer,
}

impl TxnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnType::Wrap => "WRAP",
            TxnType::Unwrap => "UNWRAP",
            TxnType::Swap => "SWAP",
            TxnType::Transfer => "TRANSFER",
        }
    }
}

impl std::fmt::Display for TxnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TxnType {
    type Err = &'static str;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "WRAP" => Ok(TxnType::Wrap),
            "UNWRAP" => Ok(TxnType::Unwrap),
            "SWAP" => Ok(TxnType::Swap),
            "TRANSFER" => Ok(TxnType::Transfer),
            _ => Err("invalid txn type; expected WRAP|UNWRAP|SWAP|TRANSFER"),
        }
    }
}

/// A submitted chain transaction awaiting reconciliation.
///
/// Rows are polled by the settlement reconciler and deleted once a receipt
/// has been obtained and published, whatever the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTxn {
    pub txn_hash: String,
    /// Absent for treasury operations
    pub trade_uuid: Option<Uuid>,
    pub agent_address: String,
    pub wallet_index: u32,
    pub symbol: String,
    /// Raw amount (wei-scale)
    pub amount: String,
    pub txn_type: TxnType,
    pub created_on: DateTime<Utc>,
}

/// Receipt message: the pending row plus mined-transaction fields and the
/// raw event logs, published to the closers tagged by `txn_type`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnReceipt {
    #[serde(flatten)]
    pub pending: PendingTxn,
    pub to_addr: String,
    pub txn_block: i64,
    pub txn_idx: i32,
    pub block_timestamp: i64,
    /// Cumulative gas used, raw
    pub gas: String,
    pub txn_status: TxnStatus,
    pub logs: Vec<Log>,
}
