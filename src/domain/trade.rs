use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::Side;

/// Terminal and in-flight transaction/trade statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxnStatus {
    /// Abandoned before (or instead of) submission
    Dropped,
    /// Submitted, not yet reconciled
    Pending,
    /// Mined and executed successfully
    Applied,
    /// Mined but reverted
    Reverted,
}

impl TxnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnStatus::Dropped => "DROPPED",
            TxnStatus::Pending => "PENDING",
            TxnStatus::Applied => "APPLIED",
            TxnStatus::Reverted => "REVERTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxnStatus::Pending)
    }
}

impl std::fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TxnStatus {
    type Err = &'static str;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DROPPED" => Ok(TxnStatus::Dropped),
            "PENDING" => Ok(TxnStatus::Pending),
            "APPLIED" => Ok(TxnStatus::Applied),
            "REVERTED" => Ok(TxnStatus::Reverted),
            _ => Err("invalid status; expected DROPPED|PENDING|APPLIED|REVERTED"),
        }
    }
}

/// Per-agent decision produced by one signal cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    None,
    AddTrade,
    DropTrade,
}

/// Trade request: persisted as the initial trade row and published to the
/// execution gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub uuid: Uuid,
    pub side: Side,
    pub agent_address: String,
    pub current_price: Decimal,
}

impl TradeRequest {
    pub fn new(agent_address: &str, side: Side, current_price: Decimal) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            side,
            agent_address: agent_address.to_string(),
            current_price,
        }
    }
}

/// Chain identifiers recorded on the trade once the swap is submitted
#[derive(Debug, Clone)]
pub struct TradeSubmission {
    pub uuid: Uuid,
    pub txn_hash: String,
    pub input_token: String,
    /// Raw input amount (wei-scale)
    pub input_bal: String,
}

/// Receipt fields pushed onto the trade by the settlement reconciler
#[derive(Debug, Clone)]
pub struct TradeReceiptUpdate {
    pub uuid: Uuid,
    pub to_addr: String,
    pub txn_block: i64,
    pub txn_idx: i32,
    pub block_timestamp: i64,
    pub gas: String,
    pub txn_status: TxnStatus,
}

/// Settlement fields written by the closer on an applied trade
#[derive(Debug, Clone)]
pub struct TradeSettlement {
    pub uuid: Uuid,
    /// Raw output amount derived from the transfer logs (wei-scale)
    pub output_bal: String,
    pub input_price: Decimal,
    pub output_price: Decimal,
}

/// Full trade row as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub uuid: Uuid,
    pub side: Side,
    pub agent_address: String,
    pub current_price: Decimal,
    pub trade_status: TxnStatus,
    pub txn_hash: Option<String>,
    pub input_token: Option<String>,
    pub input_bal: Option<String>,
    pub output_bal: Option<String>,
    pub input_price: Option<Decimal>,
    pub output_price: Option<Decimal>,
    pub created_on: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        assert_eq!("APPLIED".parse::<TxnStatus>().unwrap(), TxnStatus::Applied);
        assert_eq!("dropped".parse::<TxnStatus>().unwrap(), TxnStatus::Dropped);
        assert!("MINED".parse::<TxnStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TxnStatus::Pending.is_terminal());
        assert!(TxnStatus::Applied.is_terminal());
        assert!(TxnStatus::Reverted.is_terminal());
        assert!(TxnStatus::Dropped.is_terminal());
    }
}
