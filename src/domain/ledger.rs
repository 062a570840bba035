use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TxnType;

/// One append-only debit or credit row recording a realized token movement
/// at its settlement-time USDC price.
///
/// A settled swap posts two rows sharing a transaction hash, suffixed `_d`
/// and `_c`; a settled wrap/unwrap posts one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub txn_hash: String,
    pub txn_block: i64,
    pub txn_idx: i32,
    /// Cumulative gas used, raw
    pub gas: String,
    pub agent_address: String,
    pub symbol: String,
    /// USDC-denominated price at settlement time
    pub price: Decimal,
    pub txn_type: TxnType,
    /// Raw amount (wei-scale)
    pub amount: String,
    pub debit: bool,
    pub created_on: DateTime<Utc>,
}

impl LedgerEntry {
    /// Hash suffix distinguishing the two halves of one swap posting
    pub fn suffixed_hash(txn_hash: &str, debit: bool) -> String {
        format!("{}{}", txn_hash, if debit { "_d" } else { "_c" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffixed_hash() {
        assert_eq!(LedgerEntry::suffixed_hash("0xff", true), "0xff_d");
        assert_eq!(LedgerEntry::suffixed_hash("0xff", false), "0xff_c");
    }
}
