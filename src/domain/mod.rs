pub mod agent;
pub mod ledger;
pub mod price;
pub mod tokens;
pub mod trade;
pub mod txn;

pub use agent::{Agent, Side};
pub use ledger::LedgerEntry;
pub use price::{compute_moving_averages, PriceHistoryRow, PriceRow};
pub use trade::{
    Trade, TradeAction, TradeReceiptUpdate, TradeRequest, TradeSettlement, TradeSubmission,
    TxnStatus,
};
pub use txn::{PendingTxn, TxnReceipt, TxnType};
