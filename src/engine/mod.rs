//! The trade lifecycle stages: signal evaluation, execution, settlement
//! reconciliation, and closing.

pub mod closer;
pub mod gateway;
pub mod reconciler;
pub mod refresher;
pub mod signal;

pub use closer::{ReceiptDispatcher, TradeCloser, TreasuryCloser};
pub use gateway::ExecutionGateway;
pub use reconciler::{SettlementReconciler, SweepSummary};
pub use refresher::PriceRefresher;
pub use signal::{CycleSummary, SignalEngine};
