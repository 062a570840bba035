pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod services;
pub mod treasury;

pub use adapters::{BroadcastBus, EvmChain, GasStationOracle, PostgresStore};
pub use config::{AppConfig, Secrets};
pub use engine::{
    ExecutionGateway, PriceRefresher, ReceiptDispatcher, SettlementReconciler, SignalEngine,
    TradeCloser, TreasuryCloser,
};
pub use error::{FleetError, Result};
pub use fleet::FleetAdmin;
pub use services::Scheduler;
pub use treasury::TreasuryOps;
