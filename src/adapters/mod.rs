pub mod bus;
pub mod evm;
pub mod gas_station;
pub mod metrics;
pub mod postgres;
pub mod traits;

pub use bus::{BroadcastBus, BusMessage};
pub use evm::EvmChain;
pub use gas_station::GasStationOracle;
pub use metrics::LogMetricsSink;
pub use postgres::PostgresStore;
pub use traits::{
    admit_gas, gwei, ChainProvider, GasEstimate, GasOracle, MessageBus, MetricsSink, PoolState,
    ReceiptMeta, Store, TxnMeta,
};
