use clap::Parser;
use flotilla::adapters::traits::{ChainProvider, GasOracle, MessageBus, MetricsSink, Store};
use flotilla::adapters::{
    BroadcastBus, EvmChain, GasStationOracle, LogMetricsSink, PostgresStore,
};
use flotilla::cli::{self, Cli, Commands};
use flotilla::config::{AppConfig, Secrets};
use flotilla::engine::{
    ExecutionGateway, PriceRefresher, ReceiptDispatcher, SettlementReconciler, SignalEngine,
};
use flotilla::error::{FleetError, Result};
use flotilla::fleet::FleetAdmin;
use flotilla::services::Scheduler;
use flotilla::treasury::TreasuryOps;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)?;
    init_logging(&config);
    if let Err(errors) = config.validate() {
        return Err(FleetError::Validation(errors.join("; ")));
    }

    let deps = Deps::build(&config).await?;

    match cli.command {
        Commands::Run => run_scheduler(&config, &deps).await?,
        Commands::Signal => {
            let summary = deps.signal_engine(&config).run_cycle().await?;
            info!(
                "Cycle: {} evaluated, {} added, {} dropped",
                summary.evaluated, summary.added, summary.dropped
            );
        }
        Commands::Settle => {
            let summary = deps.reconciler(&config).sweep().await?;
            info!(
                "Sweep: {} scanned, {} settled, {} skipped",
                summary.scanned, summary.settled, summary.skipped
            );
        }
        Commands::RefreshPrices => deps.refresher(&config).refresh().await?,
        Commands::Trades { limit } => {
            let trades = deps.store.load_recent_trades(limit).await?;
            cli::print_trades(&trades);
        }
        Commands::Wrap { only } => deps.treasury(&config)?.wrap_all(&only).await?,
        Commands::Unwrap { only } => deps.treasury(&config)?.unwrap_all(&only).await?,
        Commands::Sweep { only } => deps.treasury(&config)?.sweep(&only).await?,
        Commands::Refill { only } => deps.treasury(&config)?.refill_fees(&only).await?,
        Commands::Approvals { only, revoke } => {
            deps.treasury(&config)?.set_approvals(&only, revoke).await?
        }
        Commands::Balances { agent } => {
            deps.admin().refresh_balances(agent.as_deref()).await?
        }
        Commands::Activate { off } => deps.admin().set_activation(!off, &HashMap::new()).await?,
        Commands::Onboard { params } => {
            let params = cli::parse_agent_params(&params)?;
            if params.is_empty() {
                warn!("No agent parameters given; nothing to onboard");
            } else {
                deps.admin().onboard_agents(&params).await?;
            }
        }
    }

    Ok(())
}

/// Shared collaborators wired once per invocation
struct Deps {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainProvider>,
    gas: Arc<dyn GasOracle>,
    bus: Arc<BroadcastBus>,
    metrics: Arc<dyn MetricsSink>,
}

impl Deps {
    async fn build(config: &AppConfig) -> Result<Self> {
        let postgres =
            PostgresStore::new(&config.database.url, config.database.max_connections).await?;
        postgres.migrate().await?;

        let chain = EvmChain::from_secrets(Secrets::get()?, config.chain.chain_id)?;

        Ok(Self {
            store: Arc::new(postgres),
            chain: Arc::new(chain),
            gas: Arc::new(GasStationOracle::new(&config.gas.station_url)),
            bus: Arc::new(BroadcastBus::default()),
            metrics: Arc::new(LogMetricsSink),
        })
    }

    fn message_bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    fn signal_engine(&self, config: &AppConfig) -> SignalEngine {
        SignalEngine::new(
            self.store.clone(),
            self.message_bus(),
            self.gas.clone(),
            self.metrics.clone(),
            config.trading.clone(),
            config.gas.ceiling_gwei,
        )
    }

    fn gateway(&self, config: &AppConfig) -> ExecutionGateway {
        ExecutionGateway::new(
            self.store.clone(),
            self.chain.clone(),
            self.gas.clone(),
            config.trading.clone(),
            config.gas.ceiling_gwei,
        )
    }

    fn reconciler(&self, config: &AppConfig) -> SettlementReconciler {
        SettlementReconciler::new(
            self.store.clone(),
            self.chain.clone(),
            self.message_bus(),
            config.scheduler.age_warn_secs,
        )
    }

    fn refresher(&self, config: &AppConfig) -> PriceRefresher {
        PriceRefresher::new(
            self.store.clone(),
            self.chain.clone(),
            self.message_bus(),
            self.metrics.clone(),
            config.trading.clone(),
        )
    }

    fn treasury(&self, config: &AppConfig) -> Result<TreasuryOps> {
        let withdrawal_addr = Secrets::get()?.trusted_withdrawal_addr.clone();
        Ok(TreasuryOps::new(
            self.store.clone(),
            self.chain.clone(),
            self.gas.clone(),
            self.message_bus(),
            config.treasury.clone(),
            config.gas.ceiling_gwei,
            withdrawal_addr,
        ))
    }

    fn admin(&self) -> FleetAdmin {
        FleetAdmin::new(self.store.clone(), self.chain.clone())
    }
}

async fn run_scheduler(config: &AppConfig, deps: &Deps) -> Result<()> {
    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        deps.bus.clone(),
        Arc::new(deps.refresher(config)),
        Arc::new(deps.signal_engine(config)),
        Arc::new(deps.gateway(config)),
        Arc::new(deps.reconciler(config)),
        Arc::new(ReceiptDispatcher::new(deps.store.clone())),
        Arc::new(deps.treasury(config)?),
    );

    scheduler.start();
    info!("Fleet running; press Ctrl-C to stop");

    signal::ctrl_c()
        .await
        .map_err(|e| FleetError::Internal(format!("signal handler failed: {e}")))?;
    scheduler.stop();
    info!("Shutdown complete");
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
