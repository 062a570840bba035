//! Background scheduler for the single-binary deployment.
//!
//! Drives the externally-triggered stages on fixed intervals (price refresh
//! and settlement sweeps) and pumps bus messages into their consuming
//! stages. Stages stay independent: each message is handled on its own, and
//! a failing stage only logs; the next tick or sweep retries naturally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::adapters::bus::{BroadcastBus, BusMessage};
use crate::config::SchedulerConfig;
use crate::engine::{
    ExecutionGateway, PriceRefresher, ReceiptDispatcher, SettlementReconciler, SignalEngine,
};
use crate::error::FleetError;
use crate::treasury::TreasuryOps;

pub struct Scheduler {
    config: SchedulerConfig,
    bus: Arc<BroadcastBus>,
    refresher: Arc<PriceRefresher>,
    signal: Arc<SignalEngine>,
    gateway: Arc<ExecutionGateway>,
    reconciler: Arc<SettlementReconciler>,
    dispatcher: Arc<ReceiptDispatcher>,
    treasury: Arc<TreasuryOps>,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        bus: Arc<BroadcastBus>,
        refresher: Arc<PriceRefresher>,
        signal: Arc<SignalEngine>,
        gateway: Arc<ExecutionGateway>,
        reconciler: Arc<SettlementReconciler>,
        dispatcher: Arc<ReceiptDispatcher>,
        treasury: Arc<TreasuryOps>,
    ) -> Self {
        Self {
            config,
            bus,
            refresher,
            signal,
            gateway,
            reconciler,
            dispatcher,
            treasury,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the interval loops and the bus consumer
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }
        info!(
            "Starting scheduler (price interval {}s, settle interval {}s)",
            self.config.price_interval_secs, self.config.settle_interval_secs
        );

        // Consumer first, so the opening price refresh is not published into
        // a bus nobody watches yet
        self.spawn_consumer();
        self.spawn_price_loop();
        self.spawn_settle_loop();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Scheduler stop requested");
    }

    fn spawn_price_loop(&self) {
        let refresher = self.refresher.clone();
        let running = self.running.clone();
        let secs = self.config.price_interval_secs;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(secs));
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                if let Err(e) = refresher.refresh().await {
                    error!("Price refresh failed: {e}");
                }
            }
        });
    }

    fn spawn_settle_loop(&self) {
        let reconciler = self.reconciler.clone();
        let running = self.running.clone();
        let secs = self.config.settle_interval_secs;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(secs));
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                match reconciler.sweep().await {
                    Ok(summary) if summary.scanned > 0 => info!(
                        "Settlement sweep: {} scanned, {} settled",
                        summary.scanned, summary.settled
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Settlement sweep failed: {e}"),
                }
            }
        });
    }

    fn spawn_consumer(&self) {
        let mut rx = self.bus.subscribe();
        let signal = self.signal.clone();
        let gateway = self.gateway.clone();
        let dispatcher = self.dispatcher.clone();
        let treasury = self.treasury.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let message = match rx.recv().await {
                    Ok(message) => message,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Bus consumer lagged; {missed} messages missed");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                match message {
                    BusMessage::PricesRefreshed => match signal.run_cycle().await {
                        Ok(summary) => info!(
                            "Cycle: {} evaluated, {} added, {} dropped",
                            summary.evaluated, summary.added, summary.dropped
                        ),
                        // Admission aborts are expected operating states
                        Err(FleetError::GasTooHigh(detail)) => {
                            warn!("Signal cycle aborted: {detail}")
                        }
                        Err(e) => error!("Signal cycle failed: {e}"),
                    },
                    BusMessage::TradeRequest(request) => {
                        if let Err(e) = gateway.handle(&request).await {
                            error!("Trade {} failed in the gateway: {e}", request.uuid);
                        }
                    }
                    BusMessage::Receipt(receipt) => {
                        if let Err(e) = dispatcher.dispatch(&receipt).await {
                            error!(
                                "Receipt {} failed to close: {e}",
                                receipt.pending.txn_hash
                            );
                        }
                    }
                    BusMessage::RefillRequest {
                        agent_address,
                        amount,
                    } => {
                        if let Err(e) = treasury.refill_fee(&agent_address, &amount).await {
                            error!("Refill for {agent_address} failed: {e}");
                        }
                    }
                }
            }
            info!("Bus consumer stopped");
        });
    }
}
