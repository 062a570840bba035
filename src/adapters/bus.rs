//! In-process broadcast implementation of the message bus.
//!
//! Messages are JSON-serializable and tagged by `type` so subscribers can
//! filter without duck-typing the payload. Delivery is at-least-once from
//! the consumer's perspective: a slow subscriber that lags simply observes
//! the rows/tables again on its next cycle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error};

use super::traits::MessageBus;
use crate::domain::{TradeRequest, TxnReceipt};

/// Messages exchanged between stages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    /// Signal engine -> execution gateway
    #[serde(rename = "TRADE_REQUEST")]
    TradeRequest(TradeRequest),
    /// Settlement reconciler -> closers, tagged by the inner txn_type
    #[serde(rename = "RECEIPT")]
    Receipt(TxnReceipt),
    /// Refill fan-out -> single-agent refill
    #[serde(rename = "REFILL_REQUEST")]
    RefillRequest { agent_address: String, amount: String },
    /// Price refresher -> signal engine
    #[serde(rename = "PRICES_REFRESHED")]
    PricesRefreshed,
}

/// Broadcast-channel bus for the single-binary scheduler
pub struct BroadcastBus {
    sender: broadcast::Sender<BusMessage>,
    // Keeps the channel open so one-shot publishers never observe a closed bus
    _keepalive: broadcast::Receiver<BusMessage>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, keepalive) = broadcast::channel(capacity);
        Self {
            sender,
            _keepalive: keepalive,
        }
    }

    /// New subscription receiving every message published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl MessageBus for BroadcastBus {
    async fn publish(&self, message: &BusMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(body) => debug!("Publishing {body}"),
            Err(e) => {
                error!("Unserializable bus message: {e}");
                return false;
            }
        }

        match self.sender.send(message.clone()) {
            Ok(receivers) => {
                debug!("Delivered to {receivers} subscribers");
                true
            }
            Err(e) => {
                error!("Publish failed: {e}");
                false
            }
        }
    }
}
