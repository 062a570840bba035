//! Metrics emission. Fire-and-forget: a metric that cannot be recorded is
//! logged and dropped, never surfaced to the calling stage.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

use super::traits::MetricsSink;

/// Emits price/proximity observations as structured log events, the
/// lowest-friction sink for a single-binary deployment
pub struct LogMetricsSink;

#[async_trait]
impl MetricsSink for LogMetricsSink {
    async fn push_price(&self, pair: &str, ma_duration: u32, gain: Decimal, value: Decimal) {
        info!(
            target: "flotilla::metrics",
            pair, ma_duration, %gain, %value, "price"
        );
    }
}
