//! Gas oracle backed by the Polygon gas-station JSON endpoint

use async_trait::async_trait;
use ethers::types::U256;
use serde::Deserialize;
use tracing::debug;

use super::traits::{GasEstimate, GasOracle};
use crate::error::Result;

#[derive(Debug, Deserialize)]
struct GasStationResponse {
    fast: GasStationTier,
}

#[derive(Debug, Deserialize)]
struct GasStationTier {
    #[serde(rename = "maxFee")]
    max_fee: f64,
    #[serde(rename = "maxPriorityFee")]
    max_priority_fee: f64,
}

/// Fetches EIP-1559 fee estimates over HTTP
pub struct GasStationOracle {
    client: reqwest::Client,
    url: String,
}

impl GasStationOracle {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl GasOracle for GasStationOracle {
    async fn estimate(&self) -> Result<GasEstimate> {
        let response: GasStationResponse = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let estimate = GasEstimate {
            max_fee: gwei_from_f64(response.fast.max_fee),
            max_priority_fee: gwei_from_f64(response.fast.max_priority_fee),
        };
        debug!("Gas estimate: {} gwei total", estimate.as_gwei());
        Ok(estimate)
    }
}

/// Fractional gwei to wei, keeping two decimal places
fn gwei_from_f64(value: f64) -> U256 {
    let centi_gwei = (value * 100.0).round().max(0.0) as u64;
    U256::from(centi_gwei) * U256::exp10(7)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::traits::gwei;

    #[test]
    fn test_gwei_conversion_keeps_two_decimals() {
        assert_eq!(gwei_from_f64(30.0), gwei(30));
        assert_eq!(gwei_from_f64(31.574), U256::from(3157u64) * U256::exp10(7));
        assert_eq!(gwei_from_f64(-1.0), U256::zero());
    }

    #[test]
    fn test_station_response_parsing() {
        let body = r#"{"safeLow":{"maxFee":30.1,"maxPriorityFee":30.0},
                       "standard":{"maxFee":32.2,"maxPriorityFee":31.0},
                       "fast":{"maxFee":35.5,"maxPriorityFee":33.25},
                       "blockTime":2,"blockNumber":1}"#;
        let parsed: GasStationResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.fast.max_fee, 35.5);
        assert_eq!(parsed.fast.max_priority_fee, 33.25);
    }
}
