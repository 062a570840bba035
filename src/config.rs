use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{FleetError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub gas: GasConfig,
    pub trading: TradingConfig,
    pub treasury: TreasuryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// EVM chain id (137 = Polygon mainnet)
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
}

fn default_chain_id() -> u64 {
    137
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    /// Gas station endpoint returning EIP-1559 fee estimates
    #[serde(default = "default_gas_station_url")]
    pub station_url: String,
    /// Admission ceiling for max_fee + max_priority_fee, in gwei
    #[serde(default = "default_gas_ceiling_gwei")]
    pub ceiling_gwei: u64,
}

fn default_gas_station_url() -> String {
    "https://gasstation-mainnet.matic.network/v2".to_string()
}

fn default_gas_ceiling_gwei() -> u64 {
    444
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            station_url: default_gas_station_url(),
            ceiling_gwei: default_gas_ceiling_gwei(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Trading pair evaluated by the signal engine
    #[serde(default = "default_pair")]
    pub pair: String,
    /// Decimal places for persisted prices
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    /// Shortest moving-average duration (refresh cycles)
    pub sma_from: u32,
    /// Longest moving-average duration (refresh cycles)
    pub sma_to: u32,
    /// Duration step between adjacent buckets
    pub sma_step: u32,
    /// Minimum native balance (and minimum input value) to admit a swap
    #[serde(default = "default_min_fee_balance")]
    pub min_fee_balance: Decimal,
}

fn default_pair() -> String {
    "WETH/WMATIC".to_string()
}

fn default_price_decimals() -> u32 {
    5
}

fn default_min_fee_balance() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

impl TradingConfig {
    /// Number of moving-average buckets in the configured ladder
    pub fn sma_bucket_count(&self) -> usize {
        ((self.sma_to - self.sma_from) / self.sma_step) as usize + 1
    }

    /// Index of the bucket matching a duration, if the duration is on the ladder
    pub fn sma_bucket_index(&self, duration: u32) -> Option<usize> {
        if self.sma_step == 0 {
            return None;
        }
        let idx = (duration as f64 / self.sma_step as f64).round() as usize;
        if idx == 0 || idx > self.sma_bucket_count() {
            return None;
        }
        Some(idx - 1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreasuryConfig {
    /// Native amount kept aside when wrapping or sweeping
    #[serde(default = "default_reserve")]
    pub reserve: Decimal,
    /// Minimum treasury balance required before refilling agents
    #[serde(default = "default_refill_min_balance")]
    pub refill_min_balance: Decimal,
}

fn default_reserve() -> Decimal {
    Decimal::TWO
}

fn default_refill_min_balance() -> Decimal {
    Decimal::ONE
}

impl Default for TreasuryConfig {
    fn default() -> Self {
        Self {
            reserve: default_reserve(),
            refill_min_balance: default_refill_min_balance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between price refresh + signal cycles (seconds)
    #[serde(default = "default_price_interval")]
    pub price_interval_secs: u64,
    /// Interval between settlement sweeps (seconds)
    #[serde(default = "default_settle_interval")]
    pub settle_interval_secs: u64,
    /// Pending transactions older than this are flagged every sweep (seconds)
    #[serde(default = "default_age_warn")]
    pub age_warn_secs: i64,
}

fn default_price_interval() -> u64 {
    60
}

fn default_settle_interval() -> u64 {
    30
}

fn default_age_warn() -> i64 {
    3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            price_interval_secs: default_price_interval(),
            settle_interval_secs: default_settle_interval(),
            age_warn_secs: default_age_warn(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(
                    std::env::var("FLOTILLA_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (FLOTILLA_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("FLOTILLA")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.trading.sma_step == 0 {
            errors.push("sma_step must be positive".to_string());
        }
        if self.trading.sma_from == 0 || self.trading.sma_to < self.trading.sma_from {
            errors.push("sma_from..sma_to must be a non-empty ascending range".to_string());
        }
        if self.trading.min_fee_balance <= Decimal::ZERO {
            errors.push("min_fee_balance must be positive".to_string());
        }
        if self.gas.ceiling_gwei == 0 {
            errors.push("gas ceiling must be positive".to_string());
        }
        if self.treasury.reserve <= Decimal::ZERO {
            errors.push("treasury reserve must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Secret blob: network alias, RPC project id, HD-wallet mnemonic, and the
/// trusted withdrawal address. Loaded once per process and cached; the
/// mnemonic is zeroized when the struct is dropped.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Secrets {
    pub network_alias: String,
    pub rpc_project_id: String,
    pub mnemonic: String,
    #[serde(default)]
    pub trusted_withdrawal_addr: Option<String>,
}

static SECRETS: OnceLock<Secrets> = OnceLock::new();

impl Secrets {
    /// Cached accessor; reads the blob on first use
    pub fn get() -> Result<&'static Secrets> {
        if let Some(secrets) = SECRETS.get() {
            return Ok(secrets);
        }
        let loaded = Self::load()?;
        Ok(SECRETS.get_or_init(|| loaded))
    }

    /// Load the secret blob from FLOTILLA_SECRETS (inline JSON) or
    /// FLOTILLA_SECRETS_FILE (path to a JSON file)
    pub fn load() -> Result<Self> {
        let mut raw = if let Ok(path) = std::env::var("FLOTILLA_SECRETS_FILE") {
            std::fs::read_to_string(&path)
                .map_err(|e| FleetError::Secret(format!("cannot read {path}: {e}")))?
        } else {
            std::env::var("FLOTILLA_SECRETS").map_err(|_| {
                FleetError::Secret(
                    "FLOTILLA_SECRETS or FLOTILLA_SECRETS_FILE must be set".to_string(),
                )
            })?
        };

        let parsed: std::result::Result<Secrets, _> = serde_json::from_str(&raw);
        raw.zeroize();
        parsed.map_err(|e| FleetError::Secret(format!("malformed secret blob: {e}")))
    }

    /// JSON-RPC endpoint for the configured network alias
    pub fn rpc_url(&self) -> Result<String> {
        let host = match self.network_alias.as_str() {
            "matic" | "polygon" | "polygon-mainnet" => "polygon-mainnet",
            "maticmum" | "mumbai" | "polygon-mumbai" => "polygon-mumbai",
            other => {
                return Err(FleetError::Secret(format!(
                    "unknown network alias '{other}'"
                )))
            }
        };
        Ok(format!(
            "https://{host}.infura.io/v3/{}",
            self.rpc_project_id
        ))
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("network_alias", &self.network_alias)
            .field("mnemonic", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trading() -> TradingConfig {
        TradingConfig {
            pair: default_pair(),
            price_decimals: 5,
            sma_from: 15,
            sma_to: 180,
            sma_step: 15,
            min_fee_balance: default_min_fee_balance(),
        }
    }

    #[test]
    fn test_sma_bucket_count() {
        assert_eq!(trading().sma_bucket_count(), 12);
    }

    #[test]
    fn test_sma_bucket_index() {
        let cfg = trading();
        assert_eq!(cfg.sma_bucket_index(15), Some(0));
        assert_eq!(cfg.sma_bucket_index(180), Some(11));
        // off-ladder durations round to the nearest bucket
        assert_eq!(cfg.sma_bucket_index(20), Some(0));
        assert_eq!(cfg.sma_bucket_index(0), None);
        assert_eq!(cfg.sma_bucket_index(600), None);
    }

    #[test]
    fn test_rpc_url_aliases() {
        let secrets = Secrets {
            network_alias: "matic".to_string(),
            rpc_project_id: "abc123".to_string(),
            mnemonic: String::new(),
            trusted_withdrawal_addr: None,
        };
        assert_eq!(
            secrets.rpc_url().unwrap(),
            "https://polygon-mainnet.infura.io/v3/abc123"
        );
    }
}
