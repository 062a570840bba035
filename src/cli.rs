use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::domain::Trade;
use crate::error::{FleetError, Result};
use crate::fleet::AgentParams;

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(version = "0.1.0")]
#[command(about = "Moving-average trading agent fleet for Uniswap v3 on Polygon", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration directory
    #[arg(short, long, default_value = "config")]
    pub config_dir: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every stage on its schedule until interrupted
    Run,
    /// Run one signal cycle
    Signal,
    /// Run one settlement sweep over the pending queue
    Settle,
    /// Refresh pool prices and the moving-average ladder
    RefreshPrices,
    /// List recent trades
    Trades {
        /// Maximum rows to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Wrap spare native balance for agents
    Wrap {
        /// Restrict to these agent addresses
        #[arg(long)]
        only: Vec<String>,
    },
    /// Unwrap the full wrapped balance for agents
    Unwrap {
        #[arg(long)]
        only: Vec<String>,
    },
    /// Sweep spare native balance to the trusted withdrawal address
    Sweep {
        #[arg(long)]
        only: Vec<String>,
    },
    /// Fan out fee refills from the treasury wallet
    Refill {
        #[arg(long)]
        only: Vec<String>,
    },
    /// Set or revoke the swap router's token approvals
    Approvals {
        #[arg(long)]
        only: Vec<String>,
        /// Revoke instead of grant
        #[arg(long)]
        revoke: bool,
    },
    /// Refresh stored agent balances from the chain
    Balances {
        /// Refresh a single agent only
        #[arg(long)]
        agent: Option<String>,
    },
    /// Activate (or deactivate) the fleet
    Activate {
        /// Deactivate instead
        #[arg(long)]
        off: bool,
    },
    /// Create agent rows from gain:duration pairs, e.g. 1.05:15 1.1:60
    Onboard {
        /// One gain:duration pair per agent, wallet indexes assigned in order
        params: Vec<String>,
    },
}

/// Parse "gain:duration" agent parameters
pub fn parse_agent_params(raw: &[String]) -> Result<Vec<AgentParams>> {
    raw.iter()
        .map(|pair| {
            let (gain, duration) = pair.split_once(':').ok_or_else(|| {
                FleetError::Validation(format!("expected gain:duration, got '{pair}'"))
            })?;
            Ok(AgentParams {
                ma_gain: Decimal::from_str(gain.trim())
                    .map_err(|e| FleetError::Validation(format!("bad gain '{gain}': {e}")))?,
                ma_duration: duration
                    .trim()
                    .parse()
                    .map_err(|e| FleetError::Validation(format!("bad duration '{duration}': {e}")))?,
            })
        })
        .collect()
}

/// Print a trade listing
pub fn print_trades(trades: &[Trade]) {
    if trades.is_empty() {
        println!("No trades recorded");
        return;
    }

    println!(
        "{:<38} {:<5} {:<10} {:>14} {:<44}",
        "uuid", "side", "status", "price", "txn"
    );
    for trade in trades {
        println!(
            "{:<38} {:<5} {:<10} {:>14} {:<44}",
            trade.uuid,
            trade.side,
            trade.trade_status,
            trade.current_price,
            trade.txn_hash.as_deref().unwrap_or("-")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_agent_params() {
        let parsed =
            parse_agent_params(&["1.05:15".to_string(), " 1.1 : 60 ".to_string()]).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].ma_gain, dec!(1.05));
        assert_eq!(parsed[0].ma_duration, 15);
        assert_eq!(parsed[1].ma_gain, dec!(1.1));
        assert_eq!(parsed[1].ma_duration, 60);
    }

    #[test]
    fn test_parse_agent_params_rejects_garbage() {
        assert!(parse_agent_params(&["1.05x15".to_string()]).is_err());
        assert!(parse_agent_params(&["abc:15".to_string()]).is_err());
        assert!(parse_agent_params(&["1.05:xyz".to_string()]).is_err());
    }
}
