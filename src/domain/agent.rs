use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Trade direction currently favored by an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// The opposite direction
    pub fn flipped(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Side {
    type Err = &'static str;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err("invalid side; expected BUY|SELL"),
        }
    }
}

/// One trading identity bound to a single HD-derived wallet.
///
/// A non-empty `open_trade_id` is the in-flight trade lock: the signal
/// engine must not offer the agent for a new trade until it is cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_address: String,
    pub wallet_index: u32,
    /// Band sensitivity applied around the moving average
    pub ma_gain: Decimal,
    /// Moving-average duration the agent trades against
    pub ma_duration: u32,
    pub side: Option<Side>,
    pub open_trade_id: String,
    pub is_active: bool,
    /// Last observed native-token balance
    pub balance: Decimal,
}

impl Agent {
    pub fn has_open_trade(&self) -> bool {
        !self.open_trade_id.is_empty()
    }

    /// Agents without a recorded side trade as buyers first
    pub fn effective_side(&self) -> Side {
        self.side.unwrap_or(Side::Buy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_round_trip() {
        assert_eq!("BUY".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Sell);
        assert!("HOLD".parse::<Side>().is_err());
        assert_eq!(Side::Buy.flipped(), Side::Sell);
    }

    #[test]
    fn test_agent_defaults_to_buy() {
        let agent = Agent {
            agent_address: "0x0000000000000000000000000000000000000001".to_string(),
            wallet_index: 0,
            ma_gain: dec!(1.05),
            ma_duration: 15,
            side: None,
            open_trade_id: String::new(),
            is_active: true,
            balance: dec!(3),
        };
        assert_eq!(agent.effective_side(), Side::Buy);
        assert!(!agent.has_open_trade());
    }
}
