use ethers::types::{Address, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{FleetError, Result};

pub const WMATIC: &str = "WMATIC";
pub const WETH: &str = "WETH";
pub const USDC: &str = "USDC";

pub const WETH_WMATIC_PAIR: &str = "WETH/WMATIC";
pub const WMATIC_USDC_PAIR: &str = "WMATIC/USDC";
pub const WETH_USDC_PAIR: &str = "WETH/USDC";

// Polygon mainnet deployments
const WMATIC_ADDR: [u8; 20] = [
    0x0d, 0x50, 0x0b, 0x1d, 0x8e, 0x8e, 0xf3, 0x1e, 0x21, 0xc9, 0x9d, 0x1d, 0xb9, 0xa6, 0x44,
    0x4d, 0x3a, 0xdf, 0x12, 0x70,
];
const WETH_ADDR: [u8; 20] = [
    0x7c, 0xeb, 0x23, 0xfd, 0x6b, 0xc0, 0xad, 0xd5, 0x9e, 0x62, 0xac, 0x25, 0x57, 0x82, 0x70,
    0xcf, 0xf1, 0xb9, 0xf6, 0x19,
];
const USDC_ADDR: [u8; 20] = [
    0x27, 0x91, 0xbc, 0xa1, 0xf2, 0xde, 0x46, 0x61, 0xed, 0x88, 0xa3, 0x0c, 0x99, 0xa7, 0xa9,
    0x44, 0x9a, 0xa8, 0x41, 0x74,
];
const SWAP_ROUTER_ADDR: [u8; 20] = [
    0x68, 0xb3, 0x46, 0x58, 0x33, 0xfb, 0x72, 0xa7, 0x0e, 0xcd, 0xf4, 0x85, 0xe0, 0xe4, 0xc7,
    0xbd, 0x86, 0x65, 0xfc, 0x45,
];
const POOL_FACTORY_ADDR: [u8; 20] = [
    0x1f, 0x98, 0x43, 0x1c, 0x8a, 0xd9, 0x85, 0x23, 0x63, 0x1a, 0xe4, 0xa5, 0x9f, 0x26, 0x73,
    0x46, 0xea, 0x31, 0xf9, 0x84,
];

/// A known ERC-20 token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    pub symbol: &'static str,
    pub address: Address,
    pub decimals: u32,
}

pub fn wmatic() -> TokenInfo {
    TokenInfo {
        symbol: WMATIC,
        address: Address::from(WMATIC_ADDR),
        decimals: 18,
    }
}

pub fn weth() -> TokenInfo {
    TokenInfo {
        symbol: WETH,
        address: Address::from(WETH_ADDR),
        decimals: 18,
    }
}

pub fn usdc() -> TokenInfo {
    TokenInfo {
        symbol: USDC,
        address: Address::from(USDC_ADDR),
        decimals: 6,
    }
}

pub fn swap_router() -> Address {
    Address::from(SWAP_ROUTER_ADDR)
}

pub fn pool_factory() -> Address {
    Address::from(POOL_FACTORY_ADDR)
}

/// Look up a trade token by symbol (USDC is quote-only, not tradable)
pub fn token_for_symbol(symbol: &str) -> Option<TokenInfo> {
    match symbol {
        WMATIC => Some(wmatic()),
        WETH => Some(weth()),
        _ => None,
    }
}

/// The other leg of the trading pair
pub fn counter_symbol(symbol: &str) -> Option<&'static str> {
    match symbol {
        WMATIC => Some(WETH),
        WETH => Some(WMATIC),
        _ => None,
    }
}

/// USDC quote pair for a symbol, e.g. "WETH/USDC"
pub fn usdc_pair(symbol: &str) -> String {
    format!("{symbol}/{USDC}")
}

/// Parse a stored address string
pub fn parse_address(raw: &str) -> Result<Address> {
    raw.parse::<Address>()
        .map_err(|e| FleetError::Validation(format!("invalid address '{raw}': {e}")))
}

/// Convert a human-unit amount into its raw representation
pub fn to_wei(amount: Decimal, decimals: u32) -> Result<U256> {
    let unit = 10u64
        .checked_pow(decimals)
        .ok_or_else(|| FleetError::Validation(format!("unsupported decimals {decimals}")))?;
    let raw = (amount * Decimal::from(unit))
        .trunc()
        .to_u128()
        .ok_or_else(|| FleetError::Validation(format!("amount {amount} out of range")))?;
    Ok(U256::from(raw))
}

/// Convert a raw amount into human units
pub fn from_wei(raw: U256, decimals: u32) -> Result<Decimal> {
    if raw > U256::from(i128::MAX as u128) {
        return Err(FleetError::Validation(format!(
            "raw amount {raw} out of range"
        )));
    }
    Ok(Decimal::from_i128_with_scale(
        raw.as_u128() as i128,
        decimals,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_wei_round_trip() {
        let half = to_wei(dec!(0.5), 18).unwrap();
        assert_eq!(half, U256::exp10(17) * 5);
        assert_eq!(from_wei(half, 18).unwrap(), dec!(0.500000000000000000));
    }

    #[test]
    fn test_counter_symbols() {
        assert_eq!(counter_symbol(WETH), Some(WMATIC));
        assert_eq!(counter_symbol(WMATIC), Some(WETH));
        assert_eq!(counter_symbol(USDC), None);
    }

    #[test]
    fn test_parse_address() {
        let addr = parse_address("0x0d500B1d8E8eF31E21C99d1Db9A6444d3ADf1270").unwrap();
        assert_eq!(addr, wmatic().address);
        assert!(parse_address("not-an-address").is_err());
    }
}
