//! Chain provider over JSON-RPC: HD-derived agent wallets, ERC-20 and
//! wrapped-native calls, Uniswap v3 exact-input swaps, and pool price reads.

use async_trait::async_trait;
use chrono::Utc;
use ethers::abi::{encode, Token as AbiToken};
use ethers::contract::abigen;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, H256, U256, U64};
use ethers::utils::{get_create2_address_from_hash, keccak256};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::traits::{ChainProvider, GasEstimate, PoolState, ReceiptMeta, TxnMeta};
use crate::config::Secrets;
use crate::domain::tokens::{self, TokenInfo};
use crate::error::{FleetError, Result};

abigen!(
    Erc20,
    r#"[
        function balanceOf(address owner) external view returns (uint256)
        function allowance(address owner, address spender) external view returns (uint256)
        function approve(address spender, uint256 value) external returns (bool)
        event Transfer(address indexed from, address indexed to, uint256 value)
    ]"#
);

abigen!(
    WrappedNative,
    r#"[
        function withdraw(uint256 wad) external
    ]"#
);

abigen!(
    UniswapV3Pool,
    r#"[
        function slot0() external view returns (uint160 sqrtPriceX96, int24 tick, uint16 observationIndex, uint16 observationCardinality, uint16 observationCardinalityNext, uint8 feeProtocol, bool unlocked)
        function liquidity() external view returns (uint128)
    ]"#
);

abigen!(
    SwapRouter,
    r#"[
        struct ExactInputSingleParams {address tokenIn; address tokenOut; uint24 fee; address recipient; uint256 deadline; uint256 amountIn; uint256 amountOutMinimum; uint160 sqrtPriceLimitX96;}
        function exactInputSingle(ExactInputSingleParams params) external payable returns (uint256 amountOut)
    ]"#
);

/// Uniswap v3 0.05% fee tier, the pool tier the fleet trades
const POOL_FEE: u32 = 500;

/// Uniswap v3 pool init code hash (CREATE2 address derivation)
const POOL_INIT_CODE_HASH: [u8; 32] = [
    0xe3, 0x4f, 0x19, 0x9b, 0x19, 0xb2, 0xb4, 0xf4, 0x7f, 0x68, 0x44, 0x26, 0x19, 0xd5, 0x55,
    0x52, 0x7d, 0x24, 0x4f, 0x78, 0xa3, 0x29, 0x7e, 0xa8, 0x93, 0x25, 0xf8, 0x43, 0xf8, 0x7b,
    0x8b, 0x54,
];

/// Swap deadline horizon (seconds)
const SWAP_DEADLINE_SECS: i64 = 30 * 60;

/// Headroom multiplier applied to gas-limit estimates, in percent
const GAS_LIMIT_MARGIN_PCT: u64 = 120;

type SignedClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// JSON-RPC chain client bound to the fleet's HD mnemonic
pub struct EvmChain {
    provider: Provider<Http>,
    mnemonic: Zeroizing<String>,
    chain_id: u64,
}

impl EvmChain {
    pub fn new(rpc_url: &str, mnemonic: &str, chain_id: u64) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| FleetError::Chain(format!("invalid RPC url: {e}")))?;
        Ok(Self {
            provider,
            mnemonic: Zeroizing::new(mnemonic.to_string()),
            chain_id,
        })
    }

    /// Build from the cached secret blob
    pub fn from_secrets(secrets: &Secrets, chain_id: u64) -> Result<Self> {
        Self::new(&secrets.rpc_url()?, &secrets.mnemonic, chain_id)
    }

    fn wallet(&self, index: u32) -> Result<LocalWallet> {
        let wallet = MnemonicBuilder::<English>::default()
            .phrase(self.mnemonic.as_str())
            .derivation_path(&derivation_path(index))
            .map_err(|e| FleetError::Wallet(format!("bad derivation path: {e}")))?
            .build()
            .map_err(|e| FleetError::Wallet(format!("wallet {index} derivation failed: {e}")))?;
        Ok(wallet.with_chain_id(self.chain_id))
    }

    fn client(&self, index: u32) -> Result<SignedClient> {
        Ok(SignerMiddleware::new(self.provider.clone(), self.wallet(index)?))
    }

    fn read_provider(&self) -> Arc<Provider<Http>> {
        Arc::new(self.provider.clone())
    }

    /// Estimate a gas limit, apply the margin, sign, and submit
    async fn send(
        &self,
        wallet_index: u32,
        to: Address,
        value: U256,
        data: Option<Bytes>,
        gas: GasEstimate,
    ) -> Result<ethers::providers::PendingTransaction<'_, Http>> {
        let client = self.client(wallet_index)?;

        let mut request = Eip1559TransactionRequest::new()
            .from(client.address())
            .to(to)
            .value(value)
            .max_fee_per_gas(gas.max_fee)
            .max_priority_fee_per_gas(gas.max_priority_fee);
        if let Some(data) = data {
            request = request.data(data);
        }

        let mut typed: TypedTransaction = request.into();
        let gas_limit = client
            .estimate_gas(&typed, None)
            .await
            .map_err(|e| FleetError::Submission(format!("gas estimation failed: {e}")))?;
        typed.set_gas(gas_limit * GAS_LIMIT_MARGIN_PCT / 100);

        let pending = client
            .send_transaction(typed, None)
            .await
            .map_err(|e| FleetError::Submission(e.to_string()))?;

        // Detach the pending handle from the signing client's lifetime
        let hash = pending.tx_hash();
        Ok(ethers::providers::PendingTransaction::new(hash, &self.provider))
    }

    async fn send_for_hash(
        &self,
        wallet_index: u32,
        to: Address,
        value: U256,
        data: Option<Bytes>,
        gas: GasEstimate,
    ) -> Result<String> {
        let pending = self.send(wallet_index, to, value, data, gas).await?;
        Ok(format!("{:?}", pending.tx_hash()))
    }
}

fn derivation_path(index: u32) -> String {
    format!("m/44'/60'/0'/0/{index}")
}

fn parse_hash(txn_hash: &str) -> Result<H256> {
    txn_hash
        .parse::<H256>()
        .map_err(|e| FleetError::Validation(format!("invalid txn hash '{txn_hash}': {e}")))
}

/// CREATE2 pool address for a sorted token pair
fn pool_address(token_a: Address, token_b: Address) -> Address {
    let (token0, token1) = sort_tokens(token_a, token_b);
    let salt = keccak256(encode(&[
        AbiToken::Address(token0),
        AbiToken::Address(token1),
        AbiToken::Uint(U256::from(POOL_FEE)),
    ]));
    get_create2_address_from_hash(tokens::pool_factory(), salt, POOL_INIT_CODE_HASH)
}

fn sort_tokens(a: Address, b: Address) -> (Address, Address) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Human-unit pool price from the Q64.96 sqrt ratio.
///
/// `use_token1_price` selects the price of token1 denominated in token0;
/// otherwise the price of token0 denominated in token1.
fn sqrt_price_to_price(
    sqrt_price_x96: U256,
    decimals0: u32,
    decimals1: u32,
    use_token1_price: bool,
) -> Result<Decimal> {
    let sqrt: f64 = sqrt_price_x96
        .to_string()
        .parse()
        .map_err(|e| FleetError::Chain(format!("bad sqrt price: {e}")))?;
    let ratio = (sqrt / 2f64.powi(96)).powi(2);
    let token0_price = ratio * 10f64.powi(decimals0 as i32 - decimals1 as i32);
    let value = if use_token1_price {
        1.0 / token0_price
    } else {
        token0_price
    };
    if !value.is_finite() || value <= 0.0 {
        return Err(FleetError::Chain(format!("degenerate pool price {value}")));
    }
    Decimal::from_f64(value)
        .ok_or_else(|| FleetError::Chain(format!("unrepresentable pool price {value}")))
}

#[async_trait]
impl ChainProvider for EvmChain {
    fn wallet_address(&self, wallet_index: u32) -> Result<Address> {
        Ok(self.wallet(wallet_index)?.address())
    }

    async fn native_balance(&self, address: Address) -> Result<U256> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(|e| FleetError::Chain(e.to_string()))
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256> {
        Erc20::new(token, self.read_provider())
            .balance_of(owner)
            .call()
            .await
            .map_err(|e| FleetError::Chain(e.to_string()))
    }

    async fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256> {
        Erc20::new(token, self.read_provider())
            .allowance(owner, spender)
            .call()
            .await
            .map_err(|e| FleetError::Chain(e.to_string()))
    }

    async fn transaction_meta(&self, txn_hash: &str) -> Result<Option<TxnMeta>> {
        let txn = self
            .provider
            .get_transaction(parse_hash(txn_hash)?)
            .await
            .map_err(|e| FleetError::Chain(e.to_string()))?;
        Ok(txn.map(|t| TxnMeta {
            from: t.from,
            block_number: t.block_number.map(|n| n.as_u64() as i64),
        }))
    }

    async fn transaction_receipt(&self, txn_hash: &str) -> Result<Option<ReceiptMeta>> {
        let receipt = self
            .provider
            .get_transaction_receipt(parse_hash(txn_hash)?)
            .await
            .map_err(|e| FleetError::Chain(e.to_string()))?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let block_number = receipt
            .block_number
            .ok_or_else(|| FleetError::Chain(format!("receipt for {txn_hash} has no block")))?;

        Ok(Some(ReceiptMeta {
            to_addr: receipt.to,
            block_number: block_number.as_u64() as i64,
            txn_idx: receipt.transaction_index.as_u64() as i32,
            status_ok: receipt.status == Some(U64::from(1u64)),
            cumulative_gas: receipt.cumulative_gas_used,
            logs: receipt.logs,
        }))
    }

    async fn block_timestamp(&self, block_number: i64) -> Result<i64> {
        let block = self
            .provider
            .get_block(block_number as u64)
            .await
            .map_err(|e| FleetError::Chain(e.to_string()))?
            .ok_or_else(|| FleetError::Chain(format!("block {block_number} not found")))?;
        Ok(block.timestamp.as_u64() as i64)
    }

    async fn submit_swap(
        &self,
        wallet_index: u32,
        token_in: TokenInfo,
        amount_in: U256,
        token_out: TokenInfo,
        gas: GasEstimate,
    ) -> Result<String> {
        let recipient = self.wallet_address(wallet_index)?;
        let deadline = U256::from((Utc::now().timestamp() + SWAP_DEADLINE_SECS) as u64);

        let router = SwapRouter::new(tokens::swap_router(), self.read_provider());
        let call = router.exact_input_single(ExactInputSingleParams {
            token_in: token_in.address,
            token_out: token_out.address,
            fee: POOL_FEE,
            recipient,
            deadline,
            amount_in,
            amount_out_minimum: U256::zero(),
            sqrt_price_limit_x96: U256::zero(),
        });
        let data = call
            .calldata()
            .ok_or_else(|| FleetError::Submission("swap calldata unavailable".to_string()))?;

        let hash = self
            .send_for_hash(
                wallet_index,
                tokens::swap_router(),
                U256::zero(),
                Some(data),
                gas,
            )
            .await?;
        info!(
            "Submitted swap {hash}: {amount_in} {} -> {}",
            token_in.symbol, token_out.symbol
        );
        Ok(hash)
    }

    async fn submit_wrap(
        &self,
        wallet_index: u32,
        amount: U256,
        gas: GasEstimate,
    ) -> Result<String> {
        // Plain value transfer to the wrapped-native contract mints 1:1
        let hash = self
            .send_for_hash(
                wallet_index,
                tokens::wmatic().address,
                amount,
                None,
                gas,
            )
            .await?;
        debug!("Submitted wrap {hash} for {amount}");
        Ok(hash)
    }

    async fn submit_unwrap(
        &self,
        wallet_index: u32,
        amount: U256,
        gas: GasEstimate,
    ) -> Result<String> {
        let wrapped = WrappedNative::new(tokens::wmatic().address, self.read_provider());
        let data = wrapped
            .withdraw(amount)
            .calldata()
            .ok_or_else(|| FleetError::Submission("withdraw calldata unavailable".to_string()))?;
        let hash = self
            .send_for_hash(
                wallet_index,
                tokens::wmatic().address,
                U256::zero(),
                Some(data),
                gas,
            )
            .await?;
        debug!("Submitted unwrap {hash} for {amount}");
        Ok(hash)
    }

    async fn submit_transfer(
        &self,
        wallet_index: u32,
        to: Address,
        amount: U256,
        gas: GasEstimate,
    ) -> Result<String> {
        self.send_for_hash(wallet_index, to, amount, None, gas).await
    }

    async fn transfer_and_wait(
        &self,
        wallet_index: u32,
        to: Address,
        amount: U256,
        gas: GasEstimate,
    ) -> Result<bool> {
        let pending = self.send(wallet_index, to, amount, None, gas).await?;
        let receipt = pending
            .await
            .map_err(|e| FleetError::Chain(e.to_string()))?;
        Ok(receipt
            .map(|r| r.status == Some(U64::from(1u64)))
            .unwrap_or(false))
    }

    async fn submit_approval(
        &self,
        wallet_index: u32,
        token: Address,
        spender: Address,
        amount: U256,
        gas: GasEstimate,
    ) -> Result<String> {
        let erc20 = Erc20::new(token, self.read_provider());
        let data = erc20
            .approve(spender, amount)
            .calldata()
            .ok_or_else(|| FleetError::Submission("approve calldata unavailable".to_string()))?;

        let pending = self
            .send(wallet_index, token, U256::zero(), Some(data), gas)
            .await?;
        let hash = format!("{:?}", pending.tx_hash());
        pending
            .await
            .map_err(|e| FleetError::Chain(e.to_string()))?;
        info!("Approval {hash} mined for token {token:?} spender {spender:?}");
        Ok(hash)
    }

    async fn pool_state(
        &self,
        token_a: TokenInfo,
        token_b: TokenInfo,
        use_token1_price: bool,
    ) -> Result<PoolState> {
        let (addr0, _) = sort_tokens(token_a.address, token_b.address);
        let (decimals0, decimals1) = if addr0 == token_a.address {
            (token_a.decimals, token_b.decimals)
        } else {
            (token_b.decimals, token_a.decimals)
        };

        let pool = UniswapV3Pool::new(
            pool_address(token_a.address, token_b.address),
            self.read_provider(),
        );
        let (sqrt_price_x96, ..) = pool
            .slot_0()
            .call()
            .await
            .map_err(|e| FleetError::Chain(format!("slot0 read failed: {e}")))?;
        let liquidity = pool
            .liquidity()
            .call()
            .await
            .map_err(|e| FleetError::Chain(format!("liquidity read failed: {e}")))?;

        let price =
            sqrt_price_to_price(sqrt_price_x96, decimals0, decimals1, use_token1_price)?;
        Ok(PoolState {
            price,
            liquidity: U256::from(liquidity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_path_layout() {
        assert_eq!(derivation_path(0), "m/44'/60'/0'/0/0");
        assert_eq!(derivation_path(7), "m/44'/60'/0'/0/7");
    }

    #[test]
    fn test_sort_tokens_orders_by_address() {
        let wmatic = tokens::wmatic().address;
        let weth = tokens::weth().address;
        assert_eq!(sort_tokens(weth, wmatic), (wmatic, weth));
        assert_eq!(sort_tokens(wmatic, weth), (wmatic, weth));
    }

    #[test]
    fn test_sqrt_price_at_parity() {
        // sqrtPriceX96 = 2^96 encodes a raw ratio of exactly 1
        let parity = U256::from(2u8).pow(U256::from(96u8));
        let price = sqrt_price_to_price(parity, 18, 18, false).unwrap();
        assert_eq!(price.round_dp(5), Decimal::ONE);

        // decimal skew: 18 vs 6 decimals shifts the human price by 1e12
        let price = sqrt_price_to_price(parity, 18, 6, false).unwrap();
        assert_eq!(price.round_dp(0), Decimal::from(10u64.pow(12)));
    }

    #[test]
    fn test_token1_price_is_reciprocal() {
        let parity = U256::from(2u8).pow(U256::from(96u8));
        let doubled = parity * 2; // raw ratio 4
        let token0 = sqrt_price_to_price(doubled, 18, 18, false).unwrap();
        let token1 = sqrt_price_to_price(doubled, 18, 18, true).unwrap();
        assert_eq!(token0.round_dp(5), Decimal::from(4));
        assert_eq!(token1.round_dp(5), Decimal::new(25, 2));
    }

    #[test]
    fn test_zero_sqrt_price_is_rejected() {
        assert!(sqrt_price_to_price(U256::zero(), 18, 18, false).is_err());
    }
}
