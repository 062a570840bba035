use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::traits::Store;
use crate::domain::tokens::{WETH_USDC_PAIR, WETH_WMATIC_PAIR, WMATIC_USDC_PAIR};
use crate::domain::{
    Agent, LedgerEntry, PendingTxn, PriceHistoryRow, PriceRow, Side, Trade, TradeReceiptUpdate,
    TradeRequest, TradeSettlement, TradeSubmission, TxnStatus, TxnType,
};
use crate::error::Result;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn agent_from_row(row: &sqlx::postgres::PgRow) -> Agent {
        let side: Option<String> = row.get("side");
        Agent {
            agent_address: row.get("agent_address"),
            wallet_index: row.get::<i32, _>("wallet_index") as u32,
            ma_gain: row.get("ma_gain"),
            ma_duration: row.get::<i32, _>("ma_duration") as u32,
            side: side.and_then(|s| Side::from_str(&s).ok()),
            open_trade_id: row.get("open_trade_id"),
            is_active: row.get("is_active"),
            balance: row.get("balance"),
        }
    }

    fn pending_from_row(row: &sqlx::postgres::PgRow) -> Option<PendingTxn> {
        let raw_type: String = row.get("txn_type");
        let Ok(txn_type) = TxnType::from_str(&raw_type) else {
            warn!("Pending txn with unknown type '{raw_type}' skipped");
            return None;
        };
        Some(PendingTxn {
            txn_hash: row.get("txn_hash"),
            trade_uuid: row.get("trade_uuid"),
            agent_address: row.get("agent_address"),
            wallet_index: row.get::<i32, _>("wallet_index") as u32,
            symbol: row.get("symbol"),
            amount: row.get("amount"),
            txn_type,
            created_on: row.get("created_on"),
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    // ==================== Agents ====================

    async fn load_agent(&self, agent_address: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(
            r#"
            SELECT agent_address, wallet_index, ma_gain, ma_duration, side,
                   open_trade_id, is_active, balance
            FROM agents WHERE agent_address = $1
            "#,
        )
        .bind(agent_address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Self::agent_from_row(&r)))
    }

    async fn load_all_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            r#"
            SELECT agent_address, wallet_index, ma_gain, ma_duration, side,
                   open_trade_id, is_active, balance
            FROM agents ORDER BY wallet_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::agent_from_row).collect())
    }

    async fn load_active_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            r#"
            SELECT agent_address, wallet_index, ma_gain, ma_duration, side,
                   open_trade_id, is_active, balance
            FROM agents WHERE is_active ORDER BY wallet_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::agent_from_row).collect())
    }

    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (agent_address, wallet_index, ma_gain, ma_duration,
                                side, open_trade_id, is_active, balance)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (agent_address) DO UPDATE SET
                wallet_index = EXCLUDED.wallet_index,
                ma_gain = EXCLUDED.ma_gain,
                ma_duration = EXCLUDED.ma_duration,
                updated_on = NOW()
            "#,
        )
        .bind(&agent.agent_address)
        .bind(agent.wallet_index as i32)
        .bind(agent.ma_gain)
        .bind(agent.ma_duration as i32)
        .bind(agent.side.map(|s| s.as_str()))
        .bind(&agent.open_trade_id)
        .bind(agent.is_active)
        .bind(agent.balance)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_agent_balance(&self, agent_address: &str, balance: Decimal) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET balance = $2, updated_on = NOW() WHERE agent_address = $1",
        )
        .bind(agent_address)
        .bind(balance)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_activation(&self, agent_address: &str, is_active: bool) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET is_active = $2, updated_on = NOW() WHERE agent_address = $1",
        )
        .bind(agent_address)
        .bind(is_active)
        .execute(&self.pool)
        .await?;

        info!("Set {agent_address} activation to {is_active}");
        Ok(())
    }

    async fn switch_sides(&self, agent_address: &str, side: Option<Side>) -> Result<()> {
        let new_side = match side {
            Some(side) => side,
            None => self
                .load_agent(agent_address)
                .await?
                .and_then(|a| a.side)
                .unwrap_or(Side::Buy)
                .flipped(),
        };

        sqlx::query("UPDATE agents SET side = $2, updated_on = NOW() WHERE agent_address = $1")
            .bind(agent_address)
            .bind(new_side.as_str())
            .execute(&self.pool)
            .await?;

        debug!("Agent {agent_address} side set to {new_side}");
        Ok(())
    }

    async fn acquire_open_trade(&self, agent_address: &str, trade_uuid: Uuid) -> Result<bool> {
        // Conditional write: only an unlocked agent can take the lock
        let result = sqlx::query(
            r#"
            UPDATE agents SET open_trade_id = $2, updated_on = NOW()
            WHERE agent_address = $1 AND open_trade_id = ''
            "#,
        )
        .bind(agent_address)
        .bind(trade_uuid.to_string())
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!("Lock {trade_uuid} on {agent_address}: acquired={acquired}");
        Ok(acquired)
    }

    async fn release_open_trade(&self, agent_address: &str, expected_uuid: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agents SET open_trade_id = '', updated_on = NOW()
            WHERE agent_address = $1 AND open_trade_id = $2
            "#,
        )
        .bind(agent_address)
        .bind(expected_uuid)
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected() == 1;
        debug!("Lock {expected_uuid} on {agent_address}: released={released}");
        Ok(released)
    }

    // ==================== Trades ====================

    async fn insert_trade(&self, request: &TradeRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (uuid, side, agent_address, current_price, trade_status, created_on)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(request.uuid)
        .bind(request.side.as_str())
        .bind(&request.agent_address)
        .bind(request.current_price)
        .bind(TxnStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_trade_dropped(&self, trade_uuid: Uuid) -> Result<()> {
        sqlx::query("UPDATE trades SET trade_status = $2, updated_on = NOW() WHERE uuid = $1")
            .bind(trade_uuid)
            .bind(TxnStatus::Dropped.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn record_trade_submission(&self, submission: &TradeSubmission) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades SET txn_hash = $2, input_token = $3, input_bal = $4, updated_on = NOW()
            WHERE uuid = $1
            "#,
        )
        .bind(submission.uuid)
        .bind(&submission.txn_hash)
        .bind(&submission.input_token)
        .bind(&submission.input_bal)
        .execute(&self.pool)
        .await?;

        debug!(
            "Trade {} updated with txn {}",
            submission.uuid, submission.txn_hash
        );
        Ok(())
    }

    async fn update_trade_receipt(&self, update: &TradeReceiptUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades SET
                to_addr = $2,
                txn_block = $3,
                txn_idx = $4,
                block_timestamp = $5,
                gas = $6,
                trade_status = $7,
                updated_on = NOW()
            WHERE uuid = $1
            "#,
        )
        .bind(update.uuid)
        .bind(&update.to_addr)
        .bind(update.txn_block)
        .bind(update.txn_idx)
        .bind(update.block_timestamp)
        .bind(&update.gas)
        .bind(update.txn_status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn settle_trade(&self, settlement: &TradeSettlement) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades SET
                output_bal = $2,
                input_price = $3,
                output_price = $4,
                trade_status = $5,
                updated_on = NOW()
            WHERE uuid = $1
            "#,
        )
        .bind(settlement.uuid)
        .bind(&settlement.output_bal)
        .bind(settlement.input_price)
        .bind(settlement.output_price)
        .bind(TxnStatus::Applied.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_recent_trades(&self, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, side, agent_address, current_price, trade_status, txn_hash,
                   input_token, input_bal, output_bal, input_price, output_price, created_on
            FROM trades ORDER BY created_on DESC LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let trades = rows
            .iter()
            .filter_map(|row| {
                let side: String = row.get("side");
                let status: String = row.get("trade_status");
                Some(Trade {
                    uuid: row.get("uuid"),
                    side: Side::from_str(&side).ok()?,
                    agent_address: row.get("agent_address"),
                    current_price: row.get("current_price"),
                    trade_status: TxnStatus::from_str(&status).ok()?,
                    txn_hash: row.get("txn_hash"),
                    input_token: row.get("input_token"),
                    input_bal: row.get("input_bal"),
                    output_bal: row.get("output_bal"),
                    input_price: row.get("input_price"),
                    output_price: row.get("output_price"),
                    created_on: row.get("created_on"),
                })
            })
            .collect();

        Ok(trades)
    }

    // ==================== Pending transactions ====================

    async fn load_pending_txns(&self) -> Result<Vec<PendingTxn>> {
        let rows = sqlx::query(
            r#"
            SELECT txn_hash, trade_uuid, agent_address, wallet_index, symbol,
                   amount, txn_type, created_on
            FROM pending_txns ORDER BY created_on ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(Self::pending_from_row).collect())
    }

    async fn insert_pending_txn(&self, txn: &PendingTxn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_txns (txn_hash, trade_uuid, agent_address, wallet_index,
                                      symbol, amount, txn_type, created_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&txn.txn_hash)
        .bind(txn.trade_uuid)
        .bind(&txn.agent_address)
        .bind(txn.wallet_index as i32)
        .bind(&txn.symbol)
        .bind(&txn.amount)
        .bind(txn.txn_type.as_str())
        .bind(txn.created_on)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_pending_txn(&self, txn_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_txns WHERE txn_hash = $1")
            .bind(txn_hash)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Ledger ====================

    async fn append_ledger_entry(&self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger (txn_hash, txn_block, txn_idx, gas, agent_address,
                                symbol, price, txn_type, amount, debit, created_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&entry.txn_hash)
        .bind(entry.txn_block)
        .bind(entry.txn_idx)
        .bind(&entry.gas)
        .bind(&entry.agent_address)
        .bind(&entry.symbol)
        .bind(entry.price)
        .bind(entry.txn_type.as_str())
        .bind(&entry.amount)
        .bind(entry.debit)
        .bind(entry.created_on)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Prices ====================

    async fn get_price(&self, pair: &str) -> Result<Option<PriceRow>> {
        let row = sqlx::query(
            "SELECT pair, price, liquidity, smas, updated_on FROM prices WHERE pair = $1",
        )
        .bind(pair)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let raw_smas: String = r.get("smas");
            let smas = serde_json::from_str(&raw_smas).unwrap_or_else(|e| {
                warn!("Unparsable moving averages for {pair}: {e}");
                Vec::new()
            });
            PriceRow {
                pair: r.get("pair"),
                price: r.get("price"),
                liquidity: r.get("liquidity"),
                smas,
                updated_on: r.get::<Option<DateTime<Utc>>, _>("updated_on"),
            }
        }))
    }

    async fn upsert_price(&self, row: &PriceRow) -> Result<()> {
        let smas = serde_json::to_string(&row.smas)?;
        sqlx::query(
            r#"
            INSERT INTO prices (pair, price, liquidity, smas, updated_on)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (pair) DO UPDATE SET
                price = EXCLUDED.price,
                liquidity = EXCLUDED.liquidity,
                smas = EXCLUDED.smas,
                updated_on = NOW()
            "#,
        )
        .bind(&row.pair)
        .bind(row.price)
        .bind(&row.liquidity)
        .bind(&smas)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_price_history(&self, row: &PriceHistoryRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO price_history (pair, price, liquidity, created_on) VALUES ($1, $2, $3, NOW())",
        )
        .bind(&row.pair)
        .bind(row.price)
        .bind(&row.liquidity)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_usdc_prices(&self) -> Result<HashMap<String, Decimal>> {
        let pairs: Vec<String> = [WETH_WMATIC_PAIR, WMATIC_USDC_PAIR, WETH_USDC_PAIR]
            .iter()
            .map(|p| p.to_string())
            .collect();

        let rows = sqlx::query("SELECT pair, price FROM prices WHERE pair = ANY($1)")
            .bind(&pairs)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("pair"), r.get::<Decimal, _>("price")))
            .collect())
    }

    // ==================== Errors ====================

    async fn record_trade_error(
        &self,
        trade_uuid: Uuid,
        agent_address: &str,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_errors (trade_uuid, agent_address, message, created_on)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(trade_uuid)
        .bind(agent_address)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
