//! Postgres store implementation
//!
//! One logical record per order (wallet reference embedded as JSONB),
//! separate tables for orphan events, trade orders, fills, balances and
//! watcher cursors. Balances use NUMERIC so signed running totals never
//! truncate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::{
    BalanceStore, CursorStore, LedgerCursor, OrderStore, StoreError, TradeStore,
};
use crate::events::TransferEvent;
use crate::models::{Fill, Order, OrderStatus, TokenTradeOrder};
use crate::settlement::BalanceDelta;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS orders (
                 uid TEXT PRIMARY KEY,
                 target_address TEXT NOT NULL,
                 expected_amount BIGINT NOT NULL,
                 status TEXT NOT NULL,
                 source_address TEXT,
                 created_on TIMESTAMPTZ NOT NULL,
                 linked_orders JSONB NOT NULL DEFAULT '[]',
                 payload JSONB NOT NULL,
                 wallet_reference JSONB NOT NULL
               )"#,
        )
        .execute(&self.pool)
        .await?;

        // The database enforces one open non-credit order per deposit
        // address; concurrent inserts race past the application check
        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS orders_open_target_unique
               ON orders (target_address)
               WHERE status IN ('PENDING', 'FUNDED')
                 AND payload->>'kind' <> 'credit'"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS orphan_events (
                 ledger_ref TEXT PRIMARY KEY,
                 chain_id TEXT NOT NULL,
                 source TEXT NOT NULL,
                 destination TEXT NOT NULL,
                 amount BIGINT NOT NULL,
                 native_token TEXT,
                 block_height BIGINT NOT NULL,
                 recorded_on TIMESTAMPTZ NOT NULL DEFAULT NOW()
               )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS trade_orders (
                 uid TEXT PRIMARY KEY,
                 token TEXT NOT NULL,
                 side TEXT NOT NULL,
                 price NUMERIC NOT NULL,
                 count BIGINT NOT NULL,
                 owner TEXT NOT NULL,
                 created_on TIMESTAMPTZ NOT NULL,
                 status TEXT NOT NULL
               )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS fills (
                 uid TEXT PRIMARY KEY,
                 token TEXT NOT NULL,
                 buy_order TEXT NOT NULL,
                 sell_order TEXT NOT NULL,
                 buyer TEXT NOT NULL,
                 seller TEXT NOT NULL,
                 price NUMERIC NOT NULL,
                 quantity BIGINT NOT NULL,
                 created_on TIMESTAMPTZ NOT NULL
               )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS balances (
                 owner TEXT NOT NULL,
                 token TEXT NOT NULL,
                 amount NUMERIC NOT NULL DEFAULT 0,
                 version BIGINT NOT NULL DEFAULT 1,
                 PRIMARY KEY (owner, token)
               )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ledger_cursor (
                 chain_id TEXT PRIMARY KEY,
                 height BIGINT NOT NULL,
                 block_hash TEXT NOT NULL,
                 updated_on TIMESTAMPTZ NOT NULL DEFAULT NOW()
               )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let status: String = row.get("status");
    let status: OrderStatus = serde_json::from_value(serde_json::Value::String(status))?;
    Ok(Order {
        uid: row.get("uid"),
        target_address: row.get("target_address"),
        expected_amount: row.get::<i64, _>("expected_amount") as u64,
        payload: serde_json::from_value(row.get("payload"))?,
        status,
        source_address: row.get("source_address"),
        created_on: row.get("created_on"),
        linked_orders: serde_json::from_value(row.get("linked_orders"))?,
        wallet_reference: serde_json::from_value(row.get("wallet_reference"))?,
    })
}

fn orphan_from_row(row: &PgRow) -> TransferEvent {
    TransferEvent {
        chain_id: row.get("chain_id"),
        source: row.get("source"),
        destination: row.get("destination"),
        amount: row.get::<i64, _>("amount") as u64,
        native_token: row.get("native_token"),
        ledger_ref: row.get("ledger_ref"),
        block_height: row.get::<i64, _>("block_height") as u64,
    }
}

fn trade_order_from_row(row: &PgRow) -> Result<TokenTradeOrder, StoreError> {
    let side: String = row.get("side");
    let status: String = row.get("status");
    Ok(TokenTradeOrder {
        uid: row.get("uid"),
        token: row.get("token"),
        side: serde_json::from_value(serde_json::Value::String(side))?,
        price: row.get("price"),
        count: row.get::<i64, _>("count") as u64,
        owner: row.get("owner"),
        created_on: row.get("created_on"),
        status: serde_json::from_value(serde_json::Value::String(status))?,
    })
}

#[async_trait]
impl OrderStore for PgStore {
    async fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        // Fast path only; the partial unique index is what actually
        // guards against two connections inserting for one address
        let conflict = sqlx::query(
            r#"SELECT 1 AS hit FROM orders
               WHERE target_address = $1
                 AND status IN ('PENDING', 'FUNDED')
                 AND payload->>'kind' <> 'credit'"#,
        )
        .bind(&order.target_address)
        .fetch_optional(&self.pool)
        .await?;
        if order.awaits_funding() && conflict.is_some() {
            return Err(StoreError::AddressConflict(order.target_address));
        }

        let result = sqlx::query(
            r#"INSERT INTO orders
               (uid, target_address, expected_amount, status, source_address,
                created_on, linked_orders, payload, wallet_reference)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(&order.uid)
        .bind(&order.target_address)
        .bind(order.expected_amount as i64)
        .bind(order.status.as_str())
        .bind(&order.source_address)
        .bind(order.created_on)
        .bind(serde_json::to_value(&order.linked_orders)?)
        .bind(serde_json::to_value(&order.payload)?)
        .bind(serde_json::to_value(&order.wallet_reference)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.constraint() == Some("orders_open_target_unique") =>
            {
                Err(StoreError::AddressConflict(order.target_address))
            }
            Err(sqlx::Error::Database(db)) if db.constraint() == Some("orders_pkey") => {
                Err(StoreError::Duplicate(order.uid))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_order(&self, uid: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query("SELECT * FROM orders WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn update_order(&self, order: &Order) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"UPDATE orders
               SET status = $2, source_address = $3, linked_orders = $4,
                   payload = $5, wallet_reference = $6
               WHERE uid = $1"#,
        )
        .bind(&order.uid)
        .bind(order.status.as_str())
        .bind(&order.source_address)
        .bind(serde_json::to_value(&order.linked_orders)?)
        .bind(serde_json::to_value(&order.payload)?)
        .bind(serde_json::to_value(&order.wallet_reference)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OrderNotFound(order.uid.clone()));
        }
        Ok(())
    }

    async fn find_open_by_target(&self, address: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            r#"SELECT * FROM orders
               WHERE target_address = $1
                 AND status IN ('PENDING', 'FUNDED')
                 AND payload->>'kind' <> 'credit'"#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn find_by_ledger_ref(&self, ledger_ref: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            r#"SELECT * FROM orders
               WHERE wallet_reference->'chain_references' @> to_jsonb($1::text)"#,
        )
        .bind(ledger_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn open_targets(&self) -> Result<Vec<String>, StoreError> {
        let targets = sqlx::query_scalar(
            r#"SELECT target_address FROM orders
               WHERE status IN ('PENDING', 'FUNDED')
                 AND payload->>'kind' <> 'credit'"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(targets)
    }

    async fn list_unconfirmed(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM orders
               WHERE status IN ('PENDING', 'FUNDED')
                 AND payload->>'kind' <> 'credit'
                 AND created_on < $1
                 AND (wallet_reference->>'confirmed')::boolean = false
               ORDER BY created_on"#,
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn record_orphan(&self, event: &TransferEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO orphan_events
               (ledger_ref, chain_id, source, destination, amount, native_token, block_height)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (ledger_ref) DO NOTHING"#,
        )
        .bind(&event.ledger_ref)
        .bind(&event.chain_id)
        .bind(&event.source)
        .bind(&event.destination)
        .bind(event.amount as i64)
        .bind(&event.native_token)
        .bind(event.block_height as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn orphans_for(&self, destination: &str) -> Result<Vec<TransferEvent>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM orphan_events WHERE destination = $1 ORDER BY recorded_on"#,
        )
        .bind(destination)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(orphan_from_row).collect())
    }

    async fn remove_orphan(&self, ledger_ref: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM orphan_events WHERE ledger_ref = $1")
            .bind(ledger_ref)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TradeStore for PgStore {
    async fn upsert_trade_order(&self, order: &TokenTradeOrder) -> Result<(), StoreError> {
        let side = serde_json::to_value(order.side)?;
        let status = serde_json::to_value(order.status)?;
        sqlx::query(
            r#"INSERT INTO trade_orders
               (uid, token, side, price, count, owner, created_on, status)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (uid) DO UPDATE
               SET count = EXCLUDED.count, status = EXCLUDED.status"#,
        )
        .bind(&order.uid)
        .bind(&order.token)
        .bind(side.as_str().unwrap_or_default())
        .bind(order.price)
        .bind(order.count as i64)
        .bind(&order.owner)
        .bind(order.created_on)
        .bind(status.as_str().unwrap_or_default())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_trade_order(&self, uid: &str) -> Result<Option<TokenTradeOrder>, StoreError> {
        let row = sqlx::query("SELECT * FROM trade_orders WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trade_order_from_row).transpose()
    }

    async fn insert_fills(&self, fills: &[Fill]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for fill in fills {
            sqlx::query(
                r#"INSERT INTO fills
                   (uid, token, buy_order, sell_order, buyer, seller, price, quantity, created_on)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
            )
            .bind(&fill.uid)
            .bind(&fill.token)
            .bind(&fill.buy_order)
            .bind(&fill.sell_order)
            .bind(&fill.buyer)
            .bind(&fill.seller)
            .bind(fill.price)
            .bind(fill.quantity as i64)
            .bind(fill.created_on)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fills_for_token(&self, token: &str) -> Result<Vec<Fill>, StoreError> {
        let rows = sqlx::query("SELECT * FROM fills WHERE token = $1 ORDER BY created_on")
            .bind(token)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| Fill {
                uid: row.get("uid"),
                token: row.get("token"),
                buy_order: row.get("buy_order"),
                sell_order: row.get("sell_order"),
                buyer: row.get("buyer"),
                seller: row.get("seller"),
                price: row.get("price"),
                quantity: row.get::<i64, _>("quantity") as u64,
                created_on: row.get("created_on"),
            })
            .collect())
    }
}

#[async_trait]
impl BalanceStore for PgStore {
    async fn apply_batch(&self, deltas: &[BalanceDelta]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for delta in deltas {
            let row = sqlx::query(
                "SELECT amount FROM balances WHERE owner = $1 AND token = $2 FOR UPDATE",
            )
            .bind(&delta.owner)
            .bind(&delta.token)
            .fetch_optional(&mut *tx)
            .await?;

            let current = row
                .map(|r| r.get::<Decimal, _>("amount"))
                .and_then(|d| d.to_i128())
                .unwrap_or(0);
            let next = current + delta.delta;
            if next < 0 {
                // Dropping tx rolls the whole batch back
                return Err(StoreError::InsufficientBalance {
                    owner: delta.owner.clone(),
                    token: delta.token.clone(),
                });
            }

            sqlx::query(
                r#"INSERT INTO balances (owner, token, amount, version)
                   VALUES ($1, $2, $3, 1)
                   ON CONFLICT (owner, token) DO UPDATE
                   SET amount = EXCLUDED.amount, version = balances.version + 1"#,
            )
            .bind(&delta.owner)
            .bind(&delta.token)
            .bind(Decimal::from_i128_with_scale(next, 0))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn balance_of(&self, owner: &str, token: &str) -> Result<i128, StoreError> {
        let row = sqlx::query("SELECT amount FROM balances WHERE owner = $1 AND token = $2")
            .bind(owner)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.get::<Decimal, _>("amount"))
            .and_then(|d| d.to_i128())
            .unwrap_or(0))
    }
}

#[async_trait]
impl CursorStore for PgStore {
    async fn load_cursor(&self, chain_id: &str) -> Result<Option<LedgerCursor>, StoreError> {
        let row = sqlx::query(
            "SELECT chain_id, height, block_hash FROM ledger_cursor WHERE chain_id = $1",
        )
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| LedgerCursor {
            chain_id: r.get("chain_id"),
            height: r.get::<i64, _>("height") as u64,
            block_hash: r.get("block_hash"),
        }))
    }

    async fn save_cursor(&self, cursor: &LedgerCursor) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO ledger_cursor (chain_id, height, block_hash)
               VALUES ($1, $2, $3)
               ON CONFLICT (chain_id) DO UPDATE
               SET height = EXCLUDED.height,
                   block_hash = EXCLUDED.block_hash,
                   updated_on = NOW()"#,
        )
        .bind(&cursor.chain_id)
        .bind(cursor.height as i64)
        .bind(&cursor.block_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
