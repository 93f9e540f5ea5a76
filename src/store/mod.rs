//! Persistence ports
//!
//! Every component receives its stores explicitly - there is no ambient
//! database handle anywhere in the core. `MemoryStore` backs tests and
//! demo runs; `PgStore` is the production Postgres implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::{Address, OrderUid, TokenId};
use crate::events::TransferEvent;
use crate::models::{Fill, Order, TokenTradeOrder};
use crate::settlement::BalanceDelta;

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("order not found: {0}")]
    OrderNotFound(OrderUid),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("open order already exists for target address {0}")]
    AddressConflict(Address),

    #[error("balance for {owner}/{token} would go negative")]
    InsufficientBalance { owner: Address, token: TokenId },

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Order persistence port.
///
/// An order and its embedded wallet reference persist as one logical
/// record keyed by order uid.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new order. Rejects the insert if another open order
    /// already targets the same address (fund-ambiguity guard).
    async fn insert_order(&self, order: Order) -> Result<(), StoreError>;

    async fn get_order(&self, uid: &str) -> Result<Option<Order>, StoreError>;

    /// Persist the full order record (status, wallet reference, links).
    async fn update_order(&self, order: &Order) -> Result<(), StoreError>;

    /// Look up the open (PENDING/FUNDED) order awaiting funds at an
    /// address. Outbound credit orders never match.
    async fn find_open_by_target(&self, address: &str) -> Result<Option<Order>, StoreError>;

    /// Look up the order whose wallet reference has recorded the given
    /// ledger reference, open or not. Idempotency lookup.
    async fn find_by_ledger_ref(&self, ledger_ref: &str) -> Result<Option<Order>, StoreError>;

    /// Target addresses of all orders currently awaiting funds. The
    /// watcher reloads its address filter from this set each pass.
    async fn open_targets(&self) -> Result<Vec<Address>, StoreError>;

    /// Open orders created before the cutoff whose wallet reference is
    /// not yet confirmed. Input to the retry scheduler.
    async fn list_unconfirmed(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError>;

    /// Record a transfer with no matching open order. Orphans are kept
    /// for manual recovery and for retry re-drives; recording the same
    /// ledger reference twice is a no-op.
    async fn record_orphan(&self, event: &TransferEvent) -> Result<(), StoreError>;

    /// Orphan events destined for the given address, oldest first.
    async fn orphans_for(&self, destination: &str) -> Result<Vec<TransferEvent>, StoreError>;

    /// Remove an orphan once a retry has reconciled it into an order.
    async fn remove_orphan(&self, ledger_ref: &str) -> Result<(), StoreError>;
}

/// Token trade order and fill persistence port.
///
/// Fill records are immutable once written.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn upsert_trade_order(&self, order: &TokenTradeOrder) -> Result<(), StoreError>;

    async fn get_trade_order(&self, uid: &str) -> Result<Option<TokenTradeOrder>, StoreError>;

    async fn insert_fills(&self, fills: &[Fill]) -> Result<(), StoreError>;

    async fn fills_for_token(&self, token: &str) -> Result<Vec<Fill>, StoreError>;
}

/// Balance persistence port - the sole writer of balances is the
/// settlement ledger writer.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Apply all deltas as one atomic batch: all succeed or none do.
    /// A batch that would drive any balance negative is rejected whole.
    async fn apply_batch(&self, deltas: &[BalanceDelta]) -> Result<(), StoreError>;

    async fn balance_of(&self, owner: &str, token: &str) -> Result<i128, StoreError>;
}

/// Persisted high-water mark of a watcher, one per chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerCursor {
    pub chain_id: String,
    pub height: u64,
    pub block_hash: String,
}

/// Watcher cursor persistence port.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self, chain_id: &str) -> Result<Option<LedgerCursor>, StoreError>;

    async fn save_cursor(&self, cursor: &LedgerCursor) -> Result<(), StoreError>;
}
