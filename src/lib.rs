//! chainsettle - On-chain payment reconciliation and order settlement
//!
//! Watches distributed ledgers for incoming value transfers, matches
//! them to pending orders, drives a funded/confirmed/settled state
//! machine with bounded retries, crosses resting token trade orders
//! into fills, and applies all balance effects as atomic batches,
//! exactly once per triggering event.
//!
//! # Modules
//!
//! - [`core_types`] - Core type aliases (OrderUid, Address, Amount, ...)
//! - [`models`] - Order, WalletReference, TokenTradeOrder and Fill types
//! - [`events`] - Normalized transfer events and the status feed
//! - [`store`] - Persistence ports with memory and Postgres backends
//! - [`watcher`] - Per-chain ledger scanning loops
//! - [`wallet_ref`] - Wallet reference lifecycle tracking
//! - [`reconciler`] - Transfer-to-order reconciliation
//! - [`scheduler`] - Retry sweeps and the refund path
//! - [`matching`] - Per-token order books and matching
//! - [`settlement`] - Atomic balance batch writer
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber setup

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod events;
pub mod logging;
pub mod matching;
pub mod models;
pub mod reconciler;
pub mod scheduler;
pub mod settlement;
pub mod store;
pub mod wallet_ref;
pub mod watcher;

// Convenient re-exports at crate root
pub use core_types::{Address, Amount, FillUid, LedgerRef, OrderUid, TokenId};
pub use events::{OrderStatusChanged, StatusFeed, TransferEvent};
pub use matching::{MatchingEngine, MatchingService, TokenBook};
pub use models::{
    Fill, Order, OrderPayload, OrderStatus, OrderType, TokenTradeOrder, TradeSide, TradeStatus,
    WalletReference,
};
pub use reconciler::{ReconcileAction, ReconcileResult, Reconciler};
pub use scheduler::{RetryPolicy, RetryScheduler};
pub use settlement::{BalanceDelta, SettlementWriter};
pub use store::{
    BalanceStore, CursorStore, MemoryStore, OrderStore, PgStore, StoreError, TradeStore,
};
pub use wallet_ref::WalletRefTracker;
pub use watcher::{ChainPolicy, LedgerSource, LedgerWatcher};
