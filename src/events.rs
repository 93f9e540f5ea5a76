//! Inter-component event types
//!
//! `TransferEvent` is the normalized ledger fact flowing from the watcher
//! into the reconciler. `OrderStatusChanged` is the only user-facing
//! signal the core emits; delivery is fire-and-forget.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::core_types::{Address, Amount, LedgerRef, OrderUid, TokenId};
use crate::models::OrderStatus;

/// A ledger-observed value transfer, normalized across networks.
///
/// `ledger_ref` is globally unique and serves as the idempotency key:
/// the same reference must never be reconciled into settlement twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEvent {
    pub chain_id: String,
    pub source: Address,
    pub destination: Address,
    pub amount: Amount,
    pub native_token: Option<TokenId>,
    pub ledger_ref: LedgerRef,
    pub block_height: u64,
}

/// Order status transition, emitted towards the notification/UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order: OrderUid,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
}

/// Fire-and-forget broadcast of order status transitions.
///
/// No acknowledgment is required; a missing subscriber is not an error.
#[derive(Debug, Clone)]
pub struct StatusFeed {
    tx: broadcast::Sender<OrderStatusChanged>,
}

impl StatusFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderStatusChanged> {
        self.tx.subscribe()
    }

    /// Publish a transition. Lagging or absent subscribers are ignored.
    pub fn publish(&self, order: &str, old_status: OrderStatus, new_status: OrderStatus) {
        debug!(
            order,
            old = old_status.as_str(),
            new = new_status.as_str(),
            "order status changed"
        );
        let _ = self.tx.send(OrderStatusChanged {
            order: order.to_string(),
            old_status,
            new_status,
        });
    }
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_feed_delivers_to_subscriber() {
        let feed = StatusFeed::new(8);
        let mut rx = feed.subscribe();

        feed.publish("o1", OrderStatus::Pending, OrderStatus::Funded);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.order, "o1");
        assert_eq!(ev.old_status, OrderStatus::Pending);
        assert_eq!(ev.new_status, OrderStatus::Funded);
    }

    #[test]
    fn test_publish_without_subscriber_is_noop() {
        let feed = StatusFeed::new(8);
        // Must not panic or error with no receivers attached
        feed.publish("o1", OrderStatus::Funded, OrderStatus::Settled);
    }
}
