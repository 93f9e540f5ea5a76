//! Wallet Reference Tracker
//!
//! Per-order bookkeeping of the expected incoming transfer: which ledger
//! references have been seen, how many attempts were made, and whether
//! the transfer is confirmed. Confirmed state is terminal - nothing can
//! regress it.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::core_types::OrderUid;
use crate::models::WalletReference;
use crate::store::{OrderStore, StoreError};

#[derive(Debug, Error)]
pub enum WalletRefError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("order not found: {0}")]
    OrderNotFound(OrderUid),
}

pub struct WalletRefTracker {
    orders: Arc<dyn OrderStore>,
}

impl WalletRefTracker {
    pub fn new(orders: Arc<dyn OrderStore>) -> Self {
        Self { orders }
    }

    /// Record a transfer attempt for an order.
    ///
    /// Appends the ledger reference (deduplicated) and increments the
    /// attempt counter only when the reference is a new distinct attempt,
    /// not a duplicate read of the same event. Sets `in_progress`.
    pub async fn record_attempt(
        &self,
        order_uid: &str,
        ledger_ref: &str,
    ) -> Result<WalletReference, WalletRefError> {
        let mut order = self
            .orders
            .get_order(order_uid)
            .await?
            .ok_or_else(|| WalletRefError::OrderNotFound(order_uid.to_string()))?;

        let wr = &mut order.wallet_reference;
        if wr.confirmed {
            // Terminal: the record is immutable
            return Ok(wr.clone());
        }

        if !wr.has_seen(ledger_ref) {
            wr.chain_references.push(ledger_ref.to_string());
            wr.count += 1;
            debug!(order = order_uid, ledger_ref, count = wr.count, "attempt recorded");
        }
        wr.chain_reference = Some(ledger_ref.to_string());
        wr.in_progress = true;

        let snapshot = wr.clone();
        self.orders.update_order(&order).await?;
        Ok(snapshot)
    }

    /// Mark the order's transfer as confirmed. Idempotent: calling it
    /// twice has no additional effect.
    pub async fn confirm(&self, order_uid: &str) -> Result<WalletReference, WalletRefError> {
        let mut order = self
            .orders
            .get_order(order_uid)
            .await?
            .ok_or_else(|| WalletRefError::OrderNotFound(order_uid.to_string()))?;

        let wr = &mut order.wallet_reference;
        if wr.confirmed {
            return Ok(wr.clone());
        }

        wr.confirmed = true;
        wr.in_progress = false;
        wr.error = None;

        let snapshot = wr.clone();
        self.orders.update_order(&order).await?;
        Ok(snapshot)
    }

    /// Count a failed attempt with a reason.
    ///
    /// Rejected (returns the existing state unchanged) if the reference
    /// is already confirmed.
    pub async fn fail_attempt(
        &self,
        order_uid: &str,
        reason: &str,
    ) -> Result<WalletReference, WalletRefError> {
        let mut order = self
            .orders
            .get_order(order_uid)
            .await?
            .ok_or_else(|| WalletRefError::OrderNotFound(order_uid.to_string()))?;

        let wr = &mut order.wallet_reference;
        if wr.confirmed {
            return Ok(wr.clone());
        }

        wr.count += 1;
        wr.error = Some(reason.to_string());
        wr.in_progress = false;
        debug!(order = order_uid, count = wr.count, reason, "attempt failed");

        let snapshot = wr.clone();
        self.orders.update_order(&order).await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, OrderPayload};
    use crate::store::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, WalletRefTracker) {
        let store = Arc::new(MemoryStore::new());
        let order = Order::new(
            "o1",
            "addr1",
            1_000,
            OrderPayload::Stake {
                token: "SOON".to_string(),
                weeks: 26,
            },
        );
        store.insert_order(order).await.unwrap();
        let tracker = WalletRefTracker::new(store.clone());
        (store, tracker)
    }

    #[tokio::test]
    async fn test_record_attempt_dedupes_reference() {
        let (_store, tracker) = setup().await;

        let wr = tracker.record_attempt("o1", "r1").await.unwrap();
        assert_eq!(wr.count, 1);
        assert!(wr.in_progress);

        // Duplicate read of the same event: no counter bump
        let wr = tracker.record_attempt("o1", "r1").await.unwrap();
        assert_eq!(wr.count, 1);
        assert_eq!(wr.chain_references, vec!["r1".to_string()]);

        // A distinct reference is a new attempt
        let wr = tracker.record_attempt("o1", "r2").await.unwrap();
        assert_eq!(wr.count, 2);
        assert_eq!(wr.chain_reference.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent() {
        let (_store, tracker) = setup().await;

        tracker.record_attempt("o1", "r1").await.unwrap();
        let first = tracker.confirm("o1").await.unwrap();
        assert!(first.confirmed);
        assert!(!first.in_progress);

        let second = tracker.confirm("o1").await.unwrap();
        assert_eq!(second.count, first.count);
        assert!(second.confirmed);
    }

    #[tokio::test]
    async fn test_confirmed_is_terminal_against_fail() {
        let (_store, tracker) = setup().await;

        tracker.record_attempt("o1", "r1").await.unwrap();
        let confirmed = tracker.confirm("o1").await.unwrap();

        let after = tracker.fail_attempt("o1", "late failure").await.unwrap();
        assert!(after.confirmed);
        assert_eq!(after.count, confirmed.count);
        assert!(after.error.is_none());
    }

    #[tokio::test]
    async fn test_fail_attempt_counts_and_records_reason() {
        let (_store, tracker) = setup().await;

        let wr = tracker.fail_attempt("o1", "no transfer observed").await.unwrap();
        assert_eq!(wr.count, 1);
        assert_eq!(wr.error.as_deref(), Some("no transfer observed"));
        assert!(!wr.in_progress);
    }

    #[tokio::test]
    async fn test_unknown_order_is_an_error() {
        let (_store, tracker) = setup().await;
        let err = tracker.record_attempt("nope", "r1").await;
        assert!(matches!(err, Err(WalletRefError::OrderNotFound(_))));
    }
}
