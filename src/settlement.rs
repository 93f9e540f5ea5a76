//! Settlement Ledger Writer
//!
//! The only component allowed to mutate balances. Effects from one
//! triggering event (a reconciled transfer or a matching pass) commit as
//! a single atomic batch: all deltas succeed or none do. Orders advance
//! to SETTLED only after the batch commits, so a failed commit leaves
//! the order FUNDED and safe to re-settle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::core_types::{Address, Amount, TokenId};
use crate::events::StatusFeed;
use crate::models::{Fill, Order, OrderStatus};
use crate::store::{BalanceStore, OrderStore, StoreError};

/// A single signed balance mutation, in smallest units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub owner: Address,
    pub token: TokenId,
    pub delta: i128,
}

impl BalanceDelta {
    pub fn credit(owner: impl Into<Address>, token: impl Into<TokenId>, amount: Amount) -> Self {
        Self {
            owner: owner.into(),
            token: token.into(),
            delta: amount as i128,
        }
    }

    pub fn debit(owner: impl Into<Address>, token: impl Into<TokenId>, amount: Amount) -> Self {
        Self {
            owner: owner.into(),
            token: token.into(),
            delta: -(amount as i128),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettleError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("settlement commit failed after {attempts} attempts")]
    CommitExhausted { attempts: u32 },
}

/// Result of one committed batch
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub applied: usize,
}

pub struct SettlementWriter {
    orders: Arc<dyn OrderStore>,
    balances: Arc<dyn BalanceStore>,
    feed: StatusFeed,
    /// Local retries per batch before giving up
    max_commit_attempts: u32,
    /// Consecutive failed batches before the operator alert fires
    alert_after: u32,
    consecutive_failures: AtomicU32,
}

impl SettlementWriter {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        balances: Arc<dyn BalanceStore>,
        feed: StatusFeed,
    ) -> Self {
        Self {
            orders,
            balances,
            feed,
            max_commit_attempts: 3,
            alert_after: 5,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Apply one batch of deltas, all-or-nothing.
    ///
    /// Transient store errors are retried locally; deterministic
    /// rejections (insufficient balance) are returned immediately since
    /// retrying cannot change the outcome.
    pub async fn apply(&self, deltas: &[BalanceDelta]) -> Result<CommitResult, SettleError> {
        if deltas.is_empty() {
            return Ok(CommitResult { applied: 0 });
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.balances.apply_batch(deltas).await {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return Ok(CommitResult {
                        applied: deltas.len(),
                    });
                }
                Err(StoreError::Database(e)) if attempts < self.max_commit_attempts => {
                    warn!(attempts, "settlement commit failed, retrying: {e}");
                }
                Err(StoreError::Database(e)) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if failures >= self.alert_after {
                        error!(
                            failures,
                            "settlement commits failing repeatedly, operator attention required: {e}"
                        );
                    }
                    return Err(SettleError::CommitExhausted { attempts });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Commit the batch for a funded order and advance it to SETTLED.
    ///
    /// On commit failure the order stays FUNDED; deltas are derived
    /// freshly from the order on each retry, so re-settling is safe.
    pub async fn settle_order(
        &self,
        order: &mut Order,
        deltas: &[BalanceDelta],
    ) -> Result<CommitResult, SettleError> {
        let result = self.apply(deltas).await?;

        let old = order.status;
        order.status = OrderStatus::Settled;
        self.orders.update_order(order).await?;
        self.feed.publish(&order.uid, old, OrderStatus::Settled);

        info!(order = %order.uid, deltas = result.applied, "order settled");
        Ok(result)
    }

    /// Convert a matching pass's fills into balance deltas.
    ///
    /// Per fill: the buyer pays floor(price * quantity) of the quote
    /// token and receives the base token; the seller receives the quote
    /// value minus the protocol fee; the fee account collects the fee.
    /// Floor semantics avoid crediting value that was never debited.
    pub fn fills_to_deltas(
        fills: &[Fill],
        quote_token: &str,
        fee_bps: u16,
        fee_account: &str,
    ) -> Vec<BalanceDelta> {
        let mut deltas = Vec::with_capacity(fills.len() * 5);
        for fill in fills {
            let quote_value = (fill.price * Decimal::from(fill.quantity))
                .floor()
                .to_i128()
                .unwrap_or(0);
            let fee = quote_value * fee_bps as i128 / 10_000;

            deltas.push(BalanceDelta {
                owner: fill.buyer.clone(),
                token: quote_token.to_string(),
                delta: -quote_value,
            });
            deltas.push(BalanceDelta {
                owner: fill.buyer.clone(),
                token: fill.token.clone(),
                delta: fill.quantity as i128,
            });
            deltas.push(BalanceDelta {
                owner: fill.seller.clone(),
                token: fill.token.clone(),
                delta: -(fill.quantity as i128),
            });
            deltas.push(BalanceDelta {
                owner: fill.seller.clone(),
                token: quote_token.to_string(),
                delta: quote_value - fee,
            });
            if fee > 0 {
                deltas.push(BalanceDelta {
                    owner: fee_account.to_string(),
                    token: quote_token.to_string(),
                    delta: fee,
                });
            }
        }
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderPayload;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn fill(price: i64, qty: u64) -> Fill {
        Fill {
            uid: "f1".to_string(),
            token: "SOON".to_string(),
            buy_order: "b1".to_string(),
            sell_order: "s1".to_string(),
            buyer: "buyer".to_string(),
            seller: "seller".to_string(),
            price: Decimal::new(price, 0),
            quantity: qty,
            created_on: Utc::now(),
        }
    }

    #[test]
    fn test_fills_to_deltas_with_fee() {
        let deltas = SettlementWriter::fills_to_deltas(&[fill(4, 6)], "IOTA", 250, "fees");

        // quote value 24, fee 2.5% floored = 0 -> 24 * 250 / 10000 = 0.6 -> 0
        assert_eq!(deltas.len(), 4);
        assert_eq!(deltas[0].delta, -24); // buyer pays quote
        assert_eq!(deltas[1].delta, 6); // buyer receives token
        assert_eq!(deltas[2].delta, -6); // seller gives token
        assert_eq!(deltas[3].delta, 24); // seller receives quote, zero fee
    }

    #[test]
    fn test_fills_to_deltas_fee_extraction() {
        let deltas = SettlementWriter::fills_to_deltas(&[fill(100, 100)], "IOTA", 250, "fees");

        // quote value 10000, fee 250
        assert_eq!(deltas.len(), 5);
        assert_eq!(deltas[3].delta, 10_000 - 250);
        assert_eq!(deltas[4].owner, "fees");
        assert_eq!(deltas[4].delta, 250);
    }

    #[test]
    fn test_floor_on_fractional_price() {
        let fills = [Fill {
            price: Decimal::new(15, 1), // 1.5
            ..fill(0, 5)
        }];
        let deltas = SettlementWriter::fills_to_deltas(&fills, "IOTA", 0, "fees");
        // 1.5 * 5 = 7.5 floored to 7
        assert_eq!(deltas[0].delta, -7);
        assert_eq!(deltas[3].delta, 7);
    }

    #[tokio::test]
    async fn test_settle_order_advances_status() {
        let store = Arc::new(MemoryStore::new());
        let feed = StatusFeed::default();
        let writer = SettlementWriter::new(store.clone(), store.clone(), feed.clone());

        let mut order = Order::new(
            "o1",
            "addr1",
            100,
            OrderPayload::NativePayment {
                beneficiary: "bob".to_string(),
                token: "IOTA".to_string(),
            },
        );
        order.status = OrderStatus::Funded;
        store.insert_order(order.clone()).await.unwrap();

        let mut rx = feed.subscribe();
        writer
            .settle_order(&mut order, &[BalanceDelta::credit("bob", "IOTA", 100)])
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Settled);
        let stored = store.get_order("o1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Settled);
        assert_eq!(store.balance_of("bob", "IOTA").await.unwrap(), 100);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.new_status, OrderStatus::Settled);
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let writer = SettlementWriter::new(store.clone(), store.clone(), StatusFeed::default());

        let err = writer
            .apply(&[BalanceDelta::debit("alice", "IOTA", 10)])
            .await;
        assert!(matches!(
            err,
            Err(SettleError::Store(StoreError::InsufficientBalance { .. }))
        ));
    }
}
