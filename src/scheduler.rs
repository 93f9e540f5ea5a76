//! Retry/Backoff Scheduler
//!
//! Periodically sweeps open orders whose wallet reference is still
//! unconfirmed after the retry window. A retry first replays any orphan
//! transfer recorded for the order's target address (the transfer may
//! have arrived outside the first confirmation window); only when no
//! orphan matches does the attempt counter advance. At `max_attempts`
//! the order is permanently failed and exactly one refund credit order
//! is created for the original sender.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::StatusFeed;
use crate::models::{Order, OrderPayload, OrderStatus};
use crate::reconciler::{OrderLocks, ReconcileError, Reconciler};
use crate::store::{OrderStore, StoreError};
use crate::wallet_ref::{WalletRefError, WalletRefTracker};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("wallet reference error: {0}")]
    WalletRef(#[from] WalletRefError),

    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
}

/// Retry policy; the window is configurable per deployment so slower-
/// finality networks get a longer grace period.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_window: Duration,
    pub sweep_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            retry_window: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Per-order retry state, derived from the persisted wallet reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Unconfirmed,
    Confirmed,
    PermanentlyFailed,
}

impl RetryState {
    pub fn of(order: &Order, max_attempts: u32) -> Self {
        if order.wallet_reference.confirmed {
            RetryState::Confirmed
        } else if order.wallet_reference.count >= max_attempts {
            RetryState::PermanentlyFailed
        } else {
            RetryState::Unconfirmed
        }
    }
}

pub struct RetryScheduler {
    orders: Arc<dyn OrderStore>,
    reconciler: Arc<Reconciler>,
    tracker: WalletRefTracker,
    /// Same lock map the reconciler serializes through: a sweep must
    /// never count a failure against an order whose reconcile is still
    /// in flight.
    locks: OrderLocks,
    feed: StatusFeed,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        reconciler: Arc<Reconciler>,
        feed: StatusFeed,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            tracker: WalletRefTracker::new(orders.clone()),
            orders,
            locks: reconciler.locks(),
            reconciler,
            feed,
            policy,
        }
    }

    /// Run the sweep loop until the task is cancelled.
    pub async fn run(&self) {
        info!(
            max_attempts = self.policy.max_attempts,
            window_secs = self.policy.retry_window.as_secs(),
            "retry scheduler starting"
        );
        loop {
            if let Err(e) = self.sweep_once().await {
                warn!("retry sweep failed: {e}");
            }
            sleep(self.policy.sweep_interval).await;
        }
    }

    /// One sweep over stale unconfirmed orders.
    pub async fn sweep_once(&self) -> Result<u32, SchedulerError> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.policy.retry_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(180));
        let stale = self.orders.list_unconfirmed(cutoff).await?;

        let mut handled = 0u32;
        for order in stale {
            match RetryState::of(&order, self.policy.max_attempts) {
                RetryState::Confirmed => {}
                RetryState::PermanentlyFailed => {
                    let _guard = self.locks.acquire(&order.uid).await;
                    if let Some(current) = self.orders.get_order(&order.uid).await?
                        && !current.wallet_reference.confirmed
                        && current.is_open()
                    {
                        self.fail_and_refund(current).await?;
                        handled += 1;
                    }
                }
                RetryState::Unconfirmed => {
                    self.retry(order).await?;
                    handled += 1;
                }
            }
        }
        Ok(handled)
    }

    /// Re-drive one stale order: replay recorded orphans for its target,
    /// then count a failed attempt if it is still unconfirmed.
    async fn retry(&self, order: Order) -> Result<(), SchedulerError> {
        let orphans = self.orders.orphans_for(&order.target_address).await?;
        for event in &orphans {
            self.reconciler.reconcile(event).await?;
        }

        // A reconcile parked in the settlement write holds this lock;
        // it must finish before the sweep may count a failure.
        let _guard = self.locks.acquire(&order.uid).await;

        let Some(current) = self.orders.get_order(&order.uid).await? else {
            return Ok(());
        };
        if current.wallet_reference.confirmed || !current.is_open() {
            return Ok(());
        }

        let wr = self
            .tracker
            .fail_attempt(&order.uid, "no transfer confirmed within retry window")
            .await?;

        if wr.count >= self.policy.max_attempts {
            // Exhausted on this sweep; fail immediately rather than
            // waiting a full interval
            if let Some(order) = self.orders.get_order(&order.uid).await? {
                self.fail_and_refund(order).await?;
            }
        }
        Ok(())
    }

    /// Terminal path: mark the order failed and create the refund
    /// credit order for the original sender. The caller holds the
    /// order's lock; a failed order never re-enters the sweep.
    async fn fail_and_refund(&self, mut order: Order) -> Result<(), SchedulerError> {
        let old = order.status;
        order.status = OrderStatus::Failed;
        self.orders.update_order(&order).await?;
        self.feed.publish(&order.uid, old, OrderStatus::Failed);
        warn!(
            order = %order.uid,
            attempts = order.wallet_reference.count,
            "order permanently failed"
        );

        // Without a known sender there is nothing to refund
        let Some(sender) = order.source_address.clone() else {
            self.locks.evict(&order.uid);
            return Ok(());
        };

        let refund_uid = Uuid::new_v4().to_string();
        let mut refund = Order::new(
            refund_uid.clone(),
            sender.clone(),
            order.expected_amount,
            OrderPayload::Credit {
                recipient: sender,
                token: refund_token(&order),
                invalid_payment: true,
                source_order: Some(order.uid.clone()),
            },
        );
        refund.linked_orders.push(order.uid.clone());
        self.orders.insert_order(refund).await?;

        order.status = OrderStatus::Refunded;
        order.linked_orders.push(refund_uid.clone());
        self.orders.update_order(&order).await?;
        self.feed
            .publish(&order.uid, OrderStatus::Failed, OrderStatus::Refunded);
        self.locks.evict(&order.uid);
        info!(order = %order.uid, refund = %refund_uid, "refund credit created");
        Ok(())
    }
}

/// Token the refund is denominated in, from the failed order's payload.
fn refund_token(order: &Order) -> String {
    match &order.payload {
        OrderPayload::NativePayment { token, .. }
        | OrderPayload::TokenSell { token, .. }
        | OrderPayload::TokenBuy { token, .. }
        | OrderPayload::Credit { token, .. }
        | OrderPayload::BillPayment { token, .. }
        | OrderPayload::Stake { token, .. }
        | OrderPayload::AwardFund { token, .. } => token.clone(),
        OrderPayload::NftPurchase { .. } => "native".to_string(),
    }
}
