//! Order Reconciler
//!
//! Matches inbound transfer events to open orders by target address,
//! verifies amounts under the order type's tolerance policy, and drives
//! the funded -> settled transition. Reconciliation of a single order is
//! serialized through a per-order lock; the wallet reference update
//! always happens before the settlement write, so a crash mid-reconcile
//! leaves the order safe to redo.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::core_types::{Amount, OrderUid, TokenId};
use crate::events::{StatusFeed, TransferEvent};
use crate::models::{AmountTolerance, Order, OrderPayload, OrderStatus};
use crate::settlement::{BalanceDelta, SettleError, SettlementWriter};
use crate::store::{OrderStore, StoreError};
use crate::wallet_ref::{WalletRefError, WalletRefTracker};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("wallet reference error: {0}")]
    WalletRef(#[from] WalletRefError),

    #[error("settlement error: {0}")]
    Settle(#[from] SettleError),
}

/// What reconciling one event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// No open order targets the destination; event recorded as orphan
    Orphaned,
    /// Ledger reference already settled; no-op
    AlreadySettled,
    /// Full settlement applied
    Settled,
    /// Settlement applied, overage refunded through a credit order
    SettledWithRefund { refund_order: OrderUid },
    /// Amount failed the order type's tolerance check; recorded as orphan
    AmountMismatch,
    /// Order was cancelled before the attempt could be recorded
    Cancelled,
    /// Order already reached a terminal state (failed, refunded);
    /// event recorded as orphan for manual recovery
    Closed,
}

/// Shared per-order lock map.
///
/// The reconciler and the retry scheduler serialize every mutation of
/// one order through the same entry; an entry is dropped once the order
/// reaches a terminal state. A racing acquire after eviction recreates
/// the entry and re-reads the order, which no-ops on terminal state.
#[derive(Clone, Default)]
pub struct OrderLocks {
    inner: Arc<DashMap<OrderUid, Arc<Mutex<()>>>>,
}

impl OrderLocks {
    pub async fn acquire(&self, uid: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the entry for an order that can no longer be mutated.
    pub fn evict(&self, uid: &str) {
        self.inner.remove(uid);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileResult {
    pub matched: bool,
    pub order: Option<OrderUid>,
    pub action: ReconcileAction,
}

impl ReconcileResult {
    fn unmatched(action: ReconcileAction) -> Self {
        Self {
            matched: false,
            order: None,
            action,
        }
    }

    fn matched(order: OrderUid, action: ReconcileAction) -> Self {
        Self {
            matched: true,
            order: Some(order),
            action,
        }
    }
}

pub struct Reconciler {
    orders: Arc<dyn OrderStore>,
    tracker: WalletRefTracker,
    writer: Arc<SettlementWriter>,
    feed: StatusFeed,
    /// Per-order serialization: concurrent reconciliation of the same
    /// order is the primary race to prevent
    locks: OrderLocks,
}

impl Reconciler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        writer: Arc<SettlementWriter>,
        feed: StatusFeed,
    ) -> Self {
        Self {
            tracker: WalletRefTracker::new(orders.clone()),
            orders,
            writer,
            feed,
            locks: OrderLocks::default(),
        }
    }

    /// Handle to the per-order lock map, shared with the retry
    /// scheduler so both serialize through the same entries.
    pub fn locks(&self) -> OrderLocks {
        self.locks.clone()
    }

    /// Reconcile one transfer event against the open orders.
    pub async fn reconcile(
        &self,
        event: &TransferEvent,
    ) -> Result<ReconcileResult, ReconcileError> {
        // Exactly-once: a ledger reference that was already recorded
        // belongs to its order forever, whether or not that order is
        // still open. A confirmed reference never settles twice; an
        // unconfirmed one means a crash mid-reconcile - resume it.
        if let Some(known) = self.orders.find_by_ledger_ref(&event.ledger_ref).await? {
            if known.wallet_reference.confirmed || known.status == OrderStatus::Settled {
                return Ok(ReconcileResult::matched(
                    known.uid,
                    ReconcileAction::AlreadySettled,
                ));
            }
            return self.reconcile_order(known.uid, event).await;
        }

        let Some(candidate) = self.orders.find_open_by_target(&event.destination).await? else {
            warn!(
                destination = %event.destination,
                ledger_ref = %event.ledger_ref,
                amount = event.amount,
                "orphan transfer: no open order for destination"
            );
            self.orders.record_orphan(event).await?;
            return Ok(ReconcileResult::unmatched(ReconcileAction::Orphaned));
        };

        self.reconcile_order(candidate.uid, event).await
    }

    /// Run the match/settle flow for a specific order, serialized per
    /// order uid.
    async fn reconcile_order(
        &self,
        order_uid: OrderUid,
        event: &TransferEvent,
    ) -> Result<ReconcileResult, ReconcileError> {
        let _guard = self.locks.acquire(&order_uid).await;

        // Re-read under the lock: a concurrent reconcile or a
        // cancellation may have changed the order since the lookup.
        let Some(mut order) = self.orders.get_order(&order_uid).await? else {
            self.orders.record_orphan(event).await?;
            self.locks.evict(&order_uid);
            return Ok(ReconcileResult::unmatched(ReconcileAction::Orphaned));
        };

        if order.wallet_reference.has_seen(&event.ledger_ref)
            && (order.wallet_reference.confirmed || order.status == OrderStatus::Settled)
        {
            self.locks.evict(&order_uid);
            return Ok(ReconcileResult::matched(
                order.uid,
                ReconcileAction::AlreadySettled,
            ));
        }

        // Cancellation is checked immediately before recording an attempt
        if order.status == OrderStatus::Cancelled {
            self.orders.record_orphan(event).await?;
            self.locks.evict(&order_uid);
            return Ok(ReconcileResult::matched(order.uid, ReconcileAction::Cancelled));
        }
        if !order.is_open() {
            self.orders.record_orphan(event).await?;
            self.locks.evict(&order_uid);
            return Ok(ReconcileResult::matched(order.uid, ReconcileAction::Closed));
        }

        let excess = match verify_amount(&order, event.amount) {
            AmountCheck::Ok { excess } => excess,
            AmountCheck::Mismatch => {
                warn!(
                    order = %order.uid,
                    expected = order.expected_amount,
                    received = event.amount,
                    "amount mismatch, recording for manual review"
                );
                self.orders.record_orphan(event).await?;
                return Ok(ReconcileResult::matched(
                    order.uid,
                    ReconcileAction::AmountMismatch,
                ));
            }
        };

        // Wallet reference update happens-before the settlement write
        order.wallet_reference = self
            .tracker
            .record_attempt(&order.uid, &event.ledger_ref)
            .await?;
        order.source_address = Some(event.source.clone());
        let old = order.status;
        order.status = OrderStatus::Funded;
        self.orders.update_order(&order).await?;
        if old != OrderStatus::Funded {
            self.feed.publish(&order.uid, old, OrderStatus::Funded);
        }

        let deltas = settlement_deltas(&order, event);
        self.writer.settle_order(&mut order, &deltas).await?;
        order.wallet_reference = self.tracker.confirm(&order.uid).await?;

        // Refund the overage on tolerant order types. Created only
        // after the settlement committed: a failed commit followed by
        // redelivery resumes the reconcile without a dangling refund.
        let refund_order = if excess > 0 {
            Some(self.create_excess_refund(&mut order, event, excess).await?)
        } else {
            None
        };

        // Consumed by this order; no longer an orphan candidate
        self.orders.remove_orphan(&event.ledger_ref).await?;
        self.locks.evict(&order.uid);

        info!(
            order = %order.uid,
            ledger_ref = %event.ledger_ref,
            amount = event.amount,
            "transfer reconciled"
        );

        let action = match refund_order {
            Some(refund_order) => ReconcileAction::SettledWithRefund { refund_order },
            None => ReconcileAction::Settled,
        };
        Ok(ReconcileResult::matched(order.uid, action))
    }

    /// Create a credit order refunding the overpaid portion back to the
    /// sender, linked both ways to the original order.
    ///
    /// The refund uid is derived from the order and ledger reference so
    /// a redelivered event can never mint a second refund for the same
    /// overage; an existing record is reused as-is.
    async fn create_excess_refund(
        &self,
        order: &mut Order,
        event: &TransferEvent,
        excess: Amount,
    ) -> Result<OrderUid, ReconcileError> {
        let refund_uid = format!("{}-excess-{}", order.uid, event.ledger_ref);
        let mut refund = Order::new(
            refund_uid.clone(),
            event.source.clone(),
            excess,
            OrderPayload::Credit {
                recipient: event.source.clone(),
                token: payment_token(event),
                invalid_payment: false,
                source_order: Some(order.uid.clone()),
            },
        );
        refund.linked_orders.push(order.uid.clone());
        match self.orders.insert_order(refund).await {
            Ok(()) => {
                info!(order = %order.uid, refund = %refund_uid, excess, "excess refund credit created");
            }
            Err(StoreError::Duplicate(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if !order.linked_orders.contains(&refund_uid) {
            order.linked_orders.push(refund_uid.clone());
            self.orders.update_order(order).await?;
        }
        Ok(refund_uid)
    }
}

enum AmountCheck {
    Ok { excess: Amount },
    Mismatch,
}

fn verify_amount(order: &Order, received: Amount) -> AmountCheck {
    match order.order_type().tolerance() {
        AmountTolerance::Exact => {
            if received == order.expected_amount {
                AmountCheck::Ok { excess: 0 }
            } else {
                AmountCheck::Mismatch
            }
        }
        AmountTolerance::RefundExcess => {
            if received >= order.expected_amount {
                AmountCheck::Ok {
                    excess: received - order.expected_amount,
                }
            } else {
                AmountCheck::Mismatch
            }
        }
    }
}

/// Token the payment was made in: the transfer's native token payload,
/// or the chain's base currency.
fn payment_token(event: &TransferEvent) -> TokenId {
    event
        .native_token
        .clone()
        .unwrap_or_else(|| event.chain_id.clone())
}

/// Type-specific settlement handler: derive the balance deltas a funded
/// order produces. Derivation is pure so a re-settle after a failed
/// commit yields the identical batch.
fn settlement_deltas(order: &Order, event: &TransferEvent) -> Vec<BalanceDelta> {
    let funded = order.expected_amount.min(event.amount);
    let sender = event.source.clone();
    match &order.payload {
        OrderPayload::NativePayment { beneficiary, token } => {
            vec![BalanceDelta::credit(beneficiary.clone(), token.clone(), funded)]
        }
        // Bulk funding: the sender's quote balance backs their resting
        // buy orders in the matching engine
        OrderPayload::TokenBuy { .. } => {
            vec![BalanceDelta::credit(sender, payment_token(event), funded)]
        }
        // The seller escrows the token itself
        OrderPayload::TokenSell { token, .. } => {
            vec![BalanceDelta::credit(sender, token.clone(), funded)]
        }
        OrderPayload::NftPurchase {
            seller,
            royalty_address,
            royalty_bps,
            ..
        }
        | OrderPayload::BillPayment {
            beneficiary: seller,
            royalty_address,
            royalty_bps,
            ..
        } => {
            let token = payment_token(event);
            let royalty = funded as u128 * *royalty_bps as u128 / 10_000;
            let royalty = royalty as Amount;
            let mut deltas = vec![BalanceDelta::credit(
                seller.clone(),
                token.clone(),
                funded - royalty,
            )];
            if royalty > 0
                && let Some(royalty_address) = royalty_address
            {
                deltas.push(BalanceDelta::credit(royalty_address.clone(), token, royalty));
            }
            deltas
        }
        OrderPayload::Credit { recipient, token, .. } => {
            vec![BalanceDelta::credit(recipient.clone(), token.clone(), funded)]
        }
        OrderPayload::Stake { token, .. } => {
            vec![BalanceDelta::credit(sender, token.clone(), funded)]
        }
        OrderPayload::AwardFund { award, .. } => {
            vec![BalanceDelta::credit(award.clone(), payment_token(event), funded)]
        }
    }
}
