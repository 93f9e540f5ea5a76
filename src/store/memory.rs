//! In-memory store implementation
//!
//! Backs unit/integration tests and single-process demo runs. All maps
//! sit behind plain mutexes; no lock is held across an await point.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    BalanceStore, CursorStore, LedgerCursor, OrderStore, StoreError, TradeStore,
};
use crate::events::TransferEvent;
use crate::models::{Fill, Order, TokenTradeOrder};
use crate::settlement::BalanceDelta;

#[derive(Default)]
pub struct MemoryStore {
    orders: Mutex<HashMap<String, Order>>,
    orphans: Mutex<Vec<TransferEvent>>,
    trade_orders: Mutex<HashMap<String, TokenTradeOrder>>,
    fills: Mutex<Vec<Fill>>,
    balances: Mutex<HashMap<(String, String), i128>>,
    cursors: Mutex<HashMap<String, LedgerCursor>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a balance directly. Test helper only - production balances
    /// are written exclusively through `apply_batch`.
    pub fn set_balance(&self, owner: &str, token: &str, amount: i128) {
        self.balances
            .lock()
            .unwrap()
            .insert((owner.to_string(), token.to_string()), amount);
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().unwrap().len()
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    pub fn fill_count(&self) -> usize {
        self.fills.lock().unwrap().len()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        let mut orders = self.orders.lock().unwrap();
        if orders.contains_key(&order.uid) {
            return Err(StoreError::Duplicate(order.uid));
        }
        if order.awaits_funding()
            && orders
                .values()
                .any(|o| o.awaits_funding() && o.target_address == order.target_address)
        {
            return Err(StoreError::AddressConflict(order.target_address));
        }
        orders.insert(order.uid.clone(), order);
        Ok(())
    }

    async fn get_order(&self, uid: &str) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.lock().unwrap().get(uid).cloned())
    }

    async fn update_order(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.lock().unwrap();
        if !orders.contains_key(&order.uid) {
            return Err(StoreError::OrderNotFound(order.uid.clone()));
        }
        orders.insert(order.uid.clone(), order.clone());
        Ok(())
    }

    async fn find_open_by_target(&self, address: &str) -> Result<Option<Order>, StoreError> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .values()
            .find(|o| o.awaits_funding() && o.target_address == address)
            .cloned())
    }

    async fn find_by_ledger_ref(&self, ledger_ref: &str) -> Result<Option<Order>, StoreError> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .values()
            .find(|o| o.wallet_reference.has_seen(ledger_ref))
            .cloned())
    }

    async fn open_targets(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.awaits_funding())
            .map(|o| o.target_address.clone())
            .collect())
    }

    async fn list_unconfirmed(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        let mut stale: Vec<Order> = self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| {
                o.awaits_funding() && !o.wallet_reference.confirmed && o.created_on < created_before
            })
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.created_on.cmp(&b.created_on));
        Ok(stale)
    }

    async fn record_orphan(&self, event: &TransferEvent) -> Result<(), StoreError> {
        let mut orphans = self.orphans.lock().unwrap();
        if orphans.iter().any(|e| e.ledger_ref == event.ledger_ref) {
            return Ok(());
        }
        orphans.push(event.clone());
        Ok(())
    }

    async fn orphans_for(&self, destination: &str) -> Result<Vec<TransferEvent>, StoreError> {
        Ok(self
            .orphans
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.destination == destination)
            .cloned()
            .collect())
    }

    async fn remove_orphan(&self, ledger_ref: &str) -> Result<(), StoreError> {
        self.orphans
            .lock()
            .unwrap()
            .retain(|e| e.ledger_ref != ledger_ref);
        Ok(())
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn upsert_trade_order(&self, order: &TokenTradeOrder) -> Result<(), StoreError> {
        self.trade_orders
            .lock()
            .unwrap()
            .insert(order.uid.clone(), order.clone());
        Ok(())
    }

    async fn get_trade_order(&self, uid: &str) -> Result<Option<TokenTradeOrder>, StoreError> {
        Ok(self.trade_orders.lock().unwrap().get(uid).cloned())
    }

    async fn insert_fills(&self, fills: &[Fill]) -> Result<(), StoreError> {
        let mut existing = self.fills.lock().unwrap();
        for fill in fills {
            if existing.iter().any(|f| f.uid == fill.uid) {
                return Err(StoreError::Duplicate(fill.uid.clone()));
            }
        }
        existing.extend_from_slice(fills);
        Ok(())
    }

    async fn fills_for_token(&self, token: &str) -> Result<Vec<Fill>, StoreError> {
        Ok(self
            .fills
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.token == token)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn apply_batch(&self, deltas: &[BalanceDelta]) -> Result<(), StoreError> {
        let mut balances = self.balances.lock().unwrap();

        // Stage first so a rejected batch leaves no partial update
        let mut staged: HashMap<(String, String), i128> = HashMap::new();
        for delta in deltas {
            let key = (delta.owner.clone(), delta.token.clone());
            let current = staged
                .get(&key)
                .copied()
                .or_else(|| balances.get(&key).copied())
                .unwrap_or(0);
            let next = current + delta.delta;
            if next < 0 {
                return Err(StoreError::InsufficientBalance {
                    owner: delta.owner.clone(),
                    token: delta.token.clone(),
                });
            }
            staged.insert(key, next);
        }

        for (key, value) in staged {
            balances.insert(key, value);
        }
        Ok(())
    }

    async fn balance_of(&self, owner: &str, token: &str) -> Result<i128, StoreError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&(owner.to_string(), token.to_string()))
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(&self, chain_id: &str) -> Result<Option<LedgerCursor>, StoreError> {
        Ok(self.cursors.lock().unwrap().get(chain_id).cloned())
    }

    async fn save_cursor(&self, cursor: &LedgerCursor) -> Result<(), StoreError> {
        self.cursors
            .lock()
            .unwrap()
            .insert(cursor.chain_id.clone(), cursor.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderPayload;

    fn payment_order(uid: &str, target: &str) -> Order {
        Order::new(
            uid,
            target,
            1_000,
            OrderPayload::NativePayment {
                beneficiary: "bob".to_string(),
                token: "IOTA".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_open_orders_cannot_share_target() {
        let store = MemoryStore::new();
        store.insert_order(payment_order("o1", "addr1")).await.unwrap();

        let err = store.insert_order(payment_order("o2", "addr1")).await;
        assert!(matches!(err, Err(StoreError::AddressConflict(_))));

        // Different target is fine
        store.insert_order(payment_order("o3", "addr2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_batch_is_atomic() {
        let store = MemoryStore::new();
        store.set_balance("alice", "SOON", 100);

        let deltas = vec![
            BalanceDelta::credit("bob", "SOON", 50),
            BalanceDelta::debit("alice", "SOON", 200), // would go negative
        ];
        let err = store.apply_batch(&deltas).await;
        assert!(matches!(err, Err(StoreError::InsufficientBalance { .. })));

        // Nothing was applied
        assert_eq!(store.balance_of("bob", "SOON").await.unwrap(), 0);
        assert_eq!(store.balance_of("alice", "SOON").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_orphan_dedupe_by_ledger_ref() {
        let store = MemoryStore::new();
        let event = TransferEvent {
            chain_id: "evm".to_string(),
            source: "alice".to_string(),
            destination: "addr9".to_string(),
            amount: 10,
            native_token: None,
            ledger_ref: "r1".to_string(),
            block_height: 5,
        };
        store.record_orphan(&event).await.unwrap();
        store.record_orphan(&event).await.unwrap();
        assert_eq!(store.orphan_count(), 1);
        assert_eq!(store.orphans_for("addr9").await.unwrap().len(), 1);
    }
}
