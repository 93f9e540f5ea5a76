//! TokenBook - BTreeMap-based price-time priority book for one token
//!
//! This module contains only the book data structure. The matching
//! logic lives in the engine module.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;

use crate::core_types::{Amount, OrderUid};
use crate::models::{TokenTradeOrder, TradeSide};

/// Price-time priority book.
///
/// Asks are keyed by price ascending (lowest = best); bids use
/// `Reverse<Decimal>` so the highest price iterates first. Each price
/// level is a FIFO queue, so equal-price orders fill oldest first.
///
/// The book is cheap to clone relative to a matching pass; the service
/// runs each pass on a clone and swaps it in only on success, so an
/// aborted pass leaves the live book untouched.
#[derive(Debug, Clone, Default)]
pub struct TokenBook {
    /// Sell orders: price -> orders (ascending, lowest = best)
    asks: BTreeMap<Decimal, VecDeque<TokenTradeOrder>>,
    /// Buy orders: Reverse(price) -> orders (highest price first)
    bids: BTreeMap<Reverse<Decimal>, VecDeque<TokenTradeOrder>>,
    /// Order uid -> (price, side) for cancel lookup
    order_index: FxHashMap<OrderUid, (Decimal, TradeSide)>,
}

impl TokenBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Best bid price (highest resting buy)
    #[inline]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(k, _)| k.0)
    }

    /// Best ask price (lowest resting sell)
    #[inline]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(k, _)| *k)
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) if ask > bid => Some(ask - bid),
            _ => None,
        }
    }

    /// Number of price levels on each side (bid_depth, ask_depth)
    #[inline]
    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    #[inline]
    pub(crate) fn asks_mut(&mut self) -> &mut BTreeMap<Decimal, VecDeque<TokenTradeOrder>> {
        &mut self.asks
    }

    #[inline]
    pub(crate) fn bids_mut(
        &mut self,
    ) -> &mut BTreeMap<Reverse<Decimal>, VecDeque<TokenTradeOrder>> {
        &mut self.bids
    }

    #[inline]
    pub fn asks(&self) -> &BTreeMap<Decimal, VecDeque<TokenTradeOrder>> {
        &self.asks
    }

    #[inline]
    pub fn bids(&self) -> &BTreeMap<Reverse<Decimal>, VecDeque<TokenTradeOrder>> {
        &self.bids
    }

    /// Drop a fully filled order from the cancel index. Must be called
    /// whenever the engine pops an order off a queue.
    #[inline]
    pub(crate) fn remove_from_index(&mut self, uid: &str) {
        self.order_index.remove(uid);
    }

    /// Rest an unfilled or partially filled order in the book.
    ///
    /// The caller is responsible for the order's status; this only
    /// stores it.
    pub fn rest_order(&mut self, order: TokenTradeOrder) {
        self.order_index
            .insert(order.uid.clone(), (order.price, order.side));

        match order.side {
            TradeSide::Buy => {
                self.bids
                    .entry(Reverse(order.price))
                    .or_default()
                    .push_back(order);
            }
            TradeSide::Sell => {
                self.asks.entry(order.price).or_default().push_back(order);
            }
        }
    }

    /// Total resting quantity at a price level
    pub fn qty_at_price(&self, price: Decimal, side: TradeSide) -> Amount {
        let orders = match side {
            TradeSide::Buy => self.bids.get(&Reverse(price)),
            TradeSide::Sell => self.asks.get(&price),
        };
        orders
            .map(|q| q.iter().map(|o| o.count).sum())
            .unwrap_or(0)
    }

    /// Remove a resting order by uid, via the index.
    ///
    /// Returns the removed order if it was resting.
    pub fn remove_order(&mut self, uid: &str) -> Option<TokenTradeOrder> {
        let (price, side) = self.order_index.remove(uid)?;

        let orders = match side {
            TradeSide::Buy => self.bids.get_mut(&Reverse(price)),
            TradeSide::Sell => self.asks.get_mut(&price),
        }?;

        let pos = orders.iter().position(|o| o.uid == uid)?;
        let order = orders.remove(pos)?;

        // Clean up the empty price level
        if orders.is_empty() {
            match side {
                TradeSide::Buy => {
                    self.bids.remove(&Reverse(price));
                }
                TradeSide::Sell => {
                    self.asks.remove(&price);
                }
            }
        }
        Some(order)
    }

    /// Top `limit` price levels per side with aggregated quantities.
    /// Bids descending, asks ascending.
    pub fn snapshot(&self, limit: usize) -> DepthSnapshot {
        let bids = self
            .bids
            .iter()
            .take(limit)
            .map(|(key, orders)| (key.0, orders.iter().map(|o| o.count).sum()))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(limit)
            .map(|(&price, orders)| (price, orders.iter().map(|o| o.count).sum()))
            .collect();
        DepthSnapshot { bids, asks }
    }
}

/// Market depth snapshot: (price, total quantity) per level
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub bids: Vec<(Decimal, Amount)>,
    pub asks: Vec<(Decimal, Amount)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_order(uid: &str, price: i64, count: Amount, side: TradeSide) -> TokenTradeOrder {
        TokenTradeOrder::new(uid, "SOON", side, Decimal::new(price, 0), count, "owner")
    }

    #[test]
    fn test_rest_and_best_prices() {
        let mut book = TokenBook::new();

        book.rest_order(make_order("b1", 100, 10, TradeSide::Buy));
        book.rest_order(make_order("b2", 99, 10, TradeSide::Buy));
        book.rest_order(make_order("a1", 101, 10, TradeSide::Sell));
        book.rest_order(make_order("a2", 102, 10, TradeSide::Sell));

        assert_eq!(book.best_bid(), Some(Decimal::new(100, 0)));
        assert_eq!(book.best_ask(), Some(Decimal::new(101, 0)));
        assert_eq!(book.spread(), Some(Decimal::ONE));
        assert_eq!(book.depth(), (2, 2));
    }

    #[test]
    fn test_remove_order() {
        let mut book = TokenBook::new();

        book.rest_order(make_order("b1", 100, 10, TradeSide::Buy));
        book.rest_order(make_order("a1", 101, 20, TradeSide::Sell));

        let removed = book.remove_order("b1").unwrap();
        assert_eq!(removed.uid, "b1");
        assert_eq!(book.best_bid(), None);

        assert!(book.remove_order("nope").is_none());
        assert_eq!(book.best_ask(), Some(Decimal::new(101, 0)));
    }

    #[test]
    fn test_snapshot_ordering() {
        let mut book = TokenBook::new();

        book.rest_order(make_order("b1", 100, 10, TradeSide::Buy));
        book.rest_order(make_order("b2", 99, 20, TradeSide::Buy));
        book.rest_order(make_order("b3", 99, 5, TradeSide::Buy));
        book.rest_order(make_order("a1", 101, 12, TradeSide::Sell));
        book.rest_order(make_order("a2", 103, 8, TradeSide::Sell));

        let depth = book.snapshot(5);
        assert_eq!(depth.bids[0], (Decimal::new(100, 0), 10));
        assert_eq!(depth.bids[1], (Decimal::new(99, 0), 25));
        assert_eq!(depth.asks[0], (Decimal::new(101, 0), 12));
        assert_eq!(depth.asks[1], (Decimal::new(103, 0), 8));

        assert_eq!(book.qty_at_price(Decimal::new(99, 0), TradeSide::Buy), 25);
    }
}
