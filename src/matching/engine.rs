//! Matching engine - crosses one incoming order against the book
//!
//! Pure book manipulation: no persistence, no balance effects. The
//! service layer owns persistence and the clone-and-swap protection
//! around each pass.

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use super::book::TokenBook;
use crate::core_types::{Amount, OrderUid};
use crate::models::{Fill, TokenTradeOrder, TradeSide, TradeStatus};

#[derive(Debug, Error)]
pub enum MatchError {
    /// Remaining quantity would go negative, or a zero-quantity order
    /// reached the engine. Aborts the pass for this token only.
    #[error("matching invariant violated for order {order}")]
    InvariantViolation { order: OrderUid },
}

/// Result of one matching pass
#[derive(Debug)]
pub struct MatchOutcome {
    /// The incoming order with updated remaining count and status
    pub order: TokenTradeOrder,
    pub fills: Vec<Fill>,
    /// Resting orders touched by this pass, post-fill, for persistence
    pub makers: Vec<TokenTradeOrder>,
}

struct PendingFill {
    maker: TokenTradeOrder,
    price: Decimal,
    qty: Amount,
}

pub struct MatchingEngine;

impl MatchingEngine {
    /// Cross an incoming order against the opposite side of the book.
    ///
    /// Fills are priced at the resting (maker) order's price, in
    /// price-then-time priority. Any unfilled remainder rests in the
    /// book. On error the book passed in is left in an undefined state;
    /// callers must discard it (the service matches on a clone).
    pub fn match_order(
        book: &mut TokenBook,
        mut taker: TokenTradeOrder,
    ) -> Result<MatchOutcome, MatchError> {
        if taker.count == 0 {
            return Err(MatchError::InvariantViolation { order: taker.uid });
        }

        let pending = match taker.side {
            TradeSide::Buy => Self::match_buy(book, &mut taker)?,
            TradeSide::Sell => Self::match_sell(book, &mut taker)?,
        };

        let created_on = Utc::now();
        let mut fills = Vec::with_capacity(pending.len());
        let mut makers = Vec::with_capacity(pending.len());
        for pf in pending {
            let (buy_order, sell_order, buyer, seller) = match taker.side {
                TradeSide::Buy => (
                    taker.uid.clone(),
                    pf.maker.uid.clone(),
                    taker.owner.clone(),
                    pf.maker.owner.clone(),
                ),
                TradeSide::Sell => (
                    pf.maker.uid.clone(),
                    taker.uid.clone(),
                    pf.maker.owner.clone(),
                    taker.owner.clone(),
                ),
            };
            fills.push(Fill {
                uid: Uuid::new_v4().to_string(),
                token: taker.token.clone(),
                buy_order,
                sell_order,
                buyer,
                seller,
                price: pf.price,
                quantity: pf.qty,
                created_on,
            });
            makers.push(pf.maker);
        }

        if taker.is_filled() {
            taker.status = TradeStatus::Filled;
        } else {
            if !fills.is_empty() {
                taker.status = TradeStatus::PartiallyFilled;
            }
            book.rest_order(taker.clone());
        }

        Ok(MatchOutcome {
            order: taker,
            fills,
            makers,
        })
    }

    /// Match a buy against asks, lowest price first
    fn match_buy(
        book: &mut TokenBook,
        taker: &mut TokenTradeOrder,
    ) -> Result<Vec<PendingFill>, MatchError> {
        let mut pending = Vec::new();
        let mut empty_levels = Vec::new();

        // Collect prices up front to keep the borrow local
        let prices: Vec<Decimal> = book.asks().keys().copied().collect();

        for price in prices {
            if price > taker.price || taker.is_filled() {
                break;
            }

            let mut done_uids = Vec::new();
            if let Some(level) = book.asks_mut().get_mut(&price) {
                while let Some(maker) = level.front_mut() {
                    if taker.is_filled() {
                        break;
                    }
                    let qty = taker.count.min(maker.count);
                    Self::fill_pair(taker, maker, qty)?;
                    pending.push(PendingFill {
                        maker: maker.clone(),
                        price: maker.price,
                        qty,
                    });
                    if maker.is_filled() {
                        done_uids.push(maker.uid.clone());
                        level.pop_front();
                    }
                }
                if level.is_empty() {
                    empty_levels.push(price);
                }
            }
            for uid in done_uids {
                book.remove_from_index(&uid);
            }
        }

        for price in empty_levels {
            book.asks_mut().remove(&price);
        }
        Ok(pending)
    }

    /// Match a sell against bids, highest price first
    fn match_sell(
        book: &mut TokenBook,
        taker: &mut TokenTradeOrder,
    ) -> Result<Vec<PendingFill>, MatchError> {
        let mut pending = Vec::new();
        let mut empty_levels = Vec::new();

        let keys: Vec<_> = book.bids().keys().copied().collect();

        for key in keys {
            let bid_price = key.0;
            if bid_price < taker.price || taker.is_filled() {
                break;
            }

            let mut done_uids = Vec::new();
            if let Some(level) = book.bids_mut().get_mut(&key) {
                while let Some(maker) = level.front_mut() {
                    if taker.is_filled() {
                        break;
                    }
                    let qty = taker.count.min(maker.count);
                    Self::fill_pair(taker, maker, qty)?;
                    pending.push(PendingFill {
                        maker: maker.clone(),
                        price: maker.price,
                        qty,
                    });
                    if maker.is_filled() {
                        done_uids.push(maker.uid.clone());
                        level.pop_front();
                    }
                }
                if level.is_empty() {
                    empty_levels.push(key);
                }
            }
            for uid in done_uids {
                book.remove_from_index(&uid);
            }
        }

        for key in empty_levels {
            book.bids_mut().remove(&key);
        }
        Ok(pending)
    }

    /// Apply one fill's quantity to both sides, guarding the
    /// remaining-count invariant.
    fn fill_pair(
        taker: &mut TokenTradeOrder,
        maker: &mut TokenTradeOrder,
        qty: Amount,
    ) -> Result<(), MatchError> {
        if qty == 0 {
            return Err(MatchError::InvariantViolation {
                order: maker.uid.clone(),
            });
        }
        taker.count = taker
            .count
            .checked_sub(qty)
            .ok_or_else(|| MatchError::InvariantViolation {
                order: taker.uid.clone(),
            })?;
        maker.count = maker
            .count
            .checked_sub(qty)
            .ok_or_else(|| MatchError::InvariantViolation {
                order: maker.uid.clone(),
            })?;
        maker.status = if maker.is_filled() {
            TradeStatus::Filled
        } else {
            TradeStatus::PartiallyFilled
        };
        Ok(())
    }
}
