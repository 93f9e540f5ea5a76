// models.rs - Order, wallet reference and token trade types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{Address, Amount, FillUid, LedgerRef, OrderUid, TokenId};

/// What an incoming payment funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    NativePayment,
    TokenBuy,
    TokenSell,
    NftPurchase,
    Credit,
    BillPayment,
    Stake,
    AwardFund,
}

/// Amount verification policy applied when matching a transfer to an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountTolerance {
    /// The transfer amount must equal the expected amount exactly
    Exact,
    /// Any amount >= expected is accepted; the overage is refunded
    /// through an automatically created credit order
    RefundExcess,
}

impl OrderType {
    /// Per-type amount tolerance policy.
    ///
    /// Fixed-price purchases require the exact amount; bulk-funded orders
    /// (token sale participation, award funding) accept overpayment and
    /// refund the excess. Underpayment is never accepted.
    pub fn tolerance(&self) -> AmountTolerance {
        match self {
            OrderType::NftPurchase
            | OrderType::Stake
            | OrderType::BillPayment
            | OrderType::NativePayment
            | OrderType::Credit => AmountTolerance::Exact,
            OrderType::TokenBuy | OrderType::TokenSell | OrderType::AwardFund => {
                AmountTolerance::RefundExcess
            }
        }
    }
}

/// Order lifecycle status
///
/// Once an order is persisted it MUST reach one of the terminal states
/// (Settled, Failed, Refunded, Cancelled) - never disappear or become
/// unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created, waiting for the funding transfer
    Pending,
    /// A matching transfer was reconciled; settlement not yet committed
    Funded,
    /// Settlement batch committed
    Settled,
    /// Retry attempts exhausted; refund credit issued
    Failed,
    /// Terminal state of the refund path
    Refunded,
    /// Cancelled by the order-creation API while unconfirmed
    Cancelled,
}

impl OrderStatus {
    /// An open order is one still eligible to receive its funding transfer
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Funded)
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Settled
                | OrderStatus::Failed
                | OrderStatus::Refunded
                | OrderStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Funded => "FUNDED",
            OrderStatus::Settled => "SETTLED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Refunded => "REFUNDED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Type-specific order payload, validated at the boundary before it
/// enters the core.
///
/// The variant determines the settlement handler the reconciler invokes
/// once the order is funded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderPayload {
    NativePayment {
        beneficiary: Address,
        token: TokenId,
    },
    TokenBuy {
        token: TokenId,
        price: Decimal,
    },
    TokenSell {
        token: TokenId,
        price: Decimal,
    },
    NftPurchase {
        nft: String,
        seller: Address,
        royalty_address: Option<Address>,
        royalty_bps: u16,
    },
    Credit {
        recipient: Address,
        token: TokenId,
        /// Set when the credit refunds a payment that could not be settled
        invalid_payment: bool,
        source_order: Option<OrderUid>,
    },
    BillPayment {
        beneficiary: Address,
        token: TokenId,
        royalty_address: Option<Address>,
        royalty_bps: u16,
        source_order: Option<OrderUid>,
    },
    Stake {
        token: TokenId,
        weeks: u32,
    },
    AwardFund {
        award: String,
        token: TokenId,
    },
}

impl OrderPayload {
    pub fn order_type(&self) -> OrderType {
        match self {
            OrderPayload::NativePayment { .. } => OrderType::NativePayment,
            OrderPayload::TokenBuy { .. } => OrderType::TokenBuy,
            OrderPayload::TokenSell { .. } => OrderType::TokenSell,
            OrderPayload::NftPurchase { .. } => OrderType::NftPurchase,
            OrderPayload::Credit { .. } => OrderType::Credit,
            OrderPayload::BillPayment { .. } => OrderType::BillPayment,
            OrderPayload::Stake { .. } => OrderType::Stake,
            OrderPayload::AwardFund { .. } => OrderType::AwardFund,
        }
    }
}

/// Bookkeeping record of confirmation progress for one order's expected
/// incoming transfer. Owned 1:1 by the order, persisted with it.
///
/// Invariants:
/// - `count` never decreases
/// - once `confirmed` is true the record is terminal and immutable
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletReference {
    pub confirmed: bool,
    /// Attempt counter, 0..=max_attempts
    pub count: u32,
    /// Last seen ledger transfer id
    pub chain_reference: Option<LedgerRef>,
    /// Append-only list of all distinct references seen
    pub chain_references: Vec<LedgerRef>,
    /// Last failure reason
    pub error: Option<String>,
    pub in_progress: bool,
}

impl WalletReference {
    /// Has this ledger reference already been recorded for the order?
    pub fn has_seen(&self, ledger_ref: &str) -> bool {
        self.chain_references.iter().any(|r| r == ledger_ref)
    }
}

/// An order awaiting an on-chain funding transfer.
///
/// Created by the (external) order-creation API in `Pending` state; the
/// core never originates orders itself, except refund credits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub uid: OrderUid,
    /// Unique per open order at any instant
    pub target_address: Address,
    pub expected_amount: Amount,
    pub payload: OrderPayload,
    pub status: OrderStatus,
    /// Sender of the funding transfer, learned at reconcile time.
    /// Refunds go back here.
    pub source_address: Option<Address>,
    pub created_on: DateTime<Utc>,
    /// e.g. a bill payment's source-transaction chain
    pub linked_orders: Vec<OrderUid>,
    pub wallet_reference: WalletReference,
}

impl Order {
    pub fn new(
        uid: impl Into<OrderUid>,
        target_address: impl Into<Address>,
        expected_amount: Amount,
        payload: OrderPayload,
    ) -> Self {
        Self {
            uid: uid.into(),
            target_address: target_address.into(),
            expected_amount,
            payload,
            status: OrderStatus::Pending,
            source_address: None,
            created_on: Utc::now(),
            linked_orders: Vec::new(),
            wallet_reference: WalletReference::default(),
        }
    }

    #[inline]
    pub fn order_type(&self) -> OrderType {
        self.payload.order_type()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Whether this order is still waiting for an inbound transfer.
    ///
    /// Credit orders are outbound (refunds, excess returns): they never
    /// match incoming transfers and are excluded from the open-target
    /// uniqueness rule and the retry sweep.
    #[inline]
    pub fn awaits_funding(&self) -> bool {
        self.is_open() && self.order_type() != OrderType::Credit
    }
}

/// Token trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Resting token trade order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Active,
    PartiallyFilled,
    Filled,
    Cancelled,
}

/// A resting or incoming token trade order.
///
/// `count` is the remaining unfilled quantity: it is >= 0 at all times
/// and only decreases, via fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTradeOrder {
    pub uid: OrderUid,
    pub token: TokenId,
    pub side: TradeSide,
    /// Smallest-unit of quote per base-unit of token
    pub price: Decimal,
    /// Remaining unfilled quantity
    pub count: Amount,
    pub owner: Address,
    pub created_on: DateTime<Utc>,
    pub status: TradeStatus,
}

impl TokenTradeOrder {
    pub fn new(
        uid: impl Into<OrderUid>,
        token: impl Into<TokenId>,
        side: TradeSide,
        price: Decimal,
        count: Amount,
        owner: impl Into<Address>,
    ) -> Self {
        Self {
            uid: uid.into(),
            token: token.into(),
            side,
            price,
            count,
            owner: owner.into(),
            created_on: Utc::now(),
            status: TradeStatus::Active,
        }
    }

    #[inline]
    pub fn is_filled(&self) -> bool {
        self.count == 0
    }
}

/// The atomic result of matching one buy against one sell.
///
/// Priced at the resting (maker) order's price. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub uid: FillUid,
    pub token: TokenId,
    pub buy_order: OrderUid,
    pub sell_order: OrderUid,
    pub buyer: Address,
    pub seller: Address,
    pub price: Decimal,
    pub quantity: Amount,
    pub created_on: DateTime<Utc>,
}
