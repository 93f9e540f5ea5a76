//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// Order UID - content-addressed identifier assigned by the order-creation API.
///
/// # Constraints:
/// - **Immutable**: Once assigned, NEVER changes
/// - **Globally unique**: primary key for order records
pub type OrderUid = String;

/// Ledger address - destination/source of an on-chain value transfer.
///
/// Open orders (PENDING/FUNDED) must never share a target address,
/// otherwise an incoming transfer would be ambiguous.
pub type Address = String;

/// Token identifier (symbol or content-addressed token uid).
pub type TokenId = String;

/// Amount in the token's smallest unit.
///
/// All on-chain amounts and order quantities are integers; fractional
/// values only appear as trade prices ([`rust_decimal::Decimal`]).
pub type Amount = u64;

/// Ledger reference - the distributed ledger's unique id for a confirmed
/// value transfer. Used as the idempotency key for reconciliation: the
/// same reference is never settled twice.
pub type LedgerRef = String;

/// Fill UID - unique within the system, assigned at match time.
pub type FillUid = String;
