//! Ledger watching
//!
//! Polls distributed ledgers for incoming value transfers to the open
//! orders' target addresses and emits normalized `TransferEvent`s.
//! Network adapters implement the `LedgerSource` seam; `LedgerWatcher`
//! owns the per-chain scan loops, cursors and reorg guard.

pub mod error;
pub mod evm;
pub mod source;
pub mod worker;

pub use error::{SourceError, WatchError};
pub use evm::{EvmSource, EvmSourceConfig};
pub use source::{LedgerBlock, LedgerSource, MockSource, NodeHealth};
pub use worker::{ChainPolicy, LedgerWatcher};
