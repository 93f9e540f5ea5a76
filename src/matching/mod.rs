//! Token order matching
//!
//! Per-token order books with maker-priced, price-time priority
//! matching. `TokenBook` is the data structure, `MatchingEngine` the
//! pure crossing logic, `MatchingService` the serialized, persisted
//! front door.

pub mod book;
pub mod engine;
pub mod service;

pub use book::{DepthSnapshot, TokenBook};
pub use engine::{MatchError, MatchOutcome, MatchingEngine};
pub use service::{FeePolicy, MatchingService, SubmitError};
