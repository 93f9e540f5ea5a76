use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("RPC connection failed: {0}")]
    Rpc(String),

    #[error("block not found at height {0}")]
    BlockNotFound(u64),

    #[error("node is unhealthy or stale")]
    NodeUnhealthy,

    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("event channel closed")]
    ChannelClosed,
}
