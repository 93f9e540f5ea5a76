//! Ledger source seam
//!
//! Network-specific adapters implement `LedgerSource`; the watcher
//! worker depends only on this interface and the normalized
//! `TransferEvent` shape it yields.

use async_trait::async_trait;

use super::error::SourceError;
use crate::events::TransferEvent;

/// Unified read-only interface over one distributed ledger
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Chain identifier (e.g. "smr", "eth")
    fn chain_id(&self) -> &str;

    /// Latest block height known to the node
    async fn latest_height(&self) -> Result<u64, SourceError>;

    /// Fetch one block with the transfers destined for watched addresses
    async fn fetch_block(&self, height: u64) -> Result<LedgerBlock, SourceError>;

    /// Does the block at `height` still carry the expected hash?
    /// Used for reorg detection against the persisted cursor.
    async fn verify_block_hash(&self, height: u64, expected: &str) -> Result<bool, SourceError>;

    /// Is the node synced and responsive?
    async fn health_check(&self) -> Result<NodeHealth, SourceError>;

    /// Replace the watched address filter. Called each scan pass with
    /// the open orders' target addresses.
    fn reload_addresses(&mut self, addresses: Vec<String>);

    fn watched_count(&self) -> usize;
}

/// One scanned block, filtered to watched transfers
#[derive(Debug, Clone)]
pub struct LedgerBlock {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
    pub transfers: Vec<TransferEvent>,
}

#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub is_synced: bool,
    pub block_height: u64,
    /// Unix timestamp of the node's latest block
    pub block_time: i64,
}

/// Scripted in-memory source for tests and demo runs.
///
/// Serves preloaded blocks and filters transfers by the watched set,
/// like a real adapter would.
pub struct MockSource {
    chain_id: String,
    blocks: Vec<LedgerBlock>,
    watched: std::collections::HashSet<String>,
    healthy: bool,
}

impl MockSource {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            blocks: Vec::new(),
            watched: Default::default(),
            healthy: true,
        }
    }

    pub fn push_block(&mut self, block: LedgerBlock) {
        self.blocks.push(block);
    }

    pub fn set_healthy(&mut self, healthy: bool) {
        self.healthy = healthy;
    }
}

#[async_trait]
impl LedgerSource for MockSource {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn latest_height(&self) -> Result<u64, SourceError> {
        self.blocks
            .iter()
            .map(|b| b.height)
            .max()
            .ok_or(SourceError::BlockNotFound(0))
    }

    async fn fetch_block(&self, height: u64) -> Result<LedgerBlock, SourceError> {
        let block = self
            .blocks
            .iter()
            .find(|b| b.height == height)
            .ok_or(SourceError::BlockNotFound(height))?;
        let mut block = block.clone();
        block
            .transfers
            .retain(|t| self.watched.contains(&t.destination));
        Ok(block)
    }

    async fn verify_block_hash(&self, height: u64, expected: &str) -> Result<bool, SourceError> {
        Ok(self
            .blocks
            .iter()
            .any(|b| b.height == height && b.hash == expected))
    }

    async fn health_check(&self) -> Result<NodeHealth, SourceError> {
        if !self.healthy {
            return Err(SourceError::NodeUnhealthy);
        }
        let height = self.latest_height().await.unwrap_or(0);
        Ok(NodeHealth {
            is_synced: true,
            block_height: height,
            block_time: chrono::Utc::now().timestamp(),
        })
    }

    fn reload_addresses(&mut self, addresses: Vec<String>) {
        self.watched = addresses.into_iter().collect();
    }

    fn watched_count(&self) -> usize {
        self.watched.len()
    }
}
