//! Ledger watcher worker - the scanning loop
//!
//! One long-lived loop per tracked network. Each pass reloads the
//! watched address set from the open orders, checks node health,
//! guards against reorgs via the persisted cursor hash, scans finalized
//! blocks, and emits normalized transfer events. Every transfer is
//! persisted to the orphan log before the cursor may pass its block, so
//! an observed event survives a crash of the in-process handoff; the
//! reconciler dedupes by ledger reference and consumes the log entry.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use super::error::{SourceError, WatchError};
use super::source::LedgerSource;
use crate::events::TransferEvent;
use crate::store::{CursorStore, LedgerCursor, OrderStore};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Per-network scan policy
#[derive(Debug, Clone)]
pub struct ChainPolicy {
    pub poll_interval: Duration,
    /// Blocks behind the tip a block must be before it is scanned
    pub required_confirmations: u64,
    /// Skip the pass when the node's latest block is older than this
    pub max_block_lag_secs: i64,
    /// First height to scan when no cursor exists yet
    pub start_height: u64,
}

impl Default for ChainPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            required_confirmations: 1,
            max_block_lag_secs: 3600,
            start_height: 0,
        }
    }
}

struct WatchedChain {
    source: RwLock<Box<dyn LedgerSource>>,
    policy: ChainPolicy,
}

pub struct LedgerWatcher {
    chains: Vec<WatchedChain>,
    orders: Arc<dyn OrderStore>,
    cursors: Arc<dyn CursorStore>,
    events: mpsc::Sender<TransferEvent>,
}

impl LedgerWatcher {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        cursors: Arc<dyn CursorStore>,
        events: mpsc::Sender<TransferEvent>,
    ) -> Self {
        Self {
            chains: Vec::new(),
            orders,
            cursors,
            events,
        }
    }

    pub fn add_source(&mut self, source: Box<dyn LedgerSource>, policy: ChainPolicy) {
        info!(chain = source.chain_id(), "adding ledger source");
        self.chains.push(WatchedChain {
            source: RwLock::new(source),
            policy,
        });
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    /// Drive all chains concurrently until the event channel closes.
    pub async fn run(&self) {
        info!(chains = self.chains.len(), "ledger watcher starting");
        let loops = self.chains.iter().map(|chain| self.run_chain(chain));
        futures::future::join_all(loops).await;
    }

    /// One chain's poll loop with exponential backoff on read failures
    async fn run_chain(&self, chain: &WatchedChain) {
        let mut backoff = BACKOFF_BASE;
        loop {
            match self.scan_chain(chain).await {
                Ok(_) => {
                    backoff = BACKOFF_BASE;
                    sleep(chain.policy.poll_interval).await;
                }
                Err(WatchError::ChannelClosed) => {
                    info!("event channel closed, stopping chain loop");
                    return;
                }
                Err(e) => {
                    warn!("ledger scan failed, backing off {backoff:?}: {e}");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    /// Run one pass over every chain. Returns the number of transfer
    /// events emitted.
    pub async fn scan_once(&self) -> Result<u64, WatchError> {
        let mut emitted = 0u64;
        for chain in &self.chains {
            match self.scan_chain(chain).await {
                Ok(count) => emitted += count,
                Err(WatchError::ChannelClosed) => return Err(WatchError::ChannelClosed),
                Err(e) => warn!("ledger scan failed: {e}"),
            }
        }
        Ok(emitted)
    }

    async fn scan_chain(&self, chain: &WatchedChain) -> Result<u64, WatchError> {
        // Refresh the address filter from the currently open orders
        let targets = self.orders.open_targets().await?;
        {
            let mut source = chain.source.write().await;
            source.reload_addresses(targets);
        }

        let source = chain.source.read().await;
        let chain_id = source.chain_id().to_string();

        let health = source.health_check().await?;
        let now = chrono::Utc::now().timestamp();
        let lag = now - health.block_time;
        if lag > chain.policy.max_block_lag_secs {
            warn!(chain = %chain_id, lag_secs = lag, "node is stale, skipping pass");
            return Ok(0);
        }

        let cursor = self.cursors.load_cursor(&chain_id).await?;

        // Reorg guard: the previously scanned block must still carry
        // the hash we recorded; otherwise rewind and rescan
        if let Some(c) = &cursor
            && !c.block_hash.is_empty()
            && !source.verify_block_hash(c.height, &c.block_hash).await?
        {
            warn!(chain = %chain_id, height = c.height, "reorg detected, rewinding cursor");
            self.cursors
                .save_cursor(&LedgerCursor {
                    chain_id: chain_id.clone(),
                    height: c.height.saturating_sub(1),
                    block_hash: String::new(),
                })
                .await?;
            return Ok(0);
        }

        let start = cursor
            .map(|c| c.height + 1)
            .unwrap_or(chain.policy.start_height);
        let latest = source.latest_height().await?;
        let scan_to = latest.saturating_sub(chain.policy.required_confirmations);
        if start > scan_to {
            debug!(chain = %chain_id, latest, "no new finalized blocks");
            return Ok(0);
        }

        let mut emitted = 0u64;
        for height in start..=scan_to {
            let block = match source.fetch_block(height).await {
                Ok(block) => block,
                Err(SourceError::BlockNotFound(_)) => {
                    // Pruned or pre-genesis height below the tip; move
                    // the cursor past it so the pass is not stuck here
                    debug!(chain = %chain_id, height, "block not available, skipping");
                    self.cursors
                        .save_cursor(&LedgerCursor {
                            chain_id: chain_id.clone(),
                            height,
                            block_hash: String::new(),
                        })
                        .await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            for transfer in &block.transfers {
                // Durable before the cursor may pass this block: a
                // crash between the cursor save and the reconcile
                // replays from the orphan log
                self.orders.record_orphan(transfer).await?;
                self.events
                    .send(transfer.clone())
                    .await
                    .map_err(|_| WatchError::ChannelClosed)?;
                emitted += 1;
            }

            // Advance only after every transfer in the block was
            // persisted and handed off
            self.cursors
                .save_cursor(&LedgerCursor {
                    chain_id: chain_id.clone(),
                    height: block.height,
                    block_hash: block.hash.clone(),
                })
                .await?;

            info!(
                chain = %chain_id,
                height,
                transfers = block.transfers.len(),
                "scanned block"
            );
        }

        Ok(emitted)
    }
}
