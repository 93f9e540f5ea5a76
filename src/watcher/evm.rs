//! EVM ledger adapter over JSON-RPC
//!
//! Detects base-currency transfers to watched addresses. Addresses are
//! compared lowercase; the transaction hash serves as the ledger
//! reference downstream.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::SourceError;
use super::source::{LedgerBlock, LedgerSource, NodeHealth};
use crate::events::TransferEvent;

#[derive(Debug, Clone, Deserialize)]
pub struct EvmSourceConfig {
    pub chain_id: String,
    pub rpc_url: String,
    /// Seconds before an RPC call is abandoned
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

fn default_rpc_timeout() -> u64 {
    30
}

pub struct EvmSource {
    config: EvmSourceConfig,
    client: reqwest::Client,
    /// Lowercased for case-insensitive matching
    watched: HashSet<String>,
}

#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: String,
    hash: String,
    parent_hash: String,
    timestamp: String,
    #[serde(default)]
    transactions: Vec<RpcTransaction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: String,
    from: Option<String>,
    to: Option<String>,
    value: String,
}

/// Header-only block shape for hash verification
#[derive(Deserialize)]
struct RpcBlockHeader {
    hash: String,
    timestamp: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SyncingStatus {
    NotSyncing(bool),
    #[allow(dead_code)]
    Syncing(serde_json::Value),
}

impl EvmSource {
    pub fn new(config: EvmSourceConfig) -> Result<Self, SourceError> {
        info!(
            chain = %config.chain_id,
            url = %config.rpc_url,
            "initializing EVM ledger source"
        );
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.rpc_timeout_secs))
            .build()
            .map_err(|e| SourceError::Rpc(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            watched: HashSet::new(),
        })
    }

    fn is_watched(&self, address: &str) -> bool {
        self.watched.contains(&address.to_lowercase())
    }

    async fn rpc_call<T, R>(&self, method: &'static str, params: T) -> Result<R, SourceError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let response = self
            .client
            .post(&self.config.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SourceError::Rpc(format!("HTTP request failed: {e}")))?;

        let rpc_response: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| SourceError::Rpc(format!("failed to parse response: {e}")))?;

        if let Some(error) = rpc_response.error {
            return Err(SourceError::Rpc(format!(
                "RPC error {}: {}",
                error.code, error.message
            )));
        }
        rpc_response
            .result
            .ok_or_else(|| SourceError::Rpc("no result in RPC response".to_string()))
    }
}

fn parse_hex_u64(hex: &str) -> Result<u64, SourceError> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| SourceError::Parse(format!("bad hex quantity {hex}: {e}")))
}

/// Saturate an oversized transfer value rather than dropping the
/// transfer. A dropped deposit would vanish silently; a clamped one
/// still reaches the orphan log where an operator can resolve it.
fn clamp_amount(value: u128) -> (u64, bool) {
    match u64::try_from(value) {
        Ok(amount) => (amount, false),
        Err(_) => (u64::MAX, true),
    }
}

#[async_trait]
impl LedgerSource for EvmSource {
    fn chain_id(&self) -> &str {
        &self.config.chain_id
    }

    async fn latest_height(&self) -> Result<u64, SourceError> {
        let height: String = self.rpc_call("eth_blockNumber", ()).await?;
        parse_hex_u64(&height)
    }

    async fn fetch_block(&self, height: u64) -> Result<LedgerBlock, SourceError> {
        let height_hex = format!("0x{height:x}");
        let block: Option<RpcBlock> = self
            .rpc_call("eth_getBlockByNumber", (height_hex, true))
            .await?;
        let block = block.ok_or(SourceError::BlockNotFound(height))?;

        let mut transfers = Vec::new();
        for tx in &block.transactions {
            let Some(to) = tx.to.as_deref() else {
                continue; // contract creation
            };
            if !self.is_watched(to) {
                continue;
            }
            let value = u128::from_str_radix(tx.value.trim_start_matches("0x"), 16)
                .map_err(|e| SourceError::Parse(format!("bad tx value {}: {e}", tx.value)))?;
            if value == 0 {
                continue;
            }
            let (amount, clamped) = clamp_amount(value);
            if clamped {
                warn!(
                    tx = %tx.hash,
                    raw_value = %tx.value,
                    "transfer value exceeds amount range, clamped for manual review"
                );
            }
            debug!(tx = %tx.hash, to, amount, "detected transfer");
            transfers.push(TransferEvent {
                chain_id: self.config.chain_id.clone(),
                source: tx.from.clone().unwrap_or_default(),
                destination: to.to_string(),
                amount,
                native_token: None,
                ledger_ref: tx.hash.clone(),
                block_height: height,
            });
        }

        Ok(LedgerBlock {
            height: parse_hex_u64(&block.number).unwrap_or(height),
            hash: block.hash,
            parent_hash: block.parent_hash,
            timestamp: parse_hex_u64(&block.timestamp).unwrap_or(0) as i64,
            transfers,
        })
    }

    async fn verify_block_hash(&self, height: u64, expected: &str) -> Result<bool, SourceError> {
        let height_hex = format!("0x{height:x}");
        let header: Option<RpcBlockHeader> = self
            .rpc_call("eth_getBlockByNumber", (height_hex, false))
            .await?;
        Ok(header.is_some_and(|h| h.hash.eq_ignore_ascii_case(expected)))
    }

    async fn health_check(&self) -> Result<NodeHealth, SourceError> {
        let syncing: SyncingStatus = self.rpc_call("eth_syncing", ()).await?;
        let is_synced = matches!(syncing, SyncingStatus::NotSyncing(false));

        let latest: Option<RpcBlockHeader> = self
            .rpc_call("eth_getBlockByNumber", ("latest", false))
            .await?;
        let latest = latest.ok_or(SourceError::NodeUnhealthy)?;

        Ok(NodeHealth {
            is_synced,
            block_height: self.latest_height().await?,
            block_time: parse_hex_u64(&latest.timestamp)? as i64,
        })
    }

    fn reload_addresses(&mut self, addresses: Vec<String>) {
        self.watched = addresses.into_iter().map(|a| a.to_lowercase()).collect();
    }

    fn watched_count(&self) -> usize {
        self.watched.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_quantities() {
        assert_eq!(parse_hex_u64("0x0").unwrap(), 0);
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
        assert!(parse_hex_u64("0xzz").is_err());
    }

    #[test]
    fn test_oversized_value_is_clamped_not_dropped() {
        assert_eq!(clamp_amount(42), (42, false));
        assert_eq!(clamp_amount(u64::MAX as u128), (u64::MAX, false));
        assert_eq!(clamp_amount(u64::MAX as u128 + 1), (u64::MAX, true));
    }

    #[test]
    fn test_address_matching_is_case_insensitive() {
        let mut source = EvmSource::new(EvmSourceConfig {
            chain_id: "eth".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            rpc_timeout_secs: 5,
        })
        .unwrap();

        source.reload_addresses(vec!["0xAbCd".to_string()]);
        assert!(source.is_watched("0xabcd"));
        assert!(source.is_watched("0xABCD"));
        assert!(!source.is_watched("0xother"));
        assert_eq!(source.watched_count(), 1);
    }
}
