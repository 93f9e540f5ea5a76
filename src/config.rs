use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    /// PostgreSQL connection URL; absent means in-memory stores (demo)
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
}

/// One tracked ledger network
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChainConfig {
    pub chain_id: String,
    pub rpc_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_confirmations")]
    pub required_confirmations: u64,
    #[serde(default = "default_max_block_lag_secs")]
    pub max_block_lag_secs: i64,
    #[serde(default)]
    pub start_height: u64,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_confirmations() -> u64 {
    1
}

fn default_max_block_lag_secs() -> i64 {
    3_600
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconcilerConfig {
    /// Size of the transfer event channel between watcher and reconciler
    pub event_queue_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            event_queue_size: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub max_attempts: u32,
    /// Seconds an order may stay unconfirmed before retries start.
    /// Deployments on slower-finality networks raise this.
    pub retry_window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            retry_window_secs: 180,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatchingConfig {
    /// Protocol fee in basis points, taken from the seller's proceeds
    pub fee_bps: u16,
    pub quote_token: String,
    pub fee_account: String,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            fee_bps: 250,
            quote_token: "IOTA".to_string(),
            fee_account: "protocol".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {config_path}: {e}"))?;
        Ok(serde_yaml::from_str(&content)?)
    }
}
