//! chainsettle service entry point
//!
//! Wires the components together:
//!
//! ```text
//! ┌─────────┐   transfer    ┌────────────┐   deltas   ┌────────────┐
//! │ Watcher │──────────────▶│ Reconciler │───────────▶│ Settlement │
//! └─────────┘    events     └────────────┘            │   Writer   │
//!      ▲                          ▲                   └────────────┘
//!      │ cursors                  │ re-drive                ▲
//! ┌─────────┐               ┌────────────┐                  │ fills
//! │  Store  │               │ Scheduler  │            ┌────────────┐
//! └─────────┘               └────────────┘            │  Matching  │
//!                                                     └────────────┘
//! ```
//!
//! Orders and token trade orders arrive through the external
//! order-creation API; this process owns everything downstream.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};

use chainsettle::config::AppConfig;
use chainsettle::events::StatusFeed;
use chainsettle::matching::{FeePolicy, MatchingService};
use chainsettle::reconciler::Reconciler;
use chainsettle::scheduler::{RetryPolicy, RetryScheduler};
use chainsettle::settlement::SettlementWriter;
use chainsettle::store::{
    BalanceStore, CursorStore, MemoryStore, OrderStore, PgStore, TradeStore,
};
use chainsettle::watcher::{ChainPolicy, EvmSource, EvmSourceConfig, LedgerWatcher};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = chainsettle::logging::init_logging(&config);

    info!("starting chainsettle in {env} mode");

    match &config.postgres_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("failed to connect to postgres")?;
            let store = Arc::new(PgStore::new(pool));
            store.ensure_schema().await?;
            info!("using postgres store");
            run(store, config).await
        }
        None => {
            info!("no postgres_url configured, using in-memory store");
            run(Arc::new(MemoryStore::new()), config).await
        }
    }
}

async fn run<S>(store: Arc<S>, config: AppConfig) -> anyhow::Result<()>
where
    S: OrderStore + TradeStore + BalanceStore + CursorStore + 'static,
{
    let feed = StatusFeed::default();
    let writer = Arc::new(SettlementWriter::new(
        store.clone(),
        store.clone(),
        feed.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(store.clone(), writer.clone(), feed.clone()));

    // Matching is driven by the order-creation API layer; it shares the
    // settlement writer so fills and reconciliations hit one balance path
    let _matching = Arc::new(MatchingService::new(
        store.clone(),
        writer.clone(),
        FeePolicy {
            fee_bps: config.matching.fee_bps,
            quote_token: config.matching.quote_token.clone(),
            fee_account: config.matching.fee_account.clone(),
        },
    ));

    let scheduler = RetryScheduler::new(
        store.clone(),
        reconciler.clone(),
        feed.clone(),
        RetryPolicy {
            max_attempts: config.scheduler.max_attempts,
            retry_window: std::time::Duration::from_secs(config.scheduler.retry_window_secs),
            sweep_interval: std::time::Duration::from_secs(config.scheduler.sweep_interval_secs),
        },
    );

    let (events_tx, mut events_rx) = mpsc::channel(config.reconciler.event_queue_size);
    let mut watcher = LedgerWatcher::new(store.clone(), store.clone(), events_tx);
    for chain in &config.chains {
        let source = EvmSource::new(EvmSourceConfig {
            chain_id: chain.chain_id.clone(),
            rpc_url: chain.rpc_url.clone(),
            rpc_timeout_secs: 30,
        })?;
        watcher.add_source(
            Box::new(source),
            ChainPolicy {
                poll_interval: std::time::Duration::from_millis(chain.poll_interval_ms),
                required_confirmations: chain.required_confirmations,
                max_block_lag_secs: chain.max_block_lag_secs,
                start_height: chain.start_height,
            },
        );
    }
    if watcher.chain_count() == 0 {
        info!("no chains configured, watcher idle");
    }

    let watcher_task = tokio::spawn(async move { watcher.run().await });

    let reconcile_task = tokio::spawn({
        let reconciler = reconciler.clone();
        async move {
            while let Some(event) = events_rx.recv().await {
                if let Err(e) = reconciler.reconcile(&event).await {
                    error!(ledger_ref = %event.ledger_ref, "reconcile failed: {e}");
                }
            }
        }
    });

    let scheduler_task = tokio::spawn(async move { scheduler.run().await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    watcher_task.abort();
    reconcile_task.abort();
    scheduler_task.abort();
    Ok(())
}
