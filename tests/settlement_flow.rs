//! End-to-end settlement flows over the in-memory store: watcher to
//! reconciler to settlement writer, the retry/refund path, and the
//! matching engine sharing the same balance path.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::mpsc;

use chainsettle::events::{StatusFeed, TransferEvent};
use chainsettle::matching::{FeePolicy, MatchingService};
use chainsettle::models::{Order, OrderPayload, OrderStatus, TokenTradeOrder, TradeSide};
use chainsettle::reconciler::{ReconcileAction, Reconciler};
use chainsettle::scheduler::{RetryPolicy, RetryScheduler};
use chainsettle::settlement::SettlementWriter;
use chainsettle::store::{BalanceStore, CursorStore, MemoryStore, OrderStore};
use chainsettle::watcher::{ChainPolicy, LedgerBlock, LedgerWatcher, MockSource};

struct Harness {
    store: Arc<MemoryStore>,
    feed: StatusFeed,
    writer: Arc<SettlementWriter>,
    reconciler: Arc<Reconciler>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let feed = StatusFeed::default();
    let writer = Arc::new(SettlementWriter::new(
        store.clone(),
        store.clone(),
        feed.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(store.clone(), writer.clone(), feed.clone()));
    Harness {
        store,
        feed,
        writer,
        reconciler,
    }
}

fn transfer(dest: &str, amount: u64, ledger_ref: &str) -> TransferEvent {
    TransferEvent {
        chain_id: "smr".to_string(),
        source: "payer".to_string(),
        destination: dest.to_string(),
        amount,
        native_token: None,
        ledger_ref: ledger_ref.to_string(),
        block_height: 7,
    }
}

#[tokio::test]
async fn watched_transfer_settles_payment_order_end_to_end() {
    let h = harness();

    h.store
        .insert_order(Order::new(
            "order-1",
            "addr-1",
            1_000_000,
            OrderPayload::NativePayment {
                beneficiary: "artist".to_string(),
                token: "IOTA".to_string(),
            },
        ))
        .await
        .unwrap();

    // Watcher scans a block carrying the funding transfer
    let mut source = MockSource::new("smr");
    source.push_block(LedgerBlock {
        height: 7,
        hash: "h7".to_string(),
        parent_hash: "h6".to_string(),
        timestamp: chrono::Utc::now().timestamp(),
        transfers: vec![transfer("addr-1", 1_000_000, "r1")],
    });
    source.push_block(LedgerBlock {
        height: 8,
        hash: "h8".to_string(),
        parent_hash: "h7".to_string(),
        timestamp: chrono::Utc::now().timestamp(),
        transfers: vec![],
    });

    let (tx, mut rx) = mpsc::channel(16);
    let mut watcher = LedgerWatcher::new(h.store.clone(), h.store.clone(), tx);
    watcher.add_source(
        Box::new(source),
        ChainPolicy {
            required_confirmations: 1,
            ..Default::default()
        },
    );

    let mut statuses = h.feed.subscribe();

    assert_eq!(watcher.scan_once().await.unwrap(), 1);
    let event = rx.recv().await.unwrap();
    let result = h.reconciler.reconcile(&event).await.unwrap();
    assert!(result.matched);
    assert_eq!(result.action, ReconcileAction::Settled);

    let order = h.store.get_order("order-1").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Settled);
    assert!(order.wallet_reference.confirmed);
    assert_eq!(order.wallet_reference.count, 1);
    assert_eq!(order.source_address.as_deref(), Some("payer"));
    assert_eq!(
        h.store.balance_of("artist", "IOTA").await.unwrap(),
        1_000_000
    );
    assert_eq!(h.store.load_cursor("smr").await.unwrap().unwrap().height, 7);

    // Pending -> Funded -> Settled on the feed
    let first = statuses.recv().await.unwrap();
    assert_eq!(first.new_status, OrderStatus::Funded);
    let second = statuses.recv().await.unwrap();
    assert_eq!(second.new_status, OrderStatus::Settled);

    // Re-delivering the same ledger reference is a no-op
    let replay = h.reconciler.reconcile(&event).await.unwrap();
    assert!(replay.matched);
    assert_eq!(replay.action, ReconcileAction::AlreadySettled);
    assert_eq!(
        h.store.balance_of("artist", "IOTA").await.unwrap(),
        1_000_000
    );
}

#[tokio::test]
async fn exhausted_retries_fail_the_order_and_issue_one_refund() {
    let h = harness();

    let mut order = Order::new(
        "order-1",
        "addr-1",
        5_000,
        OrderPayload::Stake {
            token: "SOON".to_string(),
            weeks: 52,
        },
    );
    order.created_on = chrono::Utc::now() - chrono::Duration::hours(2);
    order.source_address = Some("staker".to_string());
    h.store.insert_order(order).await.unwrap();

    let scheduler = RetryScheduler::new(
        h.store.clone(),
        h.reconciler.clone(),
        h.feed.clone(),
        RetryPolicy {
            max_attempts: 4,
            retry_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
        },
    );

    for _ in 0..5 {
        scheduler.sweep_once().await.unwrap();
    }

    let order = h.store.get_order("order-1").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Refunded);
    assert_eq!(order.linked_orders.len(), 1);

    let refund = h
        .store
        .get_order(&order.linked_orders[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refund.target_address, "staker");
    assert_eq!(refund.expected_amount, 5_000);
    assert!(matches!(
        refund.payload,
        OrderPayload::Credit {
            invalid_payment: true,
            ..
        }
    ));
}

#[tokio::test]
async fn token_funding_then_matching_conserves_balances() {
    let h = harness();

    // Buyer funds their quote balance through a TOKEN_BUY order
    h.store
        .insert_order(Order::new(
            "fund-1",
            "addr-buy",
            100_000,
            OrderPayload::TokenBuy {
                token: "SOON".to_string(),
                price: Decimal::new(100, 0),
            },
        ))
        .await
        .unwrap();
    let result = h
        .reconciler
        .reconcile(&transfer("addr-buy", 100_000, "r1"))
        .await
        .unwrap();
    assert_eq!(result.action, ReconcileAction::Settled);
    assert_eq!(h.store.balance_of("payer", "smr").await.unwrap(), 100_000);

    // Seller holds the token being sold
    h.store.set_balance("seller", "SOON", 500);

    let matching = MatchingService::new(
        h.store.clone(),
        h.writer.clone(),
        FeePolicy {
            fee_bps: 100, // 1%
            quote_token: "smr".to_string(),
            fee_account: "protocol".to_string(),
        },
    );

    matching
        .submit(TokenTradeOrder::new(
            "sell-1",
            "SOON",
            TradeSide::Sell,
            Decimal::new(100, 0),
            500,
            "seller",
        ))
        .await
        .unwrap();
    let fills = matching
        .submit(TokenTradeOrder::new(
            "buy-1",
            "SOON",
            TradeSide::Buy,
            Decimal::new(100, 0),
            500,
            "payer",
        ))
        .await
        .unwrap();

    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].quantity, 500);

    // quote_value = 50_000, fee = 500
    assert_eq!(h.store.balance_of("payer", "smr").await.unwrap(), 50_000);
    assert_eq!(h.store.balance_of("payer", "SOON").await.unwrap(), 500);
    assert_eq!(h.store.balance_of("seller", "smr").await.unwrap(), 49_500);
    assert_eq!(h.store.balance_of("seller", "SOON").await.unwrap(), 0);
    assert_eq!(h.store.balance_of("protocol", "smr").await.unwrap(), 500);

    // Quote conservation: buyer debit equals seller credit plus fee
    let total_quote = 50_000 + 49_500 + 500;
    assert_eq!(total_quote, 100_000);
}

#[tokio::test]
async fn orphan_transfer_is_recovered_when_the_order_appears() {
    let h = harness();

    // Transfer lands before the order exists
    let event = transfer("addr-late", 2_000, "r9");
    let result = h.reconciler.reconcile(&event).await.unwrap();
    assert!(!result.matched);
    assert_eq!(result.action, ReconcileAction::Orphaned);
    assert_eq!(h.store.orphan_count(), 1);

    // Order arrives; the next retry sweep replays the orphan
    let mut order = Order::new(
        "order-9",
        "addr-late",
        2_000,
        OrderPayload::NativePayment {
            beneficiary: "venue".to_string(),
            token: "IOTA".to_string(),
        },
    );
    order.created_on = chrono::Utc::now() - chrono::Duration::hours(1);
    h.store.insert_order(order).await.unwrap();

    let scheduler = RetryScheduler::new(
        h.store.clone(),
        h.reconciler.clone(),
        h.feed.clone(),
        RetryPolicy::default(),
    );
    scheduler.sweep_once().await.unwrap();

    let order = h.store.get_order("order-9").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Settled);
    assert_eq!(h.store.balance_of("venue", "IOTA").await.unwrap(), 2_000);
    assert_eq!(h.store.orphan_count(), 0);
}
