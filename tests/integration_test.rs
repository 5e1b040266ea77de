//! End-to-end lifecycle tests over the real engine, store, and
//! reconciliation pass. Everything runs against a throwaway LMDB
//! environment; the venue is replaced by the command channel on one side
//! and canned listings on the other.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use gridpilot::config::TradeConfig;
use gridpilot::events::{from_execution_report, from_open_order_row, OrderEvent};
use gridpilot::persist::{spawn_writer, PositionStore, StoreHandle};
use gridpilot::position::{PositionEngine, PositionStatus};
use gridpilot::reconcile::ReconciliationScheduler;
use gridpilot::venue::{OpenOrdersApi, OrderCommand, VenueError};

fn config() -> TradeConfig {
    TradeConfig {
        symbol: "PEPEUSDT".to_string(),
        base_asset: "PEPE".to_string(),
        base_asset_scale: 2,
        quote_asset: "USDT".to_string(),
        quote_asset_scale: 2,
        notional_per_trade: dec!(15.00),
        gap_size_points: 4,
        proximity_ticks: 3,
        fill_tolerance: dec!(0.001),
        combo_ceiling: 5,
        combo_window_ticks: 60,
        min_order_age: std::time::Duration::from_secs(60),
        sweep_interval: std::time::Duration::from_secs(20),
        combo_decay_interval: std::time::Duration::from_secs(60),
        reconcile_interval: std::time::Duration::from_secs(20 * 60),
        keep_alive_interval: std::time::Duration::from_secs(21 * 60),
        data_dir: "./unused".to_string(),
    }
}

struct World {
    engine: Arc<PositionEngine>,
    commands: mpsc::UnboundedReceiver<OrderCommand>,
    snapshots: StoreHandle,
    dir: tempfile::TempDir,
}

fn world() -> World {
    let dir = tempfile::tempdir().unwrap();
    world_at(dir)
}

/// Rebuild the whole stack over an existing data directory, as a process
/// restart would.
fn world_at(dir: tempfile::TempDir) -> World {
    let store = Arc::new(PositionStore::open(dir.path()).unwrap());
    let (snapshots, _writer) = spawn_writer(store);
    let (tx, commands) = mpsc::unbounded_channel();
    let engine = Arc::new(PositionEngine::new(config(), snapshots.clone(), tx));
    World {
        engine,
        commands,
        snapshots,
        dir,
    }
}

fn stream_event(client_order_id: &str, side: &str, status: &str, price: &str) -> OrderEvent {
    let executed = if status == "FILLED" { "1" } else { "0" };
    from_execution_report(&serde_json::json!({
        "e": "executionReport",
        "E": 1_700_000_001_000i64,
        "s": "PEPEUSDT",
        "c": client_order_id,
        "C": "",
        "S": side,
        "o": "LIMIT",
        "p": price,
        "q": "1",
        "z": executed,
        "X": status,
        "i": 9912,
        "O": 1_700_000_000_000i64,
        "n": "0"
    }))
    .unwrap()
}

fn listing_row(client_order_id: &str, side: &str, price: &str) -> OrderEvent {
    from_open_order_row(&serde_json::json!({
        "orderId": 9912,
        "clientOrderId": client_order_id,
        "side": side,
        "symbol": "PEPEUSDT",
        "status": "NEW",
        "time": 1_700_000_000_000i64,
        "updateTime": 1_700_000_000_000i64,
        "type": "LIMIT",
        "price": price,
        "origQty": "1",
        "executedQty": "0"
    }))
    .unwrap()
}

struct FixedListing(Vec<OrderEvent>);

#[async_trait]
impl OpenOrdersApi for FixedListing {
    async fn open_orders(&self) -> Result<Vec<OrderEvent>, VenueError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_full_cycle_buy_to_finished() {
    let mut w = world();

    w.engine
        .on_order_event(&stream_event("42_BUY", "BUY", "NEW", "100.00"));
    w.engine
        .on_order_event(&stream_event("42_BUY", "BUY", "FILLED", "100.00"));

    // The open fill must place exactly one SELL at open + gap.
    match w.commands.try_recv().unwrap() {
        OrderCommand::Create {
            price,
            quantity,
            side,
            position_id,
        } => {
            assert_eq!(side.as_wire(), "SELL");
            assert_eq!(price, dec!(100.04));
            assert_eq!(quantity, dec!(1));
            assert_eq!(position_id, 42);
        }
        other => panic!("expected sell placement, got {other:?}"),
    }

    w.engine
        .on_order_event(&stream_event("42_SELL", "SELL", "NEW", "100.04"));
    w.engine
        .on_order_event(&stream_event("42_SELL", "SELL", "FILLED", "100.04"));

    let position = w.engine.position(42).unwrap();
    assert_eq!(position.status, PositionStatus::Finished);
    assert_eq!(position.open_at_price, dec!(100.00));
    assert_eq!(position.close_at_price, dec!(100.04));
    assert!(position.closed_at.is_some());
    assert!(w.commands.try_recv().is_err(), "no further orders expected");

    // The terminal snapshot is durable.
    w.snapshots.flush().await;
    assert_eq!(
        w.snapshots.find(42).unwrap().status,
        PositionStatus::Finished
    );
}

#[tokio::test]
async fn test_cancelled_open_never_sells() {
    let mut w = world();

    w.engine
        .on_order_event(&stream_event("7_BUY", "BUY", "NEW", "99.50"));
    w.engine
        .on_order_event(&stream_event("7_BUY", "BUY", "CANCELED", "99.50"));

    assert_eq!(
        w.engine.position(7).unwrap().status,
        PositionStatus::Cancelled
    );
    assert!(w.commands.try_recv().is_err());

    // A late replay of the fill must not resurrect the position.
    w.engine
        .on_order_event(&stream_event("7_BUY", "BUY", "FILLED", "99.50"));
    assert_eq!(
        w.engine.position(7).unwrap().status,
        PositionStatus::Cancelled
    );
    assert!(w.commands.try_recv().is_err());
}

#[tokio::test]
async fn test_proximity_and_duplicate_guards() {
    let mut w = world();

    w.engine
        .on_order_event(&stream_event("11_BUY", "BUY", "NEW", "100.00"));

    assert!(!w.engine.request_open(dec!(100.00)), "duplicate price");
    assert!(!w.engine.request_open(dec!(100.03)), "3 ticks away");
    assert!(w.engine.request_open(dec!(100.04)), "4 ticks away");
    match w.commands.try_recv().unwrap() {
        OrderCommand::Create { price, .. } => assert_eq!(price, dec!(100.04)),
        other => panic!("expected buy placement, got {other:?}"),
    }
}

#[tokio::test]
async fn test_combo_ceiling_rejects_sixth_open() {
    let mut w = world();

    for id in 1..=5 {
        let price = format!("{}.00", 100 + id);
        w.engine
            .on_order_event(&stream_event(&format!("{id}_BUY"), "BUY", "NEW", &price));
        w.engine
            .on_order_event(&stream_event(&format!("{id}_BUY"), "BUY", "FILLED", &price));
    }
    assert_eq!(w.engine.combo_opened(), 5);
    assert!(!w.engine.request_open(dec!(200.00)));

    // Finishing one position frees exactly one slot.
    w.engine
        .on_order_event(&stream_event("3_SELL", "SELL", "NEW", "103.04"));
    w.engine
        .on_order_event(&stream_event("3_SELL", "SELL", "FILLED", "103.04"));
    assert_eq!(w.engine.combo_opened(), 4);
    assert!(w.engine.request_open(dec!(200.00)));
    while w.commands.try_recv().is_ok() {}
}

#[tokio::test]
async fn test_crash_recovery_rebuilds_and_replays() {
    let w = world();

    // One position mid-flight, one finished, then the process "crashes".
    w.engine
        .on_order_event(&stream_event("42_BUY", "BUY", "NEW", "100.00"));
    w.engine
        .on_order_event(&stream_event("42_BUY", "BUY", "FILLED", "100.00"));
    w.engine
        .on_order_event(&stream_event("42_SELL", "SELL", "NEW", "100.04"));
    w.engine
        .on_order_event(&stream_event("9_BUY", "BUY", "NEW", "99.00"));
    w.engine
        .on_order_event(&stream_event("9_BUY", "BUY", "CANCELED", "99.00"));
    w.snapshots.flush().await;
    let before = w.engine.position(42).unwrap();

    let mut restarted = world_at(w.dir);
    restarted.engine.restore();

    // The mid-flight position is back, the terminal one stays out of memory.
    assert_eq!(restarted.engine.position(42).unwrap(), before);
    assert_eq!(restarted.engine.combo_opened(), 0);

    // The startup reconciliation replays the venue's open SELL; state must
    // not change and no duplicate order may be placed.
    let scheduler = ReconciliationScheduler::new(
        restarted.engine.clone(),
        Arc::new(FixedListing(vec![listing_row("42_SELL", "SELL", "100.04")])),
    );
    scheduler.run_once().await;
    assert_eq!(restarted.engine.position(42).unwrap(), before);
    assert!(restarted.commands.try_recv().is_err());

    // The close fill arriving after recovery completes the cycle.
    restarted
        .engine
        .on_order_event(&stream_event("42_SELL", "SELL", "FILLED", "100.04"));
    assert_eq!(
        restarted.engine.position(42).unwrap().status,
        PositionStatus::Finished
    );
}

#[tokio::test]
async fn test_reconciliation_rebuilds_unknown_order() {
    let w = world();

    // A BUY the process never saw (stream gap) appears in the listing.
    let scheduler = ReconciliationScheduler::new(
        w.engine.clone(),
        Arc::new(FixedListing(vec![listing_row("77_BUY", "BUY", "98.00")])),
    );
    scheduler.run_once().await;

    let position = w.engine.position(77).unwrap();
    assert_eq!(position.status, PositionStatus::WaitingForOpen);
    assert_eq!(position.open_at_price, dec!(98.00));
    assert_eq!(position.close_at_price, dec!(98.04));
    assert_eq!(
        position.created_at,
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    );

    // Running the same pass again changes nothing.
    let before = w.engine.position(77).unwrap();
    scheduler.run_once().await;
    assert_eq!(w.engine.position(77).unwrap(), before);
}

#[tokio::test]
async fn test_sweep_after_recovery_cancels_drifted_open() {
    let mut w = world();

    // A pending open created long ago, far from where the market is now.
    let mut aged = stream_event("21_BUY", "BUY", "NEW", "99.00");
    aged.created_at = Utc::now() - chrono::Duration::seconds(300);
    w.engine.on_order_event(&aged);

    assert_eq!(w.engine.sweep_stale(dec!(100.00)), 1);
    match w.commands.try_recv().unwrap() {
        OrderCommand::Cancel { exchange_order_id } => assert_eq!(exchange_order_id, 9912),
        other => panic!("expected cancel, got {other:?}"),
    }

    // The venue confirms; the position terminates without a sell.
    w.engine
        .on_order_event(&stream_event("21_BUY", "BUY", "CANCELED", "99.00"));
    assert_eq!(
        w.engine.position(21).unwrap().status,
        PositionStatus::Cancelled
    );

    // Within the gap/2 + 1 band nothing is swept.
    let mut near = stream_event("22_BUY", "BUY", "NEW", "99.97");
    near.created_at = Utc::now() - chrono::Duration::seconds(300);
    w.engine.on_order_event(&near);
    assert_eq!(w.engine.sweep_stale(dec!(100.00)), 0);
}

#[tokio::test]
async fn test_quantity_budget_holds() {
    let w = world();
    let price = dec!(0.07);
    let quantity = w.engine.open_quantity(price);
    assert_eq!(quantity, dec!(214.29));
    // Cost never exceeds the truncated budget by more than one price step
    // of the final rounding.
    assert!(quantity * price <= dec!(15.00) + price * Decimal::new(1, 2));
}
