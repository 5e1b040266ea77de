use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gridpilot::balance::BalanceTracker;
use gridpilot::config::{TradeConfig, VenueConfig};
use gridpilot::persist::{spawn_writer, PositionStore};
use gridpilot::position::PositionEngine;
use gridpilot::reconcile::ReconciliationScheduler;
use gridpilot::stream::{spawn_dispatcher, StreamSupervisor, TungsteniteConnector};
use gridpilot::trigger::BandTrigger;
use gridpilot::venue::binance::BinanceRest;
use gridpilot::venue::spawn_router;

#[derive(Parser)]
#[command(author, version, about = "Unattended single-instrument grid trader")]
struct Cli {
    /// Log filter (error, warn, info, debug, trace, or a full directive)
    #[arg(long, default_value = "info")]
    verbose: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.verbose)),
        )
        .init();

    let trade = TradeConfig::from_env()?;
    let venue = VenueConfig::from_env()?;
    info!(symbol = %trade.symbol, "starting grid trader");

    // Persistence first: the engine heals from snapshots before anything
    // else is allowed to produce events.
    let store = Arc::new(PositionStore::open(&trade.data_dir)?);
    let (snapshots, _writer) = spawn_writer(store);

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(PositionEngine::new(
        trade.clone(),
        snapshots.clone(),
        commands_tx,
    ));
    engine.restore();

    let rest = Arc::new(BinanceRest::new(venue.clone(), trade.symbol.clone()));
    let _router = spawn_router(rest.clone(), commands_rx);

    // Startup pass runs before the streams connect, then repeats forever.
    let _reconciler = ReconciliationScheduler::new(engine.clone(), rest.clone()).spawn(&trade);

    let balances = Arc::new(BalanceTracker::new(trade.notional_per_trade));
    let trigger = Arc::new(BandTrigger::new(
        trade.clone(),
        engine.clone(),
        balances.clone(),
    ));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let supervisor = Arc::new(StreamSupervisor::new(
        Arc::new(TungsteniteConnector),
        rest,
        trade.clone(),
        venue.ws_url.clone(),
        events_tx,
    ));
    let _market = supervisor.spawn_market();
    let _user = supervisor.spawn_user();

    let (price_tx, price_rx) = watch::channel(None);
    let _dispatcher = spawn_dispatcher(
        events_rx,
        engine.clone(),
        balances,
        trigger,
        price_tx,
    );

    // Maintenance timers: stale-order sweep against the latest reference
    // price, and the combo decay window.
    let sweep_engine = engine.clone();
    let sweep_price = price_rx.clone();
    let sweep_interval = trade.sweep_interval;
    let _sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let reference = *sweep_price.borrow();
            if let Some(price) = reference {
                sweep_engine.sweep_stale(price);
            }
        }
    });
    let decay_engine = engine.clone();
    let decay_interval = trade.combo_decay_interval;
    let _decayer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(decay_interval);
        loop {
            ticker.tick().await;
            decay_engine.decay_tick();
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, flushing snapshots");
    snapshots.flush().await;
    Ok(())
}
