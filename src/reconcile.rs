//! Periodic reconciliation against the venue's open-order listing.
//!
//! Streams drop messages; the REST listing of open orders is the venue's
//! authoritative view. Each pass fetches the listing and replays every row
//! through the same engine entry point the stream feeds. Because the engine
//! is idempotent, rows matching known state are no-ops and rows for unknown
//! positions rebuild them, so a pass is always safe to run, including
//! once at startup before the streams connect.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TradeConfig;
use crate::position::PositionEngine;
use crate::venue::OpenOrdersApi;

pub struct ReconciliationScheduler {
    engine: Arc<PositionEngine>,
    open_orders: Arc<dyn OpenOrdersApi>,
}

impl ReconciliationScheduler {
    pub fn new(engine: Arc<PositionEngine>, open_orders: Arc<dyn OpenOrdersApi>) -> Self {
        Self {
            engine,
            open_orders,
        }
    }

    /// One reconciliation pass. Fetch failures are logged and retried on the
    /// next scheduled pass; a partial world view is worse than a late one.
    pub async fn run_once(&self) {
        let listing = match self.open_orders.open_orders().await {
            Ok(listing) => listing,
            Err(error) => {
                warn!(%error, "open-order listing fetch failed, pass skipped");
                return;
            }
        };
        let rows = listing.len();
        for event in &listing {
            self.engine.on_order_event(event);
        }
        debug!(rows, "reconciliation pass complete");
    }

    /// Run one pass immediately, then repeat on the configured cadence.
    pub fn spawn(self, cfg: &TradeConfig) -> JoinHandle<()> {
        let interval = cfg.reconcile_interval;
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "reconciliation scheduler started");
            self.run_once().await;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick already consumed above
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
