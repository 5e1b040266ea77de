//! Free-balance cache fed by the user-data stream.
//!
//! The venue pushes a full snapshot of free balances whenever any of them
//! changes; [`BalanceTracker::apply`] replaces the cache wholesale instead of
//! patching it. Before the first snapshot arrives the tracker reports an
//! optimistic default slightly above the per-trade notional, so the strategy
//! is not frozen during the startup gap between connecting the stream and
//! the first account update.

use std::collections::HashMap;
use std::sync::RwLock;

use rust_decimal::Decimal;
use tracing::debug;

use crate::events::BalanceUpdate;

pub struct BalanceTracker {
    free: RwLock<HashMap<String, Decimal>>,
    optimistic_default: Decimal,
}

impl BalanceTracker {
    pub fn new(notional_per_trade: Decimal) -> Self {
        Self {
            free: RwLock::new(HashMap::new()),
            optimistic_default: notional_per_trade + Decimal::ONE,
        }
    }

    /// Replace the cached balances with a fresh snapshot.
    pub fn apply(&self, update: BalanceUpdate) {
        let snapshot: HashMap<String, Decimal> = update.free.into_iter().collect();
        debug!(assets = snapshot.len(), "balances replaced");
        if let Ok(mut free) = self.free.write() {
            *free = snapshot;
        }
    }

    /// Free balance of `asset`.
    ///
    /// Unknown assets after the first snapshot report zero; before any
    /// snapshot the optimistic default applies.
    pub fn available(&self, asset: &str) -> Decimal {
        match self.free.read() {
            Ok(free) if free.is_empty() => self.optimistic_default,
            Ok(free) => free.get(asset).copied().unwrap_or(Decimal::ZERO),
            Err(_) => Decimal::ZERO,
        }
    }

    /// Whether `asset` has at least `amount` free.
    pub fn can_afford(&self, asset: &str, amount: Decimal) -> bool {
        self.available(asset) >= amount
    }
}
