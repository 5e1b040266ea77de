//! Position state machine: the reconciliation core.
//!
//! [`PositionEngine::on_order_event`] turns normalized order lifecycle events
//! into durable position records. It is idempotent by construction: an event
//! that does not match its position's current status is a stale or duplicate
//! delivery and is ignored, which is what lets the reconciliation pass
//! replay the venue's open-order listing through the same entry point.
//!
//! Concurrency: positions live in a `DashMap`, and a transition runs under
//! the entry guard so two concurrent events for one id cannot interleave.
//! Follow-up effects (snapshot save, order command) are pushed onto unbounded
//! channels while the guard is held, preserving per-id ordering end to end
//! without ever awaiting under a lock. Guard reads used by `request_open`
//! iterate the map advisorily; a stale read only delays a decision to the
//! next cycle.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::TradeConfig;
use crate::events::{OrderEvent, OrderStatus};
use crate::persist::StoreHandle;
use crate::position::combo::ComboBreaker;
use crate::position::{parse_position_id, Position, PositionStatus, SNAPSHOT_VERSION};
use crate::types::OrderSide;
use crate::venue::OrderCommand;

pub struct PositionEngine {
    cfg: TradeConfig,
    positions: DashMap<u64, Position>,
    store: StoreHandle,
    commands: mpsc::UnboundedSender<OrderCommand>,
    combo: ComboBreaker,
}

impl PositionEngine {
    pub fn new(
        cfg: TradeConfig,
        store: StoreHandle,
        commands: mpsc::UnboundedSender<OrderCommand>,
    ) -> Self {
        let combo = ComboBreaker::new(cfg.combo_ceiling, cfg.combo_window_ticks);
        Self {
            cfg,
            positions: DashMap::new(),
            store,
            commands,
            combo,
        }
    }

    /// Warm the in-memory cache from persisted snapshots.
    ///
    /// Only non-terminal positions are loaded eagerly; terminal ones are
    /// fetched lazily on first reference, the map being a cache over the
    /// store either way.
    pub fn restore(&self) {
        let mut restored = 0usize;
        for snapshot in self.store.load_all() {
            if !snapshot.status.is_terminal() {
                self.positions.insert(snapshot.id, snapshot);
                restored += 1;
            }
        }
        if restored > 0 {
            info!(count = restored, "restored open positions from store");
        }
    }

    /// Apply one normalized order lifecycle event.
    ///
    /// Malformed correlation ids are dropped with a log line; an event that
    /// does not match its position's current status is a no-op, not an error.
    pub fn on_order_event(&self, event: &OrderEvent) {
        if event.symbol != self.cfg.symbol {
            debug!(symbol = %event.symbol, "ignoring event for foreign symbol");
            return;
        }
        let id = match parse_position_id(&event.client_order_id) {
            Ok(id) => id,
            Err(error) => {
                warn!(%error, "dropping event with unparsable client order id");
                return;
            }
        };

        match (event.side, event.status) {
            (OrderSide::Buy, OrderStatus::New) => self.create_waiting(id, event),
            (OrderSide::Buy, OrderStatus::Filled) => {
                if self.within_fill_tolerance(event) {
                    self.open_filled(id, event);
                } else {
                    warn!(
                        id,
                        quantity = %event.quantity,
                        executed = %event.executed_qty,
                        "slippage on open fill, transition skipped"
                    );
                }
            }
            (OrderSide::Sell, OrderStatus::New) => self.wait_for_close(id, event),
            (OrderSide::Sell, OrderStatus::Filled) => {
                if self.within_fill_tolerance(event) {
                    self.close_filled(id, event);
                } else {
                    warn!(
                        id,
                        quantity = %event.quantity,
                        executed = %event.executed_qty,
                        "slippage on close fill, transition skipped"
                    );
                }
            }
            (_, OrderStatus::Canceled) => self.cancelled(id, event),
            (side, status) => {
                debug!(id, ?side, ?status, "no transition for event");
            }
        }
    }

    /// Gatekeeper for the strategy trigger. Returns whether a BUY was placed.
    pub fn request_open(&self, price: Decimal) -> bool {
        if self.combo.is_saturated() {
            debug!(%price, opened = self.combo.opened(), "open rejected: combo ceiling");
            return false;
        }

        let exact_duplicate = self
            .positions
            .iter()
            .any(|p| !p.status.is_terminal() && p.open_at_price == price);
        if exact_duplicate {
            debug!(%price, "open rejected: live position at this price");
            return false;
        }

        let proximity = Decimal::from(self.cfg.proximity_ticks);
        let too_close = self.positions.iter().any(|p| {
            p.status == PositionStatus::WaitingForOpen
                && self.cfg.in_ticks((price - p.open_at_price).abs()) <= proximity
        });
        if too_close {
            debug!(%price, "open rejected: pending open within proximity tolerance");
            return false;
        }

        let quantity = self.open_quantity(price);
        if quantity <= Decimal::ZERO {
            warn!(%price, "open rejected: notional too small for one base unit");
            return false;
        }

        let position_id = rand::thread_rng().gen_range(1..=i64::MAX) as u64;
        self.send_command(OrderCommand::Create {
            price,
            quantity,
            side: OrderSide::Buy,
            position_id,
        });
        info!(position_id, %price, %quantity, "open requested");
        true
    }

    /// Derive the BUY quantity from the configured quote-asset notional.
    ///
    /// Order matters: truncate the notional to the quote scale, divide by
    /// price rounding up, truncate to the base scale. The quantity never
    /// exceeds venue precision and the cost stays within one rounding step
    /// of the budget.
    pub fn open_quantity(&self, price: Decimal) -> Decimal {
        let budget = self
            .cfg
            .notional_per_trade
            .trunc_with_scale(self.cfg.quote_asset_scale);
        (budget / price)
            .round_dp_with_strategy(self.cfg.quote_asset_scale, RoundingStrategy::AwayFromZero)
            .trunc_with_scale(self.cfg.base_asset_scale)
    }

    /// Cancel pending opens that drifted too far from the reference price.
    ///
    /// Only positions older than the configured minimum age are considered,
    /// so an order still in flight is never swept. Returns the cancel count.
    pub fn sweep_stale(&self, reference_price: Decimal) -> usize {
        let min_age = chrono::Duration::seconds(self.cfg.min_order_age.as_secs() as i64);
        let age_cutoff = Utc::now() - min_age;
        let drift_limit = Decimal::from(self.cfg.gap_size_points) / Decimal::TWO + Decimal::ONE;

        let stale: Vec<i64> = self
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::WaitingForOpen)
            .filter(|p| p.created_at < age_cutoff)
            .filter(|p| {
                self.cfg
                    .in_ticks((reference_price - p.open_at_price).abs())
                    > drift_limit
            })
            .filter_map(|p| p.order_id_open)
            .collect();

        for exchange_order_id in &stale {
            self.send_command(OrderCommand::Cancel {
                exchange_order_id: *exchange_order_id,
            });
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "cleared stale open orders");
        }
        stale.len()
    }

    /// Advance the combo breaker's decay window by one interval.
    pub fn decay_tick(&self) {
        self.combo.decay_tick();
    }

    /// Snapshot of a position, for callers outside the engine.
    pub fn position(&self, id: u64) -> Option<Position> {
        self.positions.get(&id).map(|p| p.clone())
    }

    /// Number of combo slots currently held.
    pub fn combo_opened(&self) -> u32 {
        self.combo.opened()
    }

    fn within_fill_tolerance(&self, event: &OrderEvent) -> bool {
        (event.quantity - event.executed_qty).abs() <= self.cfg.fill_tolerance
    }

    fn send_command(&self, command: OrderCommand) {
        if self.commands.send(command).is_err() {
            error!("order router gone, command dropped");
        }
    }

    /// BUY/NEW: first sight of a position. Duplicate deliveries and ids that
    /// already have a snapshot are no-ops.
    fn create_waiting(&self, id: u64, event: &OrderEvent) {
        let slot = match self.positions.entry(id) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => slot,
        };
        if let Some(snapshot) = self.store.find(id) {
            slot.insert(snapshot);
            return;
        }

        let position = Position {
            version: SNAPSHOT_VERSION,
            id,
            status: PositionStatus::WaitingForOpen,
            order_id_open: event.exchange_order_id,
            open_at_price: event.price,
            quantity_open: event.quantity,
            order_id_close: None,
            close_at_price: event.price + self.cfg.gap_offset(),
            quantity_close: event.quantity,
            created_at: event.created_at,
            closed_at: None,
        };
        self.store.save(id, position.clone());
        info!(
            id,
            open_at = %position.open_at_price,
            close_at = %position.close_at_price,
            quantity = %position.quantity_open,
            "position waiting for open"
        );
        slot.insert(position);
    }

    /// BUY/FILLED from WaitingForOpen: the position is live on the book side;
    /// submit the matching SELL at the precomputed close price.
    fn open_filled(&self, id: u64, event: &OrderEvent) {
        self.with_position(id, |engine, position| {
            if position.status != PositionStatus::WaitingForOpen {
                return;
            }
            position.status = PositionStatus::Opened;
            position.open_at_price = event.price;
            if event.exchange_order_id.is_some() {
                position.order_id_open = event.exchange_order_id;
            }
            engine.combo.acquire();
            engine.send_command(OrderCommand::Create {
                price: position.close_at_price,
                quantity: position.quantity_close,
                side: OrderSide::Sell,
                position_id: id,
            });
            engine.store.save(id, position.clone());
            engine.warn_on_commission(id, event);
            info!(id, open_at = %position.open_at_price, "position opened");
        });
    }

    /// SELL/NEW from Opened: the exit order is on the book.
    fn wait_for_close(&self, id: u64, event: &OrderEvent) {
        self.with_position(id, |engine, position| {
            if position.status != PositionStatus::Opened {
                return;
            }
            position.status = PositionStatus::WaitingForClose;
            position.order_id_close = event.exchange_order_id;
            engine.store.save(id, position.clone());
            info!(id, close_at = %position.close_at_price, "position waiting for close");
        });
    }

    /// SELL/FILLED from WaitingForClose: the cycle is complete.
    fn close_filled(&self, id: u64, event: &OrderEvent) {
        self.with_position(id, |engine, position| {
            if position.status != PositionStatus::WaitingForClose {
                return;
            }
            position.status = PositionStatus::Finished;
            position.close_at_price = event.price;
            position.closed_at = Some(event.updated_at);
            engine.combo.release();
            engine.store.save(id, position.clone());
            engine.warn_on_commission(id, event);

            let profit = position.close_at_price * position.quantity_close
                - position.open_at_price * position.quantity_open;
            info!(id, %profit, close_at = %position.close_at_price, "position finished");
        });
    }

    /// CANCELED on either side. A cancel while waiting to close means an
    /// opened position failed to exit; reported loudly, never dropped.
    fn cancelled(&self, id: u64, event: &OrderEvent) {
        self.with_position(id, |engine, position| match position.status {
            PositionStatus::WaitingForOpen => {
                position.status = PositionStatus::Cancelled;
                engine.store.save(id, position.clone());
                info!(id, "pending open cancelled");
            }
            PositionStatus::WaitingForClose => {
                position.status = PositionStatus::Cancelled;
                position.closed_at = Some(event.updated_at);
                engine.combo.release();
                engine.store.save(id, position.clone());
                error!(
                    id,
                    open_at = %position.open_at_price,
                    quantity = %position.quantity_open,
                    "exit order cancelled on an opened position; inventory left behind"
                );
            }
            _ => {}
        });
    }

    /// Run `apply` on the position under its entry guard, loading the
    /// snapshot from the store on first reference to an unseen id.
    fn with_position<F>(&self, id: u64, apply: F)
    where
        F: FnOnce(&Self, &mut Position),
    {
        let mut guard: RefMut<'_, u64, Position> = match self.positions.entry(id) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(slot) => match self.store.find(id) {
                Some(snapshot) => slot.insert(snapshot),
                None => {
                    debug!(id, "event for unknown position, ignored");
                    return;
                }
            },
        };
        apply(self, guard.value_mut());
    }

    fn warn_on_commission(&self, id: u64, event: &OrderEvent) {
        if event.commission > Decimal::ZERO {
            warn!(id, commission = %event.commission, "commission charged on fill");
        }
    }
}
