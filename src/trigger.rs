//! Entry trigger: Bollinger bands over rolling one-minute closes.
//!
//! The trigger watches the market stream's reference price, folds it into
//! per-minute closes, and asks the engine to open a position during a band
//! squeeze: deviation is small and the price sits inside the bands, the
//! profile of a ranging market where a grid earns its gap. Band statistics
//! run in f64 because they only gate a decision; order prices stay in
//! `Decimal` end to end.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::balance::BalanceTracker;
use crate::config::TradeConfig;
use crate::position::PositionEngine;
use crate::types::PriceTick;

/// Number of one-minute closes in the statistics window.
const WINDOW: usize = 20;
/// Band half-width in standard deviations.
const BAND_SIGMA: f64 = 1.5;
/// Markets with a larger per-window deviation than this (in ticks) are
/// trending, not ranging; the trigger stays out of them.
const MAX_SIGMA_TICKS: f64 = 4.0;
/// Entry orders rest this many ticks below the triggering price.
const ENTRY_OFFSET_TICKS: u32 = 2;

struct TriggerState {
    /// Epoch minute the in-progress close belongs to.
    minute: i64,
    current_close: Option<f64>,
    closes: VecDeque<f64>,
    /// Last price the trigger acted on; suppresses refiring on the exact
    /// same print while the market sits still.
    last_action_price: Option<Decimal>,
}

pub struct BandTrigger {
    cfg: TradeConfig,
    engine: Arc<PositionEngine>,
    balances: Arc<BalanceTracker>,
    state: Mutex<TriggerState>,
}

impl BandTrigger {
    pub fn new(
        cfg: TradeConfig,
        engine: Arc<PositionEngine>,
        balances: Arc<BalanceTracker>,
    ) -> Self {
        Self {
            cfg,
            engine,
            balances,
            state: Mutex::new(TriggerState {
                minute: 0,
                current_close: None,
                closes: VecDeque::with_capacity(WINDOW),
                last_action_price: None,
            }),
        }
    }

    /// Feed one reference-price tick; may place an open request.
    pub fn on_tick(&self, tick: &PriceTick) {
        if tick.symbol != self.cfg.symbol {
            return;
        }
        let Some(price_f64) = tick.price.to_f64() else {
            return;
        };

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };

        let minute = tick.timestamp / 60_000;
        if minute != state.minute {
            if let Some(close) = state.current_close.take() {
                if state.closes.len() == WINDOW {
                    state.closes.pop_front();
                }
                state.closes.push_back(close);
            }
            state.minute = minute;
        }
        state.current_close = Some(price_f64);

        if state.closes.len() < WINDOW {
            return;
        }
        let Some((mean, sigma)) = mean_and_sigma(&state.closes) else {
            return;
        };

        let tick_size = self.cfg.tick();
        let Some(tick_f64) = tick_size.to_f64() else {
            return;
        };
        if sigma / tick_f64 >= MAX_SIGMA_TICKS {
            debug!(sigma, "market trending, trigger idle");
            return;
        }

        let lower_band = mean - BAND_SIGMA * sigma;
        let upper_band = mean + BAND_SIGMA * sigma;
        if price_f64 < lower_band || price_f64 > upper_band {
            return;
        }
        if state.last_action_price == Some(tick.price) {
            return;
        }
        if !self
            .balances
            .can_afford(&self.cfg.quote_asset, self.cfg.notional_per_trade)
        {
            debug!("insufficient quote balance, trigger idle");
            return;
        }

        let entry = tick.price - Decimal::from(ENTRY_OFFSET_TICKS) * tick_size;
        if self.engine.request_open(entry) {
            info!(%entry, price = %tick.price, mean, sigma, "band trigger fired");
        }
        state.last_action_price = Some(tick.price);
    }
}

fn mean_and_sigma(closes: &VecDeque<f64>) -> Option<(f64, f64)> {
    if closes.is_empty() {
        return None;
    }
    let n = closes.len() as f64;
    let mean = closes.iter().sum::<f64>() / n;
    let variance = closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}
