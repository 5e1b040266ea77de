//! Combo breaker: rate limit on consecutive unfinished opens.
//!
//! Every position that fills its open takes a slot; finishing (or cancelling
//! an already-opened position) releases one. Once the ceiling is reached,
//! `request_open` is rejected until slots free up. A decay counter prevents a
//! single stuck position from blocking trading forever: after the counter has
//! stayed saturated across a full rolling window of decay ticks it resets to
//! zero.
//!
//! Counters are atomics so the hot guard check (`is_saturated`) never takes a
//! lock. `decay_tick` is driven by a single maintenance timer.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct ComboBreaker {
    ceiling: u32,
    window_ticks: u32,
    opened: AtomicU32,
    saturated_ticks: AtomicU32,
}

impl ComboBreaker {
    pub fn new(ceiling: u32, window_ticks: u32) -> Self {
        Self {
            ceiling,
            window_ticks,
            opened: AtomicU32::new(0),
            saturated_ticks: AtomicU32::new(0),
        }
    }

    /// True once the ceiling is reached; `request_open` must reject.
    pub fn is_saturated(&self) -> bool {
        self.opened.load(Ordering::Acquire) >= self.ceiling
    }

    /// A position filled its open and now holds a slot.
    pub fn acquire(&self) {
        self.opened.fetch_add(1, Ordering::AcqRel);
    }

    /// A slot-holding position reached a terminal state.
    pub fn release(&self) {
        let _ = self
            .opened
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
    }

    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::Acquire)
    }

    /// One decay interval elapsed.
    ///
    /// The window only advances while the counter sits at the ceiling's edge
    /// or above; any dip below restarts it.
    pub fn decay_tick(&self) {
        let ticks = self.saturated_ticks.load(Ordering::Acquire);
        if ticks >= self.window_ticks {
            self.opened.store(0, Ordering::Release);
            self.saturated_ticks.store(0, Ordering::Release);
        } else if self.opened.load(Ordering::Acquire) >= self.ceiling.saturating_sub(1) {
            self.saturated_ticks.store(ticks + 1, Ordering::Release);
        } else {
            self.saturated_ticks.store(0, Ordering::Release);
        }
    }
}
