//! Position records and client-order-id correlation.
//!
//! A [`Position`] tracks one open→close trading cycle from its BUY order to
//! the matching SELL. The position id is encoded into every order's client
//! order id (`"<positionId>_<SIDE>"`), so each lifecycle event the venue
//! echoes back addresses its position deterministically.

pub mod combo;
pub mod engine;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::OrderSide;

pub use engine::PositionEngine;

/// Current snapshot format; bump when persisted layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Lifecycle states of a position.
///
/// Transitions are monotonic along
/// `WaitingForOpen → Opened → WaitingForClose → Finished`, with
/// `WaitingForOpen | WaitingForClose → Cancelled` as the abort edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    WaitingForOpen,
    Opened,
    WaitingForClose,
    Finished,
    Cancelled,
}

impl PositionStatus {
    /// Terminal states receive no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::WaitingForOpen => "WAITING_FOR_OPEN",
            Self::Opened => "OPENED",
            Self::WaitingForClose => "WAITING_FOR_CLOSE",
            Self::Finished => "FINISHED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{name}")
    }
}

/// One open→close trading cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Snapshot format version, defaulted for pre-versioned snapshots.
    #[serde(default)]
    pub version: u32,
    /// Stable id for the position's lifetime, taken from the client order id.
    pub id: u64,
    pub status: PositionStatus,
    /// Venue order id of the opening BUY, once reported.
    pub order_id_open: Option<i64>,
    pub open_at_price: Decimal,
    pub quantity_open: Decimal,
    /// Venue order id of the closing SELL, once reported.
    pub order_id_close: Option<i64>,
    pub close_at_price: Decimal,
    pub quantity_close: Decimal,
    pub created_at: DateTime<Utc>,
    /// Set when the position reaches a terminal state via a SELL fill or a
    /// cancel of an already-opened position.
    pub closed_at: Option<DateTime<Utc>>,
}

/// Errors raised while correlating events to positions.
#[derive(Debug, Error)]
pub enum PositionIdError {
    #[error("client order id '{0}' has no position id prefix")]
    MissingPrefix(String),

    #[error("client order id '{0}' has an unparsable position id prefix")]
    BadPrefix(String),
}

/// Build the client order id sent with an order: `"<positionId>_<SIDE>"`.
pub fn client_order_id(position_id: u64, side: OrderSide) -> String {
    format!("{}_{}", position_id, side.as_wire())
}

/// Extract the position id prefix from a client order id.
///
/// Two events with the same prefix address the same position; ids the venue
/// assigned itself (web UI orders etc.) fail here and are dropped upstream.
pub fn parse_position_id(client_order_id: &str) -> Result<u64, PositionIdError> {
    let prefix = client_order_id
        .split('_')
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| PositionIdError::MissingPrefix(client_order_id.to_string()))?;
    prefix
        .parse()
        .map_err(|_| PositionIdError::BadPrefix(client_order_id.to_string()))
}
