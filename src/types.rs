//! Common Types Module
//!
//! Shared types used across the codebase to avoid circular dependencies.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Venue wire representation ("BUY" / "SELL"), also used as the
    /// client-order-id suffix.
    pub fn as_wire(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(format!("unknown order side: {other}")),
        }
    }
}

/// A market data update (price tick) for the traded instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    /// The trading symbol (e.g., "PEPEUSDT").
    pub symbol: String,
    /// Last traded / close price of the current candle.
    pub price: Decimal,
    /// Event timestamp in epoch milliseconds.
    pub timestamp: i64,
}
