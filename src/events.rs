//! Order event normalization.
//!
//! The venue reports order lifecycle changes in two differently-shaped
//! sources: the streamed execution report on the user-data stream and the
//! REST open-orders listing. Each shape is mapped by an explicit function
//! into one canonical [`OrderEvent`] before anything reaches the position
//! engine, a tagged-union boundary instead of ad hoc field access.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{OrderSide, PriceTick};

/// Errors produced while normalizing venue payloads.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid order side: {0}")]
    Side(String),

    #[error("invalid epoch millis timestamp: {0}")]
    Timestamp(i64),
}

/// Canonical order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    #[serde(other)]
    Unknown,
}

/// Canonical order lifecycle event, post-normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Caller-assigned correlation id, `"<positionId>_<SIDE>"`.
    pub client_order_id: String,
    /// Venue-assigned order id, when the source shape carries one.
    pub exchange_order_id: Option<i64>,
    pub side: OrderSide,
    pub symbol: String,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub order_type: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub executed_qty: Decimal,
    /// Commission charged on the execution; zero when the source omits it.
    pub commission: Decimal,
}

/// A full replacement of the account's free balances.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceUpdate {
    pub free: Vec<(String, Decimal)>,
}

/// Typed message decoded from the user-data stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UserStreamEvent {
    Order(OrderEvent),
    Balances(BalanceUpdate),
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, EventError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(EventError::Timestamp(ms))
}

// ---------------------------------------------------------------------------
// Streamed execution report (user-data stream, `"e": "executionReport"`)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireExecutionReport {
    #[serde(rename = "i")]
    order_id: Option<i64>,
    #[serde(rename = "c")]
    client_order_id: String,
    /// Original client order id on cancel-replace; preferred when non-empty.
    #[serde(rename = "C", default)]
    original_client_order_id: Option<String>,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "X")]
    status: OrderStatus,
    #[serde(rename = "O")]
    created_at: i64,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "o")]
    order_type: String,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "z")]
    executed_qty: Decimal,
    #[serde(rename = "n", default)]
    commission: Option<Decimal>,
}

/// Map a streamed execution report into the canonical event.
pub fn from_execution_report(payload: &serde_json::Value) -> Result<OrderEvent, EventError> {
    let wire: WireExecutionReport = serde_json::from_value(payload.clone())?;
    let client_order_id = match wire.original_client_order_id {
        Some(ref original) if !original.is_empty() => original.clone(),
        _ => wire.client_order_id,
    };
    Ok(OrderEvent {
        client_order_id,
        exchange_order_id: wire.order_id,
        side: wire.side.parse().map_err(EventError::Side)?,
        symbol: wire.symbol,
        status: wire.status,
        created_at: millis_to_utc(wire.created_at)?,
        updated_at: millis_to_utc(wire.event_time)?,
        order_type: wire.order_type,
        price: wire.price,
        quantity: wire.quantity,
        executed_qty: wire.executed_qty,
        commission: wire.commission.unwrap_or(Decimal::ZERO),
    })
}

// ---------------------------------------------------------------------------
// REST open-orders listing row
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireOpenOrderRow {
    #[serde(rename = "orderId")]
    order_id: Option<i64>,
    #[serde(rename = "clientOrderId")]
    client_order_id: String,
    side: String,
    symbol: String,
    status: OrderStatus,
    #[serde(rename = "time")]
    created_at: i64,
    #[serde(rename = "updateTime")]
    updated_at: i64,
    #[serde(rename = "type")]
    order_type: String,
    price: Decimal,
    #[serde(rename = "origQty")]
    quantity: Decimal,
    #[serde(rename = "executedQty")]
    executed_qty: Decimal,
}

/// Map a REST open-order row into the canonical event.
///
/// The listing carries no commission field; the canonical event gets zero.
pub fn from_open_order_row(payload: &serde_json::Value) -> Result<OrderEvent, EventError> {
    let wire: WireOpenOrderRow = serde_json::from_value(payload.clone())?;
    Ok(OrderEvent {
        client_order_id: wire.client_order_id,
        exchange_order_id: wire.order_id,
        side: wire.side.parse().map_err(EventError::Side)?,
        symbol: wire.symbol,
        status: wire.status,
        created_at: millis_to_utc(wire.created_at)?,
        updated_at: millis_to_utc(wire.updated_at)?,
        order_type: wire.order_type,
        price: wire.price,
        quantity: wire.quantity,
        executed_qty: wire.executed_qty,
        commission: Decimal::ZERO,
    })
}

// ---------------------------------------------------------------------------
// Account update (user-data stream, `"e": "outboundAccountPosition"`)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireBalanceEntry {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "f")]
    free: Decimal,
}

#[derive(Debug, Deserialize)]
struct WireAccountUpdate {
    #[serde(rename = "B")]
    balances: Vec<WireBalanceEntry>,
}

fn from_account_update(payload: &serde_json::Value) -> Result<BalanceUpdate, EventError> {
    let wire: WireAccountUpdate = serde_json::from_value(payload.clone())?;
    Ok(BalanceUpdate {
        free: wire
            .balances
            .into_iter()
            .map(|entry| (entry.asset, entry.free))
            .collect(),
    })
}

/// Decode one raw user-data stream message into a typed event.
///
/// Malformed payloads and unknown event kinds are dropped here with a log
/// line so a single bad message can never halt the stream handler.
pub fn parse_user_stream(text: &str) -> Option<UserStreamEvent> {
    let payload: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(error) => {
            warn!(%error, "dropping malformed user-data message");
            return None;
        }
    };

    match payload.get("e").and_then(|kind| kind.as_str()) {
        Some("executionReport") => match from_execution_report(&payload) {
            Ok(event) => Some(UserStreamEvent::Order(event)),
            Err(error) => {
                warn!(%error, "dropping malformed execution report");
                None
            }
        },
        Some("outboundAccountPosition") => match from_account_update(&payload) {
            Ok(update) => Some(UserStreamEvent::Balances(update)),
            Err(error) => {
                warn!(%error, "dropping malformed account update");
                None
            }
        },
        Some(kind) => {
            debug!(kind, "ignoring user-data event");
            None
        }
        None => None,
    }
}

/// Decode one raw market-data stream message into a price tick.
///
/// The market stream delivers candle updates (`"e": "kline"`); the close
/// price of the in-progress candle is the engine's reference price.
pub fn parse_market_stream(text: &str) -> Option<PriceTick> {
    #[derive(Deserialize)]
    struct WireKline {
        #[serde(rename = "s")]
        symbol: String,
        #[serde(rename = "c")]
        close: Decimal,
        #[serde(rename = "T")]
        close_time: i64,
    }
    #[derive(Deserialize)]
    struct WireKlineEnvelope {
        #[serde(rename = "k")]
        kline: WireKline,
    }

    match serde_json::from_str::<WireKlineEnvelope>(text) {
        Ok(envelope) => Some(PriceTick {
            symbol: envelope.kline.symbol,
            price: envelope.kline.close,
            timestamp: envelope.kline.close_time,
        }),
        Err(error) => {
            debug!(%error, "ignoring non-kline market message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;

    fn execution_report() -> serde_json::Value {
        json!({
            "e": "executionReport",
            "E": 1700000001000i64,
            "s": "PEPEUSDT",
            "c": "42_BUY",
            "C": "",
            "S": "BUY",
            "o": "LIMIT",
            "p": "100.00",
            "q": "1",
            "z": "1",
            "X": "FILLED",
            "i": 9912,
            "O": 1700000000000i64,
            "n": "0"
        })
    }

    #[test]
    fn test_stream_report_normalizes() {
        let event = from_execution_report(&execution_report()).unwrap();
        assert_eq!(event.client_order_id, "42_BUY");
        assert_eq!(event.exchange_order_id, Some(9912));
        assert_eq!(event.side, OrderSide::Buy);
        assert_eq!(event.status, OrderStatus::Filled);
        assert_eq!(event.price, dec!(100.00));
        assert_eq!(event.executed_qty, dec!(1));
        assert_eq!(event.commission, dec!(0));
        assert_eq!(event.created_at.timestamp_millis(), 1700000000000);
        assert_eq!(event.updated_at.timestamp_millis(), 1700000001000);
    }

    #[test]
    fn test_stream_report_prefers_cancel_replace_id() {
        let mut payload = execution_report();
        payload["C"] = json!("42_BUY");
        payload["c"] = json!("web_83abc");
        let event = from_execution_report(&payload).unwrap();
        assert_eq!(event.client_order_id, "42_BUY");
    }

    #[test]
    fn test_rest_row_normalizes_without_commission() {
        let payload = json!({
            "orderId": 77,
            "clientOrderId": "7_SELL",
            "side": "SELL",
            "symbol": "PEPEUSDT",
            "status": "NEW",
            "time": 1700000000000i64,
            "updateTime": 1700000002000i64,
            "type": "LIMIT",
            "price": "100.04",
            "origQty": "1",
            "executedQty": "0"
        });
        let event = from_open_order_row(&payload).unwrap();
        assert_eq!(event.client_order_id, "7_SELL");
        assert_eq!(event.side, OrderSide::Sell);
        assert_eq!(event.status, OrderStatus::New);
        assert_eq!(event.commission, dec!(0));
    }

    #[test]
    fn test_unknown_status_maps_to_unknown() {
        let mut payload = execution_report();
        payload["X"] = json!("TRADE_PREVENTION");
        let event = from_execution_report(&payload).unwrap();
        assert_eq!(event.status, OrderStatus::Unknown);
    }

    #[test]
    fn test_user_stream_dispatch() {
        let order = serde_json::to_string(&execution_report()).unwrap();
        assert!(matches!(
            parse_user_stream(&order),
            Some(UserStreamEvent::Order(_))
        ));

        let balances = json!({
            "e": "outboundAccountPosition",
            "B": [ {"a": "USDT", "f": "120.50", "l": "0"} ]
        })
        .to_string();
        match parse_user_stream(&balances) {
            Some(UserStreamEvent::Balances(update)) => {
                assert_eq!(update.free, vec![("USDT".to_string(), dec!(120.50))]);
            }
            other => panic!("expected balance update, got {other:?}"),
        }

        assert!(parse_user_stream("{not json").is_none());
        assert!(parse_user_stream("{\"e\":\"balanceUpdate\"}").is_none());
    }

    #[test]
    fn test_market_stream_parses_kline_close() {
        let text = json!({
            "e": "kline",
            "s": "PEPEUSDT",
            "k": {
                "s": "PEPEUSDT",
                "c": "101.37",
                "T": 1700000000999i64,
                "o": "101.30",
                "h": "101.40",
                "l": "101.25"
            }
        })
        .to_string();
        let tick = parse_market_stream(&text).unwrap();
        assert_eq!(tick.price, dec!(101.37));
        assert_eq!(tick.symbol, "PEPEUSDT");
        assert!(parse_market_stream("{\"result\":null}").is_none());
    }
}
