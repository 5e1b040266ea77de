//! Binance spot REST transport.
//!
//! Implements the three venue seams over `/api/v3`: order placement and
//! cancellation, user-data session (listen key) management, and the signed
//! open-orders listing. Account endpoints are HMAC-SHA256 signed over the
//! query string, with the API key in the `X-MBX-APIKEY` header.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, StatusCode};
use ring::hmac;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::VenueConfig;
use crate::events::{from_open_order_row, OrderEvent};
use crate::position::client_order_id;
use crate::types::OrderSide;
use crate::venue::{OpenOrdersApi, OrderRouter, SessionApi, VenueError};

const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const RECV_WINDOW_MS: u32 = 5_000;

/// HMAC-SHA256 of the query string, hex encoded, as the venue requires.
fn sign_query(secret: &str, query: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hex::encode(hmac::sign(&key, query.as_bytes()).as_ref())
}

pub struct BinanceRest {
    http: reqwest::Client,
    cfg: VenueConfig,
    symbol: String,
}

impl BinanceRest {
    pub fn new(cfg: VenueConfig, symbol: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
            symbol,
        }
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let mut query = params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        query.push_str(&format!(
            "&recvWindow={}&timestamp={}",
            RECV_WINDOW_MS,
            Utc::now().timestamp_millis()
        ));
        let signature = sign_query(&self.cfg.api_secret, &query);
        format!("{query}&signature={signature}")
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &str,
    ) -> Result<String, VenueError> {
        let url = format!("{}{}?{}", self.cfg.rest_url, path, query);
        let response = self
            .http
            .request(method, &url)
            .header(API_KEY_HEADER, &self.cfg.api_key)
            .send()
            .await
            .map_err(|error| VenueError::Transport(error.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| VenueError::Transport(error.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(VenueError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<String, VenueError> {
        self.send(method, path, &self.signed_query(params)).await
    }
}

#[async_trait]
impl OrderRouter for BinanceRest {
    async fn create_order(
        &self,
        price: Decimal,
        quantity: Decimal,
        side: OrderSide,
        position_id: u64,
    ) -> Result<(), VenueError> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("side", side.as_wire().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", quantity.to_string()),
            ("price", price.to_string()),
            ("newClientOrderId", client_order_id(position_id, side)),
        ];
        self.send_signed(Method::POST, "/api/v3/order", &params)
            .await?;
        debug!(position_id, ?side, %price, %quantity, "order placed");
        Ok(())
    }

    async fn cancel_order(&self, exchange_order_id: i64) -> Result<(), VenueError> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("orderId", exchange_order_id.to_string()),
        ];
        match self
            .send_signed(Method::DELETE, "/api/v3/order", &params)
            .await
        {
            Ok(_) => {
                debug!(exchange_order_id, "order cancelled");
                Ok(())
            }
            // Already gone (filled or cancelled elsewhere) is not a failure.
            Err(VenueError::Rejected { status, body })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                debug!(exchange_order_id, body, "cancel target already gone");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

#[derive(Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

#[async_trait]
impl SessionApi for BinanceRest {
    async fn create_session(&self) -> Result<String, VenueError> {
        let body = self.send(Method::POST, "/api/v3/userDataStream", "").await?;
        let parsed: ListenKeyResponse =
            serde_json::from_str(&body).map_err(|error| VenueError::Decode(error.to_string()))?;
        Ok(parsed.listen_key)
    }

    async fn keep_alive(&self, token: &str) -> Result<(), VenueError> {
        self.send(
            Method::PUT,
            "/api/v3/userDataStream",
            &format!("listenKey={token}"),
        )
        .await?;
        Ok(())
    }

    async fn invalidate(&self, token: &str) -> Result<(), VenueError> {
        self.send(
            Method::DELETE,
            "/api/v3/userDataStream",
            &format!("listenKey={token}"),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OpenOrdersApi for BinanceRest {
    async fn open_orders(&self) -> Result<Vec<OrderEvent>, VenueError> {
        let params = [("symbol", self.symbol.clone())];
        let body = self
            .send_signed(Method::GET, "/api/v3/openOrders", &params)
            .await?;
        let rows: Vec<serde_json::Value> =
            serde_json::from_str(&body).map_err(|error| VenueError::Decode(error.to_string()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            match from_open_order_row(row) {
                Ok(event) => events.push(event),
                Err(error) => warn!(%error, "skipping malformed open-order row"),
            }
        }
        Ok(events)
    }
}
