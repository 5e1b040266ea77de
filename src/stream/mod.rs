//! WebSocket stream plumbing.
//!
//! Two long-lived connections feed the process: the public market stream
//! (candle updates for the traded symbol) and the private user-data stream
//! (execution reports and balance snapshots, addressed by a listen-key
//! session token). [`StreamSupervisor`] owns both reconnect loops; raw text
//! frames flow through a [`Connector`] seam so tests can script a session
//! without a network. Decoded messages converge on one [`StreamEvent`]
//! channel drained by the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::balance::BalanceTracker;
use crate::config::TradeConfig;
use crate::events::{
    parse_market_stream, parse_user_stream, BalanceUpdate, OrderEvent, UserStreamEvent,
};
use crate::position::PositionEngine;
use crate::trigger::BandTrigger;
use crate::types::PriceTick;
use crate::venue::SessionApi;

/// Delay between a disconnect and the next connection attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
}

/// Seam over a live WebSocket connection.
///
/// `open` yields a channel of raw text frames; the channel closing means the
/// connection is gone and the caller should reconnect. Implementations
/// answer protocol pings themselves.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<mpsc::Receiver<String>, StreamError>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn open(&self, url: &str) -> Result<mpsc::Receiver<String>, StreamError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|error| StreamError::Connect(error.to_string()))?;
        let (mut write, mut read) = stream.split();
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if tx.send(text.to_string()).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if let Err(error) = write.send(Message::Pong(payload)).await {
                            warn!(%error, "failed to answer ping");
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "websocket closed by server");
                        return;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        error!(%error, "websocket read failed");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Decoded message from either stream, ready for dispatch.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Tick(PriceTick),
    Order(OrderEvent),
    Balances(BalanceUpdate),
}

/// Owns the market and user-data reconnect loops.
pub struct StreamSupervisor {
    connector: Arc<dyn Connector>,
    session: Arc<dyn SessionApi>,
    cfg: TradeConfig,
    ws_url: String,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        session: Arc<dyn SessionApi>,
        cfg: TradeConfig,
        ws_url: String,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            connector,
            session,
            cfg,
            ws_url,
            events,
        }
    }

    /// Market stream: candle updates for the traded symbol, reconnecting
    /// forever. A lost tick only delays the trigger; nothing is replayed.
    pub fn spawn_market(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let url = format!(
            "{}/ws/{}@kline_1s",
            this.ws_url,
            this.cfg.symbol.to_lowercase()
        );
        tokio::spawn(async move {
            loop {
                match this.connector.open(&url).await {
                    Ok(mut frames) => {
                        info!(url = %url, "market stream connected");
                        while let Some(text) = frames.recv().await {
                            if let Some(tick) = parse_market_stream(&text) {
                                if this.events.send(StreamEvent::Tick(tick)).is_err() {
                                    return;
                                }
                            }
                        }
                        warn!("market stream disconnected");
                    }
                    Err(error) => {
                        error!(%error, "market stream connect failed");
                    }
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        })
    }

    /// User-data stream: execution reports and balance snapshots.
    ///
    /// Each connection gets a fresh session token, kept alive on the
    /// configured cadence and invalidated on disconnect so a reconnect never
    /// inherits a half-expired token.
    pub fn spawn_user(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let token = match this.session.create_session().await {
                    Ok(token) => token,
                    Err(error) => {
                        error!(%error, "user-data session creation failed");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };
                let url = format!("{}/ws/{}", this.ws_url, token);
                match this.connector.open(&url).await {
                    Ok(mut frames) => {
                        info!("user-data stream connected");
                        let mut keep_alive = tokio::time::interval(this.cfg.keep_alive_interval);
                        keep_alive.tick().await; // skip the immediate tick
                        loop {
                            tokio::select! {
                                frame = frames.recv() => {
                                    let Some(text) = frame else {
                                        warn!("user-data stream disconnected");
                                        break;
                                    };
                                    match parse_user_stream(&text) {
                                        Some(UserStreamEvent::Order(event)) => {
                                            if this.events.send(StreamEvent::Order(event)).is_err() {
                                                return;
                                            }
                                        }
                                        Some(UserStreamEvent::Balances(update)) => {
                                            if this.events.send(StreamEvent::Balances(update)).is_err() {
                                                return;
                                            }
                                        }
                                        None => {}
                                    }
                                }
                                _ = keep_alive.tick() => {
                                    if let Err(error) = this.session.keep_alive(&token).await {
                                        warn!(%error, "session keep-alive failed");
                                    }
                                }
                            }
                        }
                    }
                    Err(error) => {
                        error!(%error, "user-data stream connect failed");
                    }
                }
                if let Err(error) = this.session.invalidate(&token).await {
                    debug!(%error, "session invalidation failed");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        })
    }
}

/// Drain the merged event channel into the engine, the balance cache, the
/// trigger, and the reference-price watch.
pub fn spawn_dispatcher(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    engine: Arc<PositionEngine>,
    balances: Arc<BalanceTracker>,
    trigger: Arc<BandTrigger>,
    reference_price: watch::Sender<Option<Decimal>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Tick(tick) => {
                    let _ = reference_price.send(Some(tick.price));
                    trigger.on_tick(&tick);
                }
                StreamEvent::Order(order) => engine.on_order_event(&order),
                StreamEvent::Balances(update) => balances.apply(update),
            }
        }
        info!("stream event channel closed, dispatcher stopping");
    })
}
