//! Venue collaborator seams.
//!
//! The engine never talks to the venue directly: it pushes [`OrderCommand`]s
//! onto a channel drained by the router task, which calls an [`OrderRouter`]
//! implementation fire-and-forget. Acknowledgements arrive later as
//! independent execution reports on the user-data stream and are never
//! awaited here. The session and open-orders surfaces are separate traits so
//! tests and alternative transports can swap them independently.

pub mod binance;

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::OrderEvent;
use crate::types::OrderSide;

/// Errors surfaced by venue transport implementations.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("venue rejected request (http {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed venue response: {0}")]
    Decode(String),
}

/// An order instruction emitted by the position engine.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderCommand {
    Create {
        price: Decimal,
        quantity: Decimal,
        side: OrderSide,
        position_id: u64,
    },
    Cancel {
        exchange_order_id: i64,
    },
}

/// Outbound order management. The instrument is implicit from configuration.
#[async_trait]
pub trait OrderRouter: Send + Sync {
    /// Place a limit order correlated to `position_id` via the client order id.
    async fn create_order(
        &self,
        price: Decimal,
        quantity: Decimal,
        side: OrderSide,
        position_id: u64,
    ) -> Result<(), VenueError>;

    /// Cancel a live order by its venue-assigned id.
    async fn cancel_order(&self, exchange_order_id: i64) -> Result<(), VenueError>;
}

/// Short-lived user-data session tokens (listen keys).
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self) -> Result<String, VenueError>;
    async fn keep_alive(&self, token: &str) -> Result<(), VenueError>;
    async fn invalidate(&self, token: &str) -> Result<(), VenueError>;
}

/// Authoritative listing of currently open orders, already normalized.
#[async_trait]
pub trait OpenOrdersApi: Send + Sync {
    async fn open_orders(&self) -> Result<Vec<OrderEvent>, VenueError>;
}

/// Drain engine commands into the order router.
///
/// Failures are logged and dropped: the reconciliation pass heals whatever a
/// lost placement or cancel leaves behind.
pub fn spawn_router(
    router: Arc<dyn OrderRouter>,
    mut commands: mpsc::UnboundedReceiver<OrderCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            debug!(?command, "dispatching order command");
            let result = match &command {
                OrderCommand::Create {
                    price,
                    quantity,
                    side,
                    position_id,
                } => {
                    router
                        .create_order(*price, *quantity, *side, *position_id)
                        .await
                }
                OrderCommand::Cancel { exchange_order_id } => {
                    router.cancel_order(*exchange_order_id).await
                }
            };
            if let Err(error) = result {
                warn!(?command, %error, "order command failed");
            }
        }
    })
}
