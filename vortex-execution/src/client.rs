use crate::{
    balance::AssetBalance,
    error::ExecutionError,
    order::{ClientOrderId, OrderStatus, PlaceOrderRequest, VenueOrderId},
    reconcile::{ReconcileOrder, ReconcileReport},
    trade::Fill,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Constructor, From};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use vortex_instrument::venue::Venue;
use vortex_integration::Snapshot;

/// Venue acknowledgement of a place or cancel request.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct ExecutionReport {
    pub cid: ClientOrderId,
    pub venue_order_id: Option<VenueOrderId>,
    pub status: OrderStatus,
    pub time: DateTime<Utc>,
}

/// Event pushed by a venue user stream or completed by a venue request on
/// the I/O executor.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, From)]
pub enum UserEvent {
    Fill(Fill),
    OrderUpdate(ExecutionReport),
    BalanceSnapshot(Snapshot<Vec<AssetBalance>>),
    /// A venue request failed (including deadline expiry).
    VenueError {
        cid: Option<ClientOrderId>,
        error: ExecutionError,
    },
    Reconciliation(ReconcileReport),
}

/// Capability set implemented by every live execution venue adapter.
///
/// The engine never awaits these from the event loop: requests are posted to
/// the I/O executor and completions return as events. Each request carries a
/// deadline enforced by the adapter (`deadline_ms`); expiry surfaces as
/// [`ExecutionError::Timeout`].
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    fn venue(&self) -> Venue;

    async fn place(
        &self,
        request: &PlaceOrderRequest,
        deadline_ms: u64,
    ) -> Result<ExecutionReport, ExecutionError>;

    async fn cancel(
        &self,
        cid: &ClientOrderId,
        deadline_ms: u64,
    ) -> Result<ExecutionReport, ExecutionError>;

    async fn query(&self, cid: &ClientOrderId) -> Result<OrderStatus, ExecutionError>;

    /// Stream of fills/updates pushed by the venue.
    fn user_events(&self) -> BoxStream<'static, UserEvent>;

    /// Open orders as seen by the venue, for reconciliation.
    async fn open_orders(&self) -> Result<Vec<ReconcileOrder>, ExecutionError>;

    /// Balances as seen by the venue, for reconciliation.
    async fn balances(&self) -> Result<Vec<AssetBalance>, ExecutionError>;
}

impl ExecutionReport {
    pub fn accepted(
        cid: ClientOrderId,
        venue_order_id: VenueOrderId,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            cid,
            venue_order_id: Some(venue_order_id),
            status: OrderStatus::New,
            time,
        }
    }
}
