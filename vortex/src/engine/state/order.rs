use chrono::{DateTime, Utc};
use derive_more::Constructor;
use fnv::FnvHashMap;
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vortex_execution::order::{
    ClientOrderId, OrderStateRecord, PlaceOrderRequest, VenueOrderId,
};
use vortex_instrument::asset::AssetName;

/// Asset and amount moved from `free` to `locked` when an order was
/// accepted, guaranteeing settlement of the unfilled remainder.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Reservation {
    pub asset: AssetName,
    pub amount: Decimal,
}

/// An accepted order, alive from acceptance until its terminal transition.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct PendingOrder {
    pub request: PlaceOrderRequest,
    pub time_accepted: DateTime<Utc>,
    /// Simulated venue only: time the scheduled fill becomes due.
    pub time_due_fill: Option<DateTime<Utc>>,
    pub reservation: Reservation,
    pub venue_order_id: VenueOrderId,
}

/// Pending orders and observable order state records, indexed by
/// [`ClientOrderId`].
///
/// Pending orders preserve insertion order so snapshots serialize
/// deterministically. Records persist after terminal transitions for
/// duplicate rejection and lookups.
#[derive(Debug, Clone, Default)]
pub struct OrderManager {
    pending: IndexMap<ClientOrderId, PendingOrder>,
    records: FnvHashMap<ClientOrderId, OrderStateRecord>,
    /// Cancels sent to a live venue awaiting acknowledgement. These are
    /// authoritative-local during reconciliation.
    cancels_in_flight: std::collections::HashSet<ClientOrderId>,
}

impl OrderManager {
    /// True if the client order id has ever been seen (pending or terminal).
    pub fn contains(&self, cid: &ClientOrderId) -> bool {
        self.records.contains_key(cid)
    }

    pub fn pending(&self, cid: &ClientOrderId) -> Option<&PendingOrder> {
        self.pending.get(cid)
    }

    pub fn record(&self, cid: &ClientOrderId) -> Option<&OrderStateRecord> {
        self.records.get(cid)
    }

    pub fn record_mut(&mut self, cid: &ClientOrderId) -> Option<&mut OrderStateRecord> {
        self.records.get_mut(cid)
    }

    pub fn insert_pending(&mut self, order: PendingOrder, record: OrderStateRecord) {
        self.records.insert(order.request.cid.clone(), record);
        self.pending.insert(order.request.cid.clone(), order);
    }

    /// Insert a record with no pending order, eg/ a rejection.
    pub fn insert_record(&mut self, record: OrderStateRecord) {
        self.records.insert(record.cid.clone(), record);
    }

    pub fn pending_mut(&mut self, cid: &ClientOrderId) -> Option<&mut PendingOrder> {
        self.pending.get_mut(cid)
    }

    pub fn remove_pending(&mut self, cid: &ClientOrderId) -> Option<PendingOrder> {
        self.pending.shift_remove(cid)
    }

    pub fn pending_iter(&self) -> impl Iterator<Item = &PendingOrder> + '_ {
        self.pending.values()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Client order ids of simulated-venue orders whose scheduled fill is
    /// due at `now`, in acceptance order.
    pub fn due_fills(&self, now: DateTime<Utc>) -> Vec<ClientOrderId> {
        self.pending
            .values()
            .filter(|order| {
                order
                    .time_due_fill
                    .is_some_and(|due| due <= now)
            })
            .map(|order| order.request.cid.clone())
            .collect()
    }

    pub fn mark_cancel_in_flight(&mut self, cid: ClientOrderId) {
        self.cancels_in_flight.insert(cid);
    }

    pub fn clear_cancel_in_flight(&mut self, cid: &ClientOrderId) {
        self.cancels_in_flight.remove(cid);
    }

    pub fn cancels_in_flight(&self) -> &std::collections::HashSet<ClientOrderId> {
        &self.cancels_in_flight
    }

    /// Restore pending orders and their records from a snapshot.
    pub fn restore<Iter>(&mut self, pending: Iter)
    where
        Iter: IntoIterator<Item = PendingOrder>,
    {
        for order in pending {
            let record = OrderStateRecord::new_accepted(
                order.request.cid.clone(),
                order.venue_order_id,
                order.time_accepted,
            );
            self.insert_pending(order, record);
        }
    }
}
