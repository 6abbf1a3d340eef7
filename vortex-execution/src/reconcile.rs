use crate::{
    balance::{AssetBalance, Balance},
    order::{ClientOrderId, OrderStatus},
};
use chrono::{DateTime, Utc};
use derive_more::Constructor;
use fnv::FnvHashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use vortex_instrument::{asset::AssetName, venue::Venue};

/// Order view used for reconciliation, from either side of the diff.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct ReconcileOrder {
    pub cid: ClientOrderId,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
}

/// A single divergence between local state and the authoritative venue.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum Divergence {
    /// Venue reports an open order the engine does not track. Local state is
    /// corrected by adopting the venue order.
    OrderMissingLocally(ReconcileOrder),

    /// Engine tracks an open order the venue does not report. Local state is
    /// corrected by expiring the order, unless an internal cancel is in
    /// flight (authoritative-local).
    OrderMissingOnVenue { cid: ClientOrderId },

    /// Both sides track the order but disagree on its state.
    OrderStateDivergence {
        cid: ClientOrderId,
        local: ReconcileOrder,
        venue: ReconcileOrder,
    },

    /// Balances disagree for an asset.
    BalanceDivergence {
        asset: AssetName,
        local: Balance,
        venue: Balance,
    },
}

/// Result of diffing local order/balance state against the venue.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct ReconcileReport {
    pub venue: Venue,
    pub time: DateTime<Utc>,
    pub divergences: Vec<Divergence>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.divergences.is_empty()
    }
}

/// Diff local open orders and balances against the venue view.
///
/// Orders are authoritative-venue, except orders with an internal cancel in
/// flight (`cancels_in_flight`), which are authoritative-local and excluded
/// from the diff.
pub fn reconcile(
    venue: Venue,
    time: DateTime<Utc>,
    local_orders: &[ReconcileOrder],
    venue_orders: &[ReconcileOrder],
    local_balances: &[AssetBalance],
    venue_balances: &[AssetBalance],
    cancels_in_flight: &HashSet<ClientOrderId>,
) -> ReconcileReport {
    let mut divergences = Vec::new();

    let local_by_cid: FnvHashMap<&ClientOrderId, &ReconcileOrder> =
        local_orders.iter().map(|order| (&order.cid, order)).collect();
    let venue_by_cid: FnvHashMap<&ClientOrderId, &ReconcileOrder> =
        venue_orders.iter().map(|order| (&order.cid, order)).collect();

    for venue_order in venue_orders {
        match local_by_cid.get(&venue_order.cid) {
            None => divergences.push(Divergence::OrderMissingLocally(venue_order.clone())),
            Some(local_order) if *local_order != venue_order => {
                divergences.push(Divergence::OrderStateDivergence {
                    cid: venue_order.cid.clone(),
                    local: (*local_order).clone(),
                    venue: venue_order.clone(),
                });
            }
            Some(_) => {}
        }
    }

    for local_order in local_orders {
        if venue_by_cid.contains_key(&local_order.cid) {
            continue;
        }
        if cancels_in_flight.contains(&local_order.cid) {
            // Internal cancel in flight: local state is authoritative
            continue;
        }
        divergences.push(Divergence::OrderMissingOnVenue {
            cid: local_order.cid.clone(),
        });
    }

    let local_balance_by_asset: FnvHashMap<&AssetName, Balance> = local_balances
        .iter()
        .map(|balance| (&balance.asset, balance.balance))
        .collect();

    for venue_balance in venue_balances {
        let local = local_balance_by_asset
            .get(&venue_balance.asset)
            .copied()
            .unwrap_or_default();

        if local != venue_balance.balance {
            divergences.push(Divergence::BalanceDivergence {
                asset: venue_balance.asset.clone(),
                local,
                venue: venue_balance.balance,
            });
        }
    }

    ReconcileReport::new(venue, time, divergences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cid(id: &str) -> ClientOrderId {
        ClientOrderId::new(id).unwrap()
    }

    fn order(id: &str, status: OrderStatus, executed: Decimal) -> ReconcileOrder {
        ReconcileOrder::new(cid(id), status, executed)
    }

    #[test]
    fn test_reconcile_clean_when_views_agree() {
        let orders = vec![order("c1", OrderStatus::New, dec!(0))];
        let report = reconcile(
            Venue::Binance,
            Utc::now(),
            &orders,
            &orders,
            &[],
            &[],
            &HashSet::new(),
        );
        assert!(report.is_clean());
    }

    #[test]
    fn test_reconcile_detects_order_divergences() {
        let local = vec![
            order("c1", OrderStatus::New, dec!(0)),
            order("c2", OrderStatus::New, dec!(0)),
        ];
        let venue = vec![
            order("c1", OrderStatus::PartiallyFilled, dec!(0.5)),
            order("c3", OrderStatus::New, dec!(0)),
        ];

        let report = reconcile(
            Venue::Binance,
            Utc::now(),
            &local,
            &venue,
            &[],
            &[],
            &HashSet::new(),
        );

        assert_eq!(report.divergences.len(), 3);
        assert!(report.divergences.iter().any(|divergence| matches!(
            divergence,
            Divergence::OrderStateDivergence { cid: c, .. } if *c == cid("c1")
        )));
        assert!(report.divergences.iter().any(|divergence| matches!(
            divergence,
            Divergence::OrderMissingOnVenue { cid: c } if *c == cid("c2")
        )));
        assert!(report.divergences.iter().any(|divergence| matches!(
            divergence,
            Divergence::OrderMissingLocally(venue_order) if venue_order.cid == cid("c3")
        )));
    }

    #[test]
    fn test_reconcile_in_flight_cancels_are_authoritative_local() {
        let local = vec![order("c1", OrderStatus::New, dec!(0))];
        let cancels = HashSet::from([cid("c1")]);

        let report = reconcile(
            Venue::Binance,
            Utc::now(),
            &local,
            &[],
            &[],
            &[],
            &cancels,
        );
        assert!(report.is_clean());
    }

    #[test]
    fn test_reconcile_detects_balance_divergence() {
        let now = Utc::now();
        let local = vec![AssetBalance::new(
            AssetName::from_name("USDT"),
            Balance::new(dec!(100), dec!(0)),
            now,
        )];
        let venue = vec![AssetBalance::new(
            AssetName::from_name("USDT"),
            Balance::new(dec!(90), dec!(10)),
            now,
        )];

        let report = reconcile(
            Venue::Binance,
            now,
            &[],
            &[],
            &local,
            &venue,
            &HashSet::new(),
        );
        assert_eq!(report.divergences.len(), 1);
    }
}
