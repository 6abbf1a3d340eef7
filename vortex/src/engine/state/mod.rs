use crate::engine::state::{
    balance::BalanceLedger,
    order::OrderManager,
    position::{CostBasis, Position},
};
use fnv::FnvHashMap;
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vortex_execution::order::VenueOrderId;
use vortex_instrument::{asset::AssetName, symbol::SymbolId};

/// Authoritative per-asset balance ledger.
pub mod balance;

/// Pending orders and order state records.
pub mod order;

/// Derived per-symbol positions.
pub mod position;

/// Quote-stable assets valued 1:1 when computing account equity.
const STABLE_ASSETS: [&str; 4] = ["USDT", "USDC", "BUSD", "USD"];

/// Whether the engine currently admits new orders.
///
/// Trading is disabled by the circuit breaker and during the shutdown
/// sequence.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Deserialize, Serialize,
)]
pub enum TradingState {
    #[default]
    Enabled,
    Disabled,
}

/// Authoritative engine state: balances, orders, positions and reference
/// prices.
///
/// Mutated only through the dispatch loop (single writer); all invariants in
/// the balance ledger and order manager hold after every mutation.
#[derive(Debug, Default)]
pub struct EngineState {
    pub balances: BalanceLedger,
    pub orders: OrderManager,
    pub trading: TradingState,
    positions: IndexMap<SymbolId, Position>,
    cost_basis: FnvHashMap<SymbolId, CostBasis>,
    prices: IndexMap<SymbolId, Decimal>,
    venue_order_sequence: u64,
}

impl EngineState {
    pub fn new(balances: BalanceLedger) -> Self {
        Self {
            balances,
            ..Default::default()
        }
    }

    /// Configure the cost basis used for a symbol's position accounting.
    pub fn set_cost_basis(&mut self, symbol: SymbolId, basis: CostBasis) {
        self.cost_basis.insert(symbol, basis);
    }

    /// Allocate the next monotone venue order id.
    pub fn next_venue_order_id(&mut self) -> VenueOrderId {
        self.venue_order_sequence += 1;
        VenueOrderId::new(self.venue_order_sequence)
    }

    pub fn venue_order_sequence(&self) -> u64 {
        self.venue_order_sequence
    }

    /// Restore the venue order id counter from a snapshot.
    pub fn restore_venue_order_sequence(&mut self, sequence: u64) {
        self.venue_order_sequence = sequence;
    }

    pub fn position(&self, symbol: &SymbolId) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn position_mut(&mut self, symbol: &SymbolId) -> &mut Position {
        let basis = self
            .cost_basis
            .get(symbol)
            .copied()
            .unwrap_or_default();

        self.positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::new(basis))
    }

    pub fn positions_iter(&self) -> impl Iterator<Item = (&SymbolId, &Position)> + '_ {
        self.positions.iter()
    }

    /// Last known price for a symbol (top-of-book mid, trade, or restored
    /// from a snapshot).
    pub fn price(&self, symbol: &SymbolId) -> Option<Decimal> {
        self.prices.get(symbol).copied()
    }

    pub fn update_price(&mut self, symbol: &SymbolId, price: Decimal) {
        self.prices.insert(symbol.clone(), price);
    }

    pub fn prices_iter(&self) -> impl Iterator<Item = (&SymbolId, &Decimal)> + '_ {
        self.prices.iter()
    }

    /// Account equity: quote-stable balances at par plus other assets marked
    /// at their `<ASSET>USDT` reference price, where known.
    pub fn equity(&self) -> Decimal {
        self.balances
            .iter()
            .map(|(asset, balance)| balance.total() * self.asset_mark(asset))
            .sum()
    }

    /// Gross position notional across all symbols, marked at the last known
    /// price.
    pub fn total_position_notional(&self) -> Decimal {
        self.positions
            .iter()
            .map(|(symbol, position)| {
                self.price(symbol)
                    .map(|price| position.size.abs() * price)
                    .unwrap_or(Decimal::ZERO)
            })
            .sum()
    }

    /// Realized PnL summed across all positions.
    pub fn realized_pnl(&self) -> Decimal {
        self.positions
            .values()
            .map(|position| position.realized_pnl)
            .sum()
    }

    /// Verify the ledger invariants: non-negative balances, per-asset
    /// `locked` equal to the sum of open-order reservations, and no pending
    /// order in a terminal status.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut reserved: FnvHashMap<AssetName, Decimal> = FnvHashMap::default();

        for order in self.orders.pending_iter() {
            *reserved
                .entry(order.reservation.asset.clone())
                .or_default() += order.reservation.amount;

            if self
                .orders
                .record(&order.request.cid)
                .is_some_and(|record| record.status.is_terminal())
            {
                return Err(format!(
                    "pending order {} has terminal status",
                    order.request.cid
                ));
            }
        }

        for (asset, balance) in self.balances.iter() {
            if balance.free < Decimal::ZERO || balance.locked < Decimal::ZERO {
                return Err(format!("negative balance for {asset}: {balance:?}"));
            }

            let total_reserved = reserved.get(asset).copied().unwrap_or_default();
            if balance.locked != total_reserved {
                return Err(format!(
                    "locked {} for {asset} does not equal reserved {total_reserved}",
                    balance.locked
                ));
            }
        }

        Ok(())
    }

    fn asset_mark(&self, asset: &AssetName) -> Decimal {
        if STABLE_ASSETS.contains(&asset.as_str()) {
            return Decimal::ONE;
        }

        SymbolId::new(format!("{}USDT", asset.as_str()))
            .ok()
            .and_then(|symbol| self.price(&symbol))
            .unwrap_or(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use vortex_instrument::Side;

    #[test]
    fn test_venue_order_ids_are_monotone() {
        let mut state = EngineState::default();
        assert_eq!(state.next_venue_order_id(), VenueOrderId::new(1));
        assert_eq!(state.next_venue_order_id(), VenueOrderId::new(2));

        state.restore_venue_order_sequence(41);
        assert_eq!(state.next_venue_order_id(), VenueOrderId::new(42));
    }

    #[test]
    fn test_equity_marks_base_assets_at_reference_price() {
        let mut state = EngineState::new(BalanceLedger::new(vec![
            (AssetName::from_name("USDT"), dec!(1_000)),
            (AssetName::from_name("BTC"), dec!(0.5)),
        ]));

        // BTC not marked yet: contributes zero
        assert_eq!(state.equity(), dec!(1_000));

        state.update_price(&SymbolId::new("BTCUSDT").unwrap(), dec!(50_000));
        assert_eq!(state.equity(), dec!(26_000));
    }

    #[test]
    fn test_position_mut_uses_configured_cost_basis() {
        let mut state = EngineState::default();
        let symbol = SymbolId::new("ETHUSDT").unwrap();
        state.set_cost_basis(symbol.clone(), position::CostBasis::Fifo);

        let position = state.position_mut(&symbol);
        assert_eq!(position.basis(), position::CostBasis::Fifo);

        position.apply_fill(Side::Buy, dec!(1), dec!(3_000));
        assert_eq!(state.position(&symbol).unwrap().size, dec!(1));
    }
}
