use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::error;
use vortex_execution::balance::{AssetBalance, Balance};
use vortex_instrument::asset::AssetName;

/// Authoritative per-asset balance ledger.
///
/// Every mutation preserves: `free >= 0`, `locked >= 0`, and per-asset
/// `locked` equal to the sum of open-order reservations. Assets are created
/// lazily on first use; iteration order is insertion order so snapshots
/// serialize deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct BalanceLedger {
    balances: IndexMap<AssetName, Balance>,
}

impl BalanceLedger {
    pub fn new<Iter>(initial: Iter) -> Self
    where
        Iter: IntoIterator<Item = (AssetName, Decimal)>,
    {
        Self {
            balances: initial
                .into_iter()
                .map(|(asset, amount)| (asset, Balance::all_free(amount)))
                .collect(),
        }
    }

    pub fn balance(&self, asset: &AssetName) -> Balance {
        self.balances.get(asset).copied().unwrap_or_default()
    }

    /// Credit `free` by `amount`, creating the asset entry if required.
    pub fn credit_free(&mut self, asset: &AssetName, amount: Decimal) {
        let balance = self.entry(asset);
        balance.free += amount;
    }

    /// Move `amount` from `free` to `locked`, failing without mutation if
    /// `free` would go negative.
    pub fn reserve(&mut self, asset: &AssetName, amount: Decimal) -> Result<(), Decimal> {
        let balance = self.entry(asset);

        if balance.free < amount {
            return Err(balance.free);
        }

        balance.free -= amount;
        balance.locked += amount;
        Ok(())
    }

    /// Move `amount` from `locked` back to `free`, reversing a reservation.
    pub fn release(&mut self, asset: &AssetName, amount: Decimal) {
        let balance = self.entry(asset);

        if balance.locked < amount {
            error!(
                %asset,
                locked = %balance.locked,
                release = %amount,
                "balance release exceeds locked - clamping"
            );
            balance.free += balance.locked;
            balance.locked = Decimal::ZERO;
            return;
        }

        balance.locked -= amount;
        balance.free += amount;
    }

    /// Spend `amount` out of `locked`, settling a reserved fill leg.
    pub fn spend_locked(&mut self, asset: &AssetName, amount: Decimal) {
        let balance = self.entry(asset);

        if balance.locked < amount {
            error!(
                %asset,
                locked = %balance.locked,
                spend = %amount,
                "balance spend exceeds locked - clamping"
            );
            balance.locked = Decimal::ZERO;
            return;
        }

        balance.locked -= amount;
    }

    /// Debit `free` by `amount` (eg/ fees), clamping at zero with an error.
    pub fn debit_free(&mut self, asset: &AssetName, amount: Decimal) {
        let balance = self.entry(asset);

        if balance.free < amount {
            error!(
                %asset,
                free = %balance.free,
                debit = %amount,
                "balance debit exceeds free - clamping"
            );
            balance.free = Decimal::ZERO;
            return;
        }

        balance.free -= amount;
    }

    /// Overwrite the balance of an asset, eg/ adopting the venue view during
    /// reconciliation or rehydrating from a snapshot.
    pub fn set(&mut self, asset: AssetName, balance: Balance) {
        self.balances.insert(asset, balance);
    }

    /// Point-in-time snapshot of all balances.
    pub fn snapshot(&self, time: chrono::DateTime<chrono::Utc>) -> Vec<AssetBalance> {
        self.balances
            .iter()
            .map(|(asset, balance)| AssetBalance::new(asset.clone(), *balance, time))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AssetName, &Balance)> + '_ {
        self.balances.iter()
    }

    /// Sum of `free + locked` across all assets (ledger invariant checks).
    pub fn total(&self, asset: &AssetName) -> Decimal {
        self.balance(asset).total()
    }

    fn entry(&mut self, asset: &AssetName) -> &mut Balance {
        self.balances.entry(asset.clone()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn usdt() -> AssetName {
        AssetName::from_name("USDT")
    }

    #[test]
    fn test_reserve_fails_without_mutation_when_free_insufficient() {
        let mut ledger = BalanceLedger::new(vec![(usdt(), dec!(100))]);

        assert_eq!(ledger.reserve(&usdt(), dec!(150)), Err(dec!(100)));
        assert_eq!(ledger.balance(&usdt()), Balance::new(dec!(100), dec!(0)));
    }

    #[test]
    fn test_reserve_release_round_trip_preserves_total() {
        let mut ledger = BalanceLedger::new(vec![(usdt(), dec!(100))]);

        ledger.reserve(&usdt(), dec!(40)).unwrap();
        assert_eq!(ledger.balance(&usdt()), Balance::new(dec!(60), dec!(40)));
        assert_eq!(ledger.total(&usdt()), dec!(100));

        ledger.release(&usdt(), dec!(40));
        assert_eq!(ledger.balance(&usdt()), Balance::new(dec!(100), dec!(0)));
    }

    #[test]
    fn test_spend_locked_settles_reserved_leg() {
        let mut ledger = BalanceLedger::new(vec![(usdt(), dec!(100))]);
        ledger.reserve(&usdt(), dec!(40)).unwrap();

        ledger.spend_locked(&usdt(), dec!(40));
        assert_eq!(ledger.balance(&usdt()), Balance::new(dec!(60), dec!(0)));
    }
}
