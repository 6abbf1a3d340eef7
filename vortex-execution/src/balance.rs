use chrono::{DateTime, Utc};
use derive_more::Constructor;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vortex_instrument::asset::AssetName;

/// Balance of a single asset, split into the spendable `free` amount and the
/// `locked` amount reserved against open orders.
///
/// Both components are non-negative; `free + locked` is the ledger total.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Default, Deserialize, Serialize, Constructor,
)]
pub struct Balance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    /// Construct a [`Balance`] with the full amount `free`.
    pub fn all_free(amount: Decimal) -> Self {
        Self {
            free: amount,
            locked: Decimal::ZERO,
        }
    }

    /// Ledger total of this balance.
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// [`Balance`] associated with its asset and last update time.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct AssetBalance {
    pub asset: AssetName,
    pub balance: Balance,
    pub time_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_total_sums_free_and_locked() {
        let balance = Balance::new(dec!(75.5), dec!(24.5));
        assert_eq!(balance.total(), dec!(100));
        assert_eq!(Balance::all_free(dec!(10)).locked, Decimal::ZERO);
    }
}
