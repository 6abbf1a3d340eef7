use crate::order::{ClientOrderId, VenueOrderId};
use chrono::{DateTime, Utc};
use derive_more::Constructor;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vortex_instrument::{Side, asset::AssetName, symbol::SymbolId};

/// Execution fees denominated in `asset` (commonly the quote asset).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Fees {
    pub asset: Option<AssetName>,
    pub amount: Decimal,
}

impl Default for Fees {
    fn default() -> Self {
        Self {
            asset: None,
            amount: Decimal::ZERO,
        }
    }
}

impl Fees {
    pub fn quote_fees(asset: AssetName, amount: Decimal) -> Self {
        Self {
            asset: Some(asset),
            amount,
        }
    }
}

/// Normalised execution fill.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Fill {
    pub cid: ClientOrderId,
    pub venue_order_id: VenueOrderId,
    pub symbol: SymbolId,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub fees: Fees,
    pub time: DateTime<Utc>,
}

impl Fill {
    /// Value of the fill in the quote asset.
    pub fn value_quote(&self) -> Decimal {
        self.price * self.qty
    }
}
