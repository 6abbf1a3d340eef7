use chrono::{DateTime, Utc};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

/// Provides an abstract collection of shared per-venue-per-symbol
/// [`OrderBook`]s.
pub mod map;

/// Snapshot+delta sequencing with gap detection and stale-buffer replay.
pub mod sequenced;

/// Normalised local [`OrderBook`].
///
/// `sequence` strictly increases across applied updates. Both sides hold
/// price-sorted levels (bids descending, asks ascending); level price
/// equality is exact, relying on venue-canonical tick alignment.
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
pub struct OrderBook {
    pub sequence: u64,
    pub time_last_update: Option<DateTime<Utc>>,
    bids: OrderBookSide<Bids>,
    asks: OrderBookSide<Asks>,
}

impl OrderBook {
    /// Construct a new sorted [`OrderBook`].
    ///
    /// Note that the passed bid and ask levels do not need to be pre-sorted.
    pub fn new<IterBids, IterAsks, L>(
        sequence: u64,
        time_last_update: Option<DateTime<Utc>>,
        bids: IterBids,
        asks: IterAsks,
    ) -> Self
    where
        IterBids: IntoIterator<Item = L>,
        IterAsks: IntoIterator<Item = L>,
        L: Into<Level>,
    {
        Self {
            sequence,
            time_last_update,
            bids: OrderBookSide::bids(bids),
            asks: OrderBookSide::asks(asks),
        }
    }

    /// Generate a sorted [`OrderBook`] snapshot with a maximum depth.
    pub fn top(&self, depth: usize) -> Self {
        Self {
            sequence: self.sequence,
            time_last_update: self.time_last_update,
            bids: OrderBookSide::bids(self.bids.levels.iter().take(depth).copied()),
            asks: OrderBookSide::asks(self.asks.levels.iter().take(depth).copied()),
        }
    }

    /// Upsert bid levels (zero qty removes the level).
    pub fn upsert_bids<Iter, L>(&mut self, levels: Iter)
    where
        Iter: IntoIterator<Item = L>,
        L: Into<Level>,
    {
        self.bids.upsert(levels)
    }

    /// Upsert ask levels (zero qty removes the level).
    pub fn upsert_asks<Iter, L>(&mut self, levels: Iter)
    where
        Iter: IntoIterator<Item = L>,
        L: Into<Level>,
    {
        self.asks.upsert(levels)
    }

    pub fn bids(&self) -> &OrderBookSide<Bids> {
        &self.bids
    }

    pub fn asks(&self) -> &OrderBookSide<Asks> {
        &self.asks
    }

    pub fn best_bid(&self) -> Option<Level> {
        self.bids.levels.first().copied()
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks.levels.first().copied()
    }

    /// Best bid and ask, if both sides are populated.
    pub fn best_bid_ask(&self) -> Option<(Level, Level)> {
        self.best_bid().zip(self.best_ask())
    }

    /// Difference between the best ask and best bid prices.
    pub fn spread(&self) -> Option<Decimal> {
        self.best_bid_ask()
            .map(|(bid, ask)| ask.price - bid.price)
    }

    /// Calculate the mid-price by taking the average of the best bid and ask
    /// prices.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.bids.levels.first(), self.asks.levels.first()) {
            (Some(best_bid), Some(best_ask)) => Some(mid_price(best_bid.price, best_ask.price)),
            (Some(best_bid), None) => Some(best_bid.price),
            (None, Some(best_ask)) => Some(best_ask.price),
            (None, None) => None,
        }
    }

    /// Calculate the volume weighted mid-price (micro-price), weighing the
    /// best bid and ask prices with their associated qty.
    pub fn volume_weighed_mid_price(&self) -> Option<Decimal> {
        match (self.bids.levels.first(), self.asks.levels.first()) {
            (Some(best_bid), Some(best_ask)) => {
                Some(volume_weighted_mid_price(*best_bid, *best_ask))
            }
            (Some(best_bid), None) => Some(best_bid.price),
            (None, Some(best_ask)) => Some(best_ask.price),
            (None, None) => None,
        }
    }
}

/// Normalised [`Level`]s for one side of the [`OrderBook`].
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct OrderBookSide<Side> {
    #[serde(skip)]
    pub side: Side,
    levels: Vec<Level>,
}

/// Unit type to tag an [`OrderBookSide`] as the bid side (ie/ buyers).
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Serialize, Display,
)]
pub struct Bids;

/// Unit type to tag an [`OrderBookSide`] as the ask side (ie/ sellers).
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Serialize, Display,
)]
pub struct Asks;

impl OrderBookSide<Bids> {
    /// Construct a new [`OrderBookSide<Bids>`] from the provided [`Level`]s.
    pub fn bids<Iter, L>(levels: Iter) -> Self
    where
        Iter: IntoIterator<Item = L>,
        L: Into<Level>,
    {
        let mut levels = levels.into_iter().map(L::into).collect::<Vec<_>>();
        levels.sort_unstable_by(|a, b| a.price.cmp(&b.price).reverse());

        Self { side: Bids, levels }
    }

    /// Upsert bid [`Level`]s into this [`OrderBookSide<Bids>`].
    pub fn upsert<Iter, L>(&mut self, levels: Iter)
    where
        Iter: IntoIterator<Item = L>,
        L: Into<Level>,
    {
        levels.into_iter().for_each(|upsert| {
            let upsert = upsert.into();
            self.upsert_single(upsert, |existing| {
                existing.price.cmp(&upsert.price).reverse()
            })
        })
    }
}

impl OrderBookSide<Asks> {
    /// Construct a new [`OrderBookSide<Asks>`] from the provided [`Level`]s.
    pub fn asks<Iter, L>(levels: Iter) -> Self
    where
        Iter: IntoIterator<Item = L>,
        L: Into<Level>,
    {
        let mut levels = levels.into_iter().map(L::into).collect::<Vec<_>>();
        levels.sort_unstable_by(|a, b| a.price.cmp(&b.price));

        Self { side: Asks, levels }
    }

    /// Upsert ask [`Level`]s into this [`OrderBookSide<Asks>`].
    pub fn upsert<Iter, L>(&mut self, levels: Iter)
    where
        Iter: IntoIterator<Item = L>,
        L: Into<Level>,
    {
        levels.into_iter().for_each(|upsert| {
            let upsert = upsert.into();
            self.upsert_single(upsert, |existing| existing.price.cmp(&upsert.price))
        })
    }
}

impl<Side> OrderBookSide<Side>
where
    Side: std::fmt::Display + std::fmt::Debug,
{
    /// Return a reference to the [`OrderBookSide`] levels.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Upsert a single [`Level`] into this [`OrderBookSide`].
    ///
    /// ### Upsert Scenarios
    /// #### 1 Level Already Exists
    /// 1a) New qty is 0, remove the level
    /// 1b) New qty is > 0, replace the level
    ///
    /// #### 2 Level Does Not Exist
    /// 2a) New qty is 0, log debug and continue
    /// 2b) New qty is > 0, insert new level
    pub fn upsert_single<FnOrd>(&mut self, new_level: Level, fn_ord: FnOrd)
    where
        FnOrd: Fn(&Level) -> Ordering,
    {
        match (self.levels.binary_search_by(fn_ord), new_level.qty) {
            (Ok(index), new_qty) => {
                if new_qty.is_zero() {
                    // Scenario 1a: Level exists & new qty is 0 => remove level
                    let _removed = self.levels.remove(index);
                } else {
                    // Scenario 1b: Level exists & new qty is > 0 => replace level
                    self.levels[index].qty = new_qty;
                }
            }
            (Err(index), new_qty) => {
                if new_qty.is_zero() {
                    // Scenario 2a: Level does not exist & new qty is 0 => log & continue
                    debug!(
                        ?new_level,
                        side = %self.side,
                        "received upsert Level with zero qty (to remove) that was not found"
                    );
                } else {
                    // Scenario 2b: Level does not exist & new qty > 0 => insert new level
                    self.levels.insert(index, new_level);
                }
            }
        }
    }
}

impl Default for OrderBookSide<Bids> {
    fn default() -> Self {
        Self {
            side: Bids,
            levels: vec![],
        }
    }
}

impl Default for OrderBookSide<Asks> {
    fn default() -> Self {
        Self {
            side: Asks,
            levels: vec![],
        }
    }
}

/// Normalised order book price [`Level`].
#[derive(Debug, Copy, Clone, PartialEq, Ord, PartialOrd, Hash, Default, Deserialize, Serialize)]
pub struct Level {
    pub price: Decimal,
    pub qty: Decimal,
}

impl<T> From<(T, T)> for Level
where
    T: Into<Decimal>,
{
    fn from((price, qty): (T, T)) -> Self {
        Self::new(price, qty)
    }
}

impl Eq for Level {}

impl Level {
    pub fn new<T>(price: T, qty: T) -> Self
    where
        T: Into<Decimal>,
    {
        Self {
            price: price.into(),
            qty: qty.into(),
        }
    }
}

/// Calculate the mid-price by taking the average of the best bid and ask
/// prices.
pub fn mid_price(best_bid_price: Decimal, best_ask_price: Decimal) -> Decimal {
    (best_bid_price + best_ask_price) / Decimal::TWO
}

/// Calculate the volume weighted mid-price (micro-price), weighing the best
/// bid and ask prices with their associated qty.
pub fn volume_weighted_mid_price(best_bid: Level, best_ask: Level) -> Decimal {
    ((best_bid.price * best_ask.qty) + (best_ask.price * best_bid.qty))
        / (best_bid.qty + best_ask.qty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> OrderBook {
        OrderBook::new(
            100,
            None,
            vec![(dec!(49_990), dec!(2)), (dec!(50_000), dec!(1))],
            vec![(dec!(50_010), dec!(1)), (dec!(50_020), dec!(3))],
        )
    }

    #[test]
    fn test_new_sorts_sides() {
        let book = book();
        assert_eq!(book.best_bid(), Some(Level::new(dec!(50_000), dec!(1))));
        assert_eq!(book.best_ask(), Some(Level::new(dec!(50_010), dec!(1))));
    }

    #[test]
    fn test_top_limits_depth_and_preserves_order() {
        let top = book().top(1);
        assert_eq!(top.bids().levels().len(), 1);
        assert_eq!(top.asks().levels().len(), 1);
        assert_eq!(top.bids().levels()[0].price, dec!(50_000));
    }

    #[test]
    fn test_upsert_zero_qty_removes_level() {
        let mut book = book();
        book.upsert_bids(vec![(dec!(50_000), dec!(0))]);
        assert_eq!(book.best_bid(), Some(Level::new(dec!(49_990), dec!(2))));

        // Removing an absent level is a no-op
        book.upsert_asks(vec![(dec!(51_000), dec!(0))]);
        assert_eq!(book.asks().levels().len(), 2);
    }

    #[test]
    fn test_mid_and_spread() {
        let book = book();
        assert_eq!(book.mid_price(), Some(dec!(50_005)));
        assert_eq!(book.spread(), Some(dec!(10)));
    }

    #[test]
    fn test_volume_weighted_mid_price() {
        let book = OrderBook::new(
            1,
            None,
            vec![(dec!(100), dec!(3))],
            vec![(dec!(110), dec!(1))],
        );
        // (100*1 + 110*3) / (3+1)
        assert_eq!(book.volume_weighed_mid_price(), Some(dec!(107.5)));
    }
}
