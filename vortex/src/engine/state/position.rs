use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use vortex_instrument::Side;

/// Cost basis method used to compute realized PnL when a position reduces.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CostBasis {
    #[default]
    WeightedAverage,
    Fifo,
}

/// An open cost lot (FIFO basis only).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
struct Lot {
    qty: Decimal,
    price: Decimal,
}

/// Derived per-symbol position.
///
/// `size` is signed: positive LONG, negative SHORT. `avg_price` is the
/// average entry price of the open quantity under the configured basis.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Position {
    pub size: Decimal,
    pub avg_price: Decimal,
    pub realized_pnl: Decimal,
    basis: CostBasis,
    lots: VecDeque<Lot>,
}

impl Position {
    pub fn new(basis: CostBasis) -> Self {
        Self {
            size: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            basis,
            lots: VecDeque::new(),
        }
    }

    pub fn basis(&self) -> CostBasis {
        self.basis
    }

    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    /// Unrealized PnL of the open quantity marked at `mark_price`.
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        (mark_price - self.avg_price) * self.size
    }

    /// Apply a fill, returning the realized PnL delta.
    ///
    /// Same-direction fills extend the position; opposite-direction fills
    /// reduce it, realizing PnL under the configured basis, and flip into a
    /// new position with any remaining quantity.
    pub fn apply_fill(&mut self, side: Side, qty: Decimal, price: Decimal) -> Decimal {
        let signed_qty = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };

        let realized = if self.size.is_zero() || self.size.signum() == signed_qty.signum() {
            self.extend(signed_qty, price);
            Decimal::ZERO
        } else {
            self.reduce(signed_qty, price)
        };

        self.realized_pnl += realized;
        realized
    }

    fn extend(&mut self, signed_qty: Decimal, price: Decimal) {
        let new_size = self.size + signed_qty;
        let open_abs = self.size.abs();
        let add_abs = signed_qty.abs();

        self.avg_price = if new_size.is_zero() {
            Decimal::ZERO
        } else {
            (self.avg_price * open_abs + price * add_abs) / (open_abs + add_abs)
        };
        self.size = new_size;

        if self.basis == CostBasis::Fifo {
            self.lots.push_back(Lot {
                qty: add_abs,
                price,
            });
        }
    }

    fn reduce(&mut self, signed_qty: Decimal, price: Decimal) -> Decimal {
        let direction = self.size.signum();
        let close_abs = signed_qty.abs().min(self.size.abs());
        let remainder = signed_qty.abs() - close_abs;

        let realized = match self.basis {
            CostBasis::WeightedAverage => (price - self.avg_price) * close_abs * direction,
            CostBasis::Fifo => self.consume_lots(close_abs, price, direction),
        };

        self.size += direction * -close_abs;

        if self.size.is_zero() {
            self.avg_price = Decimal::ZERO;
            self.lots.clear();
        }

        // Opposite-direction remainder flips into a new position
        if remainder > Decimal::ZERO {
            self.extend(-direction * remainder, price);
        }

        realized
    }

    fn consume_lots(&mut self, mut close_abs: Decimal, price: Decimal, direction: Decimal) -> Decimal {
        let mut realized = Decimal::ZERO;

        while close_abs > Decimal::ZERO {
            let Some(front) = self.lots.front_mut() else {
                break;
            };

            let take = front.qty.min(close_abs);
            realized += (price - front.price) * take * direction;
            front.qty -= take;
            close_abs -= take;

            if front.qty.is_zero() {
                self.lots.pop_front();
            }
        }

        // Surviving lots define the remaining average entry
        let open_qty: Decimal = self.lots.iter().map(|lot| lot.qty).sum();
        if !open_qty.is_zero() {
            self.avg_price = self
                .lots
                .iter()
                .map(|lot| lot.price * lot.qty)
                .sum::<Decimal>()
                / open_qty;
        }

        realized
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new(CostBasis::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_weighted_average_extend_and_reduce() {
        let mut position = Position::new(CostBasis::WeightedAverage);

        position.apply_fill(Side::Buy, dec!(1), dec!(100));
        position.apply_fill(Side::Buy, dec!(1), dec!(200));
        assert_eq!(position.size, dec!(2));
        assert_eq!(position.avg_price, dec!(150));

        let realized = position.apply_fill(Side::Sell, dec!(1), dec!(180));
        assert_eq!(realized, dec!(30));
        assert_eq!(position.size, dec!(1));
        assert_eq!(position.avg_price, dec!(150));
        assert_eq!(position.realized_pnl, dec!(30));
    }

    #[test]
    fn test_fifo_consumes_oldest_lots_first() {
        let mut position = Position::new(CostBasis::Fifo);

        position.apply_fill(Side::Buy, dec!(1), dec!(100));
        position.apply_fill(Side::Buy, dec!(1), dec!(200));

        // Sell 1.5: closes the 100-lot fully and half the 200-lot
        let realized = position.apply_fill(Side::Sell, dec!(1.5), dec!(150));
        assert_eq!(realized, dec!(50) + dec!(-25));
        assert_eq!(position.size, dec!(0.5));
        assert_eq!(position.avg_price, dec!(200));
    }

    #[test]
    fn test_flip_closes_and_opens_opposite() {
        let mut position = Position::new(CostBasis::WeightedAverage);

        position.apply_fill(Side::Sell, dec!(0.1), dec!(50_000));
        let realized = position.apply_fill(Side::Buy, dec!(0.2), dec!(40_000));

        // SHORT 0.1 closed 10_000 in profit, flipped LONG 0.1 @ 40_000
        assert_eq!(realized, dec!(1_000.0));
        assert_eq!(position.size, dec!(0.1));
        assert_eq!(position.avg_price, dec!(40_000));
    }

    #[test]
    fn test_unrealized_pnl_signed_by_direction() {
        let mut long = Position::default();
        long.apply_fill(Side::Buy, dec!(2), dec!(100));
        assert_eq!(long.unrealized_pnl(dec!(110)), dec!(20));

        let mut short = Position::default();
        short.apply_fill(Side::Sell, dec!(2), dec!(100));
        assert_eq!(short.unrealized_pnl(dec!(110)), dec!(-20));
    }
}
