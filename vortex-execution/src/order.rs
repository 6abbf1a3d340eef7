use crate::error::RequestValidationError;
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display, From};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use vortex_instrument::{Side, symbol::SymbolId, venue::Venue};

/// Maximum accepted [`ClientOrderId`] length.
const CLIENT_ORDER_ID_MAX_LEN: usize = 64;

/// Caller-supplied unique order identifier, stable across submission,
/// cancels and fills. Guarantees at-most-once placement per id.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct ClientOrderId(SmolStr);

impl ClientOrderId {
    /// Construct a validated [`ClientOrderId`].
    ///
    /// Accepts non-empty ids of at most 64 ascii alphanumeric, `-`, `_`, `:`
    /// or `.` characters.
    pub fn new<S>(id: S) -> Result<Self, RequestValidationError>
    where
        S: AsRef<str>,
    {
        let id = id.as_ref();

        if id.is_empty() {
            return Err(RequestValidationError::ClientOrderIdInvalid(
                "empty".to_string(),
            ));
        }
        if id.len() > CLIENT_ORDER_ID_MAX_LEN {
            return Err(RequestValidationError::ClientOrderIdInvalid(format!(
                "longer than {CLIENT_ORDER_ID_MAX_LEN} characters"
            )));
        }
        if !id
            .chars()
            .all(|char| char.is_ascii_alphanumeric() || matches!(char, '-' | '_' | ':' | '.'))
        {
            return Err(RequestValidationError::ClientOrderIdInvalid(
                id.to_string(),
            ));
        }

        Ok(Self(SmolStr::new(id)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Venue-assigned order identifier. For the simulated venue this is the
/// engine's monotone order counter.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    Display,
    From,
    Constructor,
)]
pub struct VenueOrderId(pub u64);

/// Identifier of the strategy an order originated from.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct StrategyId(SmolStr);

impl StrategyId {
    pub fn new<S>(id: S) -> Self
    where
        S: AsRef<str>,
    {
        Self(SmolStr::new(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub enum OrderKind {
    Market,
    Limit,
}

impl std::str::FromStr for OrderKind {
    type Err = RequestValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "market" => Ok(OrderKind::Market),
            "limit" => Ok(OrderKind::Limit),
            other => Err(RequestValidationError::UnknownOrderKind(other.to_string())),
        }
    }
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Deserialize, Serialize,
)]
pub enum TimeInForce {
    /// Good until cancelled.
    #[default]
    Gtc,
    /// Immediate or cancel.
    Ioc,
    /// Fill or kill.
    Fok,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tif = match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        };
        write!(f, "{tif}")
    }
}

impl std::str::FromStr for TimeInForce {
    type Err = RequestValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GTC" => Ok(TimeInForce::Gtc),
            "IOC" => Ok(TimeInForce::Ioc),
            "FOK" => Ok(TimeInForce::Fok),
            other => Err(RequestValidationError::UnknownTimeInForce(other.to_string())),
        }
    }
}

/// Order lifecycle status.
///
/// `Filled`, `Canceled` and `Rejected` are terminal.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

/// Request to place an order on a venue.
///
/// `price` must be present iff `kind` is [`OrderKind::Limit`].
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct PlaceOrderRequest {
    pub cid: ClientOrderId,
    pub symbol: SymbolId,
    pub venue: Venue,
    pub side: Side,
    pub kind: OrderKind,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub user_id: Option<SmolStr>,
    pub strategy_id: Option<StrategyId>,
}

impl PlaceOrderRequest {
    /// Validate the request invariants before it reaches risk or any venue.
    pub fn validate(&self) -> Result<(), RequestValidationError> {
        if self.qty <= Decimal::ZERO {
            return Err(RequestValidationError::QtyNotPositive);
        }

        match (self.kind, self.price) {
            (OrderKind::Limit, None) => Err(RequestValidationError::PriceMissing),
            (OrderKind::Limit, Some(price)) if price <= Decimal::ZERO => {
                Err(RequestValidationError::PriceNotPositive)
            }
            (OrderKind::Market, Some(_)) => Err(RequestValidationError::PriceUnexpected),
            _ => Ok(()),
        }
    }
}

/// Observable state of an order, updated monotonically over its lifecycle.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct OrderStateRecord {
    pub cid: ClientOrderId,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub avg_price: Decimal,
    pub reason: Option<String>,
    pub time_last_update: DateTime<Utc>,
    pub venue_order_id: Option<VenueOrderId>,
}

impl OrderStateRecord {
    /// Record for a newly accepted order.
    pub fn new_accepted(
        cid: ClientOrderId,
        venue_order_id: VenueOrderId,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            cid,
            status: OrderStatus::New,
            executed_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            reason: None,
            time_last_update: time,
            venue_order_id: Some(venue_order_id),
        }
    }

    /// Record for an order rejected before acceptance.
    pub fn new_rejected(cid: ClientOrderId, reason: String, time: DateTime<Utc>) -> Self {
        Self {
            cid,
            status: OrderStatus::Rejected,
            executed_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            reason: Some(reason),
            time_last_update: time,
            venue_order_id: None,
        }
    }

    /// Apply a fill, updating the running weighted-mean `avg_price` and the
    /// monotone `executed_qty`, transitioning to `PartiallyFilled` or
    /// `Filled` against the total `order_qty`.
    ///
    /// Fills against a terminal record are ignored.
    pub fn record_fill(
        &mut self,
        fill_qty: Decimal,
        fill_price: Decimal,
        order_qty: Decimal,
        time: DateTime<Utc>,
    ) {
        if self.status.is_terminal() {
            return;
        }

        let executed_total = self.executed_qty + fill_qty;
        self.avg_price =
            (self.avg_price * self.executed_qty + fill_price * fill_qty) / executed_total;
        self.executed_qty = executed_total;
        self.time_last_update = time;

        self.status = if self.executed_qty >= order_qty {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }

    /// Transition to `Canceled` unless already terminal.
    pub fn record_cancel(&mut self, time: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = OrderStatus::Canceled;
            self.time_last_update = time;
        }
    }

    /// Transition to `Rejected` unless already terminal, eg/ on a venue
    /// rejection of an in-flight order.
    pub fn record_reject(&mut self, reason: String, time: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = OrderStatus::Rejected;
            self.reason = Some(reason);
            self.time_last_update = time;
        }
    }

    /// Overwrite status and executed quantity with the venue view during
    /// reconciliation. Bypasses the monotone guards: the venue is
    /// authoritative here.
    pub fn adopt_venue_state(
        &mut self,
        status: OrderStatus,
        executed_qty: Decimal,
        time: DateTime<Utc>,
    ) {
        self.status = status;
        self.executed_qty = executed_qty;
        self.reason = Some("reconciliation: adopted venue state".to_string());
        self.time_last_update = time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(kind: OrderKind, price: Option<Decimal>) -> PlaceOrderRequest {
        PlaceOrderRequest::new(
            ClientOrderId::new("c1").unwrap(),
            SymbolId::new("BTCUSDT").unwrap(),
            Venue::Simulated,
            Side::Buy,
            kind,
            dec!(1),
            price,
            TimeInForce::Gtc,
            None,
            None,
        )
    }

    #[test]
    fn test_client_order_id_validation() {
        assert!(ClientOrderId::new("order-1_a:b.c").is_ok());
        assert!(ClientOrderId::new("").is_err());
        assert!(ClientOrderId::new("bad id").is_err());
        assert!(ClientOrderId::new("x".repeat(65)).is_err());
    }

    #[test]
    fn test_request_price_presence_invariant() {
        assert!(request(OrderKind::Limit, Some(dec!(100))).validate().is_ok());
        assert_eq!(
            request(OrderKind::Limit, None).validate(),
            Err(RequestValidationError::PriceMissing)
        );
        assert_eq!(
            request(OrderKind::Market, Some(dec!(100))).validate(),
            Err(RequestValidationError::PriceUnexpected)
        );
        assert!(request(OrderKind::Market, None).validate().is_ok());
    }

    #[test]
    fn test_record_fill_weighted_average_and_transitions() {
        let time = Utc::now();
        let mut record = OrderStateRecord::new_accepted(
            ClientOrderId::new("c1").unwrap(),
            VenueOrderId::new(1),
            time,
        );

        record.record_fill(dec!(0.5), dec!(100), dec!(1), time);
        assert_eq!(record.status, OrderStatus::PartiallyFilled);
        assert_eq!(record.avg_price, dec!(100));

        record.record_fill(dec!(0.5), dec!(200), dec!(1), time);
        assert_eq!(record.status, OrderStatus::Filled);
        assert_eq!(record.executed_qty, dec!(1));
        assert_eq!(record.avg_price, dec!(150));

        // Terminal records ignore further fills
        record.record_fill(dec!(1), dec!(500), dec!(1), time);
        assert_eq!(record.executed_qty, dec!(1));
    }

    #[test]
    fn test_record_cancel_is_not_applied_to_terminal_orders() {
        let time = Utc::now();
        let mut record = OrderStateRecord::new_accepted(
            ClientOrderId::new("c1").unwrap(),
            VenueOrderId::new(1),
            time,
        );
        record.record_fill(dec!(1), dec!(100), dec!(1), time);

        record.record_cancel(time);
        assert_eq!(record.status, OrderStatus::Filled);
    }
}
