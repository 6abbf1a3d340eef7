use crate::{
    books::{Level, OrderBook},
    subscription::{SubKind, SubscriptionState},
};
use chrono::{DateTime, Utc};
use derive_more::{Constructor, From};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use vortex_instrument::{Side, symbol::SymbolId, venue::Venue};

/// Normalised market event produced by a venue adapter.
///
/// `time_exchange` is the venue-stamped event time; `time_received` is when
/// the adapter received the raw message, so `time_received - time_exchange`
/// measures end-to-end latency.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct MarketEvent<Kind = DataKind> {
    pub venue: Venue,
    pub symbol: SymbolId,
    pub time_exchange: DateTime<Utc>,
    pub time_received: DateTime<Utc>,
    pub kind: Kind,
}

impl<Kind> MarketEvent<Kind> {
    /// Map this event into one carrying a different kind.
    pub fn map_kind<F, NewKind>(self, op: F) -> MarketEvent<NewKind>
    where
        F: FnOnce(Kind) -> NewKind,
    {
        MarketEvent {
            venue: self.venue,
            symbol: self.symbol,
            time_exchange: self.time_exchange,
            time_received: self.time_received,
            kind: op(self.kind),
        }
    }
}

/// Aggregate normalised market event kind.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, From)]
pub enum DataKind {
    Trade(PublicTrade),
    Book(OrderBookEvent),
    Kline(Kline),
    Ticker(Ticker),
    MarkPrice(MarkPrice),
    FundingRate(FundingRate),
    SubscriptionStatus(SubscriptionStatus),
}

impl DataKind {
    /// The [`SubKind`] this event kind belongs to, if it is a data payload.
    pub fn sub_kind(&self) -> Option<SubKind> {
        match self {
            DataKind::Trade(_) => Some(SubKind::PublicTrades),
            DataKind::Book(_) => Some(SubKind::OrderBooks),
            DataKind::Kline(_) => Some(SubKind::Klines),
            DataKind::Ticker(_) => Some(SubKind::Tickers),
            DataKind::MarkPrice(_) => Some(SubKind::MarkPrices),
            DataKind::FundingRate(_) => Some(SubKind::FundingRates),
            DataKind::SubscriptionStatus(_) => None,
        }
    }
}

/// Normalised public trade.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct PublicTrade {
    pub id: SmolStr,
    pub price: Decimal,
    pub amount: Decimal,
    /// Side of the aggressing (taker) order.
    pub side: Side,
}

impl PublicTrade {
    /// True if the passive (maker) side of the trade was the buyer.
    pub fn is_buyer_maker(&self) -> bool {
        self.side == Side::Sell
    }
}

/// Order book event: a full snapshot establishing a sequence baseline, or an
/// incremental delta referring to the previous sequence it expects.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, From)]
pub enum OrderBookEvent {
    Snapshot(OrderBook),
    Delta(OrderBookDelta),
}

/// Incremental order book update.
///
/// A delta is only applicable to a book whose sequence equals
/// `prev_sequence`; a level with zero qty removes that level.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Constructor)]
pub struct OrderBookDelta {
    pub prev_sequence: u64,
    pub sequence: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// Normalised OHLCV candle.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Kline {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub time_start: DateTime<Utc>,
    pub time_close: DateTime<Utc>,
}

/// Normalised top-of-book ticker.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Ticker {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
}

/// Normalised mark price update (derivatives venues).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct MarkPrice {
    pub price: Decimal,
}

/// Normalised funding rate update (perpetual venues).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct FundingRate {
    pub rate: Decimal,
    pub time_next_funding: Option<DateTime<Utc>>,
}

/// Subscription lifecycle notification for a `(venue, symbol, kind)` key.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct SubscriptionStatus {
    pub kind: SubKind,
    pub state: SubscriptionState,
}
