use crate::{
    books::{Level, OrderBook},
    error::DataError,
    event::{DataKind, MarketEvent, PublicTrade},
    subscription::{SubKind, Subscription},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnv::{FnvHashMap, FnvHashSet};
use rand::Rng;
use rust_decimal::Decimal;
use smol_str::ToSmolStr;
use tracing::debug;
use vortex_instrument::{Side, symbol::SymbolId, venue::Venue};
use vortex_integration::channel::Tx;

/// Venue market data adapter.
///
/// Adapters own the venue transport (outside the core for live venues),
/// translate raw messages into [`MarketEvent`]s, and act on the
/// subscribe/unsubscribe/resnapshot actions issued by the
/// [`MarketDataManager`](crate::manager::MarketDataManager). All methods are
/// invoked from the I/O executor, never from the engine loop.
#[async_trait]
pub trait MarketDataConnector: Send {
    fn venue(&self) -> Venue;

    async fn connect(&mut self) -> Result<(), DataError>;

    async fn subscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), DataError>;

    async fn unsubscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), DataError>;

    /// Request a fresh order book snapshot, eg/ after a sequence gap.
    async fn request_book_snapshot(&mut self, symbol: &SymbolId) -> Result<(), DataError>;
}

/// Configuration for the in-process [`SimulatedFeed`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedFeedConfig {
    /// Half-spread applied around the random-walk mid price, in basis points.
    pub half_spread_bps: i64,
    /// Maximum per-tick mid price drift, in basis points.
    pub max_drift_bps: i64,
    /// Depth levels generated either side of the mid price.
    pub depth: usize,
}

impl Default for SimulatedFeedConfig {
    fn default() -> Self {
        Self {
            half_spread_bps: 1,
            max_drift_bps: 5,
            depth: 3,
        }
    }
}

#[derive(Debug)]
struct SimulatedSymbol {
    mid: Decimal,
    sequence: u64,
    trade_sequence: u64,
    kinds: FnvHashSet<SubKind>,
}

/// In-process market data source backing the `Simulated` venue.
///
/// Seeded with a mid price per symbol, it random-walks the mid each `tick`,
/// emitting book snapshots/deltas and synthetic trades for the subscribed
/// kinds. The shell drives `tick` from the I/O executor at a fixed cadence.
#[derive(Debug)]
pub struct SimulatedFeed<EventTx> {
    event_tx: EventTx,
    config: SimulatedFeedConfig,
    symbols: FnvHashMap<SymbolId, SimulatedSymbol>,
    seeds: FnvHashMap<SymbolId, Decimal>,
}

impl<EventTx> SimulatedFeed<EventTx>
where
    EventTx: Tx<Item = MarketEvent>,
{
    pub fn new<SeedIter>(event_tx: EventTx, config: SimulatedFeedConfig, seeds: SeedIter) -> Self
    where
        SeedIter: IntoIterator<Item = (SymbolId, Decimal)>,
    {
        Self {
            event_tx,
            config,
            symbols: FnvHashMap::default(),
            seeds: seeds.into_iter().collect(),
        }
    }

    /// Advance all subscribed symbols one simulation step, emitting market
    /// events to the configured transmitter.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let mut events = Vec::new();

        for (symbol, state) in &mut self.symbols {
            let drift_bps = rand::rng().random_range(-self.config.max_drift_bps..=self.config.max_drift_bps);
            state.mid += state.mid * Decimal::new(drift_bps, 4);

            if state.kinds.contains(&SubKind::OrderBooks) {
                state.sequence += 1;
                let book = synth_book(state.mid, self.config.half_spread_bps, self.config.depth, state.sequence, now);
                events.push(MarketEvent::new(
                    Venue::Simulated,
                    symbol.clone(),
                    now,
                    now,
                    DataKind::Book(book.into()),
                ));
            }

            if state.kinds.contains(&SubKind::PublicTrades) {
                state.trade_sequence += 1;
                let side = if rand::rng().random_bool(0.5) {
                    Side::Buy
                } else {
                    Side::Sell
                };
                events.push(MarketEvent::new(
                    Venue::Simulated,
                    symbol.clone(),
                    now,
                    now,
                    DataKind::Trade(PublicTrade::new(
                        state.trade_sequence.to_smolstr(),
                        state.mid,
                        Decimal::new(rand::rng().random_range(1..=100), 2),
                        side,
                    )),
                ));
            }
        }

        for event in events {
            if self.event_tx.send(event).is_err() {
                debug!("simulated feed event receiver dropped");
                return;
            }
        }
    }

    fn seed_mid(&self, symbol: &SymbolId) -> Decimal {
        self.seeds
            .get(symbol)
            .copied()
            .unwrap_or_else(|| Decimal::new(100, 0))
    }
}

fn synth_book(
    mid: Decimal,
    half_spread_bps: i64,
    depth: usize,
    sequence: u64,
    now: DateTime<Utc>,
) -> OrderBook {
    let half_spread = mid * Decimal::new(half_spread_bps, 4);
    let step = half_spread.max(Decimal::new(1, 2));

    let bids = (0..depth).map(|level| {
        Level::new(
            mid - half_spread - step * Decimal::from(level as u64),
            Decimal::ONE,
        )
    });
    let asks = (0..depth).map(|level| {
        Level::new(
            mid + half_spread + step * Decimal::from(level as u64),
            Decimal::ONE,
        )
    });

    OrderBook::new(sequence, Some(now), bids, asks)
}

#[async_trait]
impl<EventTx> MarketDataConnector for SimulatedFeed<EventTx>
where
    EventTx: Tx<Item = MarketEvent> + Sync,
{
    fn venue(&self) -> Venue {
        Venue::Simulated
    }

    async fn connect(&mut self) -> Result<(), DataError> {
        Ok(())
    }

    async fn subscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), DataError> {
        for subscription in subscriptions {
            let seed = self.seed_mid(&subscription.symbol);
            self.symbols
                .entry(subscription.symbol.clone())
                .or_insert_with(|| SimulatedSymbol {
                    mid: seed,
                    sequence: 0,
                    trade_sequence: 0,
                    kinds: FnvHashSet::default(),
                })
                .kinds
                .insert(subscription.kind);
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), DataError> {
        for subscription in subscriptions {
            if let Some(state) = self.symbols.get_mut(&subscription.symbol) {
                state.kinds.remove(&subscription.kind);
                if state.kinds.is_empty() {
                    self.symbols.remove(&subscription.symbol);
                }
            }
        }
        Ok(())
    }

    async fn request_book_snapshot(&mut self, symbol: &SymbolId) -> Result<(), DataError> {
        let Some(state) = self.symbols.get_mut(symbol) else {
            return Err(DataError::Connector(format!(
                "simulated feed has no subscription for {symbol}"
            )));
        };

        state.sequence += 1;
        let now = Utc::now();
        let book = synth_book(
            state.mid,
            self.config.half_spread_bps,
            self.config.depth,
            state.sequence,
            now,
        );

        self.event_tx
            .send(MarketEvent::new(
                Venue::Simulated,
                symbol.clone(),
                now,
                now,
                DataKind::Book(book.into()),
            ))
            .map_err(|_| DataError::Connector("simulated feed event receiver dropped".to_string()))
    }
}
