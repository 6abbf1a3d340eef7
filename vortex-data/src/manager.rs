use crate::{
    books::{map::OrderBookMap, sequenced::BookUpdateOutcome},
    connection::{BackoffPolicy, BackoffState, ConnectionState, StreamQuality},
    error::DataError,
    event::{DataKind, MarketEvent, SubscriptionStatus},
    subscription::{RegistryAction, SubKind, Subscription, SubscriptionRegistry, SubscriptionState},
};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use vortex_instrument::{symbol::SymbolId, venue::Venue};

/// Action the I/O executor must perform against a venue adapter on behalf of
/// the [`MarketDataManager`].
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum MarketDataAction {
    VenueSubscribe(Subscription),
    VenueUnsubscribe(Subscription),
    RequestBookSnapshot { venue: Venue, symbol: SymbolId },
}

/// Output of the manager consuming a [`MarketEvent`].
#[derive(Debug, Clone, Default)]
pub struct AppliedMarketEvent {
    /// Outcome of routing a book event into the local book, if applicable.
    pub book_outcome: Option<BookUpdateOutcome>,
    /// Venue adapter actions required as a consequence (eg/ resnapshot).
    pub actions: Vec<MarketDataAction>,
}

/// Output of a venue connection state transition.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTransition {
    /// Venue adapter actions (re-issued subscriptions, forced resnapshots).
    pub actions: Vec<MarketDataAction>,
    /// Subscription status notifications to surface downstream.
    pub statuses: Vec<MarketEvent<SubscriptionStatus>>,
}

#[derive(Debug)]
struct VenueConnection {
    state: ConnectionState,
    backoff: BackoffState,
    quality: StreamQuality,
    ever_connected: bool,
}

impl VenueConnection {
    fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: BackoffState::from(policy),
            quality: StreamQuality::default(),
            ever_connected: false,
        }
    }
}

/// Aggregates market data subscriptions, owns the local order books and
/// per-venue connection lifecycle, and normalises venue input into outputs
/// for the engine loop.
///
/// The manager is synchronous: it is owned and driven by the engine loop,
/// and expresses all venue-facing work as [`MarketDataAction`]s executed by
/// the I/O executor.
#[derive(Debug)]
pub struct MarketDataManager {
    registry: SubscriptionRegistry,
    books: OrderBookMap,
    connections: FnvHashMap<Venue, VenueConnection>,
    backoff_policy: BackoffPolicy,
}

impl MarketDataManager {
    pub fn new(backoff_policy: BackoffPolicy) -> Self {
        Self {
            registry: SubscriptionRegistry::default(),
            books: OrderBookMap::default(),
            connections: FnvHashMap::default(),
            backoff_policy,
        }
    }

    pub fn books(&self) -> &OrderBookMap {
        &self.books
    }

    pub fn connection_state(&self, venue: Venue) -> ConnectionState {
        self.connections
            .get(&venue)
            .map(|connection| connection.state)
            .unwrap_or_default()
    }

    pub fn quality(&self, venue: Venue) -> Option<&StreamQuality> {
        self.connections
            .get(&venue)
            .map(|connection| &connection.quality)
    }

    /// Iterate `(venue, quality)` pairs for all venues seen so far.
    pub fn quality_iter(&self) -> impl Iterator<Item = (Venue, &StreamQuality)> + '_ {
        self.connections
            .iter()
            .map(|(venue, connection)| (*venue, &connection.quality))
    }

    /// Register a consumer subscription, returning any venue actions to
    /// perform.
    pub fn subscribe(&mut self, subscription: Subscription) -> Vec<MarketDataAction> {
        let mut actions = Vec::new();

        if let RegistryAction::VenueSubscribe(subscription) =
            self.registry.subscribe(subscription)
        {
            info!(%subscription, "issuing venue subscribe");

            let book_snapshot = (subscription.kind == SubKind::OrderBooks).then(|| {
                // Lazily create the local book; it starts stale until the
                // venue snapshot arrives
                self.books
                    .find_or_create(subscription.venue, &subscription.symbol);
                MarketDataAction::RequestBookSnapshot {
                    venue: subscription.venue,
                    symbol: subscription.symbol.clone(),
                }
            });

            actions.push(MarketDataAction::VenueSubscribe(subscription));
            actions.extend(book_snapshot);
        }

        actions
    }

    /// Deregister a consumer subscription, returning any venue actions to
    /// perform.
    pub fn unsubscribe(
        &mut self,
        subscription: &Subscription,
    ) -> Result<Vec<MarketDataAction>, DataError> {
        match self.registry.unsubscribe(subscription)? {
            RegistryAction::VenueUnsubscribe(subscription) => {
                info!(%subscription, "issuing venue unsubscribe");
                Ok(vec![MarketDataAction::VenueUnsubscribe(subscription)])
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Consume a normalised [`MarketEvent`], routing book events into the
    /// associated local book and tracking stream quality.
    pub fn on_event(&mut self, event: &MarketEvent) -> AppliedMarketEvent {
        let mut applied = AppliedMarketEvent::default();

        if event.kind.sub_kind().is_some() {
            self.connection_mut(event.venue)
                .quality
                .on_message(event.time_exchange, event.time_received);
        }

        let DataKind::Book(book_event) = &event.kind else {
            return applied;
        };

        let book = self.books.find_or_create(event.venue, &event.symbol);
        let outcome = book.write().update(book_event.clone());

        if outcome.requires_resnapshot() {
            warn!(
                venue = %event.venue,
                symbol = %event.symbol,
                ?outcome,
                "book sequence gap detected - requesting resnapshot"
            );
            self.connection_mut(event.venue).quality.on_gap();
            applied.actions.push(MarketDataAction::RequestBookSnapshot {
                venue: event.venue,
                symbol: event.symbol.clone(),
            });
        }

        applied.book_outcome = Some(outcome);
        applied
    }

    /// Apply a venue connection state transition.
    ///
    /// On reconnection all active subscriptions for the venue are re-issued
    /// and a resnapshot is forced for every book subscription. On
    /// disconnection the venue's local books are destroyed.
    pub fn on_connection(
        &mut self,
        venue: Venue,
        new_state: ConnectionState,
        time: chrono::DateTime<chrono::Utc>,
    ) -> ConnectionTransition {
        let mut transition = ConnectionTransition::default();

        let (previous, reissue) = {
            let connection = self.connection_mut(venue);
            let previous = connection.state;
            if previous == new_state {
                return transition;
            }
            connection.state = new_state;

            let reissue = match new_state {
                ConnectionState::Connected => {
                    connection.backoff.reset();
                    let reconnected = connection.ever_connected;
                    connection.ever_connected = true;
                    reconnected
                }
                ConnectionState::Connecting => {
                    if connection.ever_connected {
                        connection.quality.on_reconnect();
                    }
                    false
                }
                ConnectionState::Disconnected | ConnectionState::Degraded => false,
            };

            (previous, reissue)
        };

        info!(%venue, %previous, state = %new_state, "venue connection transition");

        if new_state == ConnectionState::Disconnected {
            self.books.remove_venue(venue);
        }

        if reissue {
            // Re-issue active subscriptions after a reconnect, forcing a
            // resnapshot for every book subscription
            for subscription in self.registry.active_for_venue(venue) {
                transition
                    .actions
                    .push(MarketDataAction::VenueSubscribe(subscription.clone()));
                if subscription.kind == SubKind::OrderBooks {
                    transition.actions.push(MarketDataAction::RequestBookSnapshot {
                        venue,
                        symbol: subscription.symbol.clone(),
                    });
                }
            }
        }

        let state = match new_state {
            ConnectionState::Connected => SubscriptionState::Subscribed,
            ConnectionState::Connecting => SubscriptionState::Pending,
            ConnectionState::Disconnected | ConnectionState::Degraded => {
                SubscriptionState::Failed
            }
        };

        for subscription in self.registry.active_for_venue(venue) {
            transition.statuses.push(MarketEvent::new(
                venue,
                subscription.symbol.clone(),
                time,
                time,
                SubscriptionStatus::new(subscription.kind, state),
            ));
        }

        transition
    }

    /// Jittered delay before the next reconnection attempt for the venue.
    pub fn next_reconnect_delay(&mut self, venue: Venue) -> Duration {
        self.connection_mut(venue).backoff.next_delay()
    }

    fn connection_mut(&mut self, venue: Venue) -> &mut VenueConnection {
        let policy = self.backoff_policy;
        self.connections
            .entry(venue)
            .or_insert_with(|| VenueConnection::new(policy))
    }
}

impl Default for MarketDataManager {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        books::{OrderBook, sequenced::BookStatus},
        event::{OrderBookDelta, OrderBookEvent},
    };
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn symbol() -> SymbolId {
        SymbolId::new("BTCUSDT").unwrap()
    }

    fn book_subscription() -> Subscription {
        Subscription::new(Venue::Simulated, symbol(), SubKind::OrderBooks)
    }

    fn book_event(event: OrderBookEvent) -> MarketEvent {
        let now = Utc::now();
        MarketEvent::new(
            Venue::Simulated,
            symbol(),
            now,
            now,
            DataKind::Book(event),
        )
    }

    #[test]
    fn test_subscribe_book_requests_initial_snapshot() {
        let mut manager = MarketDataManager::default();

        let actions = manager.subscribe(book_subscription());
        assert!(actions.contains(&MarketDataAction::RequestBookSnapshot {
            venue: Venue::Simulated,
            symbol: symbol(),
        }));
        assert!(actions.contains(&MarketDataAction::VenueSubscribe(book_subscription())));

        // Second consumer: venue already subscribed, no new actions
        assert!(manager.subscribe(book_subscription()).is_empty());
    }

    #[test]
    fn test_on_event_gap_requests_resnapshot_and_counts_it() {
        let mut manager = MarketDataManager::default();
        manager.subscribe(book_subscription());

        let snapshot = OrderBook::new(
            100,
            None,
            vec![(dec!(100), dec!(1))],
            vec![(dec!(101), dec!(1))],
        );
        manager.on_event(&book_event(OrderBookEvent::Snapshot(snapshot)));

        let gapped = OrderBookDelta::new(103, 104, vec![], vec![]);
        let applied = manager.on_event(&book_event(OrderBookEvent::Delta(gapped)));

        assert!(applied.actions.contains(&MarketDataAction::RequestBookSnapshot {
            venue: Venue::Simulated,
            symbol: symbol(),
        }));
        assert_eq!(manager.quality(Venue::Simulated).unwrap().gaps, 1);

        let book = manager.books().find(Venue::Simulated, &symbol()).unwrap();
        assert_eq!(book.read().status(), BookStatus::Stale);
    }

    #[test]
    fn test_reconnect_reissues_subscriptions_and_resnapshots() {
        let mut manager = MarketDataManager::default();
        manager.subscribe(book_subscription());
        let now = Utc::now();

        manager.on_connection(Venue::Simulated, ConnectionState::Connected, now);

        // Drop and reconnect
        manager.on_connection(Venue::Simulated, ConnectionState::Connecting, now);
        let transition =
            manager.on_connection(Venue::Simulated, ConnectionState::Connected, now);

        assert!(transition
            .actions
            .contains(&MarketDataAction::VenueSubscribe(book_subscription())));
        assert!(transition.actions.contains(&MarketDataAction::RequestBookSnapshot {
            venue: Venue::Simulated,
            symbol: symbol(),
        }));
        assert_eq!(manager.quality(Venue::Simulated).unwrap().reconnects, 1);
        assert_eq!(transition.statuses.len(), 1);
        assert_eq!(
            transition.statuses[0].kind,
            SubscriptionStatus::new(SubKind::OrderBooks, SubscriptionState::Subscribed)
        );
    }
}
