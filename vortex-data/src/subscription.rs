use derive_more::Constructor;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use vortex_instrument::{symbol::SymbolId, venue::Venue};

/// Kind of market data a [`Subscription`] is interested in.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SubKind {
    PublicTrades,
    OrderBooks,
    Klines,
    Tickers,
    MarkPrices,
    FundingRates,
}

impl SubKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubKind::PublicTrades => "public_trades",
            SubKind::OrderBooks => "order_books",
            SubKind::Klines => "klines",
            SubKind::Tickers => "tickers",
            SubKind::MarkPrices => "mark_prices",
            SubKind::FundingRates => "funding_rates",
        }
    }
}

impl std::fmt::Display for SubKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubKind {
    type Err = UnknownSubKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public_trades" | "trades" | "trade" => Ok(SubKind::PublicTrades),
            "order_books" | "book" | "books" => Ok(SubKind::OrderBooks),
            "klines" | "kline" | "candles" => Ok(SubKind::Klines),
            "tickers" | "ticker" => Ok(SubKind::Tickers),
            "mark_prices" | "mark_price" => Ok(SubKind::MarkPrices),
            "funding_rates" | "funding" => Ok(SubKind::FundingRates),
            other => Err(UnknownSubKind(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognised [`SubKind`].
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("unknown subscription kind: {0}")]
pub struct UnknownSubKind(pub String);

/// Unique market data subscription key.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Constructor,
)]
pub struct Subscription {
    pub venue: Venue,
    pub symbol: SymbolId,
    pub kind: SubKind,
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.venue, self.symbol, self.kind)
    }
}

/// Lifecycle state of a [`Subscription`].
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Pending,
    Subscribed,
    Unsubscribed,
    Failed,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            SubscriptionState::Pending => "pending",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::Failed => "failed",
        };
        write!(f, "{state}")
    }
}

/// Action the venue adapter must take following a registry mutation.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum RegistryAction {
    /// Refcount transitioned 0→1: issue a venue subscribe.
    VenueSubscribe(Subscription),
    /// Refcount transitioned 1→0: issue a venue unsubscribe.
    VenueUnsubscribe(Subscription),
    /// Refcount changed without crossing zero: nothing to issue.
    None,
}

/// Reference-counting registry of active [`Subscription`]s.
///
/// Multiple consumers (UI, strategies) may subscribe to the same key; the
/// venue-facing subscribe/unsubscribe is only issued on the 0→1 and 1→0
/// refcount transitions.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    counts: FnvHashMap<Subscription, usize>,
}

impl SubscriptionRegistry {
    pub fn subscribe(&mut self, subscription: Subscription) -> RegistryAction {
        let count = self.counts.entry(subscription.clone()).or_insert(0);
        *count += 1;

        if *count == 1 {
            RegistryAction::VenueSubscribe(subscription)
        } else {
            RegistryAction::None
        }
    }

    pub fn unsubscribe(&mut self, subscription: &Subscription) -> Result<RegistryAction, crate::error::DataError> {
        let Some(count) = self.counts.get_mut(subscription) else {
            return Err(crate::error::DataError::NotSubscribed(subscription.clone()));
        };

        *count -= 1;
        if *count == 0 {
            self.counts.remove(subscription);
            Ok(RegistryAction::VenueUnsubscribe(subscription.clone()))
        } else {
            Ok(RegistryAction::None)
        }
    }

    /// Number of consumers currently referencing the provided key.
    pub fn refcount(&self, subscription: &Subscription) -> usize {
        self.counts.get(subscription).copied().unwrap_or(0)
    }

    /// Iterate all active (refcount > 0) subscriptions.
    pub fn active(&self) -> impl Iterator<Item = &Subscription> + '_ {
        self.counts.keys()
    }

    /// Iterate active subscriptions for the provided venue.
    pub fn active_for_venue(&self, venue: Venue) -> impl Iterator<Item = &Subscription> + '_ {
        self.counts
            .keys()
            .filter(move |subscription| subscription.venue == venue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;

    fn sub() -> Subscription {
        Subscription::new(
            Venue::Binance,
            SymbolId::new("BTCUSDT").unwrap(),
            SubKind::OrderBooks,
        )
    }

    #[test]
    fn test_subscribe_issues_venue_action_only_on_first_reference() {
        let mut registry = SubscriptionRegistry::default();

        assert_eq!(
            registry.subscribe(sub()),
            RegistryAction::VenueSubscribe(sub())
        );
        assert_eq!(registry.subscribe(sub()), RegistryAction::None);
        assert_eq!(registry.refcount(&sub()), 2);
    }

    #[test]
    fn test_unsubscribe_issues_venue_action_only_on_last_reference() {
        let mut registry = SubscriptionRegistry::default();
        registry.subscribe(sub());
        registry.subscribe(sub());

        assert_eq!(registry.unsubscribe(&sub()), Ok(RegistryAction::None));
        assert_eq!(
            registry.unsubscribe(&sub()),
            Ok(RegistryAction::VenueUnsubscribe(sub()))
        );
        assert_eq!(
            registry.unsubscribe(&sub()),
            Err(DataError::NotSubscribed(sub()))
        );
    }
}
