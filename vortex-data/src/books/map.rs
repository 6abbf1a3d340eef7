use crate::books::sequenced::SequencedBook;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use vortex_instrument::{symbol::SymbolId, venue::Venue};

/// Key of a local order book: the `(venue, symbol)` pair it mirrors.
pub type BookKey = (Venue, SymbolId);

/// Cheaply cloneable handle to a shared [`SequencedBook`].
pub type SharedBook = Arc<RwLock<SequencedBook>>;

/// Collection of shared per-venue-per-symbol [`SequencedBook`]s.
///
/// Books are created lazily on first use and removed on venue disconnection.
#[derive(Debug, Clone, Default)]
pub struct OrderBookMap {
    books: FnvHashMap<BookKey, SharedBook>,
}

impl OrderBookMap {
    pub fn find(&self, venue: Venue, symbol: &SymbolId) -> Option<SharedBook> {
        self.books
            .get(&(venue, symbol.clone()))
            .map(Arc::clone)
    }

    /// Find the book for `(venue, symbol)`, creating an empty stale book if
    /// absent.
    pub fn find_or_create(&mut self, venue: Venue, symbol: &SymbolId) -> SharedBook {
        Arc::clone(
            self.books
                .entry((venue, symbol.clone()))
                .or_default(),
        )
    }

    /// Remove all books associated with the provided venue, eg/ on venue
    /// disconnection.
    pub fn remove_venue(&mut self, venue: Venue) {
        self.books.retain(|(book_venue, _), _| *book_venue != venue);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BookKey, &SharedBook)> + '_ {
        self.books.iter()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}
