use crate::{
    books::OrderBook,
    error::DataError,
    event::{OrderBookDelta, OrderBookEvent},
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Default bound on deltas buffered while a book is [`BookStatus::Stale`].
pub const DEFAULT_STALE_BUFFER_CAPACITY: usize = 256;

/// Validity of a [`SequencedBook`].
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
pub enum BookStatus {
    /// Book reflects a contiguous sequence of venue updates.
    Valid,
    /// A sequence gap was detected; a resnapshot is required before the book
    /// can serve reads again.
    Stale,
}

/// Outcome of applying an [`OrderBookEvent`] to a [`SequencedBook`].
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum BookUpdateOutcome {
    /// Delta applied in sequence.
    Applied,
    /// Snapshot installed; buffered deltas replayed/discarded as counted.
    SnapshotInstalled { replayed: usize, discarded: usize },
    /// Book is stale; the delta was buffered for replay after resnapshot.
    Buffered,
    /// Delta is older than the current book sequence and was dropped.
    Discarded,
    /// A gap was detected. The book is now stale and the caller must request
    /// a resnapshot from the venue adapter.
    GapDetected(DataError),
}

impl BookUpdateOutcome {
    /// True if the caller must issue a resnapshot request to the venue.
    pub fn requires_resnapshot(&self) -> bool {
        matches!(self, Self::GapDetected(_))
    }
}

/// [`OrderBook`] wrapper enforcing the snapshot+delta sequencing contract.
///
/// A delta is accepted only if its `prev_sequence` equals the current book
/// `sequence`. On a gap the book is marked [`BookStatus::Stale`] and deltas
/// are buffered (bounded); a subsequent snapshot installs a new baseline and
/// replays any buffered delta that follows on from it, discarding the rest.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SequencedBook {
    book: OrderBook,
    status: BookStatus,
    buffered: VecDeque<OrderBookDelta>,
    buffer_capacity: usize,
    gap_count: u64,
}

impl Default for SequencedBook {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_BUFFER_CAPACITY)
    }
}

impl SequencedBook {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            book: OrderBook::default(),
            status: BookStatus::Stale,
            buffered: VecDeque::new(),
            buffer_capacity,
            gap_count: 0,
        }
    }

    pub fn status(&self) -> BookStatus {
        self.status
    }

    /// Read access to the underlying book. Returns `None` while the book is
    /// [`BookStatus::Stale`] so readers never observe a gapped book.
    pub fn book(&self) -> Option<&OrderBook> {
        match self.status {
            BookStatus::Valid => Some(&self.book),
            BookStatus::Stale => None,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.book.sequence
    }

    /// Total sequence gaps detected over the book lifetime.
    pub fn gap_count(&self) -> u64 {
        self.gap_count
    }

    /// Apply a normalised [`OrderBookEvent`].
    pub fn update(&mut self, event: OrderBookEvent) -> BookUpdateOutcome {
        match event {
            OrderBookEvent::Snapshot(snapshot) => self.apply_snapshot(snapshot),
            OrderBookEvent::Delta(delta) => self.apply_delta(delta),
        }
    }

    /// Install a snapshot baseline, replaying any buffered deltas that follow
    /// on from it in order.
    pub fn apply_snapshot(&mut self, snapshot: OrderBook) -> BookUpdateOutcome {
        self.book = snapshot;
        self.status = BookStatus::Valid;

        let mut replayed = 0;
        let mut discarded = 0;

        for delta in std::mem::take(&mut self.buffered) {
            if delta.sequence <= self.book.sequence {
                // Already covered by the snapshot baseline
                discarded += 1;
            } else if delta.prev_sequence == self.book.sequence {
                self.apply_delta_unchecked(delta);
                replayed += 1;
            } else {
                // Buffered stream itself has a hole beyond the snapshot
                warn!(
                    book_sequence = self.book.sequence,
                    delta_prev_sequence = delta.prev_sequence,
                    "buffered delta does not follow snapshot - discarding remainder"
                );
                discarded += 1;
            }
        }

        debug!(
            sequence = self.book.sequence,
            replayed, discarded, "installed order book snapshot"
        );

        BookUpdateOutcome::SnapshotInstalled {
            replayed,
            discarded,
        }
    }

    /// Apply a delta, detecting sequence gaps.
    pub fn apply_delta(&mut self, delta: OrderBookDelta) -> BookUpdateOutcome {
        if self.status == BookStatus::Stale {
            return self.buffer_delta(delta);
        }

        if delta.sequence <= self.book.sequence {
            return BookUpdateOutcome::Discarded;
        }

        if delta.prev_sequence != self.book.sequence {
            let error = DataError::InvalidSequence {
                book_sequence: self.book.sequence,
                prev_sequence: delta.prev_sequence,
            };

            self.status = BookStatus::Stale;
            self.gap_count += 1;
            self.buffered.push_back(delta);

            return BookUpdateOutcome::GapDetected(error);
        }

        self.apply_delta_unchecked(delta);
        BookUpdateOutcome::Applied
    }

    fn buffer_delta(&mut self, delta: OrderBookDelta) -> BookUpdateOutcome {
        if self.buffered.len() >= self.buffer_capacity {
            // Oldest buffered deltas are superseded by the pending resnapshot
            let _evicted = self.buffered.pop_front();
        }
        self.buffered.push_back(delta);
        BookUpdateOutcome::Buffered
    }

    fn apply_delta_unchecked(&mut self, delta: OrderBookDelta) {
        self.book.sequence = delta.sequence;
        self.book.upsert_bids(delta.bids);
        self.book.upsert_asks(delta.asks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::books::Level;
    use rust_decimal_macros::dec;

    fn snapshot(sequence: u64) -> OrderBook {
        OrderBook::new(
            sequence,
            None,
            vec![(dec!(100), dec!(1))],
            vec![(dec!(101), dec!(1))],
        )
    }

    fn delta(prev_sequence: u64, sequence: u64) -> OrderBookDelta {
        OrderBookDelta::new(
            prev_sequence,
            sequence,
            vec![Level::new(dec!(100), dec!(2))],
            vec![],
        )
    }

    #[test]
    fn test_contiguous_deltas_apply() {
        let mut book = SequencedBook::default();
        book.apply_snapshot(snapshot(100));

        assert_eq!(book.apply_delta(delta(100, 101)), BookUpdateOutcome::Applied);
        assert_eq!(book.sequence(), 101);
        assert_eq!(book.status(), BookStatus::Valid);
    }

    #[test]
    fn test_gap_marks_stale_and_requires_resnapshot() {
        let mut book = SequencedBook::default();
        book.apply_snapshot(snapshot(100));
        book.apply_delta(delta(100, 101));

        let outcome = book.apply_delta(delta(103, 104));
        assert!(outcome.requires_resnapshot());
        assert_eq!(book.status(), BookStatus::Stale);
        assert_eq!(book.gap_count(), 1);
        assert!(book.book().is_none());
    }

    #[test]
    fn test_resnapshot_replays_buffered_follow_on_deltas() {
        let mut book = SequencedBook::default();
        book.apply_snapshot(snapshot(100));
        book.apply_delta(delta(100, 101));

        // Gap: 102 missing
        assert!(book.apply_delta(delta(103, 104)).requires_resnapshot());

        // Deltas received while stale are buffered
        assert_eq!(
            book.apply_delta(delta(110, 111)),
            BookUpdateOutcome::Buffered
        );

        // Snapshot at 110 discards stale buffer entries and replays 111
        let outcome = book.apply_snapshot(snapshot(110));
        assert_eq!(
            outcome,
            BookUpdateOutcome::SnapshotInstalled {
                replayed: 1,
                discarded: 1,
            }
        );
        assert_eq!(book.status(), BookStatus::Valid);
        assert_eq!(book.sequence(), 111);

        // Follow-on delta applies
        assert_eq!(book.apply_delta(delta(111, 112)), BookUpdateOutcome::Applied);
    }

    #[test]
    fn test_stale_delta_discarded() {
        let mut book = SequencedBook::default();
        book.apply_snapshot(snapshot(100));

        assert_eq!(
            book.apply_delta(delta(99, 100)),
            BookUpdateOutcome::Discarded
        );
        assert_eq!(book.status(), BookStatus::Valid);
    }

    #[test]
    fn test_stale_buffer_is_bounded() {
        let mut book = SequencedBook::new(2);
        book.apply_snapshot(snapshot(100));
        assert!(book.apply_delta(delta(105, 106)).requires_resnapshot());

        book.apply_delta(delta(106, 107));
        book.apply_delta(delta(107, 108));

        // Oldest buffered delta (106) evicted; snapshot at 107 replays 108
        let outcome = book.apply_snapshot(snapshot(107));
        assert_eq!(
            outcome,
            BookUpdateOutcome::SnapshotInstalled {
                replayed: 1,
                discarded: 1,
            }
        );
        assert_eq!(book.sequence(), 108);
    }
}
