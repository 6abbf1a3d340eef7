use crate::subscription::{SubKind, Subscription};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vortex_instrument::venue::Venue;

/// All errors generated in `vortex-data`.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum DataError {
    #[error(
        "invalid sequence: delta prev_sequence {prev_sequence} does not follow on from the \
         book sequence {book_sequence}"
    )]
    InvalidSequence {
        book_sequence: u64,
        prev_sequence: u64,
    },

    #[error("stale book delta buffer overflowed its capacity of {capacity}")]
    StaleBufferFull { capacity: usize },

    #[error("not subscribed: {0}")]
    NotSubscribed(Subscription),

    #[error("venue {venue} does not support subscription kind {kind}")]
    Unsupported { venue: Venue, kind: SubKind },

    #[error("connector error: {0}")]
    Connector(String),
}

impl DataError {
    /// Determine if an error requires the associated book to re-snapshot.
    pub fn requires_resnapshot(&self) -> bool {
        matches!(
            self,
            DataError::InvalidSequence { .. } | DataError::StaleBufferFull { .. }
        )
    }
}
