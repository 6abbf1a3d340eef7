use derive_more::{Constructor, Display};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};
use tracing::warn;

/// Transmitter for sending items to a receiver.
pub trait Tx
where
    Self: Clone + Send,
{
    type Item;
    fn send(&self, item: Self::Item) -> Result<(), ReceiverDropped>;
}

/// Error returned when the receiving half of a channel has been dropped.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, thiserror::Error,
)]
#[error("channel receiver dropped")]
pub struct ReceiverDropped;

/// Unbounded [`Tx`] backed by a tokio mpsc channel.
#[derive(Debug)]
pub struct UnboundedTx<T> {
    pub tx: tokio::sync::mpsc::UnboundedSender<T>,
}

impl<T> Clone for UnboundedTx<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> UnboundedTx<T> {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<T>) -> Self {
        Self { tx }
    }
}

impl<T> Tx for UnboundedTx<T>
where
    T: Send,
{
    type Item = T;

    fn send(&self, item: Self::Item) -> Result<(), ReceiverDropped> {
        self.tx.send(item).map_err(|_| ReceiverDropped)
    }
}

/// Unbounded receiver half associated with an [`UnboundedTx`].
#[derive(Debug, Constructor)]
pub struct UnboundedRx<T> {
    pub rx: tokio::sync::mpsc::UnboundedReceiver<T>,
}

impl<T> UnboundedRx<T> {
    /// Drain all currently buffered items without waiting.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }

    pub fn into_stream(self) -> tokio_stream::wrappers::UnboundedReceiverStream<T> {
        tokio_stream::wrappers::UnboundedReceiverStream::new(self.rx)
    }
}

/// Construct an unbounded mpsc channel.
pub fn mpsc_unbounded<T>() -> (UnboundedTx<T>, UnboundedRx<T>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (UnboundedTx::new(tx), UnboundedRx::new(rx))
}

/// [`Tx`] wrapper that is disabled (rather than erroring) after the first
/// failed send, for consumers that may legitimately disconnect.
#[derive(Debug, Clone)]
pub struct ChannelTxDroppable<ChannelTx> {
    pub state: ChannelState<ChannelTx>,
}

impl<ChannelTx> ChannelTxDroppable<ChannelTx> {
    pub fn new(tx: ChannelTx) -> Self {
        Self {
            state: ChannelState::Active(tx),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Display)]
pub enum ChannelState<Tx> {
    Active(Tx),
    Disabled,
}

impl<ChannelTx> ChannelTxDroppable<ChannelTx>
where
    ChannelTx: Tx,
{
    pub fn send(&mut self, item: ChannelTx::Item) {
        let ChannelState::Active(tx) = &self.state else {
            return;
        };

        if tx.send(item).is_err() {
            let name = std::any::type_name::<ChannelTx::Item>();
            warn!(
                name,
                "ChannelTxDroppable receiver dropped - items will no longer be sent"
            );
            self.state = ChannelState::Disabled
        }
    }
}

/// Dispatch priority of an item sent via a [`PriorityTx`].
///
/// `Critical` items are always admitted and dispatched before any
/// non-`Critical` item in the queue. Within a priority, items are FIFO.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    const COUNT: usize = 4;

    fn index(&self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

/// Error returned by [`PriorityTx::send`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PrioritySendError<T> {
    /// Queue is at capacity and the item was non-`Critical`. Producers should
    /// treat this as back-pressure. The item is handed back.
    Full(T),
    /// Receiver dropped. The item is handed back.
    Closed(T),
}

impl<T> PrioritySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

impl<T> std::fmt::Display for PrioritySendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(_) => write!(f, "priority channel full"),
            Self::Closed(_) => write!(f, "priority channel receiver dropped"),
        }
    }
}

impl<T> std::error::Error for PrioritySendError<T> where T: std::fmt::Debug {}

/// Error returned by [`PriorityRx::recv_timeout`].
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, thiserror::Error,
)]
pub enum RecvTimeoutError {
    #[error("priority channel recv timed out")]
    Timeout,
    #[error("priority channel senders dropped")]
    Disconnected,
}

#[derive(Debug)]
struct PriorityState<T> {
    queues: [VecDeque<T>; Priority::COUNT],
    non_critical_len: usize,
    senders: usize,
    receiver_alive: bool,
}

#[derive(Debug)]
struct PriorityShared<T> {
    state: Mutex<PriorityState<T>>,
    available: Condvar,
    capacity: usize,
}

/// Sending half of a bounded multi-priority channel.
///
/// Non-`Critical` sends observe back-pressure once `capacity` non-`Critical`
/// items are queued; `Critical` sends are always admitted while the receiver
/// is alive.
#[derive(Debug)]
pub struct PriorityTx<T> {
    shared: Arc<PriorityShared<T>>,
}

/// Receiving half of a bounded multi-priority channel.
#[derive(Debug)]
pub struct PriorityRx<T> {
    shared: Arc<PriorityShared<T>>,
}

/// Construct a multi-priority channel with the provided non-`Critical`
/// capacity.
pub fn priority_channel<T>(capacity: usize) -> (PriorityTx<T>, PriorityRx<T>) {
    let shared = Arc::new(PriorityShared {
        state: Mutex::new(PriorityState {
            queues: std::array::from_fn(|_| VecDeque::new()),
            non_critical_len: 0,
            senders: 1,
            receiver_alive: true,
        }),
        available: Condvar::new(),
        capacity,
    });

    (
        PriorityTx {
            shared: Arc::clone(&shared),
        },
        PriorityRx { shared },
    )
}

impl<T> PriorityTx<T> {
    pub fn send(&self, item: T, priority: Priority) -> Result<(), PrioritySendError<T>> {
        let mut state = self.shared.state.lock();

        if !state.receiver_alive {
            return Err(PrioritySendError::Closed(item));
        }

        if priority != Priority::Critical && state.non_critical_len >= self.shared.capacity {
            return Err(PrioritySendError::Full(item));
        }

        if priority != Priority::Critical {
            state.non_critical_len += 1;
        }
        state.queues[priority.index()].push_back(item);
        drop(state);

        self.shared.available.notify_one();
        Ok(())
    }
}

impl<T> Clone for PriorityTx<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for PriorityTx<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.senders -= 1;
        let disconnected = state.senders == 0;
        drop(state);

        if disconnected {
            self.shared.available.notify_all();
        }
    }
}

impl<T> PriorityRx<T> {
    fn pop(state: &mut PriorityState<T>) -> Option<T> {
        for (index, queue) in state.queues.iter_mut().enumerate() {
            if let Some(item) = queue.pop_front() {
                if index != Priority::Critical.index() {
                    state.non_critical_len -= 1;
                }
                return Some(item);
            }
        }
        None
    }

    /// Receive the next item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        Self::pop(&mut self.shared.state.lock())
    }

    /// Receive the next item, blocking until one is available or all senders
    /// have been dropped.
    pub fn recv(&mut self) -> Option<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = Self::pop(&mut state) {
                return Some(item);
            }
            if state.senders == 0 {
                return None;
            }
            self.shared.available.wait(&mut state);
        }
    }

    /// Receive the next item, blocking for at most `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = Self::pop(&mut state) {
                return Ok(item);
            }
            if state.senders == 0 {
                return Err(RecvTimeoutError::Disconnected);
            }
            if self
                .shared
                .available
                .wait_for(&mut state, timeout)
                .timed_out()
            {
                return match Self::pop(&mut state) {
                    Some(item) => Ok(item),
                    None => Err(RecvTimeoutError::Timeout),
                };
            }
        }
    }

    /// Number of queued items across all priorities.
    pub fn len(&self) -> usize {
        let state = self.shared.state.lock();
        state.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for PriorityRx<T> {
    fn drop(&mut self) {
        self.shared.state.lock().receiver_alive = false;
    }
}
