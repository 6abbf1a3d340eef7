use crate::{
    EngineEvent,
    error::{EngineError, RecoverableEngineError, UnrecoverableEngineError},
};
use std::time::Duration;
use tracing::{error, info, warn};
use vortex_integration::{
    Terminal, Unrecoverable,
    channel::{
        Priority, PrioritySendError, PriorityRx, PriorityTx, ReceiverDropped, RecvTimeoutError,
        Tx, priority_channel,
    },
};

/// Default bound on queued non-Critical events before producers observe
/// back-pressure.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8_192;

/// Cloneable handle for posting [`EngineEvent`]s onto the dispatch loop.
///
/// Non-Critical posts observe `QueueFull` back-pressure once the queue is at
/// capacity; Critical posts are always admitted. Failure to admit a Critical
/// event is unrecoverable and transitions the engine to fail-stop.
#[derive(Debug, Clone)]
pub struct EventTx {
    tx: PriorityTx<EngineEvent>,
}

impl EventTx {
    /// Post an event with an explicit priority.
    pub fn post(&self, event: EngineEvent, priority: Priority) -> Result<(), EngineError> {
        match self.tx.send(event, priority) {
            Ok(()) => Ok(()),
            Err(PrioritySendError::Full(_)) => {
                Err(RecoverableEngineError::QueueFull.into())
            }
            Err(PrioritySendError::Closed(event)) => {
                if priority == Priority::Critical {
                    Err(UnrecoverableEngineError::CriticalAdmissionFailed(format!(
                        "loop receiver dropped: {event:?}"
                    ))
                    .into())
                } else {
                    Err(RecoverableEngineError::QueueFull.into())
                }
            }
        }
    }
}

impl Tx for EventTx {
    type Item = EngineEvent;

    /// Post an event at its [`EngineEvent::default_priority`].
    fn send(&self, event: Self::Item) -> Result<(), ReceiverDropped> {
        let priority = event.default_priority();
        self.tx.send(event, priority).map_err(|_| ReceiverDropped)
    }
}

/// Construct the dispatch loop channel.
pub fn event_channel(capacity: usize) -> (EventTx, PriorityRx<EngineEvent>) {
    let (tx, rx) = priority_channel(capacity);
    (EventTx { tx }, rx)
}

/// Filter deciding which events a registered handler observes.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Event classes to match; `None` matches all.
    pub classes: Option<Vec<EventClass>>,
}

/// Coarse classification of an [`EngineEvent`] used for handler routing.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EventClass {
    Shutdown,
    Command,
    Market,
    Execution,
    Breaker,
    Control,
    Tick,
}

impl EventClass {
    fn of(event: &EngineEvent) -> Self {
        match event {
            EngineEvent::Shutdown(_) => EventClass::Shutdown,
            EngineEvent::Command(_) => EventClass::Command,
            EngineEvent::Market(_) => EventClass::Market,
            EngineEvent::Execution(_) => EventClass::Execution,
            EngineEvent::Breaker(_) => EventClass::Breaker,
            EngineEvent::Control(_) => EventClass::Control,
            EngineEvent::Tick(_) => EventClass::Tick,
        }
    }
}

impl EventFilter {
    pub fn all() -> Self {
        Self { classes: None }
    }

    pub fn classes(classes: Vec<EventClass>) -> Self {
        Self {
            classes: Some(classes),
        }
    }

    pub fn matches(&self, event: &EngineEvent) -> bool {
        self.classes
            .as_ref()
            .is_none_or(|classes| classes.contains(&EventClass::of(event)))
    }
}

/// Observer invoked for matching events, in registration order.
pub type HandlerFn = Box<dyn FnMut(&EngineEvent) -> Result<(), EngineError> + Send>;

/// Registry of filtered event observers.
///
/// A handler returning an error is reported and does not stop the loop or
/// suppress later handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<(EventFilter, HandlerFn)>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn register(&mut self, filter: EventFilter, handler: HandlerFn) {
        self.handlers.push((filter, handler));
    }

    /// Invoke matching handlers in registration order, collecting failures.
    pub fn dispatch(&mut self, event: &EngineEvent) -> Vec<EngineError> {
        let mut failures = Vec::new();

        for (filter, handler) in &mut self.handlers {
            if !filter.matches(event) {
                continue;
            }
            if let Err(handler_error) = handler(event) {
                warn!(%handler_error, "event handler failed");
                failures.push(handler_error);
            }
        }

        failures
    }
}

/// Why the dispatch loop exited.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ShutdownReason {
    /// A terminal [`EngineEvent::Shutdown`] was processed.
    Commanded,
    /// All event producers disconnected.
    FeedEnded,
}

/// Processes an input event, mutating internal state.
pub trait Processor<Event> {
    type Output;
    fn process(&mut self, event: Event) -> Self::Output;
}

/// Run the synchronous dispatch loop until shutdown.
///
/// Events are popped in priority order (Critical first, FIFO within a
/// priority); registered observers run before the engine mutation so they
/// see every input. When no event arrives within `tick_interval`, a
/// synthetic [`EngineEvent::Tick`] drives timers (due fills, snapshot
/// cadence).
pub fn run<Engine>(
    engine: &mut Engine,
    rx: &mut PriorityRx<EngineEvent>,
    handlers: &mut HandlerRegistry,
    tick_interval: Duration,
    now: impl Fn() -> chrono::DateTime<chrono::Utc>,
) -> ShutdownReason
where
    Engine: Processor<EngineEvent, Output = ()>,
{
    info!("engine dispatch loop running");

    let shutdown_reason = loop {
        let event = match rx.recv_timeout(tick_interval) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => EngineEvent::Tick(now()),
            Err(RecvTimeoutError::Disconnected) => break ShutdownReason::FeedEnded,
        };

        let failures = handlers.dispatch(&event);
        for failure in failures {
            if failure.is_unrecoverable() {
                error!(%failure, "unrecoverable handler failure");
            }
        }

        let terminal = event.is_terminal();
        engine.process(event);

        if terminal {
            break ShutdownReason::Commanded;
        }
    };

    info!(?shutdown_reason, "engine dispatch loop shutting down");
    shutdown_reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use vortex_integration::Shutdown;

    #[derive(Debug, Default)]
    struct CountingEngine {
        processed: Vec<EventClass>,
    }

    impl Processor<EngineEvent> for CountingEngine {
        type Output = ();

        fn process(&mut self, event: EngineEvent) {
            self.processed.push(EventClass::of(&event));
        }
    }

    #[test]
    fn test_loop_processes_until_shutdown_with_priority_order() {
        let (tx, mut rx) = event_channel(64);
        let mut engine = CountingEngine::default();
        let mut handlers = HandlerRegistry::default();

        tx.post(
            EngineEvent::Tick(chrono::Utc::now()),
            Priority::Normal,
        )
        .unwrap();
        tx.post(EngineEvent::Shutdown(Shutdown), Priority::Critical)
            .unwrap();

        let reason = run(
            &mut engine,
            &mut rx,
            &mut handlers,
            Duration::from_millis(100),
            chrono::Utc::now,
        );

        // Critical shutdown jumped the queued tick
        assert_eq!(reason, ShutdownReason::Commanded);
        assert_eq!(engine.processed, vec![EventClass::Shutdown]);
    }

    #[test]
    fn test_handlers_run_in_registration_order_and_failures_do_not_stop_loop() {
        let (tx, mut rx) = event_channel(64);
        let mut engine = CountingEngine::default();
        let mut handlers = HandlerRegistry::default();

        let order = Arc::new(AtomicUsize::new(0));
        let first_seen = Arc::new(AtomicUsize::new(0));
        let second_seen = Arc::new(AtomicUsize::new(0));

        {
            let order = Arc::clone(&order);
            let first_seen = Arc::clone(&first_seen);
            handlers.register(
                EventFilter::all(),
                Box::new(move |_| {
                    first_seen.store(order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
                    Err(crate::error::RecoverableEngineError::Handler(
                        "boom".to_string(),
                    )
                    .into())
                }),
            );
        }
        {
            let order = Arc::clone(&order);
            let second_seen = Arc::clone(&second_seen);
            handlers.register(
                EventFilter::classes(vec![EventClass::Shutdown]),
                Box::new(move |_| {
                    second_seen.store(order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        tx.post(EngineEvent::Shutdown(Shutdown), Priority::Critical)
            .unwrap();
        run(
            &mut engine,
            &mut rx,
            &mut handlers,
            Duration::from_millis(100),
            chrono::Utc::now,
        );

        assert_eq!(first_seen.load(Ordering::SeqCst), 1);
        assert_eq!(second_seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_queue_full_backpressure_maps_to_recoverable_error() {
        let (tx, _rx) = event_channel(1);

        tx.post(EngineEvent::Tick(chrono::Utc::now()), Priority::Normal)
            .unwrap();
        let result = tx.post(EngineEvent::Tick(chrono::Utc::now()), Priority::Low);
        assert!(matches!(
            result,
            Err(EngineError::Recoverable(
                RecoverableEngineError::QueueFull
            ))
        ));

        // Critical is still admitted
        tx.post(EngineEvent::Shutdown(Shutdown), Priority::Critical)
            .unwrap();
    }
}
