use crate::{
    EngineEvent,
    command::parse_line,
    control::{ControlRequest, ControlRequestKind, ControlResponse},
    emitter::{EventEmitter, OutputRecord, ts_ns},
    engine::{
        Engine, IoRequest,
        clock::LiveClock,
        event_loop::{self, EventTx, HandlerRegistry, ShutdownReason},
        state::{EngineState, balance::BalanceLedger},
    },
    error::EngineError,
    persistence::{PersistenceError, SnapshotManager},
    risk::RiskEngine,
    strategy::{Strategy, builtin::ThresholdCross, runtime::StrategyRuntime},
};
use chrono::Utc;
use std::{
    sync::{
        Arc,
        atomic::{AtomicI32, Ordering},
    },
    time::Duration,
};
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, warn};
use vortex_data::{
    connector::{MarketDataConnector, SimulatedFeed, SimulatedFeedConfig},
    event::MarketEvent,
    manager::{MarketDataAction, MarketDataManager},
    subscription::{SubKind, Subscription},
};
use vortex_execution::simulated::SimulatedExecution;
use vortex_instrument::{symbol::InstrumentMap, venue::Venue};
use vortex_integration::{
    Shutdown,
    channel::{Priority, ReceiverDropped, Tx, UnboundedRx, mpsc_unbounded},
};

/// The engine application configuration.
pub mod config;

pub use config::{EngineConfig, RunMode};

pub const EXIT_OK: i32 = 0;
pub const EXIT_INIT_FAILURE: i32 = 2;
pub const EXIT_STATE_CORRUPT: i32 = 3;
pub const EXIT_SIGINT: i32 = 130;
pub const EXIT_SIGTERM: i32 = 143;

/// Fail-stop: a Critical event could not be admitted to the loop, so a
/// graceful shutdown can no longer be ordered. Emit a terminal error event
/// and terminate the process.
fn fail_stop(emitter: &EventEmitter, admission_error: EngineError) -> ! {
    error!(%admission_error, "critical event admission failed - fail-stop");
    emitter.emit(&OutputRecord::Error {
        ts_ns: ts_ns(Utc::now()),
        message: format!("critical event admission failed: {admission_error}"),
        reason: None,
    });
    emitter.flush();
    std::process::exit(EXIT_INIT_FAILURE);
}

/// Adapter posting normalised market events onto the engine loop.
#[derive(Debug, Clone)]
struct MarketEventTx(EventTx);

impl Tx for MarketEventTx {
    type Item = MarketEvent;

    fn send(&self, event: Self::Item) -> Result<(), ReceiverDropped> {
        self.0
            .post(EngineEvent::Market(event), Priority::Normal)
            .map_err(|_| ReceiverDropped)
    }
}

/// Handle the HTTP gateway (or tests) use to drive the core in service
/// mode.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: EventTx,
}

impl ControlHandle {
    pub fn new(tx: EventTx) -> Self {
        Self { tx }
    }

    /// Send a typed control request and await its response.
    pub async fn request(&self, kind: ControlRequestKind) -> Result<ControlResponse, EngineError> {
        let (reply_tx, mut reply_rx) = mpsc_unbounded();

        self.tx.post(
            EngineEvent::Control(ControlRequest {
                kind,
                reply: reply_tx,
            }),
            Priority::High,
        )?;

        Ok(reply_rx
            .rx
            .recv()
            .await
            .unwrap_or(ControlResponse::Error {
                message: "engine dropped control request".to_string(),
            }))
    }
}

/// Build the component graph and run the engine until shutdown, returning
/// the process exit code.
///
/// Shutdown sequence: stop accepting orders (the loop processes the terminal
/// shutdown event), abort the I/O tasks (cancelling in-flight venue
/// requests), flush the emitter and take a final snapshot.
pub fn run(config: EngineConfig) -> i32 {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(runtime_error) => {
            error!(%runtime_error, "failed to initialise I/O executor");
            return EXIT_INIT_FAILURE;
        }
    };

    let emitter = EventEmitter::stdout();
    let (event_tx, mut event_rx) = event_loop::event_channel(config.queue_capacity);
    let (io_tx, io_rx) = mpsc_unbounded::<IoRequest>();

    // Warm restart from the most recent valid snapshot, if any
    let mut persistence = SnapshotManager::new(
        config.snapshot_dir.clone(),
        config.snapshot_cadence,
        config.max_snapshots,
    );
    let restored = match persistence.load_latest() {
        Ok(snapshot) => snapshot,
        Err(PersistenceError::AllSnapshotsCorrupt { candidates }) => {
            error!(
                candidates,
                "state corruption detected on restore with no valid fallback snapshot"
            );
            return EXIT_STATE_CORRUPT;
        }
        Err(persist_error) => {
            error!(%persist_error, "failed to inspect snapshot directory");
            return EXIT_INIT_FAILURE;
        }
    };

    let state = if restored.is_some() {
        EngineState::default()
    } else {
        EngineState::new(BalanceLedger::new(config.initial_balances.clone()))
    };

    let mut strategies = StrategyRuntime::new();
    strategies.register_factory(
        ThresholdCross::NAME,
        Box::new(|id, params| {
            let symbol = vortex_instrument::symbol::SymbolId::new("BTCUSDT")
                .expect("static symbol");
            ThresholdCross::from_params(id, symbol, params)
                .map(|strategy| Box::new(strategy) as Box<dyn Strategy>)
        }),
    );

    let mut engine = Engine::new(
        LiveClock,
        state,
        InstrumentMap::default(),
        MarketDataManager::default(),
        RiskEngine::new(config.risk_limits.clone()),
        strategies,
        SimulatedExecution::new(config.sim),
        emitter.clone(),
        Some(persistence),
        io_tx,
    );

    for (symbol, basis) in &config.cost_basis {
        engine.state.set_cost_basis(symbol.clone(), *basis);
    }

    if let Some(snapshot) = restored {
        engine.restore(snapshot);
    }

    if config.use_testnet {
        info!("testnet mode: venue credentials resolve against test endpoints");
    }
    if let Some(port) = config.http_port {
        info!(port, "service mode: gateway expected to attach via the control surface");
    }

    let exit_code = Arc::new(AtomicI32::new(EXIT_OK));

    // I/O executor tasks: signals, timers, stdin, market data
    let runtime_guard = runtime.enter();
    spawn_signal_task(event_tx.clone(), emitter.clone(), Arc::clone(&exit_code));
    spawn_ticker_task(event_tx.clone(), config.tick_interval_ms);
    let io_task = spawn_io_task(
        io_rx,
        MarketEventTx(event_tx.clone()),
        &config,
    );

    if config.run_mode == RunMode::Stdio {
        spawn_stdin_task(event_tx.clone(), emitter.clone());
    }

    if config.enable_market_data {
        for (symbol, _) in &config.symbols {
            for kind in [SubKind::OrderBooks, SubKind::PublicTrades] {
                let subscription =
                    Subscription::new(Venue::Simulated, symbol.clone(), kind);
                let _admitted = event_tx.post(
                    EngineEvent::Command(crate::command::Command::Subscribe(subscription)),
                    Priority::High,
                );
            }
        }
    }

    // The dispatch loop owns all state mutation on its own thread
    let tick_interval = Duration::from_millis(config.tick_interval_ms);
    let loop_handle = std::thread::spawn(move || {
        let mut handlers = HandlerRegistry::default();
        let reason = event_loop::run(
            &mut engine,
            &mut event_rx,
            &mut handlers,
            tick_interval,
            Utc::now,
        );
        (reason, engine)
    });

    let (reason, mut engine) = match loop_handle.join() {
        Ok(outcome) => outcome,
        Err(_panic) => {
            error!("engine dispatch loop panicked");
            return EXIT_INIT_FAILURE;
        }
    };

    // Cancel in-flight venue requests, then flush and snapshot
    io_task.abort();
    engine.shutdown();
    drop(runtime_guard);
    runtime.shutdown_timeout(Duration::from_secs(5));

    if reason == ShutdownReason::FeedEnded {
        warn!("all event producers disconnected before shutdown command");
    }

    exit_code.load(Ordering::SeqCst)
}

fn spawn_signal_task(tx: EventTx, emitter: EventEmitter, exit_code: Arc<AtomicI32>) {
    tokio::spawn(async move {
        let sigint = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(signal_error) => {
                    error!(%signal_error, "failed to install SIGTERM handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigint => {
                    info!("SIGINT received - shutting down");
                    exit_code.store(EXIT_SIGINT, Ordering::SeqCst);
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received - shutting down");
                    exit_code.store(EXIT_SIGTERM, Ordering::SeqCst);
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = sigint.await;
            info!("SIGINT received - shutting down");
            exit_code.store(EXIT_SIGINT, Ordering::SeqCst);
        }

        if let Err(admission_error) = tx.post(EngineEvent::Shutdown(Shutdown), Priority::Critical)
        {
            fail_stop(&emitter, admission_error);
        }
    });
}

fn spawn_ticker_task(tx: EventTx, tick_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(tick_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if tx
                .post(EngineEvent::Tick(Utc::now()), Priority::High)
                .is_err()
            {
                break;
            }
        }
    });
}

fn spawn_stdin_task(tx: EventTx, emitter: EventEmitter) {
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    match parse_line(trimmed) {
                        Ok(command) => {
                            if let Err(post_error) =
                                tx.post(EngineEvent::Command(command), Priority::High)
                            {
                                // Back-pressure: surface and drop the command
                                emitter.emit(&OutputRecord::Error {
                                    ts_ns: ts_ns(Utc::now()),
                                    message: format!("command dropped: {post_error}"),
                                    reason: Some("QUEUE_FULL".to_string()),
                                });
                            }
                        }
                        Err(parse_error) => {
                            emitter.emit(&OutputRecord::Error {
                                ts_ns: ts_ns(Utc::now()),
                                message: parse_error.to_string(),
                                reason: None,
                            });
                        }
                    }
                }
                Ok(None) => {
                    info!("stdin closed - shutting down");
                    if let Err(admission_error) =
                        tx.post(EngineEvent::Shutdown(Shutdown), Priority::Critical)
                    {
                        fail_stop(&emitter, admission_error);
                    }
                    break;
                }
                Err(read_error) => {
                    error!(%read_error, "failed reading stdin");
                    break;
                }
            }
        }
    });
}

fn spawn_io_task(
    mut io_rx: UnboundedRx<IoRequest>,
    market_tx: MarketEventTx,
    config: &EngineConfig,
) -> tokio::task::JoinHandle<()> {
    let enable_market_data = config.enable_market_data;
    let feed_interval = Duration::from_millis(config.feed_interval_ms.max(1));
    let seeds = config.symbols.clone();

    tokio::spawn(async move {
        let mut feed = enable_market_data.then(|| {
            SimulatedFeed::new(market_tx, SimulatedFeedConfig::default(), seeds)
        });

        let mut interval = tokio::time::interval(feed_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(feed) = feed.as_mut() {
                        feed.tick(Utc::now());
                    }
                }
                request = io_rx.rx.recv() => {
                    let Some(request) = request else { break };
                    handle_io_request(request, feed.as_mut()).await;
                }
            }
        }
    })
}

async fn handle_io_request(
    request: IoRequest,
    feed: Option<&mut SimulatedFeed<MarketEventTx>>,
) {
    match request {
        IoRequest::MarketData(action) => {
            let Some(feed) = feed else {
                warn!(?action, "market data disabled - dropping action");
                return;
            };

            let result = match action {
                MarketDataAction::VenueSubscribe(ref subscription)
                    if subscription.venue == Venue::Simulated =>
                {
                    feed.subscribe(std::slice::from_ref(subscription)).await
                }
                MarketDataAction::VenueUnsubscribe(ref subscription)
                    if subscription.venue == Venue::Simulated =>
                {
                    feed.unsubscribe(std::slice::from_ref(subscription)).await
                }
                MarketDataAction::RequestBookSnapshot {
                    venue: Venue::Simulated,
                    ref symbol,
                } => feed.request_book_snapshot(symbol).await,
                other => {
                    warn!(?other, "no live venue adapter configured - dropping action");
                    Ok(())
                }
            };

            if let Err(data_error) = result {
                warn!(%data_error, "market data action failed");
            }
        }
        IoRequest::Execution(directive) => {
            // Live execution adapters attach here; the simulated venue is
            // filled in-engine by the due-fill timer
            warn!(?directive, "no live execution adapter configured - dropping directive");
        }
    }
}
