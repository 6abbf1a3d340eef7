use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use vortex::{
    EngineEvent,
    command::parse_line,
    emitter::{EventEmitter, MemorySink},
    engine::{
        Engine, IoRequest,
        clock::LiveClock,
        event_loop::Processor,
        state::{EngineState, balance::BalanceLedger},
    },
    persistence::{SnapshotCadence, SnapshotManager},
    risk::{RiskEngine, RiskLimits},
    strategy::runtime::StrategyRuntime,
};
use vortex_data::{
    books::{OrderBook, sequenced::BookStatus},
    event::{DataKind, MarketEvent, OrderBookDelta, OrderBookEvent},
    manager::{MarketDataAction, MarketDataManager},
};
use vortex_execution::{
    order::ClientOrderId,
    simulated::{SimulatedExecution, SimulatedExecutionConfig},
};
use vortex_instrument::{
    asset::AssetName,
    symbol::{InstrumentMap, SymbolId},
    venue::Venue,
};
use vortex_integration::channel::{UnboundedRx, mpsc_unbounded};

struct Harness {
    engine: Engine<LiveClock>,
    sink: MemorySink,
    io_rx: UnboundedRx<IoRequest>,
}

/// Risk limits generous enough that only the targeted gate can reject.
fn open_limits() -> RiskLimits {
    RiskLimits {
        max_order_notional: dec!(1_000_000_000),
        max_position_per_symbol: dec!(1_000_000),
        max_leverage: dec!(1_000_000),
        max_daily_loss_pct: dec!(1),
        max_price_deviation: dec!(1),
        ..RiskLimits::default()
    }
}

fn harness(balances: Vec<(&str, Decimal)>, latency_ms: u64) -> Harness {
    let sink = MemorySink::new();
    let (io_tx, io_rx) = mpsc_unbounded();

    let ledger = BalanceLedger::new(
        balances
            .into_iter()
            .map(|(asset, amount)| (AssetName::from_name(asset), amount)),
    );

    let engine = Engine::new(
        LiveClock,
        EngineState::new(ledger),
        InstrumentMap::default(),
        MarketDataManager::default(),
        RiskEngine::new(open_limits()),
        StrategyRuntime::new(),
        SimulatedExecution::new(SimulatedExecutionConfig {
            latency_ms,
            slippage_bps: 0,
            fees_bps: 0,
        }),
        EventEmitter::new(Box::new(sink.clone())),
        None,
        io_tx,
    );

    Harness {
        engine,
        sink,
        io_rx,
    }
}

fn symbol(name: &str) -> SymbolId {
    SymbolId::new(name).unwrap()
}

fn book_snapshot(symbol_name: &str, sequence: u64, bid: Decimal, ask: Decimal) -> EngineEvent {
    let now = Utc::now();
    EngineEvent::Market(MarketEvent::new(
        Venue::Simulated,
        symbol(symbol_name),
        now,
        now,
        DataKind::Book(OrderBookEvent::Snapshot(OrderBook::new(
            sequence,
            Some(now),
            vec![(bid, dec!(5))],
            vec![(ask, dec!(5))],
        ))),
    ))
}

fn book_delta(symbol_name: &str, prev_sequence: u64, sequence: u64) -> EngineEvent {
    let now = Utc::now();
    EngineEvent::Market(MarketEvent::new(
        Venue::Simulated,
        symbol(symbol_name),
        now,
        now,
        DataKind::Book(OrderBookEvent::Delta(OrderBookDelta::new(
            prev_sequence,
            sequence,
            vec![],
            vec![],
        ))),
    ))
}

fn command(harness: &mut Harness, line: &str) {
    let command = parse_line(line).unwrap();
    harness.engine.process(EngineEvent::Command(command));
}

fn records_of_type(sink: &MemorySink, record_type: &str) -> Vec<serde_json::Value> {
    sink.lines()
        .iter()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .filter(|value| value["type"] == record_type)
        .collect()
}

fn free(engine: &Engine<LiveClock>, asset: &str) -> Decimal {
    engine
        .state
        .balances
        .balance(&AssetName::from_name(asset))
        .free
}

fn locked(engine: &Engine<LiveClock>, asset: &str) -> Decimal {
    engine
        .state
        .balances
        .balance(&AssetName::from_name(asset))
        .locked
}

#[test]
fn scenario_happy_limit_buy_simulated() {
    let mut harness = harness(vec![("USDT", dec!(100_000))], 0);

    harness
        .engine
        .process(book_snapshot("BTCUSDT", 1, dec!(49_990), dec!(50_010)));

    command(&mut harness, "ORDER c1 BTCUSDT Buy Limit 0.5 49000 GTC");

    // Accepted: reservation moved to locked, order_update{New} emitted
    assert_eq!(free(&harness.engine, "USDT"), dec!(75_500));
    assert_eq!(locked(&harness.engine, "USDT"), dec!(24_500));

    let updates = records_of_type(&harness.sink, "order_update");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["client_order_id"], "c1");
    assert_eq!(updates[0]["status"], "New");

    // Zero simulated latency: the next tick collects the due fill
    harness.engine.process(EngineEvent::Tick(Utc::now()));

    let fills = records_of_type(&harness.sink, "fill");
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0]["client_order_id"], "c1");
    assert_eq!(fills[0]["qty"], "0.5");
    assert_eq!(fills[0]["price"], "49000");

    let updates = records_of_type(&harness.sink, "order_update");
    assert_eq!(updates.last().unwrap()["status"], "Filled");

    // fill emitted before the terminal order_update
    let lines = harness.sink.lines();
    let fill_index = lines.iter().position(|line| line.contains("\"fill\"")).unwrap();
    let filled_index = lines.iter().position(|line| line.contains("Filled")).unwrap();
    assert!(fill_index < filled_index);

    assert_eq!(free(&harness.engine, "USDT"), dec!(75_500));
    assert_eq!(locked(&harness.engine, "USDT"), dec!(0));
    assert_eq!(free(&harness.engine, "BTC"), dec!(0.5));
    assert!(harness.engine.state.check_invariants().is_ok());
}

#[test]
fn scenario_duplicate_client_order_id() {
    let mut harness = harness(vec![("USDT", dec!(100_000))], 0);
    harness
        .engine
        .process(book_snapshot("BTCUSDT", 1, dec!(49_990), dec!(50_010)));

    command(&mut harness, "ORDER c1 BTCUSDT Buy Limit 0.5 49000 GTC");
    harness.engine.process(EngineEvent::Tick(Utc::now()));

    let usdt_free = free(&harness.engine, "USDT");
    let btc_free = free(&harness.engine, "BTC");

    // Replay the same order: rejected as duplicate with no state change
    command(&mut harness, "ORDER c1 BTCUSDT Buy Limit 0.5 49000 GTC");

    let errors = records_of_type(&harness.sink, "error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["reason"], "DUPLICATE_COID");

    assert_eq!(free(&harness.engine, "USDT"), usdt_free);
    assert_eq!(free(&harness.engine, "BTC"), btc_free);
    assert_eq!(records_of_type(&harness.sink, "fill").len(), 1);
}

#[test]
fn scenario_insufficient_funds() {
    let mut harness = harness(vec![("USDT", dec!(100))], 0);
    harness
        .engine
        .process(book_snapshot("BTCUSDT", 1, dec!(49_990), dec!(50_010)));

    command(&mut harness, "ORDER c2 BTCUSDT Buy Limit 1 50000 GTC");

    let updates = records_of_type(&harness.sink, "order_update");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["client_order_id"], "c2");
    assert_eq!(updates[0]["status"], "Rejected");
    assert!(
        updates[0]["reason"]
            .as_str()
            .unwrap()
            .contains("INSUFFICIENT_FUNDS")
    );

    // No mutation to balances, reservations or pending orders
    assert_eq!(free(&harness.engine, "USDT"), dec!(100));
    assert_eq!(locked(&harness.engine, "USDT"), dec!(0));
    assert_eq!(harness.engine.state.orders.pending_len(), 0);
}

#[test]
fn scenario_cancel_then_recancel() {
    let mut harness = harness(vec![("USDT", dec!(10_000)), ("ETH", dec!(10))], 60_000);
    harness
        .engine
        .process(book_snapshot("ETHUSDT", 1, dec!(2_999), dec!(3_001)));

    command(&mut harness, "ORDER c3 ETHUSDT Sell Limit 1 3000 GTC");
    assert_eq!(free(&harness.engine, "ETH"), dec!(9));
    assert_eq!(locked(&harness.engine, "ETH"), dec!(1));

    command(&mut harness, "CANCEL c3");
    let updates = records_of_type(&harness.sink, "order_update");
    assert_eq!(updates.last().unwrap()["status"], "Canceled");
    assert_eq!(free(&harness.engine, "ETH"), dec!(10));
    assert_eq!(locked(&harness.engine, "ETH"), dec!(0));

    // Idempotent: the second cancel yields found=false, no second event
    command(&mut harness, "CANCEL c3");
    let errors = records_of_type(&harness.sink, "error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["reason"], "ORDER_NOT_FOUND");
    assert!(errors[0]["message"].as_str().unwrap().contains("found=false"));

    let canceled_events = records_of_type(&harness.sink, "order_update")
        .into_iter()
        .filter(|update| update["status"] == "Canceled")
        .count();
    assert_eq!(canceled_events, 1);

    // The terminal state remains queryable
    command(&mut harness, "QUERY order c3");
    let states = records_of_type(&harness.sink, "order_state");
    assert_eq!(states.len(), 1);
    assert_eq!(states[0]["client_order_id"], "c3");
    assert_eq!(states[0]["status"], "Canceled");

    command(&mut harness, "QUERY balances");
    let accounts = records_of_type(&harness.sink, "account");
    assert_eq!(accounts.len(), 1);
    let balances = accounts[0]["balances"].as_array().unwrap();
    assert!(balances.iter().any(|entry| entry["asset"] == "ETH" && entry["free"] == "10"));
}

#[test]
fn control_surface_reports_status_and_toggles_trading() {
    use vortex::control::{ControlRequest, ControlRequestKind, ControlResponse};
    use vortex_integration::channel::mpsc_unbounded as control_channel;

    let mut harness = harness(vec![("USDT", dec!(100_000))], 60_000);
    harness
        .engine
        .process(book_snapshot("BTCUSDT", 1, dec!(49_990), dec!(50_010)));

    let (reply_tx, mut reply_rx) = control_channel();
    harness.engine.process(EngineEvent::Control(ControlRequest {
        kind: ControlRequestKind::Status,
        reply: reply_tx.clone(),
    }));

    let responses = reply_rx.drain();
    let ControlResponse::Status(status) = &responses[0] else {
        panic!("expected status response");
    };
    assert!(status.trading_enabled);
    assert!(!status.breaker_tripped);
    assert_eq!(status.pending_orders, 0);
    assert_eq!(status.venues.len(), 1);

    // Stop disables order acceptance until Start
    harness.engine.process(EngineEvent::Control(ControlRequest {
        kind: ControlRequestKind::Stop,
        reply: reply_tx.clone(),
    }));
    assert_eq!(reply_rx.drain(), vec![ControlResponse::Ack]);

    command(&mut harness, "ORDER c9 BTCUSDT Buy Limit 0.1 49000 GTC");
    assert_eq!(harness.engine.state.orders.pending_len(), 0);

    harness.engine.process(EngineEvent::Control(ControlRequest {
        kind: ControlRequestKind::Start,
        reply: reply_tx,
    }));
    assert_eq!(reply_rx.drain(), vec![ControlResponse::Ack]);

    command(&mut harness, "ORDER c10 BTCUSDT Buy Limit 0.1 49000 GTC");
    assert_eq!(harness.engine.state.orders.pending_len(), 1);
}

#[test]
fn scenario_book_gap_recovery() {
    let mut harness = harness(vec![("USDT", dec!(10_000))], 0);

    harness
        .engine
        .process(book_snapshot("BTCUSDT", 100, dec!(49_990), dec!(50_010)));
    harness.engine.process(book_delta("BTCUSDT", 100, 101));

    let book = harness
        .engine
        .market
        .books()
        .find(Venue::Simulated, &symbol("BTCUSDT"))
        .unwrap();
    assert_eq!(book.read().status(), BookStatus::Valid);
    assert_eq!(book.read().sequence(), 101);

    // Gap: prev=103 does not follow 101
    harness.engine.process(book_delta("BTCUSDT", 103, 104));
    assert_eq!(book.read().status(), BookStatus::Stale);

    // The engine issued a resnapshot request to the venue adapter
    let actions: Vec<_> = harness.io_rx.drain();
    assert!(actions.iter().any(|request| matches!(
        request,
        IoRequest::MarketData(MarketDataAction::RequestBookSnapshot { venue: Venue::Simulated, symbol })
            if symbol == &self::symbol("BTCUSDT")
    )));

    // Resnapshot arrives at sequence 110; the book recovers
    harness
        .engine
        .process(book_snapshot("BTCUSDT", 110, dec!(49_990), dec!(50_010)));
    assert_eq!(book.read().status(), BookStatus::Valid);
    assert_eq!(book.read().sequence(), 110);

    harness.engine.process(book_delta("BTCUSDT", 110, 111));
    assert_eq!(book.read().status(), BookStatus::Valid);
    assert_eq!(book.read().sequence(), 111);
}

#[test]
fn scenario_warm_restart() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();

    let manager = |dir: &std::path::Path| {
        SnapshotManager::new(dir.to_path_buf(), SnapshotCadence::default(), 3)
    };

    // First life: two resting limit orders
    let mut first = harness(vec![("USDT", dec!(100_000)), ("ETH", dec!(10))], 60_000);
    first.engine.persistence = Some(manager(dir.path()));

    first
        .engine
        .process(book_snapshot("BTCUSDT", 1, dec!(49_990), dec!(50_010)));
    command(&mut first, "ORDER w1 BTCUSDT Buy Limit 0.5 49000 GTC");
    command(&mut first, "ORDER w2 ETHUSDT Sell Limit 2 3100 GTC");

    let usdt_before = (free(&first.engine, "USDT"), locked(&first.engine, "USDT"));
    let eth_before = (free(&first.engine, "ETH"), locked(&first.engine, "ETH"));
    let venue_counter_before = first.engine.state.venue_order_sequence();

    first.engine.take_snapshot(now).unwrap();

    // Second life: restore from disk
    let mut second = harness(vec![], 0);
    second.engine.persistence = Some(manager(dir.path()));

    let snapshot = second
        .engine
        .persistence
        .as_ref()
        .unwrap()
        .load_latest()
        .unwrap()
        .unwrap();
    second.engine.restore(snapshot);

    assert_eq!(
        (free(&second.engine, "USDT"), locked(&second.engine, "USDT")),
        usdt_before
    );
    assert_eq!(
        (free(&second.engine, "ETH"), locked(&second.engine, "ETH")),
        eth_before
    );
    assert_eq!(second.engine.state.orders.pending_len(), 2);
    assert_eq!(
        second.engine.state.venue_order_sequence(),
        venue_counter_before
    );
    assert!(second.engine.state.check_invariants().is_ok());

    // A subsequent fill transitions state identically to the pre-restart
    // continuation
    let cid = ClientOrderId::new("w1").unwrap();
    second
        .engine
        .apply_fill(&cid, dec!(49_000), dec!(0.5), dec!(0), Utc::now());

    assert_eq!(free(&second.engine, "USDT"), dec!(75_500));
    assert_eq!(free(&second.engine, "BTC"), dec!(0.5));
    assert_eq!(second.engine.state.orders.pending_len(), 1);

    // Venue order ids continue monotonically across the restart
    command(&mut second, "ORDER w3 ETHUSDT Sell Limit 1 3100 GTC");
    let pending_w3 = second
        .engine
        .state
        .orders
        .pending(&ClientOrderId::new("w3").unwrap())
        .unwrap();
    assert_eq!(pending_w3.venue_order_id.0, venue_counter_before + 1);
}

#[test]
fn reconciliation_corrects_local_orders_from_venue_view() {
    use vortex_execution::{
        client::UserEvent,
        order::OrderStatus,
        reconcile::{Divergence, ReconcileOrder, ReconcileReport},
    };

    let mut harness = harness(vec![("USDT", dec!(10_000)), ("ETH", dec!(10))], 60_000);
    harness
        .engine
        .process(book_snapshot("ETHUSDT", 1, dec!(2_999), dec!(3_001)));

    command(&mut harness, "ORDER r1 ETHUSDT Sell Limit 1 3000 GTC");
    assert_eq!(locked(&harness.engine, "ETH"), dec!(1));

    let cid = ClientOrderId::new("r1").unwrap();
    let untracked = ClientOrderId::new("x1").unwrap();
    let report = ReconcileReport::new(
        Venue::Simulated,
        Utc::now(),
        vec![
            // Venue no longer tracks r1 as open: local state is corrected
            Divergence::OrderStateDivergence {
                cid: cid.clone(),
                local: ReconcileOrder::new(cid.clone(), OrderStatus::New, dec!(0)),
                venue: ReconcileOrder::new(cid.clone(), OrderStatus::Canceled, dec!(0)),
            },
            // Venue reports an order the engine never saw: adopted locally
            Divergence::OrderMissingLocally(ReconcileOrder::new(
                untracked.clone(),
                OrderStatus::PartiallyFilled,
                dec!(0.4),
            )),
        ],
    );
    harness
        .engine
        .process(EngineEvent::Execution(UserEvent::Reconciliation(report)));

    // The diverging order adopted the venue's terminal state, releasing the
    // reservation
    let record = harness.engine.state.orders.record(&cid).unwrap();
    assert_eq!(record.status, OrderStatus::Canceled);
    assert_eq!(harness.engine.state.orders.pending_len(), 0);
    assert_eq!(locked(&harness.engine, "ETH"), dec!(0));
    assert_eq!(free(&harness.engine, "ETH"), dec!(10));

    // The untracked order now exists locally with the venue's view
    let adopted = harness.engine.state.orders.record(&untracked).unwrap();
    assert_eq!(adopted.status, OrderStatus::PartiallyFilled);
    assert_eq!(adopted.executed_qty, dec!(0.4));

    let updates = records_of_type(&harness.sink, "order_update");
    assert!(updates.iter().any(|update| {
        update["client_order_id"] == "r1" && update["status"] == "Canceled"
    }));
    assert!(updates.iter().any(|update| {
        update["client_order_id"] == "x1" && update["status"] == "PartiallyFilled"
    }));
}

#[test]
fn breaker_trip_rejects_orders_until_explicit_reset() {
    use vortex::risk::breaker::BreakerCommand;

    let mut harness = harness(vec![("USDT", dec!(100_000))], 60_000);
    harness
        .engine
        .process(book_snapshot("BTCUSDT", 1, dec!(49_990), dec!(50_010)));

    harness.engine.process(EngineEvent::Breaker(BreakerCommand::Trip {
        reason: "operator".to_string(),
    }));

    command(&mut harness, "ORDER b1 BTCUSDT Buy Limit 0.1 49000 GTC");
    let errors = records_of_type(&harness.sink, "error");
    assert!(
        errors
            .iter()
            .any(|error| error["reason"] == "CIRCUIT_BREAKER"
                && error["message"].as_str().unwrap().contains("b1"))
    );
    assert_eq!(harness.engine.state.orders.pending_len(), 0);
    assert_eq!(locked(&harness.engine, "USDT"), dec!(0));

    // Explicit reset re-enables trading
    harness
        .engine
        .process(EngineEvent::Breaker(BreakerCommand::Reset));

    command(&mut harness, "ORDER b2 BTCUSDT Buy Limit 0.1 49000 GTC");
    let updates = records_of_type(&harness.sink, "order_update");
    assert_eq!(updates.last().unwrap()["client_order_id"], "b2");
    assert_eq!(updates.last().unwrap()["status"], "New");
}

#[test]
fn accepted_orders_emit_new_exactly_once_before_any_fill() {
    let mut harness = harness(vec![("USDT", dec!(100_000))], 0);
    harness
        .engine
        .process(book_snapshot("BTCUSDT", 1, dec!(49_990), dec!(50_010)));

    for index in 1..=5 {
        command(
            &mut harness,
            &format!("ORDER o{index} BTCUSDT Buy Limit 0.1 49000 GTC"),
        );
    }
    harness.engine.process(EngineEvent::Tick(Utc::now()));

    let lines = harness.sink.lines();
    for index in 1..=5 {
        let cid = format!("o{index}");
        let new_positions: Vec<_> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.contains(&cid) && line.contains("\"New\""))
            .map(|(position, _)| position)
            .collect();
        assert_eq!(new_positions.len(), 1, "{cid} must emit New exactly once");

        let first_fill = lines
            .iter()
            .position(|line| line.contains(&cid) && line.contains("\"fill\""))
            .unwrap();
        assert!(new_positions[0] < first_fill);
    }
}
