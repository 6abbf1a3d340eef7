use crate::{
    EngineEvent, Sequence,
    command::{Command, QueryTarget, StrategyCommand},
    control::{
        ControlRequest, ControlRequestKind, ControlResponse, EngineStatus, VenueStatus,
    },
    emitter::{BalanceEntry, EventEmitter, OutputRecord, ts_ns},
    engine::{
        clock::{EngineClock, LiveClock},
        event_loop::Processor,
        state::{EngineState, TradingState, order::{PendingOrder, Reservation}},
    },
    error::{OrderReject, RejectCode},
    persistence::{PersistenceError, SnapshotManager, StateSnapshot, SymbolPrice},
    risk::{RiskContext, RiskEngine, breaker::BreakerCommand},
    strategy::{params::ParamSet, runtime::{DispatchOutcome, StrategyRuntime}},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use smol_str::{SmolStr, ToSmolStr};
use tracing::{debug, error, info, warn};
use vortex_data::{
    books::Level,
    event::{DataKind, MarketEvent, OrderBookEvent},
    manager::{MarketDataAction, MarketDataManager},
    subscription::Subscription,
};
use vortex_execution::{
    client::{ExecutionReport, UserEvent},
    error::ExecutionError,
    order::{
        ClientOrderId, OrderKind, OrderStateRecord, OrderStatus, PlaceOrderRequest, StrategyId,
    },
    reconcile::{Divergence, ReconcileReport},
    simulated::SimulatedExecution,
    trade::{Fees, Fill},
};
use vortex_instrument::{Side, symbol::InstrumentMap, venue::Venue};
use vortex_integration::channel::{ChannelTxDroppable, Tx, UnboundedTx};

/// Engine time sources.
pub mod clock;

/// The priority dispatch loop, handler registry and loop runner.
pub mod event_loop;

/// Authoritative engine state.
pub mod state;

/// Request for the I/O executor, posted by the engine so the loop itself
/// never performs venue or network work.
#[derive(Debug, Clone)]
pub enum IoRequest {
    MarketData(MarketDataAction),
    Execution(ExecutionDirective),
}

/// Venue-facing execution work for the I/O executor.
#[derive(Debug, Clone)]
pub enum ExecutionDirective {
    Place {
        request: PlaceOrderRequest,
        deadline_ms: u64,
    },
    Cancel {
        venue: Venue,
        cid: ClientOrderId,
    },
}

/// Running engine metadata.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EngineMeta {
    /// Clock timestamp of the current engine run start.
    pub time_start: DateTime<Utc>,
    /// Monotonically increasing count of events processed.
    pub sequence: Sequence,
}

/// Deadline attached to venue requests dispatched to the I/O executor.
const VENUE_DEADLINE_MS: u64 = 5_000;

/// Consecutive snapshot write failures that trip the circuit breaker.
const MAX_SNAPSHOT_FAILURES: u32 = 3;

/// The core trading engine.
///
/// Processes input [`EngineEvent`]s serially: maintains the authoritative
/// account and order state, gates orders through the risk engine, drives the
/// simulated venue fill model, hosts strategies, persists snapshots and
/// emits the external event stream. All I/O is expressed as [`IoRequest`]s
/// drained by the shell's executor tasks.
#[derive(Debug)]
pub struct Engine<Clock = LiveClock> {
    pub clock: Clock,
    pub meta: EngineMeta,
    pub state: EngineState,
    pub instruments: InstrumentMap,
    pub market: MarketDataManager,
    pub risk: RiskEngine,
    pub strategies: StrategyRuntime,
    pub sim: SimulatedExecution,
    pub emitter: EventEmitter,
    pub persistence: Option<SnapshotManager>,
    pub io_tx: ChannelTxDroppable<UnboundedTx<IoRequest>>,
    paused_by_breaker: Vec<StrategyId>,
    snapshot_failures: u32,
}

impl<Clock> Processor<EngineEvent> for Engine<Clock>
where
    Clock: EngineClock,
{
    type Output = ();

    fn process(&mut self, event: EngineEvent) {
        self.meta.sequence.fetch_add();

        match event {
            EngineEvent::Shutdown(_) => {
                info!("engine received shutdown - no longer accepting orders");
                self.state.trading = TradingState::Disabled;
            }
            EngineEvent::Command(command) => self.process_command(command),
            EngineEvent::Market(market_event) => self.process_market(market_event),
            EngineEvent::Execution(user_event) => self.process_execution(user_event),
            EngineEvent::Breaker(command) => self.process_breaker(command),
            EngineEvent::Control(request) => self.process_control(request),
            EngineEvent::Tick(now) => self.process_tick(now),
        }
    }
}

impl<Clock> Engine<Clock>
where
    Clock: EngineClock,
{
    pub fn new(
        clock: Clock,
        state: EngineState,
        instruments: InstrumentMap,
        market: MarketDataManager,
        risk: RiskEngine,
        strategies: StrategyRuntime,
        sim: SimulatedExecution,
        emitter: EventEmitter,
        persistence: Option<SnapshotManager>,
        io_tx: UnboundedTx<IoRequest>,
    ) -> Self {
        let time_start = clock.time();
        Self {
            clock,
            meta: EngineMeta {
                time_start,
                sequence: Sequence(0),
            },
            state,
            instruments,
            market,
            risk,
            strategies,
            sim,
            emitter,
            persistence,
            io_tx: ChannelTxDroppable::new(io_tx),
            paused_by_breaker: Vec::new(),
            snapshot_failures: 0,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.clock.time()
    }

    /// Rehydrate engine state from a persisted snapshot: balances, pending
    /// orders (rebuilding reservations), reference prices, the venue order
    /// id counter and strategy state.
    pub fn restore(&mut self, snapshot: StateSnapshot) {
        for balance in snapshot.balances {
            self.state.balances.set(balance.asset, balance.balance);
        }
        for price in snapshot.prices {
            self.state.update_price(&price.symbol, price.price);
            self.risk.update_reference_price(&price.symbol, price.price);
        }
        self.state
            .restore_venue_order_sequence(snapshot.venue_counter);
        self.state.orders.restore(snapshot.pending_orders);
        self.strategies.restore(snapshot.strategies);
        // Snapshot sequence numbers stay strictly increasing across restarts
        self.meta.sequence = Sequence(snapshot.meta.sequence_num);

        if let Err(violation) = self.state.check_invariants() {
            error!(%violation, "restored state violates ledger invariants");
        }

        info!(
            sequence_num = snapshot.meta.sequence_num,
            "engine state restored from snapshot"
        );
    }

    /// Final shutdown work once the loop has stopped: flush the emitter and
    /// persist a final snapshot.
    pub fn shutdown(&mut self) {
        self.state.trading = TradingState::Disabled;
        self.emitter.flush();

        let now = self.time();
        if let Err(persist_error) = self.take_snapshot(now) {
            error!(%persist_error, "failed to write final shutdown snapshot");
        }
    }

    // ---------------------------------------------------------------- orders

    /// Place an order: validate, reserve, risk-gate, then hand to the venue.
    pub fn place_order(&mut self, request: PlaceOrderRequest, now: DateTime<Utc>) {
        if self.state.trading == TradingState::Disabled {
            let reason = self
                .risk
                .breaker
                .trip_reason()
                .unwrap_or("trading disabled")
                .to_string();
            self.emit_error(
                format!("order {} refused: {reason}", request.cid),
                Some(RejectCode::CircuitBreaker),
            );
            return;
        }

        if let Err(validation_error) = request.validate() {
            self.emit_error(
                format!("order {} invalid: {validation_error}", request.cid),
                Some(RejectCode::InvalidRequest),
            );
            return;
        }

        // At-most-once per client order id
        if self.state.orders.contains(&request.cid) {
            self.emit_error(
                format!("duplicate client order id: {}", request.cid),
                Some(RejectCode::DuplicateCoid),
            );
            return;
        }

        let instrument = match self.instruments.resolve(&request.symbol) {
            Ok(instrument) => instrument.clone(),
            Err(symbol_error) => {
                self.emit_error(
                    format!("order {} invalid: {symbol_error}", request.cid),
                    Some(RejectCode::InvalidRequest),
                );
                return;
            }
        };

        let (best_bid, best_ask) = self.book_top_prices(request.venue, &request.symbol);

        let reservation = match self.compute_reservation(&request, &instrument, best_ask) {
            Ok(reservation) => reservation,
            Err(reject) => return self.reject_order(&request, reject, now),
        };

        let risk_ctx = self.risk_context(&request, best_bid, best_ask);
        if let Err(reject) = self.risk.pre_trade(&request, &risk_ctx) {
            return self.reject_order(&request, reject, now);
        }

        if let Err(free) = self
            .state
            .balances
            .reserve(&reservation.asset, reservation.amount)
        {
            let reject = OrderReject::new(
                RejectCode::InsufficientFunds,
                format!(
                    "requires {} {}, free {free}",
                    reservation.amount, reservation.asset
                ),
            );
            return self.reject_order(&request, reject, now);
        }

        let venue_order_id = self.state.next_venue_order_id();
        let time_due_fill =
            (request.venue == Venue::Simulated).then(|| self.sim.due_time(now));

        let pending = PendingOrder {
            request: request.clone(),
            time_accepted: now,
            time_due_fill,
            reservation,
            venue_order_id,
        };
        let record = OrderStateRecord::new_accepted(request.cid.clone(), venue_order_id, now);
        self.state.orders.insert_pending(pending, record);

        debug!(cid = %request.cid, %venue_order_id, "order accepted");
        self.emit(OutputRecord::OrderUpdate {
            ts_ns: ts_ns(now),
            client_order_id: request.cid.to_smolstr(),
            status: OrderStatus::New,
            symbol: Some(request.symbol.clone()),
            side: Some(request.side),
            qty: Some(request.qty),
            price: request.price,
            venue_order_id: Some(venue_order_id),
            reason: None,
        });

        if request.venue != Venue::Simulated {
            self.send_io(IoRequest::Execution(ExecutionDirective::Place {
                request,
                deadline_ms: VENUE_DEADLINE_MS,
            }));
        }

        self.after_mutation(now);
    }

    /// Cancel an order. Idempotent: cancelling an unknown or terminal order
    /// emits an `ORDER_NOT_FOUND` error and mutates nothing.
    pub fn cancel_order(&mut self, cid: &ClientOrderId, now: DateTime<Utc>) {
        let Some(pending) = self.state.orders.pending(cid) else {
            self.emit_error(
                format!("cancel {cid}: order not found (found=false)"),
                Some(RejectCode::OrderNotFound),
            );
            return;
        };

        // Live venue cancels are acknowledged asynchronously; the
        // reservation is held until the venue confirms
        if pending.request.venue != Venue::Simulated {
            let venue = pending.request.venue;
            self.state.orders.mark_cancel_in_flight(cid.clone());
            self.send_io(IoRequest::Execution(ExecutionDirective::Cancel {
                venue,
                cid: cid.clone(),
            }));
            return;
        }

        self.complete_cancel(cid, None, now);
        self.after_mutation(now);
    }

    /// Release the reservation and finalise a cancel locally.
    fn complete_cancel(&mut self, cid: &ClientOrderId, reason: Option<String>, now: DateTime<Utc>) {
        let Some(pending) = self.state.orders.remove_pending(cid) else {
            return;
        };

        self.state
            .balances
            .release(&pending.reservation.asset, pending.reservation.amount);

        if let Some(record) = self.state.orders.record_mut(cid) {
            record.record_cancel(now);
        }

        self.emit(OutputRecord::OrderUpdate {
            ts_ns: ts_ns(now),
            client_order_id: cid.to_smolstr(),
            status: OrderStatus::Canceled,
            symbol: Some(pending.request.symbol.clone()),
            side: Some(pending.request.side),
            qty: Some(pending.request.qty),
            price: pending.request.price,
            venue_order_id: Some(pending.venue_order_id),
            reason,
        });
    }

    /// Apply a fill to a pending order: settle the reserved legs, update the
    /// order record and position, and emit `fill` + `order_update`.
    pub fn apply_fill(
        &mut self,
        cid: &ClientOrderId,
        fill_price: Decimal,
        fill_qty: Decimal,
        fees_quote: Decimal,
        now: DateTime<Utc>,
    ) {
        let Some(pending) = self.state.orders.pending(cid) else {
            warn!(%cid, "fill for unknown pending order - dropping");
            return;
        };
        let request = pending.request.clone();
        let reservation_remaining = pending.reservation.amount;
        let venue_order_id = pending.venue_order_id;

        let instrument = match self.instruments.resolve(&request.symbol) {
            Ok(instrument) => instrument.clone(),
            Err(symbol_error) => {
                error!(%cid, %symbol_error, "fill for unresolvable instrument - dropping");
                return;
            }
        };

        let executed = self
            .state
            .orders
            .record(cid)
            .map(|record| record.executed_qty)
            .unwrap_or_default();
        let remaining_qty = request.qty - executed;
        let fill_qty = fill_qty.min(remaining_qty);
        if fill_qty <= Decimal::ZERO {
            return;
        }

        // Reservation released proportionally to the filled share of the
        // remaining quantity
        let proportion = fill_qty / remaining_qty;
        let proportional_reserved = reservation_remaining * proportion;
        let cost = fill_qty * fill_price;

        match request.side {
            Side::Buy => {
                self.state
                    .balances
                    .spend_locked(&instrument.quote, proportional_reserved);

                // Worst-case reservations refund the difference at fill
                let refund = proportional_reserved - cost;
                if refund > Decimal::ZERO {
                    self.state.balances.credit_free(&instrument.quote, refund);
                } else if refund < Decimal::ZERO {
                    self.state.balances.debit_free(&instrument.quote, -refund);
                }

                self.state.balances.credit_free(&instrument.base, fill_qty);
                if fees_quote > Decimal::ZERO {
                    self.state.balances.debit_free(&instrument.quote, fees_quote);
                }
            }
            Side::Sell => {
                self.state
                    .balances
                    .spend_locked(&instrument.base, proportional_reserved);
                self.state.balances.credit_free(&instrument.quote, cost);
                if fees_quote > Decimal::ZERO {
                    self.state.balances.debit_free(&instrument.quote, fees_quote);
                }
            }
        }

        if let Some(pending) = self.state.orders.pending_mut(cid) {
            pending.reservation.amount = reservation_remaining - proportional_reserved;
        }

        let (status, record_reason) = {
            let record = self
                .state
                .orders
                .record_mut(cid)
                .expect("pending order always has a record");
            record.record_fill(fill_qty, fill_price, request.qty, now);
            (record.status, record.reason.clone())
        };

        if status == OrderStatus::Filled {
            // Release any residual worst-case over-reservation
            if let Some(pending) = self.state.orders.remove_pending(cid) {
                if pending.reservation.amount > Decimal::ZERO {
                    self.state.balances.release(
                        &pending.reservation.asset,
                        pending.reservation.amount,
                    );
                }
            }
        }

        let realized = self
            .state
            .position_mut(&request.symbol)
            .apply_fill(request.side, fill_qty, fill_price);
        self.risk.breaker.record_realized_pnl(now, realized);
        self.state.update_price(&request.symbol, fill_price);
        self.risk.update_reference_price(&request.symbol, fill_price);

        self.emit(OutputRecord::Fill {
            ts_ns: ts_ns(now),
            client_order_id: cid.to_smolstr(),
            symbol: request.symbol.clone(),
            qty: fill_qty,
            price: fill_price,
        });
        self.emit(OutputRecord::OrderUpdate {
            ts_ns: ts_ns(now),
            client_order_id: cid.to_smolstr(),
            status,
            symbol: Some(request.symbol.clone()),
            side: Some(request.side),
            qty: Some(fill_qty),
            price: Some(fill_price),
            venue_order_id: Some(venue_order_id),
            reason: record_reason,
        });

        // Route the fill back to the originating strategy
        if let Some(strategy_id) = request.strategy_id.clone() {
            let fill = Fill::new(
                cid.clone(),
                venue_order_id,
                request.symbol.clone(),
                request.side,
                fill_price,
                fill_qty,
                Fees::quote_fees(instrument.quote.clone(), fees_quote),
                now,
            );
            let outcome =
                self.strategies
                    .dispatch_fill(&strategy_id, &fill, self.market.books(), now);
            self.handle_dispatch_outcome(outcome, now);
        }

        self.after_mutation(now);
    }

    /// Collect simulated-venue fills that have become due.
    pub fn collect_due_fills(&mut self, now: DateTime<Utc>) {
        for cid in self.state.orders.due_fills(now) {
            let Some(pending) = self.state.orders.pending(&cid) else {
                continue;
            };
            let request = pending.request.clone();

            let (best_bid, best_ask) = self.book_top_prices(request.venue, &request.symbol);
            let fallback = self.state.price(&request.symbol);
            let Some(fill_price) =
                self.sim
                    .fill_price(&request, best_bid.or(fallback), best_ask.or(fallback))
            else {
                // No usable price yet; retry on the next tick
                continue;
            };

            let executed = self
                .state
                .orders
                .record(&cid)
                .map(|record| record.executed_qty)
                .unwrap_or_default();
            let remaining = request.qty - executed;
            let fees = self.sim.fees(remaining * fill_price);

            self.apply_fill(&cid, fill_price, remaining, fees, now);
        }
    }

    fn reject_order(&mut self, request: &PlaceOrderRequest, reject: OrderReject, now: DateTime<Utc>) {
        info!(cid = %request.cid, code = %reject.code, message = %reject.message, "order rejected");
        for adjustment in &reject.adjustments {
            info!(cid = %request.cid, %adjustment, "risk threshold adjustment applied");
        }

        self.state.orders.insert_record(OrderStateRecord::new_rejected(
            request.cid.clone(),
            reject.reason(),
            now,
        ));

        self.emit(OutputRecord::OrderUpdate {
            ts_ns: ts_ns(now),
            client_order_id: request.cid.to_smolstr(),
            status: OrderStatus::Rejected,
            symbol: Some(request.symbol.clone()),
            side: Some(request.side),
            qty: Some(request.qty),
            price: request.price,
            venue_order_id: None,
            reason: Some(reject.reason()),
        });
    }

    fn compute_reservation(
        &self,
        request: &PlaceOrderRequest,
        instrument: &vortex_instrument::symbol::Instrument,
        best_ask: Option<Decimal>,
    ) -> Result<Reservation, OrderReject> {
        match request.side {
            Side::Sell => Ok(Reservation::new(instrument.base.clone(), request.qty)),
            Side::Buy => {
                let amount = match (request.kind, request.price) {
                    (OrderKind::Limit, Some(price)) => request.qty * price,
                    _ => {
                        // Market buys reserve an adversely-priced estimate
                        // from the last known top-of-book
                        let ask = best_ask
                            .or_else(|| self.state.price(&request.symbol))
                            .ok_or_else(|| {
                                OrderReject::new(
                                    RejectCode::InvalidRequest,
                                    "no reference price to reserve market buy against",
                                )
                            })?;
                        self.sim.adverse_buy_estimate(request.qty, ask)
                    }
                };
                Ok(Reservation::new(instrument.quote.clone(), amount))
            }
        }
    }

    fn risk_context(
        &self,
        request: &PlaceOrderRequest,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
    ) -> RiskContext {
        let mid_price = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => self.state.price(&request.symbol),
        };

        RiskContext {
            mid_price,
            position_size: self
                .state
                .position(&request.symbol)
                .map(|position| position.size)
                .unwrap_or_default(),
            equity: self.state.equity(),
            total_notional: self.state.total_position_notional(),
        }
    }

    // ---------------------------------------------------------- market data

    fn process_market(&mut self, event: MarketEvent) {
        self.clock.advance_to(event.time_exchange);
        let now = self.time();

        let applied = self.market.on_event(&event);
        for action in applied.actions {
            self.send_io(IoRequest::MarketData(action));
        }

        match &event.kind {
            DataKind::Trade(trade) => {
                self.state.update_price(&event.symbol, trade.price);
                self.risk.update_reference_price(&event.symbol, trade.price);

                self.emit(OutputRecord::Trade {
                    ts_ns: ts_ns(now),
                    symbol: event.symbol.clone(),
                    venue: event.venue,
                    price: trade.price,
                    qty: trade.amount,
                    is_buyer_maker: trade.is_buyer_maker(),
                    trade_id: trade.id.clone(),
                });
                self.emit(OutputRecord::Market {
                    ts_ns: ts_ns(now),
                    symbol: event.symbol.clone(),
                    price: trade.price,
                });
            }
            DataKind::Book(book_event) => {
                if let OrderBookEvent::Delta(delta) = book_event {
                    self.emit(OutputRecord::BookDelta {
                        ts_ns: ts_ns(now),
                        symbol: event.symbol.clone(),
                        venue: event.venue,
                        sequence: delta.sequence,
                        bids: delta.bids.clone(),
                        asks: delta.asks.clone(),
                    });
                }

                if let Some((bid, ask)) = self.book_top_levels(event.venue, &event.symbol) {
                    let mid = (bid.price + ask.price) / Decimal::TWO;
                    self.state.update_price(&event.symbol, mid);
                    self.risk.update_reference_price(&event.symbol, mid);

                    self.emit(OutputRecord::BookTop {
                        ts_ns: ts_ns(now),
                        symbol: event.symbol.clone(),
                        venue: event.venue,
                        bid_price: bid.price,
                        bid_qty: bid.qty,
                        ask_price: ask.price,
                        ask_qty: ask.qty,
                    });
                }
            }
            DataKind::Kline(kline) => {
                self.state.update_price(&event.symbol, kline.close);
                self.emit(OutputRecord::Kline {
                    ts_ns: ts_ns(now),
                    symbol: event.symbol.clone(),
                    venue: event.venue,
                    open: kline.open,
                    high: kline.high,
                    low: kline.low,
                    close: kline.close,
                    volume: kline.volume,
                    start_time: ts_ns(kline.time_start),
                    close_time: ts_ns(kline.time_close),
                });
            }
            DataKind::Ticker(ticker) => {
                let mid = (ticker.bid + ticker.ask) / Decimal::TWO;
                self.state.update_price(&event.symbol, mid);
                self.risk.update_reference_price(&event.symbol, mid);
                self.emit(OutputRecord::Market {
                    ts_ns: ts_ns(now),
                    symbol: event.symbol.clone(),
                    price: mid,
                });
            }
            DataKind::MarkPrice(mark) => {
                self.state.update_price(&event.symbol, mark.price);
                self.emit(OutputRecord::Market {
                    ts_ns: ts_ns(now),
                    symbol: event.symbol.clone(),
                    price: mark.price,
                });
            }
            DataKind::FundingRate(_) => {}
            DataKind::SubscriptionStatus(status) => {
                self.emit(OutputRecord::SubscriptionStatus {
                    ts_ns: ts_ns(now),
                    symbol: event.symbol.clone(),
                    event_type: status.kind.to_smolstr(),
                    status: status.state.to_smolstr(),
                });
            }
        }

        let outcome = self
            .strategies
            .dispatch_market(&event, self.market.books(), now);
        self.handle_dispatch_outcome(outcome, now);
    }

    // ------------------------------------------------------------ execution

    fn process_execution(&mut self, user_event: UserEvent) {
        let now = self.time();

        match user_event {
            UserEvent::Fill(fill) => {
                self.risk.breaker.record_venue_success();
                self.apply_fill(&fill.cid, fill.price, fill.qty, fill.fees.amount, now);
            }
            UserEvent::OrderUpdate(report) => {
                self.risk.breaker.record_venue_success();
                self.process_execution_report(report, now);
            }
            UserEvent::BalanceSnapshot(snapshot) => {
                let balances = snapshot
                    .into_inner()
                    .into_iter()
                    .map(|balance| BalanceEntry {
                        asset: balance.asset,
                        free: balance.balance.free,
                        locked: balance.balance.locked,
                    })
                    .collect();
                self.emit(OutputRecord::Account {
                    ts_ns: ts_ns(now),
                    balances,
                });
            }
            UserEvent::VenueError { cid, error } => {
                self.process_venue_error(cid, error, now);
            }
            UserEvent::Reconciliation(report) => {
                self.apply_reconciliation(report, now);
            }
        }
    }

    fn process_execution_report(&mut self, report: ExecutionReport, now: DateTime<Utc>) {
        match report.status {
            OrderStatus::Canceled => {
                self.state.orders.clear_cancel_in_flight(&report.cid);
                self.complete_cancel(&report.cid, None, now);
                self.after_mutation(now);
            }
            OrderStatus::Rejected => {
                self.rollback_in_flight(&report.cid, "venue rejected order".to_string(), now);
            }
            OrderStatus::New => {
                debug!(cid = %report.cid, "venue acknowledged order");
            }
            OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                // Executed quantity flows through Fill events
            }
        }
    }

    fn process_venue_error(
        &mut self,
        cid: Option<ClientOrderId>,
        venue_error: ExecutionError,
        now: DateTime<Utc>,
    ) {
        self.risk.breaker.record_venue_error();

        let reason = match &venue_error {
            ExecutionError::Timeout(_) => Some(RejectCode::VenueTimeout),
            _ => None,
        };
        self.emit_error(format!("venue error: {venue_error}"), reason);

        if let Some(cid) = cid {
            self.rollback_in_flight(&cid, venue_error.to_string(), now);
        }

        self.after_mutation(now);
    }

    /// Roll back a live order whose venue request failed: release the
    /// reservation and mark the record rejected.
    fn rollback_in_flight(&mut self, cid: &ClientOrderId, reason: String, now: DateTime<Utc>) {
        let Some(pending) = self.state.orders.remove_pending(cid) else {
            return;
        };

        self.state
            .balances
            .release(&pending.reservation.asset, pending.reservation.amount);

        if let Some(record) = self.state.orders.record_mut(cid) {
            record.record_reject(reason.clone(), now);
        }

        self.emit(OutputRecord::OrderUpdate {
            ts_ns: ts_ns(now),
            client_order_id: cid.to_smolstr(),
            status: OrderStatus::Rejected,
            symbol: Some(pending.request.symbol.clone()),
            side: Some(pending.request.side),
            qty: Some(pending.request.qty),
            price: pending.request.price,
            venue_order_id: Some(pending.venue_order_id),
            reason: Some(reason),
        });

        self.after_mutation(now);
    }

    /// Apply a reconciliation report: venue-authoritative for orders (except
    /// internal cancels in flight), adopting venue balances on divergence.
    fn apply_reconciliation(&mut self, report: ReconcileReport, now: DateTime<Utc>) {
        if report.is_clean() {
            debug!(venue = %report.venue, "reconciliation clean");
            return;
        }

        for divergence in report.divergences {
            match divergence {
                Divergence::OrderMissingOnVenue { cid } => {
                    if self.state.orders.cancels_in_flight().contains(&cid) {
                        continue;
                    }
                    warn!(%cid, "order missing on venue - cancelling locally");
                    self.complete_cancel(
                        &cid,
                        Some("reconciliation: missing on venue".to_string()),
                        now,
                    );
                }
                Divergence::OrderMissingLocally(venue_order) => {
                    warn!(
                        cid = %venue_order.cid,
                        status = %venue_order.status,
                        "venue reports untracked order - adopting locally"
                    );
                    self.state.orders.insert_record(OrderStateRecord {
                        cid: venue_order.cid.clone(),
                        status: venue_order.status,
                        executed_qty: venue_order.executed_qty,
                        avg_price: Decimal::ZERO,
                        reason: Some("reconciliation: adopted from venue".to_string()),
                        time_last_update: now,
                        venue_order_id: None,
                    });

                    self.emit(OutputRecord::OrderUpdate {
                        ts_ns: ts_ns(now),
                        client_order_id: venue_order.cid.to_smolstr(),
                        status: venue_order.status,
                        symbol: None,
                        side: None,
                        qty: None,
                        price: None,
                        venue_order_id: None,
                        reason: Some("reconciliation: adopted from venue".to_string()),
                    });
                }
                Divergence::OrderStateDivergence { cid, local, venue } => {
                    if self.state.orders.cancels_in_flight().contains(&cid) {
                        continue;
                    }
                    warn!(
                        %cid,
                        local_status = %local.status,
                        venue_status = %venue.status,
                        "order state divergence - adopting venue view"
                    );

                    // Terminal on the venue: the pending entry and its
                    // remaining reservation are dead weight locally
                    if venue.status.is_terminal() {
                        if let Some(pending) = self.state.orders.remove_pending(&cid) {
                            self.state.balances.release(
                                &pending.reservation.asset,
                                pending.reservation.amount,
                            );
                        }
                    }

                    if let Some(record) = self.state.orders.record_mut(&cid) {
                        record.adopt_venue_state(venue.status, venue.executed_qty, now);
                    }

                    self.emit(OutputRecord::OrderUpdate {
                        ts_ns: ts_ns(now),
                        client_order_id: cid.to_smolstr(),
                        status: venue.status,
                        symbol: None,
                        side: None,
                        qty: Some(venue.executed_qty),
                        price: None,
                        venue_order_id: None,
                        reason: Some("reconciliation: adopted venue state".to_string()),
                    });
                }
                Divergence::BalanceDivergence { asset, local, venue } => {
                    warn!(
                        %asset,
                        ?local,
                        ?venue,
                        "balance divergence - adopting venue balance"
                    );
                    self.state.balances.set(asset, venue);
                }
            }
        }

        // Adopted venue balances are authoritative even where they disagree
        // with local reservations, so skip the ledger assertion here
        if let Some(manager) = &mut self.persistence {
            manager.record_mutation();
        }
        self.risk.observe_equity(self.state.equity());
    }

    // -------------------------------------------------------------- breaker

    fn process_breaker(&mut self, command: BreakerCommand) {
        match command {
            BreakerCommand::Trip { reason } => {
                self.risk.breaker.trip(reason.clone());
                self.enter_breaker_state(&reason);
            }
            BreakerCommand::Reset => {
                self.risk.breaker.reset();
                self.state.trading = TradingState::Enabled;

                for strategy_id in std::mem::take(&mut self.paused_by_breaker) {
                    if let Err(resume_error) = self.strategies.resume(&strategy_id) {
                        warn!(%strategy_id, %resume_error, "failed to resume strategy after reset");
                    }
                }

                info!("circuit breaker reset - trading enabled");
                self.emit_error("circuit breaker reset".to_string(), None);
            }
        }
    }

    fn enter_breaker_state(&mut self, reason: &str) {
        self.state.trading = TradingState::Disabled;
        if self.paused_by_breaker.is_empty() {
            self.paused_by_breaker = self.strategies.pause_all();
        }
        self.emit_error(
            format!("circuit breaker tripped: {reason}"),
            Some(RejectCode::CircuitBreaker),
        );
    }

    /// Align trading state with a breaker that tripped automatically.
    fn sync_breaker(&mut self) {
        if self.risk.breaker.is_tripped() && self.state.trading == TradingState::Enabled {
            let reason = self
                .risk
                .breaker
                .trip_reason()
                .unwrap_or_default()
                .to_string();
            self.enter_breaker_state(&reason);
        }
    }

    // -------------------------------------------------------------- control

    fn process_control(&mut self, request: ControlRequest) {
        let response = match request.kind {
            ControlRequestKind::Status => ControlResponse::Status(self.status()),
            ControlRequestKind::Health => ControlResponse::Health { healthy: true },
            ControlRequestKind::Start => {
                if self.risk.breaker.is_tripped() {
                    ControlResponse::Error {
                        message: "circuit breaker tripped - reset required".to_string(),
                    }
                } else {
                    self.state.trading = TradingState::Enabled;
                    ControlResponse::Ack
                }
            }
            ControlRequestKind::Stop => {
                self.state.trading = TradingState::Disabled;
                ControlResponse::Ack
            }
            ControlRequestKind::ListStrategies => {
                ControlResponse::Strategies(self.strategies.list())
            }
            ControlRequestKind::GetStrategy(id) => self
                .strategies
                .list()
                .into_iter()
                .find(|info| info.id == id)
                .map(ControlResponse::Strategy)
                .unwrap_or_else(|| ControlResponse::Error {
                    message: format!("unknown strategy: {id}"),
                }),
            ControlRequestKind::StartStrategy(id) => match self.strategies.start(&id) {
                Ok(()) => ControlResponse::Ack,
                Err(runtime_error) => ControlResponse::Error {
                    message: runtime_error.to_string(),
                },
            },
            ControlRequestKind::StopStrategy(id) => match self.strategies.stop(&id) {
                Ok(()) => ControlResponse::Ack,
                Err(runtime_error) => ControlResponse::Error {
                    message: runtime_error.to_string(),
                },
            },
        };

        if request.reply.send(response).is_err() {
            warn!("control requester dropped before receiving response");
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            trading_enabled: self.state.trading == TradingState::Enabled,
            breaker_tripped: self.risk.breaker.is_tripped(),
            pending_orders: self.state.orders.pending_len(),
            events_processed: self.meta.sequence.value(),
            venues: self
                .market
                .quality_iter()
                .map(|(venue, quality)| VenueStatus {
                    venue,
                    connection: self.market.connection_state(venue),
                    messages: quality.messages,
                    gaps: quality.gaps,
                    reconnects: quality.reconnects,
                    latency_ewma_ms: quality.latency_ewma_ms,
                })
                .collect(),
        }
    }

    // ------------------------------------------------------------- commands

    fn process_command(&mut self, command: Command) {
        let now = self.time();

        match command {
            Command::Order(request) => self.place_order(request, now),
            Command::Cancel { cid } => self.cancel_order(&cid, now),
            Command::Query(target) => self.process_query(target, now),
            Command::Subscribe(subscription) => self.process_subscribe(subscription, now),
            Command::Unsubscribe(subscription) => self.process_unsubscribe(subscription, now),
            Command::Strategy(strategy_command) => {
                self.process_strategy_command(strategy_command)
            }
        }
    }

    fn process_query(&mut self, target: QueryTarget, now: DateTime<Utc>) {
        match target {
            QueryTarget::Order(cid) => match self.state.orders.record(&cid) {
                Some(record) => {
                    self.emit(OutputRecord::OrderState {
                        ts_ns: ts_ns(now),
                        client_order_id: record.cid.to_smolstr(),
                        status: record.status,
                        executed_qty: record.executed_qty,
                        avg_price: record.avg_price,
                        reason: record.reason.clone(),
                        last_ts_ns: ts_ns(record.time_last_update),
                        venue_order_id: record.venue_order_id,
                    });
                }
                None => self.emit_error(
                    format!("query order {cid}: not found (found=false)"),
                    Some(RejectCode::OrderNotFound),
                ),
            },
            QueryTarget::Balances => self.emit_account(now),
            QueryTarget::Book { venue, symbol } => {
                match self.book_top_levels(venue, &symbol) {
                    Some((bid, ask)) => self.emit(OutputRecord::BookTop {
                        ts_ns: ts_ns(now),
                        symbol,
                        venue,
                        bid_price: bid.price,
                        bid_qty: bid.qty,
                        ask_price: ask.price,
                        ask_qty: ask.qty,
                    }),
                    None => self.emit_error(
                        format!("query book {venue} {symbol}: book unavailable"),
                        None,
                    ),
                }
            }
        }
    }

    fn process_subscribe(&mut self, subscription: Subscription, now: DateTime<Utc>) {
        let actions = self.market.subscribe(subscription.clone());
        for action in actions {
            self.send_io(IoRequest::MarketData(action));
        }

        self.emit(OutputRecord::SubscriptionStatus {
            ts_ns: ts_ns(now),
            symbol: subscription.symbol,
            event_type: subscription.kind.to_smolstr(),
            status: SmolStr::new("pending"),
        });
    }

    fn process_unsubscribe(&mut self, subscription: Subscription, now: DateTime<Utc>) {
        match self.market.unsubscribe(&subscription) {
            Ok(actions) => {
                for action in actions {
                    self.send_io(IoRequest::MarketData(action));
                }
                self.emit(OutputRecord::SubscriptionStatus {
                    ts_ns: ts_ns(now),
                    symbol: subscription.symbol,
                    event_type: subscription.kind.to_smolstr(),
                    status: SmolStr::new("unsubscribed"),
                });
            }
            Err(data_error) => {
                self.emit_error(format!("unsubscribe failed: {data_error}"), None);
            }
        }
    }

    fn process_strategy_command(&mut self, command: StrategyCommand) {
        let result = match command {
            StrategyCommand::Load { name, id } => {
                self.strategies.load(&name, id, &ParamSet::default())
            }
            StrategyCommand::Start(id) => self.strategies.start(&id),
            StrategyCommand::Stop(id) => self.strategies.stop(&id),
            StrategyCommand::Pause(id) => self.strategies.pause(&id),
            StrategyCommand::Resume(id) => self.strategies.resume(&id),
            StrategyCommand::Unload(id) => self.strategies.unload(&id),
            StrategyCommand::List => {
                for info in self.strategies.list() {
                    info!(strategy_id = %info.id, kind = %info.name, status = %info.status, "strategy");
                }
                Ok(())
            }
            StrategyCommand::Status(id) => match self.strategies.status(&id) {
                Some(status) => {
                    info!(strategy_id = %id, %status, "strategy status");
                    Ok(())
                }
                None => Err(crate::strategy::runtime::StrategyRuntimeError::UnknownStrategy(id)),
            },
        };

        if let Err(runtime_error) = result {
            self.emit_error(format!("strategy command failed: {runtime_error}"), None);
        }
    }

    // ----------------------------------------------------------------- tick

    fn process_tick(&mut self, now: DateTime<Utc>) {
        self.clock.advance_to(now);
        self.collect_due_fills(now);
        self.maybe_snapshot(now);
    }

    // ---------------------------------------------------------- persistence

    fn maybe_snapshot(&mut self, now: DateTime<Utc>) {
        let due = self
            .persistence
            .as_ref()
            .is_some_and(|manager| manager.should_snapshot(now));
        if !due {
            return;
        }

        if let Err(persist_error) = self.take_snapshot(now) {
            error!(%persist_error, "periodic snapshot failed");
            self.snapshot_failures += 1;

            if self.snapshot_failures >= MAX_SNAPSHOT_FAILURES && !self.risk.breaker.is_tripped()
            {
                self.risk
                    .breaker
                    .trip(format!("{} consecutive snapshot failures", self.snapshot_failures));
                self.sync_breaker();
            }
        } else {
            self.snapshot_failures = 0;
        }
    }

    /// Serialize and durably write a [`StateSnapshot`] of the current state.
    pub fn take_snapshot(&mut self, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        let Some(manager) = &mut self.persistence else {
            return Ok(());
        };

        let snapshot = StateSnapshot::new(
            now,
            self.meta.sequence.value(),
            self.state.balances.snapshot(now),
            self.state.orders.pending_iter().cloned().collect(),
            self.state
                .prices_iter()
                .map(|(symbol, price)| SymbolPrice {
                    symbol: symbol.clone(),
                    price: *price,
                })
                .collect(),
            self.state.venue_order_sequence(),
            self.strategies.snapshots(),
        )?;

        manager.write(&snapshot)?;
        Ok(())
    }

    // ------------------------------------------------------------- plumbing

    fn handle_dispatch_outcome(&mut self, outcome: DispatchOutcome, now: DateTime<Utc>) {
        for signal in outcome.signals {
            self.place_order(signal, now);
        }

        for (strategy_id, message) in outcome.errored {
            self.on_strategy_error(&strategy_id, &message, now);
        }
    }

    /// A strategy errored: cancel its in-flight orders and surface a
    /// lifecycle event.
    fn on_strategy_error(&mut self, strategy_id: &StrategyId, message: &str, now: DateTime<Utc>) {
        let cids: Vec<ClientOrderId> = self
            .state
            .orders
            .pending_iter()
            .filter(|order| order.request.strategy_id.as_ref() == Some(strategy_id))
            .map(|order| order.request.cid.clone())
            .collect();

        for cid in cids {
            self.cancel_order(&cid, now);
        }

        self.emit_error(
            format!("strategy {strategy_id} transitioned to error: {message}"),
            None,
        );
    }

    fn after_mutation(&mut self, _now: DateTime<Utc>) {
        if let Some(manager) = &mut self.persistence {
            manager.record_mutation();
        }
        self.risk.observe_equity(self.state.equity());
        self.sync_breaker();

        debug_assert!(
            self.state.check_invariants().is_ok(),
            "ledger invariant violated: {:?}",
            self.state.check_invariants()
        );
    }

    fn book_top_levels(&self, venue: Venue, symbol: &vortex_instrument::symbol::SymbolId) -> Option<(Level, Level)> {
        let book = self.market.books().find(venue, symbol)?;
        let guard = book.read();
        guard.book().and_then(|book| book.best_bid_ask())
    }

    fn book_top_prices(
        &self,
        venue: Venue,
        symbol: &vortex_instrument::symbol::SymbolId,
    ) -> (Option<Decimal>, Option<Decimal>) {
        match self.book_top_levels(venue, symbol) {
            Some((bid, ask)) => (Some(bid.price), Some(ask.price)),
            None => (None, None),
        }
    }

    fn emit(&self, record: OutputRecord) {
        self.emitter.emit(&record);
    }

    fn emit_account(&self, now: DateTime<Utc>) {
        let balances = self
            .state
            .balances
            .iter()
            .map(|(asset, balance)| BalanceEntry {
                asset: asset.clone(),
                free: balance.free,
                locked: balance.locked,
            })
            .collect();

        self.emit(OutputRecord::Account {
            ts_ns: ts_ns(now),
            balances,
        });
    }

    fn emit_error(&self, message: String, reason: Option<RejectCode>) {
        self.emit(OutputRecord::Error {
            ts_ns: ts_ns(self.time()),
            message,
            reason: reason.map(|code| code.to_string()),
        });
    }

    fn send_io(&mut self, request: IoRequest) {
        self.io_tx.send(request);
    }
}
