use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use smol_str::SmolStr;
use std::{io::Write, sync::Arc};
use tracing::error;
use vortex_data::books::Level;
use vortex_execution::order::{OrderStatus, VenueOrderId};
use vortex_instrument::{Side, asset::AssetName, symbol::SymbolId, venue::Venue};

/// Convert a timestamp to the `ts_ns` wire representation.
pub fn ts_ns(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or_default()
}

/// Balance entry of an [`OutputRecord::Account`] record.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct BalanceEntry {
    pub asset: AssetName,
    pub free: Decimal,
    pub locked: Decimal,
}

/// A single record of the external newline-delimited JSON event stream.
///
/// Every record serializes with a `type` discriminator and a `ts_ns`
/// timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputRecord {
    Market {
        ts_ns: i64,
        symbol: SymbolId,
        price: Decimal,
    },
    Trade {
        ts_ns: i64,
        symbol: SymbolId,
        venue: Venue,
        price: Decimal,
        qty: Decimal,
        is_buyer_maker: bool,
        trade_id: SmolStr,
    },
    BookTop {
        ts_ns: i64,
        symbol: SymbolId,
        venue: Venue,
        bid_price: Decimal,
        bid_qty: Decimal,
        ask_price: Decimal,
        ask_qty: Decimal,
    },
    BookDelta {
        ts_ns: i64,
        symbol: SymbolId,
        venue: Venue,
        sequence: u64,
        bids: Vec<Level>,
        asks: Vec<Level>,
    },
    Kline {
        ts_ns: i64,
        symbol: SymbolId,
        venue: Venue,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        start_time: i64,
        close_time: i64,
    },
    OrderUpdate {
        ts_ns: i64,
        client_order_id: SmolStr,
        status: OrderStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<SymbolId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        side: Option<Side>,
        #[serde(skip_serializing_if = "Option::is_none")]
        qty: Option<Decimal>,
        #[serde(skip_serializing_if = "Option::is_none")]
        price: Option<Decimal>,
        #[serde(skip_serializing_if = "Option::is_none")]
        venue_order_id: Option<VenueOrderId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    OrderState {
        ts_ns: i64,
        client_order_id: SmolStr,
        status: OrderStatus,
        executed_qty: Decimal,
        avg_price: Decimal,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        last_ts_ns: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        venue_order_id: Option<VenueOrderId>,
    },
    Fill {
        ts_ns: i64,
        client_order_id: SmolStr,
        symbol: SymbolId,
        qty: Decimal,
        price: Decimal,
    },
    Account {
        ts_ns: i64,
        balances: Vec<BalanceEntry>,
    },
    SubscriptionStatus {
        ts_ns: i64,
        symbol: SymbolId,
        event_type: SmolStr,
        status: SmolStr,
    },
    Error {
        ts_ns: i64,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Serialized single-writer emitter producing newline-delimited JSON records
/// to an external byte sink.
///
/// All writes go through an exclusive mutex, so lines are never interleaved
/// and consumers can parse line-by-line. Cloned handles share the sink.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

impl EventEmitter {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Emit a single record as one line. Serialization failures and sink
    /// errors are logged, never propagated to the producer.
    pub fn emit(&self, record: &OutputRecord) {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(serialize_error) => {
                error!(?serialize_error, "failed to serialize output record");
                return;
            }
        };

        let mut sink = self.sink.lock();
        if let Err(io_error) = writeln!(sink, "{json}") {
            error!(?io_error, "failed to write output record to sink");
        }
    }

    pub fn flush(&self) {
        let mut sink = self.sink.lock();
        if let Err(io_error) = sink.flush() {
            error!(?io_error, "failed to flush output sink");
        }
    }
}

/// In-memory sink capturing emitted lines, for tests and the service-mode
/// self-check.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured output as a UTF-8 string.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    /// Captured output split into JSON lines.
    pub fn lines(&self) -> Vec<String> {
        self.contents()
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_every_line_is_parseable_json_with_type_and_ts_ns() {
        let sink = MemorySink::new();
        let emitter = EventEmitter::new(Box::new(sink.clone()));
        let now = Utc::now();

        emitter.emit(&OutputRecord::Market {
            ts_ns: ts_ns(now),
            symbol: SymbolId::new("BTCUSDT").unwrap(),
            price: dec!(50_000),
        });
        emitter.emit(&OutputRecord::Error {
            ts_ns: ts_ns(now),
            message: "multi\nline\nmessage".to_string(),
            reason: Some("INVALID_REQUEST".to_string()),
        });

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);

        for line in &lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("type").is_some());
            assert!(value.get("ts_ns").is_some());
        }

        // Embedded newlines are escaped inside the JSON value
        assert!(lines[1].contains("multi\\nline"));
    }

    #[test]
    fn test_order_update_omits_absent_optional_fields() {
        let sink = MemorySink::new();
        let emitter = EventEmitter::new(Box::new(sink.clone()));

        emitter.emit(&OutputRecord::OrderUpdate {
            ts_ns: 0,
            client_order_id: SmolStr::new("c1"),
            status: OrderStatus::Canceled,
            symbol: None,
            side: None,
            qty: None,
            price: None,
            venue_order_id: None,
            reason: None,
        });

        let line = sink.lines().remove(0);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "order_update");
        assert_eq!(value["status"], "Canceled");
        assert!(value.get("reason").is_none());
    }
}
