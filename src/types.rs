// =============================================================================
// Shared types used across the Meridian market-data engine
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A traded instrument (e.g. `BTCUSDT`). Always stored uppercase.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Instrument(String);

impl Instrument {
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self(symbol.as_ref().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase form used in stream subscription URLs.
    pub fn stream_name(&self) -> String {
        self.0.to_lowercase()
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// An incremental depth message: the price-level changes since the previous
/// update. A quantity of zero means "remove this level".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub instrument: Instrument,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// A full point-in-time order book state, fetched over REST during
/// (re)synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub instrument: Instrument,
    pub last_update_id: u64,
    pub bids: BTreeMap<Decimal, Decimal>,
    pub asks: BTreeMap<Decimal, Decimal>,
}

/// Synchronization state of a per-instrument order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookStatus {
    /// Buffering diffs while waiting for a snapshot baseline.
    Syncing,
    /// Snapshot applied and the diff chain is contiguous.
    Live,
    /// A sequence gap was detected; the book is stale until resynced.
    Desynced,
}

impl std::fmt::Display for BookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syncing => write!(f, "Syncing"),
            Self::Live => write!(f, "Live"),
            Self::Desynced => write!(f, "Desynced"),
        }
    }
}

/// A single executed trade from the exchange stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument: Instrument,
    /// Strictly increasing per instrument; duplicates are dropped.
    pub trade_id: u64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    /// Exchange event time, epoch milliseconds.
    pub timestamp_ms: i64,
}

/// Composite key identifying a candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub instrument: Instrument,
    pub interval_ms: i64,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}ms", self.instrument, self.interval_ms)
    }
}

/// An OHLCV candle over one fixed time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: Instrument,
    pub interval_ms: i64,
    /// Floor of every contributing trade's timestamp to the interval boundary.
    pub bucket_start_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
    pub closed: bool,
}

impl Candle {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            instrument: self.instrument.clone(),
            interval_ms: self.interval_ms,
        }
    }
}

/// Severity attached to an emitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "Info"),
            Self::Warning => write!(f, "Warning"),
            Self::Critical => write!(f, "Critical"),
        }
    }
}

/// A derived event indicating a noteworthy market condition. Immutable once
/// emitted; consumed by the dispatch boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    pub id: Uuid,
    pub instrument: Instrument,
    pub rule_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub severity: Severity,
}

impl SignalEvent {
    pub fn new(
        instrument: Instrument,
        rule_id: impl Into<String>,
        payload: serde_json::Value,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument,
            rule_id: rule_id.into(),
            timestamp: Utc::now(),
            payload,
            severity,
        }
    }
}

/// One price level of a ladder read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Read-model snapshot of an order book: depth-limited, best price first on
/// both sides. Carries the sync status so consumers can flag staleness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ladder {
    pub instrument: Instrument,
    pub status: BookStatus,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl Ladder {
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    /// Absolute spread between best ask and best bid.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Depth imbalance in [-1, +1]: positive when bids outweigh asks.
    pub fn imbalance(&self) -> f64 {
        let bid_depth: f64 = self
            .bids
            .iter()
            .filter_map(|l| l.quantity.to_f64())
            .sum();
        let ask_depth: f64 = self
            .asks
            .iter()
            .filter_map(|l| l.quantity.to_f64())
            .sum();
        let total = bid_depth + ask_depth;
        if total > 0.0 {
            (bid_depth - ask_depth) / total
        } else {
            0.0
        }
    }
}

/// Connection lifecycle notifications surfaced by the stream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    Dropped,
    Resumed,
}

/// A decoded event from the exchange stream, delivered in wire arrival order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Depth(DepthUpdate),
    Trade(Trade),
    Connection(Instrument, ConnectionEvent),
}
