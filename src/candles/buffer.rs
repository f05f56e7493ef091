// =============================================================================
// Candle Buffer — bounded ring of closed candles per (instrument, interval)
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::types::{Candle, CandleKey};

/// Thread-safe ring buffer storing the most recent closed candles per
/// `(instrument, interval)` key. The in-progress candle is owned by the
/// aggregator and never appears here.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    retention: usize,
}

impl CandleBuffer {
    /// Create a buffer retaining at most `retention` closed candles per key.
    pub fn new(retention: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Append a closed candle and trim the ring to the retention budget.
    pub fn push(&self, candle: Candle) {
        debug_assert!(candle.closed, "only closed candles are retained");
        let mut map = self.buffers.write();
        let ring = map
            .entry(candle.key())
            .or_insert_with(|| VecDeque::with_capacity(self.retention + 1));
        ring.push_back(candle);
        while ring.len() > self.retention {
            ring.pop_front();
        }
    }

    /// The most recent `count` closed candles, oldest first.
    pub fn recent(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// The most recent `count` closed candles with `bucket_start_ms` at or
    /// before `end_bucket_ms`, oldest first. Rings are ordered by bucket
    /// start because candles are pushed in close order.
    pub fn recent_until(&self, key: &CandleKey, end_bucket_ms: i64, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let end = ring.partition_point(|c| c.bucket_start_ms <= end_bucket_ms);
                let start = end.saturating_sub(count);
                ring.iter().take(end).skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the most recent candle, if any.
    pub fn last_close(&self, key: &CandleKey) -> Option<Decimal> {
        let map = self.buffers.read();
        map.get(key).and_then(|ring| ring.back()).map(|c| c.close)
    }

    pub fn len(&self, key: &CandleKey) -> usize {
        self.buffers.read().get(key).map_or(0, VecDeque::len)
    }

    /// Drop every series belonging to an instrument (on unsubscribe).
    pub fn remove_instrument(&self, instrument: &crate::types::Instrument) {
        self.buffers
            .write()
            .retain(|key, _| &key.instrument != instrument);
    }
}
