// =============================================================================
// Candle Aggregator — trade stream → gapless OHLCV buckets
// =============================================================================
//
// For each instrument and configured interval the aggregator owns the one
// in-progress candle. Closed candles are pushed to the CandleBuffer and
// forwarded downstream; skipped buckets are filled with synthetic
// zero-volume candles so consumers always see a gapless sequence.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::candles::buffer::CandleBuffer;
use crate::types::{Candle, Instrument, Trade};

/// Upper bound on synthetic candles emitted per rollover. A timestamp jump
/// past this many buckets restarts the series instead of flooding the
/// buffer and channel.
const MAX_SYNTHETIC_FILL: i64 = 1_000;

/// Anomaly counters exposed for operator reads.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AggregatorStats {
    pub late_trades: u64,
    pub duplicate_trades: u64,
}

/// Per-instrument aggregation state.
struct InstrumentState {
    /// Bounded recent-trade-id window for duplicate detection.
    seen_ids: HashSet<u64>,
    id_order: VecDeque<u64>,
    /// The currently open candle per interval.
    open: HashMap<i64, Candle>,
}

impl InstrumentState {
    fn new() -> Self {
        Self {
            seen_ids: HashSet::new(),
            id_order: VecDeque::new(),
            open: HashMap::new(),
        }
    }
}

/// Buckets trades into fixed-duration OHLCV candles.
pub struct CandleAggregator {
    intervals_ms: Vec<i64>,
    buffer: Arc<CandleBuffer>,
    closed_tx: mpsc::UnboundedSender<Candle>,
    state: RwLock<HashMap<Instrument, InstrumentState>>,
    dedup_window: usize,
    late_trades: AtomicU64,
    duplicate_trades: AtomicU64,
}

impl CandleAggregator {
    pub fn new(
        intervals_ms: Vec<i64>,
        buffer: Arc<CandleBuffer>,
        closed_tx: mpsc::UnboundedSender<Candle>,
        dedup_window: usize,
    ) -> Self {
        Self {
            intervals_ms,
            buffer,
            closed_tx,
            state: RwLock::new(HashMap::new()),
            dedup_window,
            late_trades: AtomicU64::new(0),
            duplicate_trades: AtomicU64::new(0),
        }
    }

    /// Feed one trade into every configured interval series.
    pub fn on_trade(&self, trade: &Trade) {
        let mut state = self.state.write();
        let inst_state = state
            .entry(trade.instrument.clone())
            .or_insert_with(InstrumentState::new);

        // Duplicate trade_id: drop with no side effects.
        if inst_state.seen_ids.contains(&trade.trade_id) {
            self.duplicate_trades.fetch_add(1, Ordering::Relaxed);
            debug!(
                instrument = %trade.instrument,
                trade_id = trade.trade_id,
                "duplicate trade dropped"
            );
            return;
        }
        inst_state.seen_ids.insert(trade.trade_id);
        inst_state.id_order.push_back(trade.trade_id);
        while inst_state.id_order.len() > self.dedup_window {
            if let Some(old) = inst_state.id_order.pop_front() {
                inst_state.seen_ids.remove(&old);
            }
        }

        for &interval_ms in &self.intervals_ms {
            let bucket = bucket_start(trade.timestamp_ms, interval_ms);

            // Take the open candle out so rollover can close it and insert a
            // fresh one without fighting the map borrow.
            match inst_state.open.remove(&interval_ms) {
                None => {
                    inst_state
                        .open
                        .insert(interval_ms, open_candle(trade, interval_ms, bucket));
                }
                Some(mut open) if bucket == open.bucket_start_ms => {
                    open.high = open.high.max(trade.price);
                    open.low = open.low.min(trade.price);
                    open.close = trade.price;
                    open.volume += trade.quantity;
                    open.trade_count += 1;
                    inst_state.open.insert(interval_ms, open);
                }
                Some(mut closing) if bucket > closing.bucket_start_ms => {
                    closing.closed = true;
                    let prev_close = closing.close;
                    let prev_bucket = closing.bucket_start_ms;
                    self.emit(closing);

                    // Synthetic zero-volume candles for skipped buckets.
                    let missed = (bucket - prev_bucket) / interval_ms - 1;
                    if missed > MAX_SYNTHETIC_FILL {
                        warn!(
                            instrument = %trade.instrument,
                            interval_ms,
                            missed,
                            "bucket jump exceeds synthetic fill bound — restarting series"
                        );
                    } else {
                        let mut fill = prev_bucket + interval_ms;
                        while fill < bucket {
                            self.emit(synthetic_candle(
                                &trade.instrument,
                                interval_ms,
                                fill,
                                prev_close,
                            ));
                            fill += interval_ms;
                        }
                    }

                    inst_state
                        .open
                        .insert(interval_ms, open_candle(trade, interval_ms, bucket));
                }
                Some(open) => {
                    // Out-of-order arrival: never reopens a closed bucket.
                    self.late_trades.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        instrument = %trade.instrument,
                        interval_ms,
                        trade_bucket = bucket,
                        open_bucket = open.bucket_start_ms,
                        "late trade dropped"
                    );
                    inst_state.open.insert(interval_ms, open);
                }
            }
        }
    }

    fn emit(&self, candle: Candle) {
        self.buffer.push(candle.clone());
        let _ = self.closed_tx.send(candle);
    }

    /// The in-progress candle for an interval, if one is open.
    pub fn open_candle(&self, instrument: &Instrument, interval_ms: i64) -> Option<Candle> {
        self.state
            .read()
            .get(instrument)
            .and_then(|s| s.open.get(&interval_ms))
            .cloned()
    }

    /// Drop aggregation state for an instrument (on unsubscribe).
    pub fn unsubscribe(&self, instrument: &Instrument) {
        self.state.write().remove(instrument);
        self.buffer.remove_instrument(instrument);
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            late_trades: self.late_trades.load(Ordering::Relaxed),
            duplicate_trades: self.duplicate_trades.load(Ordering::Relaxed),
        }
    }
}

/// Floor a timestamp to its interval boundary.
fn bucket_start(timestamp_ms: i64, interval_ms: i64) -> i64 {
    timestamp_ms.div_euclid(interval_ms) * interval_ms
}

fn open_candle(trade: &Trade, interval_ms: i64, bucket_start_ms: i64) -> Candle {
    Candle {
        instrument: trade.instrument.clone(),
        interval_ms,
        bucket_start_ms,
        open: trade.price,
        high: trade.price,
        low: trade.price,
        close: trade.price,
        volume: trade.quantity,
        trade_count: 1,
        closed: false,
    }
}

fn synthetic_candle(
    instrument: &Instrument,
    interval_ms: i64,
    bucket_start_ms: i64,
    prev_close: rust_decimal::Decimal,
) -> Candle {
    Candle {
        instrument: instrument.clone(),
        interval_ms,
        bucket_start_ms,
        open: prev_close,
        high: prev_close,
        low: prev_close,
        close: prev_close,
        volume: rust_decimal::Decimal::ZERO,
        trade_count: 0,
        closed: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandleKey, Side};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn inst() -> Instrument {
        Instrument::new("BTCUSDT")
    }

    fn trade(trade_id: u64, price: Decimal, qty: Decimal, timestamp_ms: i64) -> Trade {
        Trade {
            instrument: inst(),
            trade_id,
            price,
            quantity: qty,
            side: Side::Buy,
            timestamp_ms,
        }
    }

    fn setup(intervals: Vec<i64>) -> (CandleAggregator, mpsc::UnboundedReceiver<Candle>, Arc<CandleBuffer>) {
        let buffer = Arc::new(CandleBuffer::new(100));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            CandleAggregator::new(intervals, buffer.clone(), tx, 16),
            rx,
            buffer,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Candle>) -> Vec<Candle> {
        let mut out = Vec::new();
        while let Ok(c) = rx.try_recv() {
            out.push(c);
        }
        out
    }

    #[test]
    fn first_trade_opens_candle() {
        let (agg, mut rx, _) = setup(vec![60_000]);
        agg.on_trade(&trade(1, dec!(100), dec!(2), 5_000));

        let open = agg.open_candle(&inst(), 60_000).expect("candle open");
        assert_eq!(open.bucket_start_ms, 0);
        assert_eq!(open.open, dec!(100));
        assert_eq!(open.high, dec!(100));
        assert_eq!(open.low, dec!(100));
        assert_eq!(open.close, dec!(100));
        assert_eq!(open.volume, dec!(2));
        assert_eq!(open.trade_count, 1);
        assert!(!open.closed);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn same_bucket_trades_fold_in() {
        let (agg, _rx, _) = setup(vec![60_000]);
        agg.on_trade(&trade(1, dec!(100), dec!(1), 5_000));
        agg.on_trade(&trade(2, dec!(105), dec!(2), 10_000));
        agg.on_trade(&trade(3, dec!(98), dec!(1), 20_000));

        let open = agg.open_candle(&inst(), 60_000).unwrap();
        assert_eq!(open.open, dec!(100));
        assert_eq!(open.high, dec!(105));
        assert_eq!(open.low, dec!(98));
        assert_eq!(open.close, dec!(98));
        assert_eq!(open.volume, dec!(4));
        assert_eq!(open.trade_count, 3);
    }

    #[test]
    fn bucket_rollover_emits_closed_candle() {
        let (agg, mut rx, buffer) = setup(vec![60_000]);
        agg.on_trade(&trade(1, dec!(100), dec!(1), 5_000));
        agg.on_trade(&trade(2, dec!(105), dec!(1), 65_000));

        let emitted = drain(&mut rx);
        assert_eq!(emitted.len(), 1);
        assert!(emitted[0].closed);
        assert_eq!(emitted[0].bucket_start_ms, 0);
        assert_eq!(emitted[0].close, dec!(100));

        let key = CandleKey {
            instrument: inst(),
            interval_ms: 60_000,
        };
        assert_eq!(buffer.len(&key), 1);

        let open = agg.open_candle(&inst(), 60_000).unwrap();
        assert_eq!(open.bucket_start_ms, 60_000);
        assert_eq!(open.open, dec!(105));
    }

    #[test]
    fn skipped_buckets_are_filled_synthetically() {
        // Trades at t=5s (price 100) and t=125s: bucket [60s,120s) has no
        // trade, so a synthetic zero-volume candle must bridge it.
        let (agg, mut rx, _) = setup(vec![60_000]);
        agg.on_trade(&trade(1, dec!(100), dec!(1), 5_000));
        agg.on_trade(&trade(2, dec!(105), dec!(1), 125_000));

        let emitted = drain(&mut rx);
        assert_eq!(emitted.len(), 2);

        assert_eq!(emitted[0].bucket_start_ms, 0);
        assert_eq!(emitted[0].close, dec!(100));
        assert!(emitted[0].closed);

        let synth = &emitted[1];
        assert_eq!(synth.bucket_start_ms, 60_000);
        assert_eq!(synth.open, dec!(100));
        assert_eq!(synth.high, dec!(100));
        assert_eq!(synth.low, dec!(100));
        assert_eq!(synth.close, dec!(100));
        assert_eq!(synth.volume, Decimal::ZERO);
        assert_eq!(synth.trade_count, 0);
        assert!(synth.closed);

        let open = agg.open_candle(&inst(), 60_000).unwrap();
        assert_eq!(open.bucket_start_ms, 120_000);
        assert_eq!(open.open, dec!(105));
    }

    #[test]
    fn emitted_sequence_is_gapless() {
        let (agg, mut rx, _) = setup(vec![60_000]);
        agg.on_trade(&trade(1, dec!(100), dec!(1), 0));
        agg.on_trade(&trade(2, dec!(101), dec!(1), 61_000));
        agg.on_trade(&trade(3, dec!(102), dec!(1), 305_000));
        agg.on_trade(&trade(4, dec!(103), dec!(1), 360_000));

        let emitted = drain(&mut rx);
        for pair in emitted.windows(2) {
            assert_eq!(
                pair[1].bucket_start_ms - pair[0].bucket_start_ms,
                60_000,
                "consecutive candles must differ by exactly one interval"
            );
        }
    }

    #[test]
    fn far_future_jump_skips_synthetic_fill() {
        let (agg, mut rx, _) = setup(vec![60_000]);
        agg.on_trade(&trade(1, dec!(100), dec!(1), 5_000));
        // ~31 years of skipped buckets: far past the fill bound.
        agg.on_trade(&trade(2, dec!(101), dec!(1), 1_000_000_000_000));

        // Only the rolled-over candle is emitted, no synthetic flood.
        let emitted = drain(&mut rx);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].bucket_start_ms, 0);

        let open = agg.open_candle(&inst(), 60_000).unwrap();
        assert_eq!(open.bucket_start_ms, bucket_start(1_000_000_000_000, 60_000));
    }

    #[test]
    fn late_trade_is_dropped_and_counted() {
        let (agg, mut rx, buffer) = setup(vec![60_000]);
        agg.on_trade(&trade(1, dec!(100), dec!(1), 65_000));
        agg.on_trade(&trade(2, dec!(500), dec!(9), 5_000)); // bucket 0 < bucket 60_000

        assert_eq!(agg.stats().late_trades, 1);
        assert!(drain(&mut rx).is_empty());

        // The open candle is untouched by the late trade.
        let open = agg.open_candle(&inst(), 60_000).unwrap();
        assert_eq!(open.close, dec!(100));
        assert_eq!(open.trade_count, 1);

        let key = CandleKey {
            instrument: inst(),
            interval_ms: 60_000,
        };
        assert_eq!(buffer.len(&key), 0);
    }

    #[test]
    fn duplicate_trade_id_is_a_no_op() {
        let (agg, _rx, _) = setup(vec![60_000]);
        agg.on_trade(&trade(7, dec!(100), dec!(1), 5_000));
        agg.on_trade(&trade(7, dec!(999), dec!(50), 6_000));

        let open = agg.open_candle(&inst(), 60_000).unwrap();
        assert_eq!(open.close, dec!(100));
        assert_eq!(open.volume, dec!(1));
        assert_eq!(open.trade_count, 1);
        assert_eq!(agg.stats().duplicate_trades, 1);
    }

    #[test]
    fn dedup_window_is_bounded() {
        let (agg, _rx, _) = setup(vec![60_000]);
        // Window is 16; push 20 distinct ids, then re-send id 1 (evicted).
        for i in 1..=20 {
            agg.on_trade(&trade(i, dec!(100), dec!(1), 5_000));
        }
        agg.on_trade(&trade(1, dec!(100), dec!(1), 5_000));

        // Evicted from the window, so it is not seen as a duplicate.
        assert_eq!(agg.stats().duplicate_trades, 0);
        let open = agg.open_candle(&inst(), 60_000).unwrap();
        assert_eq!(open.trade_count, 21);
    }

    #[test]
    fn multiple_intervals_bucket_independently() {
        let (agg, mut rx, _) = setup(vec![60_000, 300_000]);
        agg.on_trade(&trade(1, dec!(100), dec!(1), 5_000));
        agg.on_trade(&trade(2, dec!(101), dec!(1), 65_000));

        // Only the 1m series rolled over; the 5m candle is still open.
        let emitted = drain(&mut rx);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].interval_ms, 60_000);

        let open_5m = agg.open_candle(&inst(), 300_000).unwrap();
        assert_eq!(open_5m.trade_count, 2);
    }

    #[test]
    fn bucket_floor_math() {
        assert_eq!(bucket_start(5_000, 60_000), 0);
        assert_eq!(bucket_start(60_000, 60_000), 60_000);
        assert_eq!(bucket_start(125_000, 60_000), 120_000);
        assert_eq!(bucket_start(-1, 60_000), -60_000);
    }

    #[test]
    fn unsubscribe_clears_state() {
        let (agg, _rx, buffer) = setup(vec![60_000]);
        agg.on_trade(&trade(1, dec!(100), dec!(1), 5_000));
        agg.on_trade(&trade(2, dec!(101), dec!(1), 65_000));
        agg.unsubscribe(&inst());

        assert_eq!(agg.open_candle(&inst(), 60_000), None);
        let key = CandleKey {
            instrument: inst(),
            interval_ms: 60_000,
        };
        assert_eq!(buffer.len(&key), 0);
    }
}
