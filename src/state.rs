// =============================================================================
// Central Engine State — Meridian Market Engine
// =============================================================================
//
// The single source of truth for the engine. All subsystems hold Arc
// references to their own state; EngineState ties them together, owns the
// per-instrument subscription tasks, and provides the read-only accessors
// the query surface consumes.
//
// Thread safety:
//   - Atomic counters for lock-free stats.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::book::{OrderBookEngine, SnapshotSource};
use crate::candles::{CandleAggregator, CandleBuffer};
use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, SignalSink};
use crate::signals::{RuleContext, SignalEngine};
use crate::stream::StreamClient;
use crate::types::{
    BookStatus, Candle, CandleKey, ConnectionEvent, Instrument, Ladder, SignalEvent, StreamEvent,
};

/// Operational counters for the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub uptime_secs: u64,
    pub malformed_frames: u64,
    pub connection_drops: u64,
    pub dropped_book_updates: u64,
    pub late_trades: u64,
    pub duplicate_trades: u64,
    pub signals_delivered: u64,
    pub signals_failed: u64,
    pub books: Vec<BookStatusEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookStatusEntry {
    pub instrument: Instrument,
    pub status: BookStatus,
}

/// Central engine state shared across all async tasks via `Arc`.
pub struct EngineState<S: SnapshotSource> {
    pub config: RwLock<EngineConfig>,
    pub stream_client: Arc<StreamClient>,
    pub book_engine: Arc<OrderBookEngine<S>>,
    pub candle_buffer: Arc<CandleBuffer>,
    pub aggregator: Arc<CandleAggregator>,
    pub signal_engine: Arc<SignalEngine>,
    pub dispatcher: Arc<Dispatcher>,

    /// Stream + pipeline task handles per subscribed instrument.
    subscriptions: RwLock<HashMap<Instrument, Vec<JoinHandle<()>>>>,

    connection_drops: AtomicU64,
    start_time: std::time::Instant,
}

impl<S: SnapshotSource> EngineState<S> {
    /// Build the full subsystem graph. Returns the state plus the receivers
    /// main wires into the signal and system loops.
    pub fn new(
        config: EngineConfig,
        source: S,
        sinks: Vec<Box<dyn SignalSink>>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<Candle>,
        mpsc::UnboundedReceiver<SignalEvent>,
    ) {
        let (candle_tx, candle_rx) = mpsc::unbounded_channel();
        let (system_tx, system_rx) = mpsc::unbounded_channel();

        let stream_client = Arc::new(StreamClient::new(
            config.stream_url.clone(),
            config.reconnect_base_ms,
            config.reconnect_cap_ms,
        ));
        let book_engine = Arc::new(OrderBookEngine::new(
            source,
            config.ladder_depth,
            config.sync_max_retries,
            Duration::from_millis(config.reconnect_base_ms),
            system_tx,
        ));
        let candle_buffer = Arc::new(CandleBuffer::new(config.candle_retention));
        let aggregator = Arc::new(CandleAggregator::new(
            config.intervals_ms.clone(),
            candle_buffer.clone(),
            candle_tx,
            config.trade_dedup_window,
        ));
        let signal_engine = Arc::new(SignalEngine::new(
            config.rules.clone(),
            config.signal_retention,
        ));
        let dispatcher = Arc::new(Dispatcher::new(sinks));

        let state = Arc::new(Self {
            config: RwLock::new(config),
            stream_client,
            book_engine,
            candle_buffer,
            aggregator,
            signal_engine,
            dispatcher,
            subscriptions: RwLock::new(HashMap::new()),
            connection_drops: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        });

        (state, candle_rx, system_rx)
    }

    // ── Subscription lifecycle ──────────────────────────────────────────

    /// Start the stream and pipeline tasks for an instrument. Idempotent.
    pub fn subscribe(self: &Arc<Self>, instrument: Instrument) {
        let mut subs = self.subscriptions.write();
        if subs.contains_key(&instrument) {
            return;
        }

        self.book_engine.subscribe(&instrument);

        let (tx, rx) = mpsc::unbounded_channel();

        let client = self.stream_client.clone();
        let stream_inst = instrument.clone();
        let stream_handle = tokio::spawn(async move {
            client.run(stream_inst, tx).await;
        });

        let pipeline_state = self.clone();
        let pipeline_handle = tokio::spawn(async move {
            pipeline_state.run_pipeline(rx).await;
        });

        info!(instrument = %instrument, "instrument subscribed");
        subs.insert(instrument, vec![stream_handle, pipeline_handle]);
    }

    /// Stop event delivery for an instrument and release its state. After
    /// this returns no further update for the instrument is applied.
    pub fn unsubscribe(&self, instrument: &Instrument) {
        let handles = self.subscriptions.write().remove(instrument);
        match handles {
            Some(handles) => {
                for handle in handles {
                    handle.abort();
                }
                self.book_engine.unsubscribe(instrument);
                self.aggregator.unsubscribe(instrument);
                self.signal_engine.unsubscribe(instrument);
                info!(instrument = %instrument, "instrument unsubscribed");
            }
            None => {
                warn!(instrument = %instrument, "unsubscribe for unknown instrument");
            }
        }
    }

    pub fn subscribed_instruments(&self) -> Vec<Instrument> {
        self.subscriptions.read().keys().cloned().collect()
    }

    // ── Event loops ─────────────────────────────────────────────────────

    /// Consume one instrument's ordered event stream, driving the book
    /// engine and candle aggregator sequentially so each sees its events in
    /// arrival order.
    pub async fn run_pipeline(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<StreamEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Depth(update) => {
                    self.book_engine.on_depth_update(update).await;
                }
                StreamEvent::Trade(trade) => {
                    self.aggregator.on_trade(&trade);
                }
                StreamEvent::Connection(instrument, ConnectionEvent::Dropped) => {
                    self.connection_drops.fetch_add(1, Ordering::Relaxed);
                    warn!(instrument = %instrument, "stream connection dropped");
                }
                StreamEvent::Connection(instrument, ConnectionEvent::Resumed) => {
                    info!(instrument = %instrument, "stream connection resumed");
                }
            }
        }
    }

    /// Evaluate signal rules for every closed candle and dispatch the
    /// resulting events.
    pub async fn run_signal_loop(self: Arc<Self>, mut candle_rx: mpsc::UnboundedReceiver<Candle>) {
        while let Some(candle) = candle_rx.recv().await {
            self.on_candle_closed(&candle);
        }
    }

    /// Forward system events (e.g. a book parked in Desynced) to the recent
    /// ring and the dispatch boundary.
    pub async fn run_system_loop(
        self: Arc<Self>,
        mut system_rx: mpsc::UnboundedReceiver<SignalEvent>,
    ) {
        while let Some(event) = system_rx.recv().await {
            self.signal_engine.record(event.clone());
            self.dispatcher.dispatch(&event);
        }
    }

    /// Rule evaluation for one closed candle. The history read ends at the
    /// candle itself (the aggregator stores before forwarding): later closes
    /// may already sit in the buffer when one trade rolls several buckets
    /// over, and each queued candle must be judged against its own past.
    pub fn on_candle_closed(&self, candle: &Candle) {
        let lookback = self.config.read().signal_lookback;
        let history =
            self.candle_buffer
                .recent_until(&candle.key(), candle.bucket_start_ms, lookback);
        if history.last().map(|c| c.bucket_start_ms) != Some(candle.bucket_start_ms) {
            // Evicted from the ring before the signal loop got to it.
            return;
        }
        let ladder = self.book_engine.ladder(&candle.instrument);

        let ctx = RuleContext {
            instrument: &candle.instrument,
            interval_ms: candle.interval_ms,
            candles: &history,
            ladder: ladder.as_ref(),
        };
        for event in self.signal_engine.evaluate(&ctx) {
            self.dispatcher.dispatch(&event);
        }
    }

    // ── Query surface (read-only, non-blocking snapshots) ───────────────

    pub fn current_book(&self, instrument: &Instrument) -> Option<Ladder> {
        self.book_engine.ladder(instrument)
    }

    pub fn recent_candles(
        &self,
        instrument: &Instrument,
        interval_ms: i64,
        count: usize,
    ) -> Vec<Candle> {
        let key = CandleKey {
            instrument: instrument.clone(),
            interval_ms,
        };
        self.candle_buffer.recent(&key, count)
    }

    pub fn recent_signals(&self, instrument: &Instrument, count: usize) -> Vec<SignalEvent> {
        self.signal_engine.recent_signals(instrument, count)
    }

    pub fn stats(&self) -> EngineStats {
        let aggregator = self.aggregator.stats();
        let books = self
            .book_engine
            .instruments()
            .into_iter()
            .filter_map(|instrument| {
                self.book_engine
                    .status(&instrument)
                    .map(|status| BookStatusEntry { instrument, status })
            })
            .collect();

        EngineStats {
            uptime_secs: self.start_time.elapsed().as_secs(),
            malformed_frames: self.stream_client.malformed_frames(),
            connection_drops: self.connection_drops.load(Ordering::Relaxed),
            dropped_book_updates: self.book_engine.dropped_updates(),
            late_trades: aggregator.late_trades,
            duplicate_trades: aggregator.duplicate_trades,
            signals_delivered: self.dispatcher.delivered(),
            signals_failed: self.dispatcher.failed(),
            books,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::RuleConfig;
    use crate::types::{Side, Snapshot, Trade};
    use anyhow::Result;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    /// Snapshot source that always serves the same baseline.
    #[derive(Clone)]
    struct StaticSource {
        last_update_id: u64,
    }

    impl SnapshotSource for StaticSource {
        async fn fetch_snapshot(&self, instrument: &Instrument) -> Result<Snapshot> {
            let mut bids = BTreeMap::new();
            bids.insert(dec!(100), dec!(5));
            let mut asks = BTreeMap::new();
            asks.insert(dec!(101), dec!(2));
            Ok(Snapshot {
                instrument: instrument.clone(),
                last_update_id: self.last_update_id,
                bids,
                asks,
            })
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            intervals_ms: vec![60_000],
            rules: vec![RuleConfig::VolumeSpike {
                window: 2,
                ratio: 3.0,
            }],
            ..EngineConfig::default()
        }
    }

    fn trade(trade_id: u64, price: rust_decimal::Decimal, qty: rust_decimal::Decimal, ts: i64) -> Trade {
        Trade {
            instrument: Instrument::new("BTCUSDT"),
            trade_id,
            price,
            quantity: qty,
            side: Side::Buy,
            timestamp_ms: ts,
        }
    }

    #[tokio::test]
    async fn closed_candles_flow_into_query_reads() {
        let (state, mut candle_rx, _system_rx) =
            EngineState::new(test_config(), StaticSource { last_update_id: 10 }, vec![]);
        let instrument = Instrument::new("BTCUSDT");

        state.aggregator.on_trade(&trade(1, dec!(100), dec!(1), 5_000));
        state.aggregator.on_trade(&trade(2, dec!(101), dec!(1), 65_000));

        // One candle closed and forwarded.
        let closed = candle_rx.try_recv().expect("closed candle expected");
        state.on_candle_closed(&closed);

        let candles = state.recent_candles(&instrument, 60_000, 10);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, dec!(100));
        assert!(candles[0].closed);
    }

    #[tokio::test]
    async fn volume_spike_reaches_recent_signals() {
        let (state, mut candle_rx, _system_rx) =
            EngineState::new(test_config(), StaticSource { last_update_id: 10 }, vec![]);
        let instrument = Instrument::new("BTCUSDT");

        // Two quiet minutes, then a heavy one; the rollover trade closes the
        // spiking candle.
        state.aggregator.on_trade(&trade(1, dec!(100), dec!(1), 5_000));
        state.aggregator.on_trade(&trade(2, dec!(100), dec!(1), 65_000));
        state.aggregator.on_trade(&trade(3, dec!(100), dec!(50), 125_000));
        state.aggregator.on_trade(&trade(4, dec!(100), dec!(1), 185_000));

        while let Ok(candle) = candle_rx.try_recv() {
            state.on_candle_closed(&candle);
        }

        let signals = state.recent_signals(&instrument, 10);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].rule_id, "volume_spike");
        assert_eq!(state.dispatcher.delivered(), 0); // no sinks registered
    }

    #[tokio::test]
    async fn burst_close_attributes_signal_to_spiking_candle() {
        let (state, mut candle_rx, _system_rx) =
            EngineState::new(test_config(), StaticSource { last_update_id: 10 }, vec![]);
        let instrument = Instrument::new("BTCUSDT");

        // Two quiet minutes, a heavy one, then a jump four buckets ahead:
        // the spike at 120s closes in the same call as three synthetic
        // fills, so several closed candles queue up before evaluation.
        state.aggregator.on_trade(&trade(1, dec!(100), dec!(1), 5_000));
        state.aggregator.on_trade(&trade(2, dec!(100), dec!(1), 65_000));
        state.aggregator.on_trade(&trade(3, dec!(100), dec!(50), 125_000));
        state.aggregator.on_trade(&trade(4, dec!(100), dec!(1), 365_000));

        while let Ok(candle) = candle_rx.try_recv() {
            state.on_candle_closed(&candle);
        }

        let spikes: Vec<_> = state
            .recent_signals(&instrument, 10)
            .into_iter()
            .filter(|s| s.rule_id == "volume_spike")
            .collect();
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].payload["bucket_start_ms"], 120_000);
    }

    #[tokio::test]
    async fn book_reads_reflect_sync_state() {
        let (state, _candle_rx, _system_rx) =
            EngineState::new(test_config(), StaticSource { last_update_id: 10 }, vec![]);
        let instrument = Instrument::new("BTCUSDT");

        state.book_engine.subscribe(&instrument);
        assert_eq!(
            state.current_book(&instrument).unwrap().status,
            BookStatus::Syncing
        );

        state
            .book_engine
            .on_depth_update(crate::types::DepthUpdate {
                instrument: instrument.clone(),
                first_update_id: 11,
                last_update_id: 11,
                bids: vec![(dec!(100.5), dec!(1))],
                asks: vec![],
            })
            .await;

        let ladder = state.current_book(&instrument).unwrap();
        assert_eq!(ladder.status, BookStatus::Live);
        assert_eq!(ladder.best_bid().unwrap().price, dec!(100.5));

        let stats = state.stats();
        assert_eq!(stats.books.len(), 1);
        assert_eq!(stats.books[0].status, BookStatus::Live);
    }
}
