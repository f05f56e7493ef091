// =============================================================================
// Order Book Engine — snapshot + diff reconciliation per instrument
// =============================================================================
//
// Protocol (per instrument):
//   1. While Syncing, incoming diffs are buffered in arrival order.
//   2. A snapshot is fetched through the injected SnapshotSource.
//   3. Buffered diffs fully covered by the snapshot are discarded.
//   4. The first usable diff must straddle snapshot.last_update_id + 1 and
//      the remaining buffered chain must be contiguous; otherwise the
//      snapshot is re-fetched (bounded retries).
//   5. Snapshot applied, buffer replayed, book goes Live.
//   6. While Live, a diff that does not continue the chain exactly marks the
//      book Desynced and restarts from step 2.
//
// After the retry budget is exhausted the book is parked in Desynced and a
// Critical `system` signal is emitted so operators see the stale instrument.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::book::order_book::{ApplyOutcome, OrderBook};
use crate::types::{BookStatus, DepthUpdate, Instrument, Ladder, PriceLevel, Severity, SignalEvent, Snapshot};

/// Request/response capability for fetching a full book baseline. The engine
/// depends on the market-data accessor only through this method.
pub trait SnapshotSource: Send + Sync + 'static {
    fn fetch_snapshot(
        &self,
        instrument: &Instrument,
    ) -> impl std::future::Future<Output = Result<Snapshot>> + Send;
}

/// Per-instrument slot: the book plus the diff buffer used while syncing.
struct BookSlot {
    book: OrderBook,
    buffer: VecDeque<DepthUpdate>,
    /// The first diff applied after a fresh snapshot may overlap it.
    allow_straddle: bool,
}

impl BookSlot {
    fn new(instrument: Instrument) -> Self {
        Self {
            book: OrderBook::new(instrument),
            buffer: VecDeque::new(),
            allow_straddle: false,
        }
    }
}

/// Maintains a Live book replica per subscribed instrument.
///
/// All mutations for one instrument arrive from that instrument's pipeline
/// task, so writes are naturally serialized; reads clone under the read lock
/// and never observe a half-applied diff.
pub struct OrderBookEngine<S> {
    source: S,
    books: RwLock<HashMap<Instrument, BookSlot>>,
    ladder_depth: usize,
    max_retries: u32,
    retry_delay: Duration,
    system_tx: mpsc::UnboundedSender<SignalEvent>,
    /// Diffs dropped because their book was parked in Desynced.
    dropped_updates: AtomicU64,
}

impl<S: SnapshotSource> OrderBookEngine<S> {
    pub fn new(
        source: S,
        ladder_depth: usize,
        max_retries: u32,
        retry_delay: Duration,
        system_tx: mpsc::UnboundedSender<SignalEvent>,
    ) -> Self {
        Self {
            source,
            books: RwLock::new(HashMap::new()),
            ladder_depth,
            max_retries,
            retry_delay,
            system_tx,
            dropped_updates: AtomicU64::new(0),
        }
    }

    /// Create the (Syncing) book for a newly subscribed instrument.
    pub fn subscribe(&self, instrument: &Instrument) {
        let mut books = self.books.write();
        books
            .entry(instrument.clone())
            .or_insert_with(|| BookSlot::new(instrument.clone()));
        info!(instrument = %instrument, "order book subscribed");
    }

    /// Drop all book state for an instrument. Diffs arriving afterwards are
    /// ignored.
    pub fn unsubscribe(&self, instrument: &Instrument) {
        if self.books.write().remove(instrument).is_some() {
            info!(instrument = %instrument, "order book unsubscribed");
        }
    }

    /// Feed one depth diff, driving the sync protocol as needed.
    pub async fn on_depth_update(&self, update: DepthUpdate) {
        let instrument = update.instrument.clone();
        let needs_sync = {
            let mut books = self.books.write();
            let Some(slot) = books.get_mut(&instrument) else {
                // Unsubscribed (or never subscribed) — ignore.
                return;
            };
            match slot.book.status() {
                BookStatus::Syncing => {
                    slot.buffer.push_back(update);
                    true
                }
                BookStatus::Live => {
                    let result = if slot.allow_straddle {
                        slot.book.apply_straddling(&update)
                    } else {
                        slot.book.apply_update(&update)
                    };
                    match result {
                        Ok(ApplyOutcome::Applied) => {
                            slot.allow_straddle = false;
                            false
                        }
                        // A stale diff (queued while the snapshot fetch was
                        // in flight) must not consume the straddle allowance.
                        Ok(ApplyOutcome::Stale) => false,
                        Err(gap) => {
                            warn!(
                                instrument = %instrument,
                                expected = gap.expected,
                                got = gap.got,
                                "sequence gap detected — resynchronizing"
                            );
                            slot.book.set_status(BookStatus::Syncing);
                            slot.buffer.clear();
                            slot.buffer.push_back(update);
                            true
                        }
                    }
                }
                BookStatus::Desynced => {
                    // Parked after exhausting the retry budget.
                    self.dropped_updates.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        };

        if needs_sync {
            self.resynchronize(&instrument).await;
        }
    }

    /// Fetch a snapshot and replay the buffered diff chain, retrying up to
    /// `max_retries` times before parking the book in Desynced.
    async fn resynchronize(&self, instrument: &Instrument) {
        for attempt in 1..=self.max_retries {
            // Skip the fetch entirely if the instrument went away.
            if !self.books.read().contains_key(instrument) {
                return;
            }

            let snapshot = match self.source.fetch_snapshot(instrument).await {
                Ok(snap) => snap,
                Err(e) => {
                    warn!(
                        instrument = %instrument,
                        attempt,
                        error = %e,
                        "snapshot fetch failed"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };

            // The write lock lives in this block; it must be released
            // before the retry sleep below.
            let replayed = {
                let mut books = self.books.write();
                let Some(slot) = books.get_mut(instrument) else {
                    // Unsubscribed while the fetch was in flight.
                    return;
                };

                // Drop buffered diffs the snapshot already covers.
                while let Some(front) = slot.buffer.front() {
                    if front.last_update_id <= snapshot.last_update_id {
                        slot.buffer.pop_front();
                    } else {
                        break;
                    }
                }

                if buffer_chain_is_usable(&slot.buffer, snapshot.last_update_id) {
                    slot.book.apply_snapshot(&snapshot);
                    let mut first = true;
                    for update in slot.buffer.drain(..) {
                        let applied = if first {
                            first = false;
                            slot.book.apply_straddling(&update)
                        } else {
                            slot.book.apply_update(&update)
                        };
                        // The chain was validated above; a failure here is
                        // impossible short of a logic error, so surface it.
                        if let Err(gap) = applied {
                            warn!(instrument = %instrument, error = %gap, "validated replay failed");
                        }
                    }
                    slot.book.set_status(BookStatus::Live);
                    // The next diff from the wire may overlap the replayed range.
                    slot.allow_straddle = true;
                    info!(
                        instrument = %instrument,
                        last_update_id = slot.book.last_update_id(),
                        levels = slot.book.level_count(),
                        "order book live"
                    );
                    true
                } else {
                    warn!(
                        instrument = %instrument,
                        attempt,
                        snapshot_id = snapshot.last_update_id,
                        buffered = slot.buffer.len(),
                        "buffered diff chain does not continue snapshot — re-fetching"
                    );
                    false
                }
            };

            if replayed {
                return;
            }
            tokio::time::sleep(self.retry_delay).await;
        }

        // Retry budget exhausted: park the book and alert.
        if let Some(slot) = self.books.write().get_mut(instrument) {
            slot.book.set_status(BookStatus::Desynced);
            slot.buffer.clear();
        }
        warn!(
            instrument = %instrument,
            retries = self.max_retries,
            "snapshot retries exhausted — book parked in Desynced"
        );
        let event = SignalEvent::new(
            instrument.clone(),
            "system",
            serde_json::json!({
                "kind": "book_desynced",
                "retries": self.max_retries,
            }),
            Severity::Critical,
        );
        let _ = self.system_tx.send(event);
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub fn ladder(&self, instrument: &Instrument) -> Option<Ladder> {
        self.books
            .read()
            .get(instrument)
            .map(|slot| slot.book.ladder(self.ladder_depth))
    }

    pub fn best_bid_ask(&self, instrument: &Instrument) -> Option<(PriceLevel, PriceLevel)> {
        let books = self.books.read();
        let slot = books.get(instrument)?;
        match (slot.book.best_bid(), slot.book.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid, ask)),
            _ => None,
        }
    }

    pub fn status(&self, instrument: &Instrument) -> Option<BookStatus> {
        self.books
            .read()
            .get(instrument)
            .map(|slot| slot.book.status())
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        self.books.read().keys().cloned().collect()
    }

    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates.load(Ordering::Relaxed)
    }
}

/// A buffered chain is usable when it is empty (nothing to replay) or its
/// first diff straddles `snapshot_id + 1` and every later diff continues the
/// previous one exactly.
fn buffer_chain_is_usable(buffer: &VecDeque<DepthUpdate>, snapshot_id: u64) -> bool {
    let mut expected = snapshot_id + 1;
    for (i, update) in buffer.iter().enumerate() {
        if i == 0 {
            if update.first_update_id > expected || update.last_update_id < expected {
                return false;
            }
        } else if update.first_update_id != expected {
            return false;
        }
        expected = update.last_update_id + 1;
    }
    true
}
