// =============================================================================
// Order Book — single-instrument ladder with contiguous diff application
// =============================================================================

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{BookStatus, DepthUpdate, Instrument, Ladder, PriceLevel, Snapshot};

/// A depth update whose `first_update_id` does not continue the applied chain.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("sequence gap: expected first_update_id {expected}, got {got}")]
pub struct GapError {
    pub expected: u64,
    pub got: u64,
}

/// Result of feeding one diff to the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The diff extended the chain and the ladder was mutated.
    Applied,
    /// The diff predates the current state entirely; dropped without effect.
    Stale,
}

/// In-memory replica of one instrument's bid/ask ladder.
///
/// Prices are exact decimals keyed in a `BTreeMap`, so point updates are a
/// direct lookup and best-bid/best-ask are the ends of the map. Levels with
/// quantity zero are removed, never stored.
#[derive(Debug, Clone)]
pub struct OrderBook {
    instrument: Instrument,
    status: BookStatus,
    last_update_id: u64,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl OrderBook {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            status: BookStatus::Syncing,
            last_update_id: 0,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn status(&self) -> BookStatus {
        self.status
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Replace the entire ladder with a snapshot baseline. Zero-quantity
    /// levels in the snapshot are not retained.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        self.bids = snapshot
            .bids
            .iter()
            .filter(|(_, qty)| !qty.is_zero())
            .map(|(p, q)| (*p, *q))
            .collect();
        self.asks = snapshot
            .asks
            .iter()
            .filter(|(_, qty)| !qty.is_zero())
            .map(|(p, q)| (*p, *q))
            .collect();
        self.last_update_id = snapshot.last_update_id;
    }

    /// Apply a diff while `Live`: the chain must be exactly contiguous.
    ///
    /// * `last_update_id <= applied` — already covered, dropped as `Stale`.
    /// * `first_update_id == applied + 1` — applied.
    /// * anything else — the book is marked `Desynced` and nothing is mutated.
    pub fn apply_update(&mut self, update: &DepthUpdate) -> Result<ApplyOutcome, GapError> {
        if update.last_update_id <= self.last_update_id {
            return Ok(ApplyOutcome::Stale);
        }
        let expected = self.last_update_id + 1;
        if update.first_update_id != expected {
            self.status = BookStatus::Desynced;
            return Err(GapError {
                expected,
                got: update.first_update_id,
            });
        }
        self.apply_levels(update);
        Ok(ApplyOutcome::Applied)
    }

    /// Apply the first post-snapshot diff, which may overlap the snapshot:
    /// it must satisfy `first_update_id <= applied + 1 <= last_update_id`.
    /// Level changes are absolute quantities, so the overlap is harmless.
    pub fn apply_straddling(&mut self, update: &DepthUpdate) -> Result<ApplyOutcome, GapError> {
        if update.last_update_id <= self.last_update_id {
            return Ok(ApplyOutcome::Stale);
        }
        let expected = self.last_update_id + 1;
        if update.first_update_id > expected {
            self.status = BookStatus::Desynced;
            return Err(GapError {
                expected,
                got: update.first_update_id,
            });
        }
        self.apply_levels(update);
        Ok(ApplyOutcome::Applied)
    }

    fn apply_levels(&mut self, update: &DepthUpdate) {
        for (price, qty) in &update.bids {
            if qty.is_zero() {
                self.bids.remove(price);
            } else {
                self.bids.insert(*price, *qty);
            }
        }
        for (price, qty) in &update.asks {
            if qty.is_zero() {
                self.asks.remove(price);
            } else {
                self.asks.insert(*price, *qty);
            }
        }
        self.last_update_id = update.last_update_id;
    }

    pub fn set_status(&mut self, status: BookStatus) {
        self.status = status;
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.iter().next_back().map(|(p, q)| PriceLevel {
            price: *p,
            quantity: *q,
        })
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.iter().next().map(|(p, q)| PriceLevel {
            price: *p,
            quantity: *q,
        })
    }

    /// Depth-limited read model: best price first on both sides.
    pub fn ladder(&self, depth: usize) -> Ladder {
        Ladder {
            instrument: self.instrument.clone(),
            status: self.status,
            last_update_id: self.last_update_id,
            bids: self
                .bids
                .iter()
                .rev()
                .take(depth)
                .map(|(p, q)| PriceLevel {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
            asks: self
                .asks
                .iter()
                .take(depth)
                .map(|(p, q)| PriceLevel {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
        }
    }

    pub fn level_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inst() -> Instrument {
        Instrument::new("BTCUSDT")
    }

    fn snapshot(last_update_id: u64, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> Snapshot {
        Snapshot {
            instrument: inst(),
            last_update_id,
            bids: bids.iter().copied().collect(),
            asks: asks.iter().copied().collect(),
        }
    }

    fn update(first: u64, last: u64, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) -> DepthUpdate {
        DepthUpdate {
            instrument: inst(),
            first_update_id: first,
            last_update_id: last,
            bids,
            asks,
        }
    }

    #[test]
    fn zero_quantity_removes_level() {
        // Snapshot {last_update_id: 100, bids: {10.0: 5}}, then a diff that
        // zeroes the level out: the book must end with no entry at 10.0.
        let mut book = OrderBook::new(inst());
        book.apply_snapshot(&snapshot(100, &[(dec!(10.0), dec!(5))], &[]));
        book.set_status(BookStatus::Live);

        let outcome = book
            .apply_update(&update(101, 101, vec![(dec!(10.0), dec!(0))], vec![]))
            .expect("contiguous update should apply");
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.last_update_id(), 101);
    }

    #[test]
    fn gap_marks_desynced_without_mutation() {
        let mut book = OrderBook::new(inst());
        book.apply_snapshot(&snapshot(100, &[(dec!(10.0), dec!(5))], &[(dec!(11.0), dec!(2))]));
        book.set_status(BookStatus::Live);

        // first_update_id 103 != 101: gap.
        let err = book
            .apply_update(&update(103, 104, vec![(dec!(10.0), dec!(0))], vec![]))
            .expect_err("gap must be rejected");
        assert_eq!(err.expected, 101);
        assert_eq!(err.got, 103);
        assert_eq!(book.status(), BookStatus::Desynced);
        // Ladder untouched.
        assert_eq!(book.best_bid().unwrap().price, dec!(10.0));
        assert_eq!(book.last_update_id(), 100);
    }

    #[test]
    fn stale_update_is_dropped() {
        let mut book = OrderBook::new(inst());
        book.apply_snapshot(&snapshot(100, &[(dec!(10.0), dec!(5))], &[]));
        book.set_status(BookStatus::Live);

        let outcome = book
            .apply_update(&update(90, 95, vec![(dec!(10.0), dec!(0))], vec![]))
            .expect("stale update is not an error");
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(book.best_bid().unwrap().quantity, dec!(5));
    }

    #[test]
    fn straddling_update_accepted_after_snapshot() {
        let mut book = OrderBook::new(inst());
        book.apply_snapshot(&snapshot(100, &[], &[(dec!(11.0), dec!(2))]));

        // Overlaps the snapshot (first 99 <= 101 <= last 102).
        let outcome = book
            .apply_straddling(&update(99, 102, vec![(dec!(10.5), dec!(1))], vec![]))
            .expect("straddling update should apply");
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(book.last_update_id(), 102);
        assert_eq!(book.best_bid().unwrap().price, dec!(10.5));
    }

    #[test]
    fn replay_determinism_matches_from_scratch() {
        // Same snapshot + same contiguous diffs applied twice independently
        // must yield identical ladders.
        let snap = snapshot(
            10,
            &[(dec!(100), dec!(1)), (dec!(99), dec!(2))],
            &[(dec!(101), dec!(1)), (dec!(102), dec!(3))],
        );
        let updates = vec![
            update(11, 12, vec![(dec!(100), dec!(0)), (dec!(98), dec!(4))], vec![]),
            update(13, 13, vec![], vec![(dec!(101), dec!(0.5))]),
            update(14, 16, vec![(dec!(99.5), dec!(1))], vec![(dec!(102), dec!(0))]),
        ];

        let build = || {
            let mut book = OrderBook::new(inst());
            book.apply_snapshot(&snap);
            book.set_status(BookStatus::Live);
            for u in &updates {
                book.apply_update(u).expect("chain is contiguous");
            }
            book.ladder(10)
        };

        let a = build();
        let b = build();
        assert_eq!(a.bids, b.bids);
        assert_eq!(a.asks, b.asks);
        assert_eq!(a.last_update_id, b.last_update_id);
        assert_eq!(a.best_bid().unwrap().price, dec!(99.5));
        assert_eq!(a.best_ask().unwrap().price, dec!(101));
    }

    #[test]
    fn ladder_is_depth_limited_and_sorted() {
        let mut book = OrderBook::new(inst());
        book.apply_snapshot(&snapshot(
            1,
            &[(dec!(10), dec!(1)), (dec!(11), dec!(1)), (dec!(12), dec!(1))],
            &[(dec!(13), dec!(1)), (dec!(14), dec!(1)), (dec!(15), dec!(1))],
        ));

        let ladder = book.ladder(2);
        assert_eq!(ladder.bids.len(), 2);
        assert_eq!(ladder.bids[0].price, dec!(12)); // best bid first
        assert_eq!(ladder.asks[0].price, dec!(13)); // best ask first
    }
}
