// =============================================================================
// Signal Engine — deterministic rule evaluation with fault isolation
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::signals::{RuleConfig, RuleContext};
use crate::types::{Instrument, SignalEvent};

/// Runs every configured rule exactly once per input event, in configuration
/// order. A rule that panics is isolated: the fault is logged and the
/// remaining rules still run. Emitted events preserve evaluation order.
pub struct SignalEngine {
    rules: Vec<RuleConfig>,
    retention: usize,
    recent: RwLock<HashMap<Instrument, VecDeque<SignalEvent>>>,
}

impl SignalEngine {
    pub fn new(rules: Vec<RuleConfig>, retention: usize) -> Self {
        Self {
            rules,
            retention,
            recent: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate all rules against one context. Returned events are also
    /// recorded in the per-instrument recent ring.
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> Vec<SignalEvent> {
        let mut events = Vec::new();
        for rule in &self.rules {
            match catch_unwind(AssertUnwindSafe(|| rule.evaluate(ctx))) {
                Ok(Some(event)) => {
                    debug!(
                        instrument = %ctx.instrument,
                        rule = rule.rule_id(),
                        severity = %event.severity,
                        "signal emitted"
                    );
                    events.push(event);
                }
                Ok(None) => {}
                Err(_) => {
                    error!(
                        instrument = %ctx.instrument,
                        rule = rule.rule_id(),
                        "rule evaluation panicked — skipped"
                    );
                }
            }
        }
        for event in &events {
            self.record(event.clone());
        }
        events
    }

    /// Append an event to the recent ring (also used for externally produced
    /// `system` events so query reads see them).
    pub fn record(&self, event: SignalEvent) {
        let mut recent = self.recent.write();
        let ring = recent
            .entry(event.instrument.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.retention + 1));
        ring.push_back(event);
        while ring.len() > self.retention {
            ring.pop_front();
        }
    }

    /// The most recent `count` events for an instrument, oldest first.
    pub fn recent_signals(&self, instrument: &Instrument, count: usize) -> Vec<SignalEvent> {
        let recent = self.recent.read();
        match recent.get(instrument) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop recorded events for an instrument (on unsubscribe).
    pub fn unsubscribe(&self, instrument: &Instrument) {
        self.recent.write().remove(instrument);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
