// =============================================================================
// Dispatch Boundary — fan-out of signal events to notification sinks
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{info, warn};

use crate::types::SignalEvent;

/// Failure surfaced by a sink. Retrying is the sink's responsibility; the
/// dispatcher only logs.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("sink rejected event: {0}")]
    Rejected(String),
}

/// Outbound delivery capability (chat bots, webhooks, ...). Implementations
/// live outside the core; the engine only depends on this method.
pub trait SignalSink: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, event: &SignalEvent) -> Result<(), DeliveryError>;
}

/// Forwards each signal event to every registered sink, in registration
/// order. Failed deliveries are logged and counted, never retried here.
pub struct Dispatcher {
    sinks: Vec<Box<dyn SignalSink>>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Dispatcher {
    pub fn new(sinks: Vec<Box<dyn SignalSink>>) -> Self {
        Self {
            sinks,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn dispatch(&self, event: &SignalEvent) {
        for sink in &self.sinks {
            match sink.deliver(event) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        sink = sink.name(),
                        rule = %event.rule_id,
                        instrument = %event.instrument,
                        error = %e,
                        "signal delivery failed"
                    );
                }
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Built-in sink that writes events to the log. Useful as a default when no
/// external notification sink is configured.
pub struct LogSink;

impl SignalSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&self, event: &SignalEvent) -> Result<(), DeliveryError> {
        info!(
            instrument = %event.instrument,
            rule = %event.rule_id,
            severity = %event.severity,
            payload = %event.payload,
            "signal"
        );
        Ok(())
    }
}
