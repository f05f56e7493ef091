// =============================================================================
// Signal Rules — pure evaluation over candle history and ladder reads
// =============================================================================
//
// Rules are a closed set of tagged variants rather than open-ended dynamic
// dispatch, so evaluation order and fault isolation are enforced centrally
// by the engine. Each rule is a pure function of the context it is given.
// =============================================================================

pub mod engine;

pub use engine::SignalEngine;

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::types::{Candle, Instrument, Ladder, Severity, SignalEvent};

/// Everything a rule may look at for one evaluation: the recent closed-candle
/// history (oldest first, last element = the candle that just closed) and an
/// optional live ladder read.
pub struct RuleContext<'a> {
    pub instrument: &'a Instrument,
    pub interval_ms: i64,
    pub candles: &'a [Candle],
    pub ladder: Option<&'a Ladder>,
}

/// A configured signal rule. Variants are evaluated in configuration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleConfig {
    /// Fires when the just-closed candle's volume exceeds `ratio` times the
    /// average volume of the preceding `window` candles.
    VolumeSpike { window: usize, ratio: f64 },
    /// Fires when the close-to-close move over `lookback` candles exceeds
    /// `min_change_pct` percent in either direction.
    Momentum { lookback: usize, min_change_pct: f64 },
    /// Fires when bid/ask depth imbalance over the top `depth` levels
    /// exceeds `threshold` (0..1) in either direction.
    BookImbalance { depth: usize, threshold: f64 },
    /// Test-only rule that panics during evaluation.
    #[cfg(test)]
    PanicsOnEvaluate,
}

impl RuleConfig {
    /// Stable identifier attached to emitted events.
    pub fn rule_id(&self) -> &'static str {
        match self {
            Self::VolumeSpike { .. } => "volume_spike",
            Self::Momentum { .. } => "momentum",
            Self::BookImbalance { .. } => "book_imbalance",
            #[cfg(test)]
            Self::PanicsOnEvaluate => "panics_on_evaluate",
        }
    }

    /// Default rule set used when the config file names none.
    pub fn default_set() -> Vec<RuleConfig> {
        vec![
            RuleConfig::VolumeSpike {
                window: 5,
                ratio: 3.0,
            },
            RuleConfig::Momentum {
                lookback: 10,
                min_change_pct: 1.5,
            },
            RuleConfig::BookImbalance {
                depth: 10,
                threshold: 0.7,
            },
        ]
    }

    /// Evaluate the rule against a context. Pure: no state is read or
    /// written outside `ctx`.
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<SignalEvent> {
        match self {
            Self::VolumeSpike { window, ratio } => evaluate_volume_spike(ctx, *window, *ratio),
            Self::Momentum {
                lookback,
                min_change_pct,
            } => evaluate_momentum(ctx, *lookback, *min_change_pct),
            Self::BookImbalance { depth, threshold } => {
                evaluate_book_imbalance(ctx, *depth, *threshold)
            }
            #[cfg(test)]
            Self::PanicsOnEvaluate => panic!("rule fault injected"),
        }
    }
}

fn evaluate_volume_spike(ctx: &RuleContext<'_>, window: usize, ratio: f64) -> Option<SignalEvent> {
    if window == 0 || ctx.candles.len() < window + 1 {
        return None;
    }
    let current = ctx.candles.last()?;
    let prior = &ctx.candles[ctx.candles.len() - 1 - window..ctx.candles.len() - 1];

    let avg: f64 = prior
        .iter()
        .filter_map(|c| c.volume.to_f64())
        .sum::<f64>()
        / window as f64;
    let current_volume = current.volume.to_f64()?;

    if avg > 0.0 && current_volume >= avg * ratio {
        Some(SignalEvent::new(
            ctx.instrument.clone(),
            "volume_spike",
            serde_json::json!({
                "interval_ms": ctx.interval_ms,
                "bucket_start_ms": current.bucket_start_ms,
                "current_volume": current_volume,
                "average_volume": avg,
                "ratio": current_volume / avg,
            }),
            Severity::Warning,
        ))
    } else {
        None
    }
}

fn evaluate_momentum(
    ctx: &RuleContext<'_>,
    lookback: usize,
    min_change_pct: f64,
) -> Option<SignalEvent> {
    if lookback == 0 || ctx.candles.len() < lookback + 1 {
        return None;
    }
    let current = ctx.candles.last()?;
    let reference = &ctx.candles[ctx.candles.len() - 1 - lookback];

    let old = reference.close.to_f64()?;
    let new = current.close.to_f64()?;
    if old <= 0.0 {
        return None;
    }
    let change_pct = (new - old) / old * 100.0;

    if change_pct.abs() >= min_change_pct {
        Some(SignalEvent::new(
            ctx.instrument.clone(),
            "momentum",
            serde_json::json!({
                "interval_ms": ctx.interval_ms,
                "bucket_start_ms": current.bucket_start_ms,
                "change_pct": change_pct,
                "direction": if change_pct > 0.0 { "up" } else { "down" },
                "lookback": lookback,
            }),
            Severity::Info,
        ))
    } else {
        None
    }
}

fn evaluate_book_imbalance(
    ctx: &RuleContext<'_>,
    depth: usize,
    threshold: f64,
) -> Option<SignalEvent> {
    let ladder = ctx.ladder?;

    let bid_depth: f64 = ladder
        .bids
        .iter()
        .take(depth)
        .filter_map(|l| l.quantity.to_f64())
        .sum();
    let ask_depth: f64 = ladder
        .asks
        .iter()
        .take(depth)
        .filter_map(|l| l.quantity.to_f64())
        .sum();
    let total = bid_depth + ask_depth;
    if total <= 0.0 {
        return None;
    }
    let imbalance = (bid_depth - ask_depth) / total;

    if imbalance.abs() >= threshold {
        Some(SignalEvent::new(
            ctx.instrument.clone(),
            "book_imbalance",
            serde_json::json!({
                "imbalance": imbalance,
                "bid_depth": bid_depth,
                "ask_depth": ask_depth,
                "side": if imbalance > 0.0 { "bid" } else { "ask" },
                "book_status": ladder.status,
            }),
            Severity::Info,
        ))
    } else {
        None
    }
}
