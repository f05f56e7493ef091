// =============================================================================
// Engine Configuration — JSON-backed settings with atomic save
// =============================================================================
//
// Every tunable parameter of the engine lives here. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading
// an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::signals::RuleConfig;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
    ]
}

fn default_intervals_ms() -> Vec<i64> {
    // 1m and 5m.
    vec![60_000, 300_000]
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_cap_ms() -> u64 {
    30_000
}

fn default_sync_max_retries() -> u32 {
    5
}

fn default_ladder_depth() -> usize {
    20
}

fn default_candle_retention() -> usize {
    500
}

fn default_trade_dedup_window() -> usize {
    4_096
}

fn default_signal_lookback() -> usize {
    64
}

fn default_signal_retention() -> usize {
    256
}

fn default_stream_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_rest_url() -> String {
    "https://api.binance.com".to_string()
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level engine configuration, loaded from `engine_config.json` with
/// environment-variable overrides applied in main.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Instruments to subscribe to.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Candle intervals to aggregate, in milliseconds.
    #[serde(default = "default_intervals_ms")]
    pub intervals_ms: Vec<i64>,

    /// Base delay for websocket reconnect backoff.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Cap for websocket reconnect backoff.
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,

    /// Snapshot fetch attempts before a book is parked in Desynced.
    #[serde(default = "default_sync_max_retries")]
    pub sync_max_retries: u32,

    /// Number of levels returned by ladder reads.
    #[serde(default = "default_ladder_depth")]
    pub ladder_depth: usize,

    /// Closed candles retained per (instrument, interval).
    #[serde(default = "default_candle_retention")]
    pub candle_retention: usize,

    /// Recent trade-ids remembered for duplicate detection.
    #[serde(default = "default_trade_dedup_window")]
    pub trade_dedup_window: usize,

    /// Closed candles handed to rule evaluation as history.
    #[serde(default = "default_signal_lookback")]
    pub signal_lookback: usize,

    /// Signal events retained per instrument for query reads.
    #[serde(default = "default_signal_retention")]
    pub signal_retention: usize,

    /// Websocket endpoint base.
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// REST endpoint base (snapshot fetches).
    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    /// Signal rules, evaluated in this order.
    #[serde(default = "RuleConfig::default_set")]
    pub rules: Vec<RuleConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            intervals_ms: default_intervals_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            sync_max_retries: default_sync_max_retries(),
            ladder_depth: default_ladder_depth(),
            candle_retention: default_candle_retention(),
            trade_dedup_window: default_trade_dedup_window(),
            signal_lookback: default_signal_lookback(),
            signal_retention: default_signal_retention(),
            stream_url: default_stream_url(),
            rest_url: default_rest_url(),
            rules: RuleConfig::default_set(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Save configuration atomically (write tmp, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .with_context(|| format!("failed to write tmp config {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename tmp config into {}", path.display()))?;
        info!(path = %path.display(), "engine config saved");
        Ok(())
    }
}
