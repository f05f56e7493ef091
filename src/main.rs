// =============================================================================
// Meridian Market Engine — Main Entry Point
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod book;
mod candles;
mod config;
mod dispatch;
mod signals;
mod state;
mod stream;
mod types;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::book::RestSnapshotSource;
use crate::config::EngineConfig;
use crate::dispatch::{LogSink, SignalSink};
use crate::state::EngineState;
use crate::types::Instrument;

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Market Engine starting up");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        warn!("no symbols configured — nothing to subscribe");
    }

    info!(
        symbols = ?config.symbols,
        intervals_ms = ?config.intervals_ms,
        rules = config.rules.len(),
        "engine configured"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let snapshot_source = RestSnapshotSource::new(config.rest_url.clone());
    let sinks: Vec<Box<dyn SignalSink>> = vec![Box::new(LogSink)];
    let symbols = config.symbols.clone();
    let (state, candle_rx, system_rx) = EngineState::new(config, snapshot_source, sinks);

    // ── 3. Signal evaluation loop ────────────────────────────────────────
    let signal_state = state.clone();
    tokio::spawn(async move {
        signal_state.run_signal_loop(candle_rx).await;
    });

    // ── 4. System alert loop ─────────────────────────────────────────────
    let system_state = state.clone();
    tokio::spawn(async move {
        system_state.run_system_loop(system_rx).await;
    });

    // ── 5. Subscribe instruments ─────────────────────────────────────────
    for symbol in &symbols {
        state.subscribe(Instrument::new(symbol));
    }
    info!(count = symbols.len(), "market data subscriptions launched");

    // ── 6. Periodic stats log ────────────────────────────────────────────
    let stats_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;
            let stats = stats_state.stats();
            info!(
                uptime_secs = stats.uptime_secs,
                malformed_frames = stats.malformed_frames,
                connection_drops = stats.connection_drops,
                dropped_book_updates = stats.dropped_book_updates,
                late_trades = stats.late_trades,
                duplicate_trades = stats.duplicate_trades,
                signals_delivered = stats.signals_delivered,
                signals_failed = stats.signals_failed,
                "engine stats"
            );
            for entry in &stats.books {
                if entry.status != types::BookStatus::Live {
                    warn!(instrument = %entry.instrument, status = %entry.status, "book not live");
                }
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");

    let instruments: Vec<Instrument> = state.subscribed_instruments();
    for instrument in &instruments {
        state.unsubscribe(instrument);
    }

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Meridian Market Engine shut down complete.");
    Ok(())
}
