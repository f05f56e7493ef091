// =============================================================================
// Stream Client — websocket supervisor with jittered reconnect backoff
// =============================================================================
//
// One logical subscription per instrument: a combined stream carrying both
// the diff-depth and trade feeds. Decoded events are delivered over an mpsc
// channel in wire arrival order. On connection loss the client emits
// Connection(Dropped), reconnects with exponential full-jitter backoff, and
// emits Connection(Resumed) once the subscription is re-established.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::stream::decode::decode_message;
use crate::types::{ConnectionEvent, Instrument, StreamEvent};

/// Why one connection attempt ended.
enum SessionEnd {
    /// Stream dropped after delivering events; consumers were told.
    Dropped,
    /// The event channel closed (instrument unsubscribed): stop entirely.
    Cancelled,
}

/// Maintains the exchange websocket subscription for instruments and feeds
/// decoded events downstream.
pub struct StreamClient {
    stream_url: String,
    backoff_base_ms: u64,
    backoff_cap_ms: u64,
    malformed_frames: AtomicU64,
}

impl StreamClient {
    pub fn new(stream_url: impl Into<String>, backoff_base_ms: u64, backoff_cap_ms: u64) -> Self {
        Self {
            stream_url: stream_url.into(),
            backoff_base_ms,
            backoff_cap_ms,
            malformed_frames: AtomicU64::new(0),
        }
    }

    /// Malformed frames dropped so far (all instruments).
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    /// Run the subscription for one instrument until `tx` closes. Never
    /// returns early on transport errors; reconnects forever with backoff.
    pub async fn run(&self, instrument: Instrument, tx: mpsc::UnboundedSender<StreamEvent>) {
        let url = combined_stream_url(&self.stream_url, &instrument);
        let mut attempt: u32 = 0;
        let mut resuming = false;

        loop {
            if tx.is_closed() {
                info!(instrument = %instrument, "stream cancelled");
                return;
            }

            match self.run_session(&url, &instrument, &tx, resuming).await {
                Ok(SessionEnd::Cancelled) => {
                    info!(instrument = %instrument, "stream cancelled");
                    return;
                }
                Ok(SessionEnd::Dropped) => {
                    // Reconnect from a clean backoff schedule: the session
                    // was live, so the next attempt is the first retry.
                    attempt = 1;
                    resuming = true;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    error!(
                        instrument = %instrument,
                        attempt,
                        error = %e,
                        "stream connect failed"
                    );
                }
            }

            let delay = jittered_backoff(self.backoff_base_ms, self.backoff_cap_ms, attempt);
            warn!(
                instrument = %instrument,
                delay_ms = delay.as_millis() as u64,
                "reconnecting after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection lifetime: connect, read until the socket ends, deliver
    /// decoded events in arrival order.
    async fn run_session(
        &self,
        url: &str,
        instrument: &Instrument,
        tx: &mpsc::UnboundedSender<StreamEvent>,
        resuming: bool,
    ) -> Result<SessionEnd> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .context("failed to connect to market-data websocket")?;
        info!(instrument = %instrument, url = %url, "stream connected");

        if resuming
            && tx
                .send(StreamEvent::Connection(
                    instrument.clone(),
                    ConnectionEvent::Resumed,
                ))
                .is_err()
        {
            return Ok(SessionEnd::Cancelled);
        }

        let (_write, mut read) = ws_stream.split();

        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match decode_message(&text) {
                            Ok(Some(event)) => {
                                if tx.send(event).is_err() {
                                    return Ok(SessionEnd::Cancelled);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    instrument = %instrument,
                                    error = %e,
                                    "malformed frame dropped"
                                );
                            }
                        }
                    }
                    // Ping/Pong/Binary/Close frames are not surfaced;
                    // tungstenite answers pings itself.
                }
                Some(Err(e)) => {
                    warn!(instrument = %instrument, error = %e, "stream read error");
                    break;
                }
                None => {
                    warn!(instrument = %instrument, "stream ended");
                    break;
                }
            }
        }

        if tx
            .send(StreamEvent::Connection(
                instrument.clone(),
                ConnectionEvent::Dropped,
            ))
            .is_err()
        {
            return Ok(SessionEnd::Cancelled);
        }
        Ok(SessionEnd::Dropped)
    }
}

/// Combined-stream URL carrying diff-depth and trades for one instrument.
fn combined_stream_url(base: &str, instrument: &Instrument) -> String {
    let name = instrument.stream_name();
    format!("{base}/stream?streams={name}@depth@100ms/{name}@trade")
}

/// Full-jitter exponential backoff: uniform in [0, min(cap, base * 2^(n-1))].
/// Attempt 0 (or a zero ceiling) yields no delay.
fn jittered_backoff(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let ceiling = backoff_ceiling_ms(base_ms, cap_ms, attempt);
    if ceiling == 0 {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(0..=ceiling);
    Duration::from_millis(ms)
}

fn backoff_ceiling_ms(base_ms: u64, cap_ms: u64, attempt: u32) -> u64 {
    if attempt == 0 {
        return 0;
    }
    base_ms
        .saturating_mul(1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX))
        .min(cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_subscribes_depth_and_trades() {
        let url = combined_stream_url(
            "wss://stream.binance.com:9443",
            &Instrument::new("BTCUSDT"),
        );
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@depth@100ms/btcusdt@trade"
        );
    }

    #[test]
    fn backoff_ceiling_doubles_then_caps() {
        assert_eq!(backoff_ceiling_ms(1_000, 30_000, 0), 0);
        assert_eq!(backoff_ceiling_ms(1_000, 30_000, 1), 1_000);
        assert_eq!(backoff_ceiling_ms(1_000, 30_000, 2), 2_000);
        assert_eq!(backoff_ceiling_ms(1_000, 30_000, 5), 16_000);
        assert_eq!(backoff_ceiling_ms(1_000, 30_000, 6), 30_000);
        assert_eq!(backoff_ceiling_ms(1_000, 30_000, 63), 30_000);
        // Shift overflow saturates at the cap rather than wrapping.
        assert_eq!(backoff_ceiling_ms(1_000, 30_000, 200), 30_000);
    }

    #[test]
    fn jitter_stays_within_ceiling() {
        for _ in 0..100 {
            let delay = jittered_backoff(1_000, 30_000, 3);
            assert!(delay <= Duration::from_millis(4_000));
        }
    }
}
