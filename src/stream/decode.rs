// =============================================================================
// Wire Decoding — exchange stream messages → typed events
// =============================================================================

use anyhow::{Context, Result};
use rust_decimal::Decimal;

use crate::types::{DepthUpdate, Instrument, Side, StreamEvent, Trade};

/// Decode one text frame from the exchange stream.
///
/// Returns `Ok(None)` for recognized-but-irrelevant payloads (subscription
/// acks, unknown event types); `Err` for malformed frames the caller should
/// count and drop.
pub fn decode_message(text: &str) -> Result<Option<StreamEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse stream JSON")?;

    // Combined-stream envelope: { "stream": "...", "data": { ... } }.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    match data["e"].as_str() {
        Some("depthUpdate") => Ok(Some(StreamEvent::Depth(decode_depth_update(data)?))),
        Some("trade") => Ok(Some(StreamEvent::Trade(decode_trade(data)?))),
        // Subscription acks ({"result":null,"id":1}) and unknown events.
        _ => Ok(None),
    }
}

/// Decode a diff-depth event.
///
/// Expected shape:
/// ```json
/// { "e": "depthUpdate", "s": "BNBBTC", "U": 157, "u": 160,
///   "b": [["0.0024", "10"]], "a": [["0.0026", "100"]] }
/// ```
fn decode_depth_update(data: &serde_json::Value) -> Result<DepthUpdate> {
    let symbol = data["s"].as_str().context("missing field s")?;
    let first_update_id = data["U"].as_u64().context("missing field U")?;
    let last_update_id = data["u"].as_u64().context("missing field u")?;

    Ok(DepthUpdate {
        instrument: Instrument::new(symbol),
        first_update_id,
        last_update_id,
        bids: decode_levels(&data["b"], "b")?,
        asks: decode_levels(&data["a"], "a")?,
    })
}

/// Decode a trade event.
///
/// Expected shape:
/// ```json
/// { "e": "trade", "s": "BNBBTC", "t": 12345, "p": "0.001", "q": "100",
///   "T": 1672515782136, "m": true }
/// ```
/// `m == true` means the buyer was the maker, i.e. the taker sold.
fn decode_trade(data: &serde_json::Value) -> Result<Trade> {
    let symbol = data["s"].as_str().context("missing field s")?;
    let trade_id = data["t"].as_u64().context("missing field t")?;
    let price: Decimal = data["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse trade price")?;
    let quantity: Decimal = data["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse trade quantity")?;
    let timestamp_ms = data["T"].as_i64().context("missing field T")?;
    let buyer_is_maker = data["m"].as_bool().context("missing field m")?;

    Ok(Trade {
        instrument: Instrument::new(symbol),
        trade_id,
        price,
        quantity,
        side: if buyer_is_maker { Side::Sell } else { Side::Buy },
        timestamp_ms,
    })
}

fn decode_levels(value: &serde_json::Value, name: &str) -> Result<Vec<(Decimal, Decimal)>> {
    let levels = value
        .as_array()
        .with_context(|| format!("missing field {name}"))?;

    let mut out = Vec::with_capacity(levels.len());
    for level in levels {
        let price: Decimal = level
            .get(0)
            .and_then(|v| v.as_str())
            .with_context(|| format!("{name} level missing price"))?
            .parse()
            .with_context(|| format!("failed to parse {name} price"))?;
        let qty: Decimal = level
            .get(1)
            .and_then(|v| v.as_str())
            .with_context(|| format!("{name} level missing quantity"))?
            .parse()
            .with_context(|| format!("failed to parse {name} quantity"))?;
        out.push((price, qty));
    }
    Ok(out)
}
