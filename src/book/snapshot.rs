// =============================================================================
// REST Snapshot Source — full book baselines via GET /api/v3/depth
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::debug;

use crate::book::engine::SnapshotSource;
use crate::types::{Instrument, Snapshot};

/// Number of levels requested per snapshot. 1000 is the deepest single-call
/// tier the public depth endpoint serves.
const SNAPSHOT_LIMIT: u32 = 1000;

/// Fetches order book snapshots from the exchange REST API. The depth
/// endpoint is public, so no request signing is involved.
#[derive(Clone)]
pub struct RestSnapshotSource {
    base_url: String,
    client: reqwest::Client,
}

impl RestSnapshotSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

impl SnapshotSource for RestSnapshotSource {
    async fn fetch_snapshot(&self, instrument: &Instrument) -> Result<Snapshot> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url, instrument, SNAPSHOT_LIMIT
        );
        debug!(instrument = %instrument, "fetching depth snapshot");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/depth request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse depth snapshot body")?;

        if !status.is_success() {
            anyhow::bail!("depth snapshot returned {status}: {body}");
        }

        parse_snapshot(instrument, &body)
    }
}

/// Parse a depth snapshot body.
///
/// Expected shape:
/// ```json
/// {
///   "lastUpdateId": 1027024,
///   "bids": [["4.00000000", "431.00000000"], ...],
///   "asks": [["4.00000200", "12.00000000"], ...]
/// }
/// ```
fn parse_snapshot(instrument: &Instrument, body: &serde_json::Value) -> Result<Snapshot> {
    let last_update_id = body["lastUpdateId"]
        .as_u64()
        .context("missing field lastUpdateId")?;

    Ok(Snapshot {
        instrument: instrument.clone(),
        last_update_id,
        bids: parse_levels(&body["bids"], "bids")?,
        asks: parse_levels(&body["asks"], "asks")?,
    })
}

fn parse_levels(value: &serde_json::Value, name: &str) -> Result<BTreeMap<Decimal, Decimal>> {
    let levels = value
        .as_array()
        .with_context(|| format!("missing field {name}"))?;

    let mut map = BTreeMap::new();
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
        map.insert(price, qty);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parse_snapshot_ok() {
        let body = serde_json::json!({
            "lastUpdateId": 1027024,
            "bids": [["4.00000000", "431.00000000"], ["3.99000000", "9.00000000"]],
            "asks": [["4.00000200", "12.00000000"]]
        });
        let snap = parse_snapshot(&Instrument::new("BNBBTC"), &body).expect("should parse");
        assert_eq!(snap.last_update_id, 1027024);
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.bids.get(&dec!(4.00000000)), Some(&dec!(431.00000000)));
        assert_eq!(snap.asks.len(), 1);
    }

    #[test]
    fn parse_snapshot_missing_field() {
        let body = serde_json::json!({ "bids": [], "asks": [] });
        assert!(parse_snapshot(&Instrument::new("BNBBTC"), &body).is_err());
    }
}
