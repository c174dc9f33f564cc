// =============================================================================
// WebSocket Quote Feed — non-FIX adapter for normalized quotes
// =============================================================================
//
// Some LPs publish prices over a plain WebSocket instead of a FIX market-data
// stream. This adapter connects, parses the normalized JSON quote shape and
// feeds the aggregator exactly like a FIX session would.
//
// Runs until the stream disconnects or an error occurs, then returns so that
// the caller (main.rs) can handle reconnection.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::quotes::aggregator::{Quote, QuoteAggregator};
use crate::runtime_config::WsFeedConfig;
use crate::types::now_ms;

/// Connect to a WebSocket quote feed and apply every quote to `aggregator`.
pub async fn run_quote_feed(
    config: &WsFeedConfig,
    aggregator: &Arc<QuoteAggregator>,
) -> Result<()> {
    info!(lp = %config.lp_id, url = %config.url, "connecting to quote WebSocket");

    let (ws_stream, _response) = connect_async(&config.url)
        .await
        .context("failed to connect to quote WebSocket")?;

    info!(lp = %config.lp_id, "quote WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_quote(&config.lp_id, &text) {
                        Ok(quote) => aggregator.apply_quote(quote),
                        Err(e) => {
                            warn!(lp = %config.lp_id, error = %e, "failed to parse quote message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(lp = %config.lp_id, error = %e, "quote WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(lp = %config.lp_id, "quote WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a normalized quote message.
///
/// Expected shape:
/// ```json
/// { "symbol": "EURUSD", "bid": 1.10000, "ask": 1.10020,
///   "bid_volume": 5.0, "ask_volume": 3.0, "ts": 1700000000000 }
/// ```
/// `bid_volume`, `ask_volume` and `ts` are optional; a missing `ts` is
/// stamped with the receive time.
fn parse_quote(lp_id: &str, text: &str) -> Result<Quote> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse quote JSON")?;

    let symbol = root["symbol"]
        .as_str()
        .context("missing field symbol")?
        .to_uppercase();

    let bid = root["bid"].as_f64().context("missing field bid")?;
    let ask = root["ask"].as_f64().context("missing field ask")?;

    Ok(Quote {
        symbol,
        lp: lp_id.to_string(),
        bid,
        ask,
        bid_volume: root["bid_volume"].as_f64(),
        ask_volume: root["ask_volume"].as_f64(),
        ts_ms: root["ts"].as_i64().unwrap_or_else(now_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_quote() {
        let text = r#"{"symbol":"eurusd","bid":1.1,"ask":1.10020,"bid_volume":5.0,"ask_volume":3.0,"ts":1700000000000}"#;
        let quote = parse_quote("WSLP", text).unwrap();
        assert_eq!(quote.symbol, "EURUSD");
        assert_eq!(quote.lp, "WSLP");
        assert_eq!(quote.bid, 1.1);
        assert_eq!(quote.ask, 1.10020);
        assert_eq!(quote.bid_volume, Some(5.0));
        assert_eq!(quote.ts_ms, 1_700_000_000_000);
    }

    #[test]
    fn missing_ts_is_stamped() {
        let text = r#"{"symbol":"EURUSD","bid":1.1,"ask":1.2}"#;
        let quote = parse_quote("WSLP", text).unwrap();
        assert!(quote.ts_ms > 0);
        assert!(quote.bid_volume.is_none());
    }

    #[test]
    fn missing_price_is_an_error() {
        assert!(parse_quote("WSLP", r#"{"symbol":"EURUSD","bid":1.1}"#).is_err());
        assert!(parse_quote("WSLP", "not json").is_err());
    }
}
