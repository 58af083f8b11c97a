// =============================================================================
// Feed Protocols — per-exchange ticker stream wire formats
// =============================================================================
//
// A protocol knows where to connect, how to ask for a symbol, how to keep the
// connection alive and how to turn a text frame into a price. It never does
// I/O; the manager owns the socket.
//
// Bybit linear tickers:
//   -> {"op":"subscribe","args":["tickers.BTCUSDT"]}
//   <- {"topic":"tickers.BTCUSDT","type":"snapshot","data":{"symbol":"BTCUSDT","lastPrice":"43000.5",..}}
//   client keep-alive {"op":"ping"} every 20 s
//
// BingX tickers (gzip binary frames):
//   -> {"id":"..","reqType":"sub","dataType":"BTC-USDT@ticker"}
//   <- {"dataType":"BTC-USDT@ticker","data":{"s":"BTC-USDT","c":"43000.5",..}}
//   server heartbeat "Ping" -> "Pong", {"ping":x} -> {"pong":x}
// =============================================================================

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::Exchange;

/// What a single inbound text frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Keep-alive traffic; `Some` carries the reply to send back.
    Heartbeat(Option<String>),
    Price { symbol: String, price: f64 },
    /// Acks, deltas without a price and other frames we do not route.
    Ignored(&'static str),
}

#[derive(Debug, Error)]
pub enum FeedParseError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("price field holds '{0}'")]
    BadPrice(String),
    #[error("binary frame is neither gzip nor UTF-8")]
    Undecodable,
}

pub trait FeedProtocol: Send + Sync {
    fn exchange(&self) -> Exchange;

    fn endpoint(&self) -> &str;

    /// Extra HTTP headers for the websocket handshake.
    fn handshake_headers(&self) -> &[(&'static str, &'static str)] {
        &[]
    }

    fn subscribe_request(&self, symbol: &str) -> String;

    /// Client-initiated keep-alive, if the exchange expects one.
    fn client_ping(&self) -> Option<(Duration, String)> {
        None
    }

    fn classify(&self, text: &str) -> Result<WireMessage, FeedParseError>;
}

pub fn protocol_for(exchange: Exchange) -> Arc<dyn FeedProtocol> {
    match exchange {
        Exchange::Bybit => Arc::new(BybitProtocol::default()),
        Exchange::Bingx => Arc::new(BingxProtocol::default()),
    }
}

/// Canonical routing key: upper case, no separators (`btc/usdt` -> `BTCUSDT`).
pub fn normalize_symbol(symbol: &str) -> String {
    symbol
        .trim()
        .chars()
        .filter(|c| !matches!(c, '/' | '-' | '_'))
        .collect::<String>()
        .to_uppercase()
}

/// Decode a binary frame: gzip when it has the gzip magic, plain UTF-8 otherwise.
pub fn decode_frame(bytes: &[u8]) -> Result<String, FeedParseError> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut text = String::new();
        if GzDecoder::new(bytes).read_to_string(&mut text).is_ok() {
            return Ok(text);
        }
    }
    String::from_utf8(bytes.to_vec()).map_err(|_| FeedParseError::Undecodable)
}

fn price_from(value: &Value) -> Result<f64, FeedParseError> {
    let price = match value {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    price
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| FeedParseError::BadPrice(value.to_string()))
}

// ---------------------------------------------------------------------------
// Bybit
// ---------------------------------------------------------------------------

pub struct BybitProtocol {
    endpoint: String,
    ping_interval: Duration,
}

impl Default for BybitProtocol {
    fn default() -> Self {
        Self {
            endpoint: "wss://stream.bybit.com/v5/public/linear".to_string(),
            ping_interval: Duration::from_secs(20),
        }
    }
}

impl FeedProtocol for BybitProtocol {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn subscribe_request(&self, symbol: &str) -> String {
        json!({ "op": "subscribe", "args": [format!("tickers.{symbol}")] }).to_string()
    }

    fn client_ping(&self) -> Option<(Duration, String)> {
        Some((self.ping_interval, json!({ "op": "ping" }).to_string()))
    }

    fn classify(&self, text: &str) -> Result<WireMessage, FeedParseError> {
        let root: Value = serde_json::from_str(text)?;

        if root["op"] == "pong" || root["ret_msg"] == "pong" {
            return Ok(WireMessage::Heartbeat(None));
        }
        if root.get("success").is_some() {
            return Ok(WireMessage::Ignored("command ack"));
        }

        let data = &root["data"];
        let Some(raw_price) = data.get("lastPrice") else {
            return Ok(WireMessage::Ignored("ticker without lastPrice"));
        };
        let symbol = data["symbol"]
            .as_str()
            .or_else(|| root["topic"].as_str().and_then(|t| t.strip_prefix("tickers.")));
        let Some(symbol) = symbol else {
            return Ok(WireMessage::Ignored("ticker without symbol"));
        };

        Ok(WireMessage::Price {
            symbol: normalize_symbol(symbol),
            price: price_from(raw_price)?,
        })
    }
}

// ---------------------------------------------------------------------------
// BingX
// ---------------------------------------------------------------------------

/// Headers BingX's edge expects from a browser client.
const BINGX_HANDSHAKE_HEADERS: [(&str, &str); 3] = [
    (
        "User-Agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    ),
    ("Origin", "https://bingx.com"),
    ("Accept-Language", "en-US,en;q=0.9"),
];

pub struct BingxProtocol {
    endpoint: String,
}

impl Default for BingxProtocol {
    fn default() -> Self {
        Self {
            endpoint: "wss://open-api-ws.bingx.com/market".to_string(),
        }
    }
}

impl BingxProtocol {
    /// `BTCUSDT` -> `BTC-USDT`.
    pub fn wire_symbol(symbol: &str) -> String {
        match symbol.strip_suffix("USDT") {
            Some(base) if !symbol.contains('-') && !base.is_empty() => format!("{base}-USDT"),
            _ => symbol.to_string(),
        }
    }
}

impl FeedProtocol for BingxProtocol {
    fn exchange(&self) -> Exchange {
        Exchange::Bingx
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn handshake_headers(&self) -> &[(&'static str, &'static str)] {
        &BINGX_HANDSHAKE_HEADERS
    }

    fn subscribe_request(&self, symbol: &str) -> String {
        json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "reqType": "sub",
            "dataType": format!("{}@ticker", Self::wire_symbol(symbol)),
        })
        .to_string()
    }

    fn classify(&self, text: &str) -> Result<WireMessage, FeedParseError> {
        if text.trim() == "Ping" {
            return Ok(WireMessage::Heartbeat(Some("Pong".to_string())));
        }

        let root: Value = serde_json::from_str(text)?;
        if let Some(ping) = root.get("ping").filter(|p| !p.is_null()) {
            return Ok(WireMessage::Heartbeat(Some(json!({ "pong": ping }).to_string())));
        }

        let stream_symbol = root["dataType"]
            .as_str()
            .and_then(|dt| dt.split('@').next())
            .filter(|s| !s.is_empty());

        // Ticker object, flat price update, or a batch of either.
        let (item, raw_price) = match &root["data"] {
            Value::Object(_) if root["data"].get("c").is_some() => (&root["data"], &root["data"]["c"]),
            Value::Array(items) => {
                let found = items.iter().find_map(|item| {
                    item.get("c").or_else(|| item.get("price")).map(|p| (item, p))
                });
                match found {
                    Some(pair) => pair,
                    None => return Ok(WireMessage::Ignored("batch without price")),
                }
            }
            _ if root.get("price").is_some() => (&root, &root["price"]),
            _ => return Ok(WireMessage::Ignored("frame without price")),
        };

        let symbol = item["s"]
            .as_str()
            .or_else(|| item["symbol"].as_str())
            .or(stream_symbol);
        let Some(symbol) = symbol else {
            return Ok(WireMessage::Ignored("price without symbol"));
        };

        Ok(WireMessage::Price {
            symbol: normalize_symbol(symbol),
            price: price_from(raw_price)?,
        })
    }
}
