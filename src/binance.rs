// ===============================
// src/binance.rs
// ===============================
//
// Binance Spot wire helpers:
// - signer (HMAC-SHA256 over the canonical query string)
// - REST / WS payload models (numbers arrive as strings)
//
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::domain::SymbolFilters;

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn sign_query(secret: &str, query: &str) -> String {
    // HMAC accepts keys of any length, the error branch is unreachable in practice
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(query.as_bytes());
    let sig = mac.finalize().into_bytes();
    hex::encode(sig)
}

/// Canonical query string: parameters in insertion order, values url-encoded.
/// The signature is computed over exactly this string.
pub fn build_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn str_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num {
        S(String),
        F(f64),
    }
    Ok(match Num::deserialize(d)? {
        Num::S(s) => s.parse::<f64>().unwrap_or(0.0),
        Num::F(f) => f,
    })
}

// ---- REST models ----

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default = "yes")]
    pub is_spot_trading_allowed: bool,
    #[serde(default)]
    pub oco_allowed: bool,
    #[serde(default)]
    pub filters: Vec<serde_json::Value>,
}

fn yes() -> bool {
    true
}

impl SymbolInfo {
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING" && self.is_spot_trading_allowed
    }

    /// Extract LOT_SIZE / PRICE_FILTER / (MIN_)NOTIONAL into [`SymbolFilters`].
    pub fn filters(&self) -> SymbolFilters {
        let mut f = SymbolFilters::unrestricted(&self.symbol);
        let num = |v: &serde_json::Value, key: &str| -> Option<f64> {
            v.get(key).and_then(|x| x.as_str()).and_then(|s| s.parse::<f64>().ok())
        };
        for filter in &self.filters {
            match filter.get("filterType").and_then(|x| x.as_str()) {
                Some("LOT_SIZE") => {
                    f.min_qty = num(filter, "minQty").unwrap_or(f.min_qty);
                    f.max_qty = num(filter, "maxQty").unwrap_or(f.max_qty);
                    f.step_size = num(filter, "stepSize").unwrap_or(f.step_size);
                }
                Some("PRICE_FILTER") => {
                    f.tick_size = num(filter, "tickSize").unwrap_or(f.tick_size);
                }
                Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                    f.min_notional = num(filter, "minNotional").unwrap_or(f.min_notional);
                }
                _ => {}
            }
        }
        f
    }
}

/// `GET /api/v3/ticker/24hr` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24h {
    pub symbol: String,
    #[serde(deserialize_with = "str_f64")]
    pub last_price: f64,
    #[serde(deserialize_with = "str_f64")]
    pub volume: f64,
    #[serde(deserialize_with = "str_f64")]
    pub quote_volume: f64,
    #[serde(deserialize_with = "str_f64")]
    pub price_change_percent: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceTicker {
    pub symbol: String,
    #[serde(deserialize_with = "str_f64")]
    pub price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub balances: Vec<Balance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Balance {
    pub asset: String,
    #[serde(deserialize_with = "str_f64")]
    pub free: f64,
    #[serde(deserialize_with = "str_f64")]
    pub locked: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub symbol: String,
    pub order_id: u64,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "str_f64")]
    pub price: f64,
    #[serde(default, deserialize_with = "str_f64")]
    pub executed_qty: f64,
    #[serde(default, deserialize_with = "str_f64", rename = "cummulativeQuoteQty")]
    pub cumulative_quote_qty: f64,
    #[serde(default, rename = "type")]
    pub order_type: String,
}

impl OrderResponse {
    /// Average fill price, falling back to the order price for unfilled orders.
    pub fn avg_price(&self) -> f64 {
        if self.executed_qty > 0.0 && self.cumulative_quote_qty > 0.0 {
            self.cumulative_quote_qty / self.executed_qty
        } else {
            self.price
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcoResponse {
    pub order_list_id: u64,
    #[serde(default)]
    pub order_reports: Vec<OrderResponse>,
}

// ---- WS models ----

/// `!ticker@arr` element (24h rolling window ticker).
#[derive(Debug, Clone, Deserialize)]
pub struct WsTicker {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c", deserialize_with = "str_f64")]
    pub last_price: f64,
    #[serde(rename = "v", deserialize_with = "str_f64")]
    pub volume: f64,
    #[serde(rename = "q", deserialize_with = "str_f64")]
    pub quote_volume: f64,
    #[serde(rename = "P", deserialize_with = "str_f64")]
    pub price_change_percent: f64,
}

impl From<WsTicker> for Ticker24h {
    fn from(t: WsTicker) -> Self {
        Ticker24h {
            symbol: t.symbol,
            last_price: t.last_price,
            volume: t.volume,
            quote_volume: t.quote_volume,
            price_change_percent: t.price_change_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_binance_documentation_vector() {
        // example from the Binance Spot API docs (SIGNED endpoint examples)
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn query_keeps_order_and_encodes_values() {
        let q = build_query(&[("symbol", "BTCUSDT".into()), ("newClientOrderId", "a b/c".into())]);
        assert_eq!(q, "symbol=BTCUSDT&newClientOrderId=a%20b%2Fc");
    }

    #[test]
    fn parses_symbol_filters_from_exchange_info() {
        let raw = r#"{"symbols":[{"symbol":"NEWUSDT","status":"TRADING","baseAsset":"NEW","quoteAsset":"USDT",
            "isSpotTradingAllowed":true,"ocoAllowed":true,"filters":[
            {"filterType":"PRICE_FILTER","minPrice":"0.0001","maxPrice":"1000","tickSize":"0.0001"},
            {"filterType":"LOT_SIZE","minQty":"0.1","maxQty":"90000","stepSize":"0.1"},
            {"filterType":"NOTIONAL","minNotional":"5.0","applyMinToMarket":true}]}]}"#;
        let info: ExchangeInfo = serde_json::from_str(raw).unwrap();
        let s = &info.symbols[0];
        assert!(s.is_trading());
        let f = s.filters();
        assert_eq!(f.step_size, 0.1);
        assert_eq!(f.tick_size, 0.0001);
        assert_eq!(f.min_notional, 5.0);
        assert_eq!(f.max_qty, 90000.0);
    }

    #[test]
    fn order_response_average_price() {
        let raw = r#"{"symbol":"NEWUSDT","orderId":7,"clientOrderId":"x","status":"FILLED","price":"0.00000000",
            "executedQty":"4.0","cummulativeQuoteQty":"10.0","type":"MARKET"}"#;
        let o: OrderResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(o.avg_price(), 2.5);
    }
}
