// ===============================
// src/gateway.rs
// ===============================
//
// Order Gateway: trading intents -> exchange calls.
// - OrderGateway : the seam used by the lifecycle manager (live, paper, safety decorator)
// - LiveGateway  : Binance Spot REST, symbol filters enforced before submission
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use reqwest::Method;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::binance::{OcoResponse, OrderResponse};
use crate::client::{weights, ExchangeClient};
use crate::domain::{BracketIntent, FilterViolation, OrderIntent, OrderKind, OrderResult, Protection, SymbolFilters};
use crate::error::{codes, ExchangeError};
use crate::metrics::ORDERS;

#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Environment / venue name for logs and audit records.
    fn venue(&self) -> &str;

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn free_balance(&self, asset: &str) -> Result<f64, ExchangeError>;

    async fn submit(&self, intent: &OrderIntent) -> Result<OrderResult, ExchangeError>;

    /// One atomic take-profit / stop-loss list. `Unsupported` when the pair has no OCO.
    async fn submit_bracket(&self, intent: &BracketIntent) -> Result<Protection, ExchangeError>;

    async fn order_status(&self, symbol: &str, order_id: u64) -> Result<OrderResult, ExchangeError>;

    async fn cancel(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError>;

    /// Realized P&L feedback (used by the daily loss ceiling).
    fn record_realized_pnl(&self, _pnl: f64) {}

    fn is_healthy(&self) -> bool { true }
}

pub fn kind_label(kind: &OrderKind) -> &'static str {
    match kind {
        OrderKind::MarketQuote { .. } | OrderKind::Market { .. } => "market",
        OrderKind::Limit { .. } => "limit",
        OrderKind::StopLimit { .. } => "stop_limit",
    }
}

fn check_qty(f: &SymbolFilters, qty: f64) -> Result<(), FilterViolation> {
    if !qty.is_finite() || qty <= 0.0 || qty < f.min_qty {
        return Err(FilterViolation::QtyBelowMin { qty, min: f.min_qty });
    }
    if qty > f.max_qty {
        return Err(FilterViolation::QtyAboveMax { qty, max: f.max_qty });
    }
    Ok(())
}

/// REST parameters for `POST /api/v3/order`, rounded to step/tick and checked
/// against LOT_SIZE and NOTIONAL.
pub fn order_params(f: &SymbolFilters, intent: &OrderIntent) -> Result<Vec<(&'static str, String)>, FilterViolation> {
    let mut p: Vec<(&'static str, String)> = vec![
        ("symbol", intent.symbol.clone()),
        ("side", intent.side.as_str().to_string()),
    ];
    match &intent.kind {
        OrderKind::MarketQuote { quote_amount } => {
            if !quote_amount.is_finite() || *quote_amount < f.min_notional || *quote_amount <= 0.0 {
                return Err(FilterViolation::NotionalBelowMin { notional: *quote_amount, min: f.min_notional });
            }
            p.push(("type", "MARKET".into()));
            p.push(("quoteOrderQty", format!("{:.8}", quote_amount).trim_end_matches('0').trim_end_matches('.').to_string()));
        }
        OrderKind::Market { quantity } => {
            let qty = f.floor_qty(*quantity);
            check_qty(f, qty)?;
            p.push(("type", "MARKET".into()));
            p.push(("quantity", f.fmt_qty(qty)));
        }
        OrderKind::Limit { quantity, price } => {
            let (qty, px) = (f.floor_qty(*quantity), f.floor_price(*price));
            f.validate(qty, px)?;
            p.push(("type", "LIMIT".into()));
            p.push(("timeInForce", "GTC".into()));
            p.push(("quantity", f.fmt_qty(qty)));
            p.push(("price", f.fmt_price(px)));
        }
        OrderKind::StopLimit { quantity, stop_price, limit_price } => {
            let (qty, stop, limit) = (f.floor_qty(*quantity), f.floor_price(*stop_price), f.floor_price(*limit_price));
            f.validate(qty, limit)?;
            p.push(("type", "STOP_LOSS_LIMIT".into()));
            p.push(("timeInForce", "GTC".into()));
            p.push(("quantity", f.fmt_qty(qty)));
            p.push(("stopPrice", f.fmt_price(stop)));
            p.push(("price", f.fmt_price(limit)));
        }
    }
    p.push(("newClientOrderId", intent.client_order_id.clone()));
    p.push(("newOrderRespType", "RESULT".into()));
    Ok(p)
}

/// REST parameters for `POST /api/v3/order/oco` (long exit: SELL side).
pub fn bracket_params(f: &SymbolFilters, b: &BracketIntent) -> Result<Vec<(&'static str, String)>, FilterViolation> {
    let qty = f.floor_qty(b.quantity);
    let (tp, stop, limit) = (f.floor_price(b.take_profit), f.floor_price(b.stop_price), f.floor_price(b.stop_limit_price));
    f.validate(qty, limit)?;
    Ok(vec![
        ("symbol", b.symbol.clone()),
        ("side", "SELL".into()),
        ("quantity", f.fmt_qty(qty)),
        ("price", f.fmt_price(tp)),
        ("stopPrice", f.fmt_price(stop)),
        ("stopLimitPrice", f.fmt_price(limit)),
        ("stopLimitTimeInForce", "GTC".into()),
        ("listClientOrderId", b.client_order_id.clone()),
    ])
}

/// Pick the two legs out of an OCO placement response.
pub fn protection_from_oco(rsp: &OcoResponse) -> Result<Protection, ExchangeError> {
    let leg = |ty: &str| rsp.order_reports.iter().find(|r| r.order_type == ty).map(|r| r.order_id);
    match (leg("LIMIT_MAKER"), leg("STOP_LOSS_LIMIT")) {
        (Some(take_profit_id), Some(stop_loss_id)) => {
            Ok(Protection::Bracket { list_id: rsp.order_list_id, take_profit_id, stop_loss_id })
        }
        _ => Err(ExchangeError::Decode(format!("OCO list {} missing a leg", rsp.order_list_id))),
    }
}

struct CachedFilters {
    fetched: Instant,
    filters: SymbolFilters,
    oco_allowed: bool,
}

/// Binance Spot gateway on top of the shared ExchangeClient.
pub struct LiveGateway {
    client: Arc<ExchangeClient>,
    filter_ttl: Duration,
    cache: Mutex<HashMap<String, CachedFilters>>,
}

impl LiveGateway {
    pub fn new(client: Arc<ExchangeClient>, filter_ttl: Duration) -> Self {
        Self { client, filter_ttl, cache: Mutex::new(HashMap::new()) }
    }

    pub fn client(&self) -> &Arc<ExchangeClient> { &self.client }

    fn cached(&self, symbol: &str) -> Option<(SymbolFilters, bool)> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(symbol)
            .filter(|c| c.fetched.elapsed() < self.filter_ttl)
            .map(|c| (c.filters.clone(), c.oco_allowed))
    }

    async fn rules(&self, symbol: &str) -> Result<(SymbolFilters, bool), ExchangeError> {
        if let Some(hit) = self.cached(symbol) {
            return Ok(hit);
        }
        let info = self.client.symbol_info(symbol).await?;
        let Some(s) = info.symbols.into_iter().find(|s| s.symbol == symbol) else {
            return Err(ExchangeError::Rejected { status: 400, code: -1121, msg: format!("unknown symbol {symbol}") });
        };
        let filters = s.filters();
        debug!(%symbol, ?filters, oco = s.oco_allowed, "symbol filters refreshed");
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                symbol.to_string(),
                CachedFilters { fetched: Instant::now(), filters: filters.clone(), oco_allowed: s.oco_allowed },
            );
        }
        Ok((filters, s.oco_allowed))
    }

    /// POST the order. A transient failure or a duplicate rejection can hide an order that
    /// did reach the book, so it is looked up by client order id before failure is reported.
    async fn post_order(&self, intent: &OrderIntent, params: &[(&str, String)]) -> Result<OrderResult, ExchangeError> {
        let err = match self.client.signed_request(Method::POST, "/api/v3/order", params, weights::ORDER).await {
            Ok(v) => return decode_order(v),
            Err(e) => e,
        };
        if !(err.is_retryable() || is_duplicate(&err)) {
            return Err(err);
        }
        let query = [("symbol", intent.symbol.clone()), ("origClientOrderId", intent.client_order_id.clone())];
        match self
            .client
            .signed_request(Method::GET, "/api/v3/order", &query, weights::ORDER_QUERY)
            .await
            .and_then(decode_order)
        {
            Ok(found) => {
                warn!(symbol = %intent.symbol, cl_id = %intent.client_order_id, order_id = found.order_id, error = %err,
                      "order placement reported failure but the order exists");
                Ok(found)
            }
            Err(lookup) => {
                debug!(symbol = %intent.symbol, cl_id = %intent.client_order_id, error = %lookup, "no order under client id");
                Err(err)
            }
        }
    }
}

fn decode_order(v: serde_json::Value) -> Result<OrderResult, ExchangeError> {
    let rsp: OrderResponse = serde_json::from_value(v).map_err(|e| ExchangeError::Decode(e.to_string()))?;
    Ok(rsp.into())
}

fn is_duplicate(e: &ExchangeError) -> bool {
    matches!(e, ExchangeError::Rejected { code: codes::NEW_ORDER_REJECTED, msg, .. } if msg.contains("Duplicate order"))
}

#[async_trait]
impl OrderGateway for LiveGateway {
    fn venue(&self) -> &str { self.client.profile() }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        self.rules(symbol).await.map(|(f, _)| f)
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.client.ticker_price(symbol).await
    }

    async fn free_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let acct = self.client.account().await?;
        Ok(acct.balances.iter().find(|b| b.asset == asset).map(|b| b.free).unwrap_or(0.0))
    }

    async fn submit(&self, intent: &OrderIntent) -> Result<OrderResult, ExchangeError> {
        let kind = kind_label(&intent.kind);
        let (filters, _) = self.rules(&intent.symbol).await?;
        let params = order_params(&filters, intent).map_err(|v| {
            ORDERS.with_label_values(&[kind, "filter"]).inc();
            warn!(symbol = %intent.symbol, violation = %v, "order violates symbol filters");
            ExchangeError::Filter(v)
        })?;
        match self.post_order(intent, &params).await {
            Ok(res) => {
                ORDERS.with_label_values(&[kind, "ok"]).inc();
                info!(venue = %self.venue(), symbol = %res.symbol, order_id = res.order_id, cl_id = %res.client_order_id,
                      status = ?res.status, qty = res.executed_qty, avg_px = res.avg_price, "order placed");
                Ok(res)
            }
            Err(e) => {
                ORDERS.with_label_values(&[kind, e.label()]).inc();
                warn!(venue = %self.venue(), symbol = %intent.symbol, cl_id = %intent.client_order_id, error = %e, "order failed");
                Err(e)
            }
        }
    }

    async fn submit_bracket(&self, intent: &BracketIntent) -> Result<Protection, ExchangeError> {
        let (filters, oco_allowed) = self.rules(&intent.symbol).await?;
        if !oco_allowed {
            ORDERS.with_label_values(&["bracket", "unsupported"]).inc();
            return Err(ExchangeError::Unsupported(format!("OCO not allowed on {}", intent.symbol)));
        }
        let params = bracket_params(&filters, intent)?;
        let res = self
            .client
            .signed_request(Method::POST, "/api/v3/order/oco", &params, weights::OCO)
            .await
            .and_then(|v| serde_json::from_value::<OcoResponse>(v).map_err(|e| ExchangeError::Decode(e.to_string())))
            .and_then(|rsp| protection_from_oco(&rsp));
        let outcome = match &res {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        ORDERS.with_label_values(&["bracket", outcome]).inc();
        res
    }

    async fn order_status(&self, symbol: &str, order_id: u64) -> Result<OrderResult, ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        let v = self.client.signed_request(Method::GET, "/api/v3/order", &params, weights::ORDER_QUERY).await?;
        decode_order(v)
    }

    async fn cancel(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        self.client
            .signed_request(Method::DELETE, "/api/v3/order", &params, weights::ORDER_CANCEL)
            .await
            .map(|_| ())
    }

    fn is_healthy(&self) -> bool { self.client.is_healthy() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::domain::{OrderStatus, Side};
    use crate::testkit::serve;

    const INFO: &str = r#"{"symbols":[{"symbol":"NEWUSDT","status":"TRADING","baseAsset":"NEW","quoteAsset":"USDT","ocoAllowed":true,"filters":[]}]}"#;

    fn live(url: &str) -> LiveGateway {
        let mut cfg = ClientConfig::public(url);
        cfg.api_key = "k".repeat(64);
        cfg.api_secret = "s".repeat(64);
        cfg.retry_base = Duration::from_millis(5);
        cfg.retry_max = Duration::from_millis(20);
        LiveGateway::new(Arc::new(ExchangeClient::new("testnet", cfg).unwrap()), Duration::from_secs(60))
    }

    fn filters() -> SymbolFilters {
        SymbolFilters {
            symbol: "NEWUSDT".into(),
            min_qty: 0.1,
            max_qty: 1000.0,
            step_size: 0.1,
            min_notional: 5.0,
            tick_size: 0.001,
        }
    }

    fn get<'a>(p: &'a [(&'static str, String)], k: &str) -> Option<&'a str> {
        p.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str())
    }

    #[test]
    fn market_buy_uses_quote_amount_and_client_id() {
        let i = OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 20.0 });
        let p = order_params(&filters(), &i).unwrap();
        assert_eq!(get(&p, "type"), Some("MARKET"));
        assert_eq!(get(&p, "quoteOrderQty"), Some("20"));
        assert_eq!(get(&p, "newClientOrderId"), Some(i.client_order_id.as_str()));
        let small = OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 1.0 });
        assert!(matches!(order_params(&filters(), &small), Err(FilterViolation::NotionalBelowMin { .. })));
    }

    #[test]
    fn quantities_and_prices_round_down_to_step_and_tick() {
        let i = OrderIntent::new(
            "NEWUSDT",
            Side::Sell,
            OrderKind::StopLimit { quantity: 12.37, stop_price: 0.95049, limit_price: 0.94578 },
        );
        let p = order_params(&filters(), &i).unwrap();
        assert_eq!(get(&p, "type"), Some("STOP_LOSS_LIMIT"));
        assert_eq!(get(&p, "quantity"), Some("12.3"));
        assert_eq!(get(&p, "stopPrice"), Some("0.950"));
        assert_eq!(get(&p, "price"), Some("0.945"));
    }

    #[test]
    fn lot_size_violations_are_refused() {
        let i = OrderIntent::new("NEWUSDT", Side::Sell, OrderKind::Market { quantity: 0.05 });
        assert!(matches!(order_params(&filters(), &i), Err(FilterViolation::QtyBelowMin { .. })));
        let i = OrderIntent::new("NEWUSDT", Side::Sell, OrderKind::Limit { quantity: 2.0, price: 1.0 });
        assert!(matches!(order_params(&filters(), &i), Err(FilterViolation::NotionalBelowMin { .. })));
    }

    #[test]
    fn oco_response_maps_both_legs() {
        let rsp: OcoResponse = serde_json::from_str(
            r#"{"orderListId":7,"orderReports":[
                {"symbol":"NEWUSDT","orderId":11,"status":"NEW","type":"STOP_LOSS_LIMIT"},
                {"symbol":"NEWUSDT","orderId":12,"status":"NEW","type":"LIMIT_MAKER"}]}"#,
        )
        .unwrap();
        assert_eq!(
            protection_from_oco(&rsp).unwrap(),
            Protection::Bracket { list_id: 7, take_profit_id: 12, stop_loss_id: 11 }
        );
        let half: OcoResponse = serde_json::from_str(
            r#"{"orderListId":8,"orderReports":[{"symbol":"NEWUSDT","orderId":1,"type":"LIMIT_MAKER"}]}"#,
        )
        .unwrap();
        assert!(protection_from_oco(&half).is_err());
    }

    #[test]
    fn bracket_params_are_sell_side_gtc() {
        let b = BracketIntent {
            client_order_id: "lb-1".into(),
            symbol: "NEWUSDT".into(),
            quantity: 10.0,
            take_profit: 1.1,
            stop_price: 0.95,
            stop_limit_price: 0.94525,
        };
        let p = bracket_params(&filters(), &b).unwrap();
        assert_eq!(get(&p, "side"), Some("SELL"));
        assert_eq!(get(&p, "price"), Some("1.100"));
        assert_eq!(get(&p, "stopLimitPrice"), Some("0.945"));
        assert_eq!(get(&p, "listClientOrderId"), Some("lb-1"));
    }

    #[tokio::test]
    async fn retried_order_that_already_executed_is_recovered() {
        let (url, fx) = serve(vec![
            (200, vec![], INFO),
            (503, vec![], "busy"),
            (400, vec![], r#"{"code":-2010,"msg":"Duplicate order sent."}"#),
            (200, vec![], r#"{"symbol":"NEWUSDT","orderId":42,"clientOrderId":"x","status":"FILLED","price":"0","executedQty":"10","cummulativeQuoteQty":"20","type":"MARKET"}"#),
        ])
        .await;
        let g = live(&url);
        let buy = OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 20.0 });
        let res = g.submit(&buy).await.unwrap();
        assert_eq!(res.order_id, 42);
        assert_eq!(res.status, OrderStatus::Filled);
        assert!((res.avg_price - 2.0).abs() < 1e-9);

        let seen = fx.seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen[3].0.contains(&format!("origClientOrderId={}", buy.client_order_id)));
    }

    #[tokio::test]
    async fn plain_rejection_is_not_looked_up() {
        let (url, fx) = serve(vec![
            (200, vec![], INFO),
            (400, vec![], r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#),
        ])
        .await;
        let g = live(&url);
        let buy = OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 20.0 });
        let err = g.submit(&buy).await.unwrap_err();
        assert_eq!(err.code(), Some(codes::NEW_ORDER_REJECTED));
        assert_eq!(fx.seen.lock().unwrap().len(), 2);
    }
}
