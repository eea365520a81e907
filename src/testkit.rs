// ===============================
// src/testkit.rs (test doubles)
// ===============================
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crate::domain::{BracketIntent, OrderIntent, OrderResult, Protection, SymbolFilters};
use crate::error::ExchangeError;
use crate::gateway::{kind_label, OrderGateway};
use crate::paper::{MarketData, PaperGateway};

/// Prices set by the test; filters unrestricted.
pub struct StaticMarket {
    prices: Mutex<HashMap<String, f64>>,
    healthy: AtomicBool,
}

impl StaticMarket {
    pub fn with_price(symbol: &str, price: f64) -> Arc<Self> {
        let m = Arc::new(Self { prices: Mutex::new(HashMap::new()), healthy: AtomicBool::new(true) });
        m.set_price(symbol, price);
        m
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl MarketData for StaticMarket {
    async fn price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.prices.lock().unwrap().get(symbol).copied().ok_or_else(|| ExchangeError::Rejected {
            status: 400,
            code: -1121,
            msg: format!("Invalid symbol {symbol}"),
        })
    }

    async fn filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        Ok(SymbolFilters::unrestricted(symbol))
    }

    fn is_healthy(&self) -> bool { self.healthy.load(Ordering::SeqCst) }
}

/// Paper book with scripted failures and call counters.
///
/// Operation labels: `market`, `limit`, `stop_limit`, `bracket`, `status`, `cancel`, `price`.
pub struct ScriptedGateway {
    paper: PaperGateway,
    market: Arc<StaticMarket>,
    failures: Mutex<HashMap<&'static str, VecDeque<ExchangeError>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    oco: AtomicBool,
    pnl: Mutex<Vec<f64>>,
}

impl ScriptedGateway {
    pub fn new(price: f64) -> Arc<Self> {
        let market = StaticMarket::with_price("NEWUSDT", price);
        Arc::new(Self {
            paper: PaperGateway::new("testnet", "USDT", 1000.0, market.clone()),
            market,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            oco: AtomicBool::new(true),
            pnl: Mutex::new(vec![]),
        })
    }

    pub fn set_price(&self, symbol: &str, price: f64) { self.market.set_price(symbol, price) }

    pub fn disable_oco(&self) { self.oco.store(false, Ordering::SeqCst) }

    pub fn fail_next(&self, op: &'static str, err: ExchangeError) {
        self.failures.lock().unwrap().entry(op).or_default().push_back(err);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    pub fn realized(&self) -> Vec<f64> { self.pnl.lock().unwrap().clone() }

    fn hit(&self, op: &'static str) -> Result<(), ExchangeError> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        match self.failures.lock().unwrap().get_mut(op).and_then(|q| q.pop_front()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub fn rejected(code: i64) -> ExchangeError {
    ExchangeError::Rejected { status: 400, code, msg: "scripted".into() }
}

#[async_trait]
impl OrderGateway for ScriptedGateway {
    fn venue(&self) -> &str { "testnet" }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        self.paper.symbol_filters(symbol).await
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.hit("price")?;
        self.paper.last_price(symbol).await
    }

    async fn free_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        self.paper.free_balance(asset).await
    }

    async fn submit(&self, intent: &OrderIntent) -> Result<OrderResult, ExchangeError> {
        self.hit(kind_label(&intent.kind))?;
        self.paper.submit(intent).await
    }

    async fn submit_bracket(&self, intent: &BracketIntent) -> Result<Protection, ExchangeError> {
        self.hit("bracket")?;
        if !self.oco.load(Ordering::SeqCst) {
            return Err(ExchangeError::Unsupported("OCO disabled".into()));
        }
        self.paper.submit_bracket(intent).await
    }

    async fn order_status(&self, symbol: &str, order_id: u64) -> Result<OrderResult, ExchangeError> {
        self.hit("status")?;
        self.paper.order_status(symbol, order_id).await
    }

    async fn cancel(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError> {
        self.hit("cancel")?;
        self.paper.cancel(symbol, order_id).await
    }

    fn record_realized_pnl(&self, pnl: f64) {
        self.pnl.lock().unwrap().push(pnl);
    }

    fn is_healthy(&self) -> bool { self.paper.is_healthy() }
}

type Reply = (u16, Vec<(&'static str, &'static str)>, &'static str);

/// Local HTTP server answering requests from a script, in order.
#[derive(Default)]
pub struct Fixture {
    pub script: Mutex<VecDeque<Reply>>,
    /// (path and query, X-MBX-APIKEY) per request.
    pub seen: Mutex<Vec<(String, Option<String>)>>,
}

pub async fn serve(script: Vec<Reply>) -> (String, Arc<Fixture>) {
    let fx = Arc::new(Fixture { script: Mutex::new(script.into()), seen: Mutex::new(vec![]) });
    let state = fx.clone();
    let make = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let state = state.clone();
                async move {
                    let key = req.headers().get("X-MBX-APIKEY").and_then(|v| v.to_str().ok()).map(String::from);
                    let pq = req.uri().path_and_query().map(|p| p.to_string()).unwrap_or_default();
                    state.seen.lock().unwrap().push((pq, key));
                    let (status, headers, body) = state.script.lock().unwrap().pop_front().unwrap_or((200, vec![], "{}"));
                    let mut rsp = Response::builder().status(status);
                    for (k, v) in headers {
                        rsp = rsp.header(k, v);
                    }
                    Ok::<_, Infallible>(rsp.body(Body::from(body)).unwrap())
                }
            }))
        }
    });
    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make);
    let addr = server.local_addr();
    tokio::spawn(server);
    (format!("http://{addr}"), fx)
}
