// ===============================
// src/paper.rs (simulation mode)
// ===============================
//
// In-process fills against live public prices. No signed order calls are made.
// Resting limit / stop-limit sells trigger when the last price crosses them; the
// check runs whenever the order is queried, which the reconciliation loop does.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::domain::{
    BracketIntent, OrderIntent, OrderKind, OrderResult, OrderStatus, Protection, Side, SymbolFilters,
};
use crate::error::{codes, ExchangeError};
use crate::gateway::{bracket_params, kind_label, order_params, LiveGateway, OrderGateway};
use crate::metrics::ORDERS;

/// Public price and rules source for the simulated book.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn price(&self, symbol: &str) -> Result<f64, ExchangeError>;
    async fn filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;

    fn is_healthy(&self) -> bool { true }
}

#[async_trait]
impl MarketData for LiveGateway {
    async fn price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.last_price(symbol).await
    }

    async fn filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        self.symbol_filters(symbol).await
    }

    fn is_healthy(&self) -> bool { OrderGateway::is_healthy(self) }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    result: OrderResult,
    side: Side,
    quantity: f64,
    limit: f64,
    stop: Option<f64>,
    sibling: Option<u64>,
}

#[derive(Default)]
struct Book {
    balances: HashMap<String, f64>,
    orders: HashMap<u64, PaperOrder>,
    next_id: u64,
}

impl Book {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn credit(&mut self, asset: &str, amount: f64) {
        *self.balances.entry(asset.to_string()).or_insert(0.0) += amount;
    }

    fn debit(&mut self, asset: &str, amount: f64) -> Result<(), ExchangeError> {
        let free = self.balances.get(asset).copied().unwrap_or(0.0);
        if free + 1e-9 < amount {
            return Err(insufficient(asset, free, amount));
        }
        self.balances.insert(asset.to_string(), (free - amount).max(0.0));
        Ok(())
    }
}

fn insufficient(asset: &str, free: f64, need: f64) -> ExchangeError {
    ExchangeError::Rejected {
        status: 400,
        code: codes::NEW_ORDER_REJECTED,
        msg: format!("Account has insufficient balance for requested action ({asset}: {free} < {need})"),
    }
}

fn unknown_order() -> ExchangeError {
    ExchangeError::Rejected { status: 400, code: codes::UNKNOWN_ORDER, msg: "Unknown order sent.".into() }
}

pub struct PaperGateway {
    venue: String,
    quote_asset: String,
    market: Arc<dyn MarketData>,
    book: Mutex<Book>,
}

impl PaperGateway {
    pub fn new(venue: &str, quote_asset: &str, starting_balance: f64, market: Arc<dyn MarketData>) -> Self {
        let mut book = Book::default();
        book.credit(quote_asset, starting_balance);
        Self { venue: format!("{venue}-paper"), quote_asset: quote_asset.to_string(), market, book: Mutex::new(book) }
    }

    fn book(&self) -> std::sync::MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn base_asset<'a>(&self, symbol: &'a str) -> &'a str {
        symbol.strip_suffix(self.quote_asset.as_str()).unwrap_or(symbol)
    }

    /// Immediate fill at `price`; balances move both ways.
    fn fill_now(&self, intent: &OrderIntent, qty: f64, price: f64) -> Result<OrderResult, ExchangeError> {
        let base = self.base_asset(&intent.symbol).to_string();
        let mut book = self.book();
        let notional = qty * price;
        match intent.side {
            Side::Buy => {
                book.debit(&self.quote_asset, notional)?;
                book.credit(&base, qty);
            }
            Side::Sell => {
                book.debit(&base, qty)?;
                book.credit(&self.quote_asset, notional);
            }
        }
        let order_id = book.id();
        Ok(OrderResult {
            order_id,
            client_order_id: intent.client_order_id.clone(),
            symbol: intent.symbol.clone(),
            status: OrderStatus::Filled,
            executed_qty: qty,
            avg_price: price,
        })
    }

    fn rest(book: &mut Book, intent_cl: &str, symbol: &str, side: Side, qty: f64, limit: f64, stop: Option<f64>) -> u64 {
        let order_id = book.id();
        let result = OrderResult {
            order_id,
            client_order_id: intent_cl.to_string(),
            symbol: symbol.to_string(),
            status: OrderStatus::New,
            executed_qty: 0.0,
            avg_price: 0.0,
        };
        book.orders.insert(order_id, PaperOrder { result, side, quantity: qty, limit, stop, sibling: None });
        order_id
    }

    /// Trigger a resting order against `price`; the bracket sibling expires on fill.
    fn evaluate(&self, order_id: u64, price: f64) -> Option<OrderResult> {
        let mut book = self.book();
        let o = book.orders.get(&order_id)?.clone();
        if !o.result.status.is_open() {
            return Some(o.result);
        }
        let triggered = match (o.side, o.stop) {
            (Side::Sell, None) => price >= o.limit,
            (Side::Sell, Some(stop)) => price <= stop,
            (Side::Buy, None) => price <= o.limit,
            (Side::Buy, Some(stop)) => price >= stop,
        };
        if !triggered {
            return Some(o.result);
        }
        let base = self.base_asset(&o.result.symbol).to_string();
        let notional = o.quantity * o.limit;
        match o.side {
            Side::Sell => {
                if book.debit(&base, o.quantity).is_err() {
                    // inventory already sold elsewhere
                    if let Some(slot) = book.orders.get_mut(&order_id) {
                        slot.result.status = OrderStatus::Expired;
                    }
                    return book.orders.get(&order_id).map(|s| s.result.clone());
                }
                book.credit(&self.quote_asset, notional);
            }
            Side::Buy => {
                if book.debit(&self.quote_asset, notional).is_err() {
                    return Some(o.result);
                }
                book.credit(&base, o.quantity);
            }
        }
        if let Some(sib) = o.sibling.and_then(|id| book.orders.get_mut(&id)) {
            if sib.result.status.is_open() {
                sib.result.status = OrderStatus::Expired;
            }
        }
        let slot = book.orders.get_mut(&order_id)?;
        slot.result.status = OrderStatus::Filled;
        slot.result.executed_qty = o.quantity;
        slot.result.avg_price = o.limit;
        info!(venue = %self.venue, symbol = %slot.result.symbol, order_id, px = o.limit, "paper order filled");
        Some(slot.result.clone())
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    fn venue(&self) -> &str { &self.venue }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        self.market.filters(symbol).await
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.market.price(symbol).await
    }

    async fn free_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        Ok(self.book().balances.get(asset).copied().unwrap_or(0.0))
    }

    async fn submit(&self, intent: &OrderIntent) -> Result<OrderResult, ExchangeError> {
        let kind = kind_label(&intent.kind);
        let filters = self.market.filters(&intent.symbol).await?;
        order_params(&filters, intent).map_err(ExchangeError::Filter)?;
        let res = match &intent.kind {
            OrderKind::MarketQuote { quote_amount } => {
                let px = self.market.price(&intent.symbol).await?;
                let qty = filters.floor_qty(quote_amount / px);
                self.fill_now(intent, qty, px)
            }
            OrderKind::Market { quantity } => {
                let px = self.market.price(&intent.symbol).await?;
                self.fill_now(intent, filters.floor_qty(*quantity), px)
            }
            OrderKind::Limit { quantity, price } => {
                let mut book = self.book();
                let id = Self::rest(&mut book, &intent.client_order_id, &intent.symbol, intent.side,
                    filters.floor_qty(*quantity), filters.floor_price(*price), None);
                book.orders.get(&id).map(|o| o.result.clone()).ok_or_else(unknown_order)
            }
            OrderKind::StopLimit { quantity, stop_price, limit_price } => {
                let mut book = self.book();
                let id = Self::rest(&mut book, &intent.client_order_id, &intent.symbol, intent.side,
                    filters.floor_qty(*quantity), filters.floor_price(*limit_price), Some(filters.floor_price(*stop_price)));
                book.orders.get(&id).map(|o| o.result.clone()).ok_or_else(unknown_order)
            }
        };
        let outcome = match &res {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        ORDERS.with_label_values(&[kind, outcome]).inc();
        res
    }

    async fn submit_bracket(&self, intent: &BracketIntent) -> Result<Protection, ExchangeError> {
        let filters = self.market.filters(&intent.symbol).await?;
        bracket_params(&filters, intent).map_err(ExchangeError::Filter)?;
        let qty = filters.floor_qty(intent.quantity);
        let mut book = self.book();
        let tp = Self::rest(&mut book, &intent.client_order_id, &intent.symbol, Side::Sell, qty,
            filters.floor_price(intent.take_profit), None);
        let sl = Self::rest(&mut book, &intent.client_order_id, &intent.symbol, Side::Sell, qty,
            filters.floor_price(intent.stop_limit_price), Some(filters.floor_price(intent.stop_price)));
        if let Some(o) = book.orders.get_mut(&tp) {
            o.sibling = Some(sl);
        }
        if let Some(o) = book.orders.get_mut(&sl) {
            o.sibling = Some(tp);
        }
        let list_id = book.id();
        ORDERS.with_label_values(&["bracket", "ok"]).inc();
        Ok(Protection::Bracket { list_id, take_profit_id: tp, stop_loss_id: sl })
    }

    async fn order_status(&self, symbol: &str, order_id: u64) -> Result<OrderResult, ExchangeError> {
        let open = {
            let book = self.book();
            match book.orders.get(&order_id) {
                Some(o) if o.result.symbol == symbol => o.result.status.is_open(),
                _ => return Err(ExchangeError::Rejected { status: 400, code: codes::NO_SUCH_ORDER, msg: "Order does not exist.".into() }),
            }
        };
        if open {
            let px = self.market.price(symbol).await?;
            return self.evaluate(order_id, px).ok_or_else(unknown_order);
        }
        self.book().orders.get(&order_id).map(|o| o.result.clone()).ok_or_else(unknown_order)
    }

    async fn cancel(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError> {
        let mut book = self.book();
        match book.orders.get_mut(&order_id) {
            Some(o) if o.result.symbol == symbol && o.result.status.is_open() => {
                o.result.status = OrderStatus::Canceled;
                Ok(())
            }
            _ => Err(unknown_order()),
        }
    }

    /// A banned or rejected-credential client behind the prices makes the book unusable too.
    fn is_healthy(&self) -> bool { self.market.is_healthy() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::StaticMarket;

    fn paper(market: Arc<StaticMarket>) -> PaperGateway {
        PaperGateway::new("testnet", "USDT", 1000.0, market)
    }

    #[tokio::test]
    async fn market_buy_fills_at_last_price() {
        let m = StaticMarket::with_price("NEWUSDT", 2.0);
        let g = paper(m.clone());
        let i = OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 20.0 });
        let r = g.submit(&i).await.unwrap();
        assert_eq!(r.status, OrderStatus::Filled);
        assert!((r.executed_qty - 10.0).abs() < 1e-9);
        assert_eq!(r.avg_price, 2.0);
        assert!((g.free_balance("USDT").await.unwrap() - 980.0).abs() < 1e-9);
        assert!((g.free_balance("NEW").await.unwrap() - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn bracket_take_profit_fill_expires_the_stop() {
        let m = StaticMarket::with_price("NEWUSDT", 2.0);
        let g = paper(m.clone());
        let buy = OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 20.0 });
        g.submit(&buy).await.unwrap();
        let b = BracketIntent {
            client_order_id: "lb-b".into(),
            symbol: "NEWUSDT".into(),
            quantity: 10.0,
            take_profit: 2.2,
            stop_price: 1.9,
            stop_limit_price: 1.89,
        };
        let Protection::Bracket { take_profit_id, stop_loss_id, .. } = g.submit_bracket(&b).await.unwrap() else {
            panic!("expected bracket");
        };
        assert!(g.order_status("NEWUSDT", take_profit_id).await.unwrap().status.is_open());

        m.set_price("NEWUSDT", 2.3);
        let tp = g.order_status("NEWUSDT", take_profit_id).await.unwrap();
        assert_eq!(tp.status, OrderStatus::Filled);
        assert_eq!(tp.avg_price, 2.2);
        let sl = g.order_status("NEWUSDT", stop_loss_id).await.unwrap();
        assert_eq!(sl.status, OrderStatus::Expired);
        assert!((g.free_balance("USDT").await.unwrap() - 1002.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_fills_at_its_limit_price() {
        let m = StaticMarket::with_price("NEWUSDT", 2.0);
        let g = paper(m.clone());
        g.submit(&OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 20.0 })).await.unwrap();
        let sl = g
            .submit(&OrderIntent::new(
                "NEWUSDT",
                Side::Sell,
                OrderKind::StopLimit { quantity: 10.0, stop_price: 1.9, limit_price: 1.89 },
            ))
            .await
            .unwrap();
        m.set_price("NEWUSDT", 1.85);
        let r = g.order_status("NEWUSDT", sl.order_id).await.unwrap();
        assert_eq!(r.status, OrderStatus::Filled);
        assert_eq!(r.avg_price, 1.89);
    }

    #[tokio::test]
    async fn cancelling_an_unknown_order_reports_unknown() {
        let g = paper(StaticMarket::with_price("NEWUSDT", 2.0));
        let err = g.cancel("NEWUSDT", 42).await.unwrap_err();
        assert!(err.is_unknown_order());
    }

    #[tokio::test]
    async fn buy_beyond_balance_is_rejected() {
        let g = PaperGateway::new("testnet", "USDT", 10.0, StaticMarket::with_price("NEWUSDT", 2.0));
        let i = OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 20.0 });
        let err = g.submit(&i).await.unwrap_err();
        assert_eq!(err.code(), Some(codes::NEW_ORDER_REJECTED));
    }

    #[tokio::test]
    async fn health_follows_the_price_source() {
        let m = StaticMarket::with_price("NEWUSDT", 2.0);
        let g = paper(m.clone());
        assert!(g.is_healthy());
        m.set_healthy(false);
        assert!(!g.is_healthy());
    }
}
