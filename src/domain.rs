// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

/// Exchange trading rules for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub symbol: String,
    pub min_qty: f64,
    pub max_qty: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub tick_size: f64,
}

impl SymbolFilters {
    pub fn unrestricted(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            min_qty: 0.0,
            max_qty: f64::MAX,
            step_size: 0.0,
            min_notional: 0.0,
            tick_size: 0.0,
        }
    }

    /// Round a quantity down to the lot step.
    pub fn floor_qty(&self, qty: f64) -> f64 {
        floor_to(qty, self.step_size)
    }

    /// Round a price down to the tick.
    pub fn floor_price(&self, px: f64) -> f64 {
        floor_to(px, self.tick_size)
    }

    pub fn qty_decimals(&self) -> usize { decimals(self.step_size) }
    pub fn price_decimals(&self) -> usize { decimals(self.tick_size) }

    pub fn fmt_qty(&self, qty: f64) -> String {
        format!("{:.*}", self.qty_decimals(), qty)
    }

    pub fn fmt_price(&self, px: f64) -> String {
        format!("{:.*}", self.price_decimals(), px)
    }

    /// Check a (quantity, price) pair against LOT_SIZE and NOTIONAL.
    pub fn validate(&self, qty: f64, px: f64) -> Result<(), FilterViolation> {
        if !qty.is_finite() || qty <= 0.0 || qty < self.min_qty {
            return Err(FilterViolation::QtyBelowMin { qty, min: self.min_qty });
        }
        if qty > self.max_qty {
            return Err(FilterViolation::QtyAboveMax { qty, max: self.max_qty });
        }
        let notional = qty * px;
        if notional < self.min_notional {
            return Err(FilterViolation::NotionalBelowMin { notional, min: self.min_notional });
        }
        Ok(())
    }
}

fn floor_to(v: f64, step: f64) -> f64 {
    if step <= 0.0 || !v.is_finite() {
        return v;
    }
    // small epsilon so 0.3 / 0.1 does not floor to 2
    let n = (v / step + 1e-9).floor();
    let d = decimals(step) as i32;
    let scale = 10f64.powi(d);
    (n * step * scale).round() / scale
}

fn decimals(step: f64) -> usize {
    if step <= 0.0 {
        return 8;
    }
    let mut d = 0;
    let mut s = step;
    while d < 12 && (s - s.round()).abs() > 1e-9 {
        s *= 10.0;
        d += 1;
    }
    d
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterViolation {
    #[error("quantity {qty} below minimum {min}")]
    QtyBelowMin { qty: f64, min: f64 },
    #[error("quantity {qty} above maximum {max}")]
    QtyAboveMax { qty: f64, max: f64 },
    #[error("notional {notional} below minimum {min}")]
    NotionalBelowMin { notional: f64, min: f64 },
}

// ---- Market events ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingEvent {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub price_change_percent: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelistingNotice {
    pub symbol: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketEvent { Listing(ListingEvent), Delisting(DelistingNotice) }

// ---- Orders ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Market order sized in quote currency (`quoteOrderQty`).
    MarketQuote { quote_amount: f64 },
    /// Market order sized in base quantity.
    Market { quantity: f64 },
    Limit { quantity: f64, price: f64 },
    StopLimit { quantity: f64, stop_price: f64, limit_price: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
}

impl OrderIntent {
    pub fn new(symbol: &str, side: Side, kind: OrderKind) -> Self {
        Self { client_order_id: new_client_id(), symbol: symbol.to_string(), side, kind }
    }

    /// Quote value the order commits, using `ref_price` for quantity-sized orders.
    pub fn notional(&self, ref_price: f64) -> f64 {
        match &self.kind {
            OrderKind::MarketQuote { quote_amount } => *quote_amount,
            OrderKind::Market { quantity } => quantity * ref_price,
            OrderKind::Limit { quantity, price } => quantity * price,
            OrderKind::StopLimit { quantity, limit_price, .. } => quantity * limit_price,
        }
    }
}

/// Linked take-profit / stop-loss sell for a long position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketIntent {
    pub client_order_id: String,
    pub symbol: String,
    pub quantity: f64,
    pub take_profit: f64,
    pub stop_price: f64,
    pub stop_limit_price: f64,
}

pub fn new_client_id() -> String {
    use rand::Rng;
    format!("lb-{}-{:08x}", crate::binance::timestamp_ms(), rand::thread_rng().gen::<u32>())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    Unknown(String),
}

impl OrderStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "PENDING_CANCEL" => OrderStatus::PendingCancel,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
            other => OrderStatus::Unknown(other.to_string()),
        }
    }

    /// Still resting on the book.
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled | OrderStatus::PendingCancel)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: u64,
    pub client_order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub avg_price: f64,
}

impl From<crate::binance::OrderResponse> for OrderResult {
    fn from(o: crate::binance::OrderResponse) -> Self {
        OrderResult {
            order_id: o.order_id,
            avg_price: o.avg_price(),
            status: OrderStatus::parse(&o.status),
            executed_qty: o.executed_qty,
            client_order_id: o.client_order_id,
            symbol: o.symbol,
        }
    }
}

// ---- Positions ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protection {
    /// Nothing resting; only transient between fill and attachment.
    None,
    /// One atomic OCO list.
    Bracket { list_id: u64, take_profit_id: u64, stop_loss_id: u64 },
    /// Two independent orders, both accepted.
    Independent { take_profit_id: u64, stop_loss_id: u64 },
}

impl Protection {
    pub fn is_protected(&self) -> bool { !matches!(self, Protection::None) }

    pub fn order_ids(&self) -> Vec<u64> {
        match self {
            Protection::None => vec![],
            Protection::Bracket { take_profit_id, stop_loss_id, .. }
            | Protection::Independent { take_profit_id, stop_loss_id } => vec![*take_profit_id, *stop_loss_id],
        }
    }

    /// (take profit, stop loss)
    pub fn legs(&self) -> Option<(u64, u64)> {
        match self {
            Protection::None => None,
            Protection::Bracket { take_profit_id, stop_loss_id, .. }
            | Protection::Independent { take_profit_id, stop_loss_id } => Some((*take_profit_id, *stop_loss_id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus { Open, BreakEven, InProfit, InLoss, Closed }

impl PositionStatus {
    pub fn is_open(&self) -> bool { !matches!(self, PositionStatus::Closed) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason { TakeProfit, StopLoss, Manual, ProtectionFailed }

/// Band around entry (in percent) reported as break-even.
pub const BREAK_EVEN_BAND_PCT: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_order_id: u64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub protection: Protection,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub unrealized_pnl: f64,
    pub environment: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PositionError {
    #[error("position {0} already closed")]
    AlreadyClosed(String),
}

impl Position {
    /// Build from a confirmed entry fill. Protection is attached afterwards.
    pub fn from_fill(
        fill: &OrderResult,
        take_profit_price: f64,
        stop_loss_price: f64,
        environment: &str,
    ) -> Self {
        Self {
            symbol: fill.symbol.clone(),
            side: Side::Buy,
            quantity: fill.executed_qty,
            entry_price: fill.avg_price,
            entry_time: Utc::now(),
            entry_order_id: fill.order_id,
            take_profit_price,
            stop_loss_price,
            protection: Protection::None,
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            close_reason: None,
            pnl: None,
            pnl_percent: None,
            unrealized_pnl: 0.0,
            environment: environment.to_string(),
        }
    }

    pub fn is_open(&self) -> bool { self.status.is_open() }

    pub fn protection_order_ids(&self) -> Vec<u64> { self.protection.order_ids() }

    /// Informational mark-to-market; never leaves the open family of states.
    pub fn mark(&mut self, price: f64) {
        if !self.is_open() || self.entry_price <= 0.0 {
            return;
        }
        self.unrealized_pnl = (price - self.entry_price) * self.quantity;
        let pct = (price - self.entry_price) / self.entry_price * 100.0;
        self.status = if pct.abs() <= BREAK_EVEN_BAND_PCT {
            PositionStatus::BreakEven
        } else if pct > 0.0 {
            PositionStatus::InProfit
        } else {
            PositionStatus::InLoss
        };
    }

    /// Terminal transition. Entry and exit fields are frozen afterwards.
    pub fn close(&mut self, exit_price: f64, reason: CloseReason, at: DateTime<Utc>) -> Result<f64, PositionError> {
        if !self.is_open() {
            return Err(PositionError::AlreadyClosed(self.symbol.clone()));
        }
        let (pnl, pnl_percent) = realized_pnl(self.entry_price, exit_price, self.quantity);
        self.exit_price = Some(exit_price);
        self.exit_time = Some(at);
        self.close_reason = Some(reason);
        self.pnl = Some(pnl);
        self.pnl_percent = Some(pnl_percent);
        self.unrealized_pnl = 0.0;
        self.status = PositionStatus::Closed;
        Ok(pnl)
    }
}

/// `(exit - entry) * qty` and the percent move relative to entry.
pub fn realized_pnl(entry: f64, exit: f64, qty: f64) -> (f64, f64) {
    let pnl = (exit - entry) * qty;
    let pct = if entry > 0.0 { (exit - entry) / entry * 100.0 } else { 0.0 };
    (pnl, pct)
}
