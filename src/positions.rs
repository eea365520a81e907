// ===============================
// src/positions.rs (position lifecycle)
// ===============================
//
// Owns the open-position map. Only the trader task holds a LifecycleManager, so
// every transition below runs serialized per symbol without extra locking.
//
//   NONE -> OPEN -> {BREAK_EVEN, IN_PROFIT, IN_LOSS} -> CLOSED
//
use ahash::AHashMap as HashMap;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::domain::{
    BracketIntent, CloseReason, ListingEvent, OrderIntent, OrderKind, OrderResult, OrderStatus, Position,
    Protection, Side, new_client_id,
};
use crate::error::{EngineError, EntryError, ExchangeError, ReconcileError};
use crate::gateway::OrderGateway;
use crate::metrics::{LAT_LISTING_FILL, OPEN_POSITIONS, PNL_REALIZED, RECONCILE_ERRORS};
use crate::risk::RiskEngine;
use crate::store::{ErrorRecord, Notifier, NotifyEvent, PositionStore};

#[derive(Debug, Clone)]
pub struct ProtectionConfig {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    /// How far below the stop trigger the stop leg's limit sits, in percent.
    pub stop_limit_offset_pct: f64,
    pub prefer_bracket: bool,
    /// Extra attempts after the first failed protection attempt.
    pub retries: u32,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self { take_profit_pct: 10.0, stop_loss_pct: 5.0, stop_limit_offset_pct: 0.5, prefer_bracket: true, retries: 1 }
    }
}

impl ProtectionConfig {
    pub fn take_profit(&self, entry: f64) -> f64 { entry * (1.0 + self.take_profit_pct / 100.0) }
    pub fn stop_loss(&self, entry: f64) -> f64 { entry * (1.0 - self.stop_loss_pct / 100.0) }
    pub fn stop_limit(&self, stop: f64) -> f64 { stop * (1.0 - self.stop_limit_offset_pct / 100.0) }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuyResult {
    pub symbol: String,
    pub order: OrderResult,
    pub quote_spent: f64,
    pub entry_price: f64,
    pub quantity: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtectionResult {
    pub symbol: String,
    pub protection: Protection,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub attempts: u32,
}

pub struct LifecycleManager {
    gateway: Arc<dyn OrderGateway>,
    risk: RiskEngine,
    protection: ProtectionConfig,
    quote_asset: String,
    environment: String,
    store: Arc<dyn PositionStore>,
    notifier: Arc<dyn Notifier>,
    open: HashMap<String, Position>,
    balance: f64,
}

impl LifecycleManager {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        risk: RiskEngine,
        protection: ProtectionConfig,
        quote_asset: &str,
        environment: &str,
        store: Arc<dyn PositionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            gateway,
            risk,
            protection,
            quote_asset: quote_asset.to_string(),
            environment: environment.to_string(),
            store,
            notifier,
            open: HashMap::new(),
            balance: 0.0,
        }
    }

    /// Point at a new environment. Only valid with no open positions.
    pub fn rebind(&mut self, gateway: Arc<dyn OrderGateway>, risk: RiskEngine, environment: &str) {
        self.gateway = gateway;
        self.risk = risk;
        self.environment = environment.to_string();
        self.balance = 0.0;
    }

    pub fn environment(&self) -> &str { &self.environment }
    pub fn balance(&self) -> f64 { self.balance }
    pub fn open_count(&self) -> usize { self.open.len() }
    pub fn is_open(&self, symbol: &str) -> bool { self.open.contains_key(symbol) }
    pub fn position(&self, symbol: &str) -> Option<&Position> { self.open.get(symbol) }
    pub fn gateway(&self) -> &Arc<dyn OrderGateway> { &self.gateway }

    pub fn open_positions(&self) -> Vec<Position> {
        let mut v: Vec<Position> = self.open.values().cloned().collect();
        v.sort_by(|a, b| a.entry_time.cmp(&b.entry_time));
        v
    }

    /// Resume open positions of the active environment from storage.
    pub async fn load(&mut self) -> Result<usize, EngineError> {
        let active = self.store.get_active_positions().await?;
        for p in active.into_iter().filter(|p| p.environment == self.environment) {
            info!(symbol = %p.symbol, qty = p.quantity, entry = p.entry_price, protection = ?p.protection, "resumed open position");
            self.open.insert(p.symbol.clone(), p);
        }
        OPEN_POSITIONS.set(self.open.len() as i64);
        Ok(self.open.len())
    }

    pub async fn refresh_balance(&mut self) -> Result<f64, ExchangeError> {
        self.balance = self.gateway.free_balance(&self.quote_asset).await?;
        Ok(self.balance)
    }

    // ---------- entry ----------

    /// Market-buy a fresh listing. A position exists only after a confirmed fill.
    pub async fn execute_buy(&mut self, listing: &ListingEvent) -> Result<BuyResult, EntryError> {
        match self.try_buy(listing).await {
            Ok(r) => Ok(r),
            Err(e) => {
                warn!(environment = %self.environment, symbol = %listing.symbol, reason = %e, "entry not taken");
                self.record_error("execute_buy", Some(&listing.symbol), &e).await;
                self.notifier.send(
                    NotifyEvent::EntryBlocked,
                    json!({ "symbol": listing.symbol, "reason": e.to_string(), "kind": e.label() }),
                );
                Err(e)
            }
        }
    }

    async fn try_buy(&mut self, listing: &ListingEvent) -> Result<BuyResult, EntryError> {
        let symbol = listing.symbol.as_str();
        if self.open.contains_key(symbol) {
            return Err(EntryError::AlreadyOpen(symbol.to_string()));
        }
        let open = self.open.len();
        let balance = self.refresh_balance().await?;
        let size = self.risk.size_order(balance, open);
        self.risk.check(balance, open, size)?;

        let intent = OrderIntent::new(symbol, Side::Buy, OrderKind::MarketQuote { quote_amount: size });
        info!(environment = %self.environment, %symbol, size, balance, open, cl_id = %intent.client_order_id, "entering listing");
        let fill = self.gateway.submit(&intent).await?;
        if fill.executed_qty <= 0.0 || fill.avg_price <= 0.0 {
            return Err(EntryError::NotFilled { symbol: symbol.to_string(), status: fill.status });
        }

        let tp = self.protection.take_profit(fill.avg_price);
        let sl = self.protection.stop_loss(fill.avg_price);
        let position = Position::from_fill(&fill, tp, sl, &self.environment);
        if let Err(e) = self.store.save_position(&position).await {
            error!(%symbol, error = %e, "position filled but not persisted");
            self.record_error("save_position", Some(symbol), &e).await;
        }
        self.open.insert(symbol.to_string(), position);
        OPEN_POSITIONS.set(self.open.len() as i64);
        let latency = (Utc::now() - listing.detected_at).num_milliseconds().max(0);
        LAT_LISTING_FILL.observe(latency as f64);

        let result = BuyResult {
            symbol: symbol.to_string(),
            quote_spent: fill.executed_qty * fill.avg_price,
            entry_price: fill.avg_price,
            quantity: fill.executed_qty,
            take_profit_price: tp,
            stop_loss_price: sl,
            order: fill,
        };
        info!(%symbol, qty = result.quantity, entry = result.entry_price, tp, sl, latency_ms = latency, "position opened");
        self.notifier.send(NotifyEvent::PositionOpened, json!(result));
        Ok(result)
    }

    // ---------- protection ----------

    /// Attach take-profit / stop-loss to the position opened by `buy`. When protection
    /// cannot be attached the position is closed at market rather than left naked.
    pub async fn set_take_profit_stop_loss(&mut self, buy: &BuyResult) -> Result<ProtectionResult, ExchangeError> {
        let symbol = buy.symbol.as_str();
        match self.protect(symbol).await {
            Ok(r) => Ok(r),
            Err(e) => {
                error!(%symbol, error = %e, "protection could not be attached, closing at market");
                self.record_error("set_take_profit_stop_loss", Some(symbol), &e).await;
                self.close_unprotected(symbol).await;
                Err(e)
            }
        }
    }

    async fn protect(&mut self, symbol: &str) -> Result<ProtectionResult, ExchangeError> {
        let Some(pos) = self.open.get(symbol).cloned() else {
            return Err(ExchangeError::Unsupported(format!("no open position for {symbol}")));
        };
        let filters = self.gateway.symbol_filters(symbol).await?;
        let qty = filters.floor_qty(pos.quantity);
        let (tp, sl) = (pos.take_profit_price, pos.stop_loss_price);
        let stop_limit = self.protection.stop_limit(sl);

        let attempts = 1 + self.protection.retries;
        let mut last_err = ExchangeError::Unsupported("no protection attempt made".into());
        for attempt in 1..=attempts {
            if self.protection.prefer_bracket {
                let bracket = BracketIntent {
                    client_order_id: new_client_id(),
                    symbol: symbol.to_string(),
                    quantity: qty,
                    take_profit: tp,
                    stop_price: sl,
                    stop_limit_price: stop_limit,
                };
                match self.gateway.submit_bracket(&bracket).await {
                    Ok(p) => return Ok(self.protected(symbol, p, attempt).await),
                    Err(e) => warn!(%symbol, attempt, error = %e, "bracket refused, falling back to independent orders"),
                }
            }
            match self.independent(symbol, qty, tp, sl, stop_limit).await {
                Ok(p) => return Ok(self.protected(symbol, p, attempt).await),
                Err(e) => {
                    warn!(%symbol, attempt, attempts, error = %e, "independent protection failed");
                    if e.is_fatal() {
                        return Err(e);
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Take-profit limit plus stop-limit. Both legs are always tried; if either is
    /// refused the accepted one is withdrawn, so neither is left resting alone.
    async fn independent(&self, symbol: &str, qty: f64, tp: f64, sl: f64, stop_limit: f64) -> Result<Protection, ExchangeError> {
        let tp_order = OrderIntent::new(symbol, Side::Sell, OrderKind::Limit { quantity: qty, price: tp });
        let sl_order = OrderIntent::new(
            symbol,
            Side::Sell,
            OrderKind::StopLimit { quantity: qty, stop_price: sl, limit_price: stop_limit },
        );
        let take_profit = self.gateway.submit(&tp_order).await;
        let stop_loss = self.gateway.submit(&sl_order).await;
        match (take_profit, stop_loss) {
            (Ok(tp), Ok(sl)) => Ok(Protection::Independent { take_profit_id: tp.order_id, stop_loss_id: sl.order_id }),
            (Ok(leg), Err(e)) | (Err(e), Ok(leg)) => {
                if let Err(ce) = self.cancel_benign(symbol, leg.order_id).await {
                    error!(%symbol, order_id = leg.order_id, error = %ce, "could not withdraw lone protection leg");
                }
                Err(e)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    async fn protected(&mut self, symbol: &str, protection: Protection, attempts: u32) -> ProtectionResult {
        let mut snapshot = None;
        if let Some(pos) = self.open.get_mut(symbol) {
            pos.protection = protection.clone();
            snapshot = Some(pos.clone());
        }
        let result = ProtectionResult {
            symbol: symbol.to_string(),
            take_profit_price: snapshot.as_ref().map(|p| p.take_profit_price).unwrap_or_default(),
            stop_loss_price: snapshot.as_ref().map(|p| p.stop_loss_price).unwrap_or_default(),
            protection,
            attempts,
        };
        if let Some(pos) = snapshot {
            self.persist(&pos).await;
        }
        info!(%symbol, protection = ?result.protection, attempts, "protection attached");
        self.notifier.send(NotifyEvent::ProtectionAttached, json!(result));
        result
    }

    /// Market-sell a position that could not be protected.
    async fn close_unprotected(&mut self, symbol: &str) {
        let Some(pos) = self.open.get(symbol).cloned() else { return };
        match self.market_exit(&pos).await {
            Ok(exit) => {
                self.finalize_close(symbol, exit, CloseReason::ProtectionFailed).await;
            }
            Err(e) => {
                error!(critical = true, %symbol, error = %e, "unprotected position could not be closed, will retry on next reconciliation");
                self.record_error("close_unprotected", Some(symbol), &e).await;
            }
        }
    }

    async fn market_exit(&self, pos: &Position) -> Result<f64, ExchangeError> {
        let sell = OrderIntent::new(&pos.symbol, Side::Sell, OrderKind::Market { quantity: pos.quantity });
        let fill = self.gateway.submit(&sell).await?;
        if fill.executed_qty > 0.0 && fill.avg_price > 0.0 {
            return Ok(fill.avg_price);
        }
        self.gateway.last_price(&pos.symbol).await
    }

    async fn cancel_benign(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError> {
        match self.gateway.cancel(symbol, order_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_unknown_order() => {
                debug!(%symbol, order_id, "cancel: order already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ---------- reconciliation ----------

    /// One pass over every open position. A failure is isolated to its position and
    /// retried on the next pass.
    pub async fn reconcile_all(&mut self) -> Vec<ReconcileError> {
        let mut symbols: Vec<String> = self.open.keys().cloned().collect();
        symbols.sort();
        let mut errors = Vec::new();
        for symbol in symbols {
            if let Err(e) = self.reconcile_one(&symbol).await {
                RECONCILE_ERRORS.inc();
                warn!(%symbol, error = %e.source, "reconciliation failed, retrying next cycle");
                self.record_error("reconcile", Some(&symbol), &e).await;
                errors.push(e);
            }
        }
        errors
    }

    pub async fn reconcile_one(&mut self, symbol: &str) -> Result<Option<CloseReason>, ReconcileError> {
        let wrap = |source: ExchangeError| ReconcileError { symbol: symbol.to_string(), source };
        let Some(pos) = self.open.get(symbol).cloned() else { return Ok(None) };

        let Some((tp_id, sl_id)) = pos.protection.legs() else {
            info!(%symbol, "position unprotected, re-attaching protection");
            if let Err(e) = self.protect(symbol).await {
                warn!(%symbol, error = %e, "re-protection failed");
                self.close_unprotected(symbol).await;
            }
            return Ok(self.closed_reason(symbol));
        };

        let tp = self.gateway.order_status(symbol, tp_id).await.map_err(wrap)?;
        let sl = self.gateway.order_status(symbol, sl_id).await.map_err(wrap)?;

        if tp.status == OrderStatus::Filled {
            self.cancel_benign(symbol, sl_id).await.map_err(wrap)?;
            let exit = if tp.avg_price > 0.0 { tp.avg_price } else { pos.take_profit_price };
            self.finalize_close(symbol, exit, CloseReason::TakeProfit).await;
            return Ok(Some(CloseReason::TakeProfit));
        }
        if sl.status == OrderStatus::Filled {
            self.cancel_benign(symbol, tp_id).await.map_err(wrap)?;
            let exit = if sl.avg_price > 0.0 { sl.avg_price } else { self.protection.stop_limit(pos.stop_loss_price) };
            self.finalize_close(symbol, exit, CloseReason::StopLoss).await;
            return Ok(Some(CloseReason::StopLoss));
        }

        if tp.status.is_open() && sl.status.is_open() {
            match self.gateway.last_price(symbol).await {
                Ok(px) => self.mark(symbol, px).await,
                Err(e) => debug!(%symbol, error = %e, "mark price unavailable"),
            }
            return Ok(None);
        }

        // a leg went away without filling (cancelled / expired / rejected)
        warn!(%symbol, tp = ?tp.status, sl = ?sl.status, "protection leg lost without fill, re-protecting");
        for (id, st) in [(tp_id, &tp.status), (sl_id, &sl.status)] {
            if st.is_open() {
                self.cancel_benign(symbol, id).await.map_err(wrap)?;
            }
        }
        if let Some(p) = self.open.get_mut(symbol) {
            p.protection = Protection::None;
        }
        if let Err(e) = self.protect(symbol).await {
            warn!(%symbol, error = %e, "re-protection failed");
            self.close_unprotected(symbol).await;
        }
        Ok(self.closed_reason(symbol))
    }

    fn closed_reason(&self, symbol: &str) -> Option<CloseReason> {
        if self.open.contains_key(symbol) { None } else { Some(CloseReason::ProtectionFailed) }
    }

    async fn mark(&mut self, symbol: &str, price: f64) {
        let Some(pos) = self.open.get_mut(symbol) else { return };
        let before = pos.status;
        pos.mark(price);
        if pos.status != before {
            debug!(%symbol, price, status = ?pos.status, unrealized = pos.unrealized_pnl, "position state changed");
            let snapshot = pos.clone();
            self.persist(&snapshot).await;
        }
    }

    /// Terminal transition: P&L, archive, balance refresh.
    async fn finalize_close(&mut self, symbol: &str, exit_price: f64, reason: CloseReason) -> Option<Position> {
        let mut pos = self.open.remove(symbol)?;
        let pnl = match pos.close(exit_price, reason, Utc::now()) {
            Ok(pnl) => pnl,
            Err(e) => {
                warn!(%symbol, error = %e, "close on a closed position ignored");
                return None;
            }
        };
        self.persist(&pos).await;
        self.gateway.record_realized_pnl(pnl);
        PNL_REALIZED.add(pnl);
        OPEN_POSITIONS.set(self.open.len() as i64);
        info!(%symbol, ?reason, entry = pos.entry_price, exit = exit_price, qty = pos.quantity, pnl, pnl_pct = pos.pnl_percent.unwrap_or_default(), "position closed");
        self.notifier.send(NotifyEvent::PositionClosed, json!(pos));
        if let Err(e) = self.refresh_balance().await {
            warn!(error = %e, "balance refresh after close failed");
        }
        Some(pos)
    }

    // ---------- manual close ----------

    /// Withdraw protection, sell at market; the exit is booked at the current price.
    pub async fn close_position(&mut self, symbol: &str) -> Result<Position, EngineError> {
        let Some(pos) = self.open.get(symbol).cloned() else {
            return Err(EngineError::NoPosition(symbol.to_string()));
        };
        for id in pos.protection_order_ids() {
            self.cancel_benign(symbol, id).await?;
        }
        if let Some(p) = self.open.get_mut(symbol) {
            p.protection = Protection::None;
        }
        let price = self.gateway.last_price(symbol).await?;
        let sell = OrderIntent::new(symbol, Side::Sell, OrderKind::Market { quantity: pos.quantity });
        self.gateway.submit(&sell).await?;
        self.finalize_close(symbol, price, CloseReason::Manual)
            .await
            .ok_or_else(|| EngineError::NoPosition(symbol.to_string()))
    }

    // ---------- helpers ----------

    async fn persist(&self, pos: &Position) {
        if let Err(e) = self.store.update_position(&pos.symbol, pos.entry_order_id, pos).await {
            warn!(symbol = %pos.symbol, error = %e, "position update not persisted");
        }
    }

    async fn record_error(&self, context: &str, symbol: Option<&str>, err: &(dyn std::fmt::Display + Sync)) {
        if let Err(e) = self.store.save_error(ErrorRecord::new(context, symbol, err)).await {
            warn!(context, error = %e, "error record not persisted");
        }
        self.notifier.send(NotifyEvent::Error, json!({ "context": context, "symbol": symbol, "error": err.to_string() }));
    }
}
