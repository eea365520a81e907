// ===============================
// src/safety.rs
// ===============================
//
// Real-money safeguards as a decorator around any OrderGateway:
// - per-order notional cap on entries
// - rolling 24h realized-loss ceiling blocking further entries
// - audit record for every order attempt / success / block / error
//
// Exits (protection legs, market sells) are never blocked, only audited.
//
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

use crate::domain::{BracketIntent, OrderIntent, OrderKind, OrderResult, Protection, Side, SymbolFilters};
use crate::error::{ExchangeError, SafetyViolation};
use crate::gateway::{kind_label, OrderGateway};
use crate::metrics::SAFETY_BLOCKS;
use crate::recorder::{AuditAction, AuditRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyLimits {
    pub max_order_notional: f64,
    pub daily_loss_limit: f64,
    /// Percent of notional an entry is assumed to risk (the configured stop distance).
    pub stop_loss_pct: f64,
}

pub struct SafetyPolicy {
    limits: SafetyLimits,
    environment: String,
    // (time, loss) for every losing close in the last 24h
    losses: Mutex<VecDeque<(DateTime<Utc>, f64)>>,
    audit: Option<mpsc::Sender<AuditRecord>>,
}

impl SafetyPolicy {
    pub fn new(environment: &str, limits: SafetyLimits, audit: Option<mpsc::Sender<AuditRecord>>) -> Self {
        Self { limits, environment: environment.to_string(), losses: Mutex::new(VecDeque::new()), audit }
    }

    pub fn limits(&self) -> &SafetyLimits { &self.limits }

    /// Realized loss over the trailing 24h, as a positive amount.
    pub fn lost_24h(&self, now: DateTime<Utc>) -> f64 {
        let mut losses = self.losses.lock().unwrap_or_else(|p| p.into_inner());
        let cutoff = now - ChronoDuration::hours(24);
        while losses.front().is_some_and(|(t, _)| *t <= cutoff) {
            losses.pop_front();
        }
        losses.iter().map(|(_, l)| l).sum()
    }

    pub fn record_pnl(&self, pnl: f64, at: DateTime<Utc>) {
        if pnl < 0.0 && pnl.is_finite() {
            self.losses.lock().unwrap_or_else(|p| p.into_inner()).push_back((at, -pnl));
        }
    }

    /// Entry gate: notional cap, then the daily loss ceiling.
    pub fn check_entry(&self, notional: f64, now: DateTime<Utc>) -> Result<(), SafetyViolation> {
        let l = &self.limits;
        if notional > l.max_order_notional {
            return Err(SafetyViolation::NotionalCap { notional, cap: l.max_order_notional });
        }
        let lost = self.lost_24h(now);
        let risk = notional * l.stop_loss_pct / 100.0;
        if lost >= l.daily_loss_limit || lost + risk > l.daily_loss_limit {
            return Err(SafetyViolation::DailyLossCeiling { ceiling: l.daily_loss_limit, lost, risk });
        }
        Ok(())
    }

    fn audit(&self, rec: AuditRecord) {
        let Some(tx) = &self.audit else { return };
        if let Err(e) = tx.try_send(rec) {
            // never block the order path; keep the record in the log instead
            warn!(error = %e, "audit queue unavailable, record logged only");
        }
    }
}

fn reason_label(v: &SafetyViolation) -> &'static str {
    match v {
        SafetyViolation::NotionalCap { .. } => "notional_cap",
        SafetyViolation::DailyLossCeiling { .. } => "daily_loss",
    }
}

pub struct SafeGateway {
    inner: Arc<dyn OrderGateway>,
    policy: Arc<SafetyPolicy>,
}

impl SafeGateway {
    pub fn new(inner: Arc<dyn OrderGateway>, policy: Arc<SafetyPolicy>) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &Arc<SafetyPolicy> { &self.policy }

    fn record(&self, action: AuditAction, symbol: &str, side: Side, kind: &str, cl_id: &str, notional: f64) -> AuditRecord {
        AuditRecord {
            at: Utc::now(),
            environment: self.policy.environment.clone(),
            action,
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            kind: kind.to_string(),
            client_order_id: cl_id.to_string(),
            notional,
            order_id: None,
            detail: None,
        }
    }

    /// Only a quantity-sized entry needs a price; exits never wait on one.
    async fn notional(&self, intent: &OrderIntent) -> Result<f64, ExchangeError> {
        match (intent.side, &intent.kind) {
            (Side::Buy, OrderKind::Market { .. }) => Ok(intent.notional(self.inner.last_price(&intent.symbol).await?)),
            _ => Ok(intent.notional(0.0)),
        }
    }
}

#[async_trait]
impl OrderGateway for SafeGateway {
    fn venue(&self) -> &str { self.inner.venue() }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        self.inner.symbol_filters(symbol).await
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.inner.last_price(symbol).await
    }

    async fn free_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        self.inner.free_balance(asset).await
    }

    async fn submit(&self, intent: &OrderIntent) -> Result<OrderResult, ExchangeError> {
        let kind = kind_label(&intent.kind);
        let priced = self.notional(intent).await;
        let notional = *priced.as_ref().unwrap_or(&0.0);
        let base = |action| self.record(action, &intent.symbol, intent.side, kind, &intent.client_order_id, notional);
        self.policy.audit(base(AuditAction::Attempt));
        if let Err(e) = priced {
            warn!(environment = %self.policy.environment, symbol = %intent.symbol, error = %e, "entry not priced, order withheld");
            let mut rec = base(AuditAction::Error);
            rec.detail = Some(e.to_string());
            self.policy.audit(rec);
            return Err(e);
        }

        if intent.side == Side::Buy {
            if let Err(v) = self.policy.check_entry(notional, Utc::now()) {
                SAFETY_BLOCKS.with_label_values(&[reason_label(&v)]).inc();
                warn!(environment = %self.policy.environment, symbol = %intent.symbol, notional, reason = %v, "entry blocked by safety policy");
                let mut rec = base(AuditAction::Block);
                rec.detail = Some(v.to_string());
                self.policy.audit(rec);
                return Err(ExchangeError::Blocked(v));
            }
        }

        let res = self.inner.submit(intent).await;
        let mut rec = base(if res.is_ok() { AuditAction::Success } else { AuditAction::Error });
        match &res {
            Ok(r) => rec.order_id = Some(r.order_id),
            Err(e) => rec.detail = Some(e.to_string()),
        }
        self.policy.audit(rec);
        res
    }

    async fn submit_bracket(&self, intent: &BracketIntent) -> Result<Protection, ExchangeError> {
        let notional = intent.quantity * intent.take_profit;
        let base = |action| self.record(action, &intent.symbol, Side::Sell, "bracket", &intent.client_order_id, notional);
        self.policy.audit(base(AuditAction::Attempt));
        let res = self.inner.submit_bracket(intent).await;
        let mut rec = base(if res.is_ok() { AuditAction::Success } else { AuditAction::Error });
        if let Err(e) = &res {
            rec.detail = Some(e.to_string());
        }
        self.policy.audit(rec);
        res
    }

    async fn order_status(&self, symbol: &str, order_id: u64) -> Result<OrderResult, ExchangeError> {
        self.inner.order_status(symbol, order_id).await
    }

    async fn cancel(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError> {
        self.inner.cancel(symbol, order_id).await
    }

    fn record_realized_pnl(&self, pnl: f64) {
        self.policy.record_pnl(pnl, Utc::now());
        self.inner.record_realized_pnl(pnl);
    }

    fn is_healthy(&self) -> bool { self.inner.is_healthy() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::ScriptedGateway;

    fn limits(cap: f64) -> SafetyLimits {
        SafetyLimits { max_order_notional: cap, daily_loss_limit: 100.0, stop_loss_pct: 5.0 }
    }

    #[test]
    fn loss_ceiling_blocks_when_candidate_risk_would_breach() {
        let p = SafetyPolicy::new("mainnet", limits(1000.0), None);
        let now = Utc::now();
        p.record_pnl(-95.0, now);
        p.record_pnl(12.0, now);
        // 200 notional * 5% = 10 at risk; 95 + 10 > 100
        let err = p.check_entry(200.0, now).unwrap_err();
        assert_eq!(err, SafetyViolation::DailyLossCeiling { ceiling: 100.0, lost: 95.0, risk: 10.0 });
        assert!(p.check_entry(100.0, now).is_ok(), "95 + 5 stays at the ceiling");
    }

    #[test]
    fn losses_roll_off_after_24h() {
        let p = SafetyPolicy::new("mainnet", limits(1000.0), None);
        let now = Utc::now();
        p.record_pnl(-100.0, now - ChronoDuration::hours(25));
        p.record_pnl(-20.0, now - ChronoDuration::hours(1));
        assert!((p.lost_24h(now) - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn blocked_entry_is_never_attempted_and_is_audited() {
        let inner = ScriptedGateway::new(2.0);
        let (tx, mut rx) = mpsc::channel(16);
        let policy = Arc::new(SafetyPolicy::new("mainnet", limits(1000.0), Some(tx)));
        policy.record_pnl(-95.0, Utc::now());
        let g = SafeGateway::new(inner.clone(), policy);

        let buy = OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 200.0 });
        let err = g.submit(&buy).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Blocked(SafetyViolation::DailyLossCeiling { .. })));
        assert_eq!(inner.calls("market"), 0);

        assert_eq!(rx.recv().await.unwrap().action, AuditAction::Attempt);
        let block = rx.recv().await.unwrap();
        assert_eq!(block.action, AuditAction::Block);
        assert!(block.detail.unwrap().contains("daily loss"));
    }

    #[tokio::test]
    async fn notional_cap_blocks_entries_but_not_exits() {
        let inner = ScriptedGateway::new(2.0);
        let (tx, mut rx) = mpsc::channel(16);
        let g = SafeGateway::new(inner.clone(), Arc::new(SafetyPolicy::new("mainnet", limits(50.0), Some(tx))));

        let buy = OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 60.0 });
        assert!(matches!(g.submit(&buy).await, Err(ExchangeError::Blocked(SafetyViolation::NotionalCap { .. }))));

        let ok = OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 40.0 });
        let fill = g.submit(&ok).await.unwrap();
        let exit = OrderIntent::new("NEWUSDT", Side::Sell, OrderKind::Market { quantity: fill.executed_qty });
        assert!(g.submit(&exit).await.is_ok(), "exits are not capped");
        assert_eq!(inner.calls("market"), 2);

        let mut actions = vec![];
        while let Ok(r) = rx.try_recv() {
            actions.push(r.action);
        }
        use AuditAction::*;
        assert_eq!(actions, vec![Attempt, Block, Attempt, Success, Attempt, Success]);
    }

    #[tokio::test]
    async fn exits_go_out_even_when_prices_are_unavailable() {
        let inner = ScriptedGateway::new(2.0);
        let (tx, mut rx) = mpsc::channel(16);
        let g = SafeGateway::new(inner.clone(), Arc::new(SafetyPolicy::new("mainnet", limits(1000.0), Some(tx))));
        let fill = g.submit(&OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::MarketQuote { quote_amount: 40.0 })).await.unwrap();
        while rx.try_recv().is_ok() {}

        inner.fail_next("price", ExchangeError::Transient("ticker down".into()));
        let exit = OrderIntent::new("NEWUSDT", Side::Sell, OrderKind::Market { quantity: fill.executed_qty });
        assert!(g.submit(&exit).await.is_ok());
        assert_eq!(inner.calls("price"), 0);
        assert_eq!(rx.recv().await.unwrap().action, AuditAction::Attempt);
        assert_eq!(rx.recv().await.unwrap().action, AuditAction::Success);
    }

    #[tokio::test]
    async fn unpriced_entry_is_audited_as_an_error() {
        let inner = ScriptedGateway::new(2.0);
        let (tx, mut rx) = mpsc::channel(16);
        let g = SafeGateway::new(inner.clone(), Arc::new(SafetyPolicy::new("mainnet", limits(1000.0), Some(tx))));
        inner.fail_next("price", ExchangeError::Transient("ticker down".into()));

        let buy = OrderIntent::new("NEWUSDT", Side::Buy, OrderKind::Market { quantity: 5.0 });
        assert!(matches!(g.submit(&buy).await, Err(ExchangeError::Transient(_))));
        assert_eq!(inner.calls("market"), 0);
        assert_eq!(rx.recv().await.unwrap().action, AuditAction::Attempt);
        let err = rx.recv().await.unwrap();
        assert_eq!(err.action, AuditAction::Error);
        assert!(err.detail.unwrap().contains("ticker down"));
    }
}
