// ===============================
// src/risk.rs
// ===============================
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub base_order_size: f64,
    pub max_order_size: f64,
    pub max_positions: usize,
    pub account_risk_fraction: f64,
    pub position_risk_fraction: f64,
    pub balance_utilization: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            base_order_size: 20.0,
            max_order_size: 100.0,
            max_positions: 3,
            account_risk_fraction: 0.5,
            position_risk_fraction: 0.1,
            balance_utilization: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("position ceiling reached ({open}/{max})")]
    MaxPositions { open: usize, max: usize },
    #[error("insufficient balance {balance:.4} for order {candidate:.4}")]
    InsufficientBalance { balance: f64, candidate: f64 },
    #[error("aggregate exposure {exposure:.4} above account risk ceiling {ceiling:.4}")]
    AggregateRisk { exposure: f64, ceiling: f64 },
    #[error("invalid order size {0}")]
    InvalidSize(f64),
}

#[derive(Debug, Clone)]
pub struct RiskEngine {
    limits: RiskLimits,
}

impl RiskEngine {
    pub fn new(limits: RiskLimits) -> Self { Self { limits } }

    pub fn limits(&self) -> &RiskLimits { &self.limits }

    /// Quote amount for the next entry: the base amount bounded by every cap.
    /// Never fails: a bad computation falls back to the base amount.
    pub fn size_order(&self, balance: f64, open_positions: usize) -> f64 {
        match self.bounded_size(balance, open_positions) {
            Some(size) => size,
            None => {
                warn!(balance, open_positions, base = self.limits.base_order_size, "sizing failed, using base order size");
                self.limits.base_order_size
            }
        }
    }

    fn bounded_size(&self, balance: f64, open_positions: usize) -> Option<f64> {
        let l = &self.limits;
        if !balance.is_finite() || balance < 0.0 {
            return None;
        }
        let caps = [
            l.base_order_size,
            l.max_order_size,
            balance * l.position_risk_fraction,
            (balance * l.account_risk_fraction) / (open_positions as f64 + 1.0),
            balance * l.balance_utilization,
        ];
        if caps.iter().any(|c| !c.is_finite()) {
            return None;
        }
        let size = caps.iter().copied().fold(f64::INFINITY, f64::min);
        Some(size.max(0.0))
    }

    /// Second, independent gate right before the order goes out.
    pub fn check(&self, balance: f64, open_positions: usize, candidate: f64) -> Result<(), RiskError> {
        let l = &self.limits;
        if !candidate.is_finite() || candidate <= 0.0 {
            return Err(RiskError::InvalidSize(candidate));
        }
        if open_positions >= l.max_positions {
            return Err(RiskError::MaxPositions { open: open_positions, max: l.max_positions });
        }
        if !balance.is_finite() || candidate > balance {
            return Err(RiskError::InsufficientBalance { balance, candidate });
        }
        let exposure = candidate * (open_positions as f64 + 1.0);
        let ceiling = balance * l.account_risk_fraction;
        if exposure > ceiling {
            return Err(RiskError::AggregateRisk { exposure, ceiling });
        }
        Ok(())
    }

    pub fn is_risk_acceptable(&self, balance: f64, open_positions: usize, candidate: f64) -> bool {
        self.check(balance, open_positions, candidate).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskLimits::default())
    }

    #[test]
    fn size_is_min_of_all_caps() {
        let e = engine();
        // base 20 wins on a large balance
        assert_eq!(e.size_order(10_000.0, 0), 20.0);
        // balance 100: position cap 10
        assert_eq!(e.size_order(100.0, 0), 10.0);
        // account cap split across 3 slots: 100 * 0.5 / 3
        let mut l = RiskLimits::default();
        l.base_order_size = 1000.0;
        l.max_order_size = 1000.0;
        l.position_risk_fraction = 1.0;
        let e = RiskEngine::new(l);
        assert!((e.size_order(100.0, 2) - 50.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn size_never_exceeds_hard_caps() {
        let l = RiskLimits { base_order_size: 500.0, max_order_size: 75.0, ..RiskLimits::default() };
        let e = RiskEngine::new(l.clone());
        for balance in [0.0, 1.0, 33.3, 250.0, 999.0, 1e6] {
            for open in 0..6 {
                let s = e.size_order(balance, open);
                let bound = l.max_order_size.min(balance * l.position_risk_fraction).min(balance * l.balance_utilization);
                assert!(s <= bound + 1e-12, "balance={balance} open={open} size={s} bound={bound}");
                assert!(s >= 0.0);
            }
        }
    }

    #[test]
    fn sizing_failure_falls_back_to_base() {
        let e = engine();
        assert_eq!(e.size_order(f64::NAN, 0), 20.0);
        assert_eq!(e.size_order(-5.0, 1), 20.0);
    }

    #[test]
    fn gate_rejects_each_violation() {
        let e = engine();
        assert!(e.is_risk_acceptable(1000.0, 0, 20.0));
        assert_eq!(e.check(1000.0, 3, 20.0), Err(RiskError::MaxPositions { open: 3, max: 3 }));
        assert!(matches!(e.check(10.0, 0, 20.0), Err(RiskError::InsufficientBalance { .. })));
        assert!(matches!(e.check(100.0, 2, 20.0), Err(RiskError::AggregateRisk { .. })));
        assert!(matches!(e.check(100.0, 0, 0.0), Err(RiskError::InvalidSize(_))));
    }
}
