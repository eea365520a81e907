// ===============================
// src/error.rs
// ===============================
use std::time::Duration;
use thiserror::Error;

use crate::domain::{FilterViolation, OrderStatus};
use crate::risk::RiskError;

/// Binance error codes the engine branches on.
pub mod codes {
    /// Unknown order sent (already filled / cancelled).
    pub const UNKNOWN_ORDER: i64 = -2011;
    /// Order does not exist.
    pub const NO_SUCH_ORDER: i64 = -2013;
    /// Invalid signature.
    pub const BAD_SIGNATURE: i64 = -1022;
    /// API-key format invalid.
    pub const BAD_API_KEY_FORMAT: i64 = -2014;
    /// Invalid API-key, IP, or permissions for action.
    pub const REJECTED_MBX_KEY: i64 = -2015;
    /// Timestamp outside recvWindow.
    pub const TIMESTAMP_OUTSIDE_WINDOW: i64 = -1021;
    /// New order rejected (insufficient balance, filter failure, OCO unsupported ...).
    pub const NEW_ORDER_REJECTED: i64 = -2010;
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SafetyViolation {
    #[error("order notional {notional:.4} exceeds cap {cap:.4}")]
    NotionalCap { notional: f64, cap: f64 },
    #[error("daily loss ceiling {ceiling:.4} would be breached (lost {lost:.4}, candidate risk {risk:.4})")]
    DailyLossCeiling { ceiling: f64, lost: f64, risk: f64 },
}

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Network failure, timeout, 5xx or exhausted rate-limit retries.
    #[error("transient exchange error: {0}")]
    Transient(String),
    /// HTTP 418. Never retried.
    #[error("IP banned by exchange (418), retry after {retry_after:?}")]
    IpBanned { retry_after: Option<Duration> },
    /// Signature or key refused. Never retried.
    #[error("credentials rejected ({code}): {msg}")]
    Credentials { code: i64, msg: String },
    /// Any other 4xx; carries the exchange's numeric code.
    #[error("rejected by exchange (http {status}, code {code}): {msg}")]
    Rejected { status: u16, code: i64, msg: String },
    #[error("filter violation: {0}")]
    Filter(#[from] FilterViolation),
    #[error("blocked by safety policy: {0}")]
    Blocked(#[from] SafetyViolation),
    #[error("bad exchange payload: {0}")]
    Decode(String),
    #[error("request weight {cost} exceeds the budget limit {limit}")]
    WeightTooLarge { cost: u32, limit: u32 },
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }

    /// Ban / credential failures: surface as critical and mark the environment unhealthy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::IpBanned { .. } | ExchangeError::Credentials { .. })
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            ExchangeError::Rejected { code, .. } | ExchangeError::Credentials { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The order is already gone on the exchange side.
    pub fn is_unknown_order(&self) -> bool {
        matches!(self.code(), Some(codes::UNKNOWN_ORDER) | Some(codes::NO_SUCH_ORDER))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExchangeError::Transient(_) => "transient",
            ExchangeError::IpBanned { .. } => "ip_banned",
            ExchangeError::Credentials { .. } => "credentials",
            ExchangeError::Rejected { .. } => "rejected",
            ExchangeError::Filter(_) => "filter",
            ExchangeError::Blocked(_) => "blocked",
            ExchangeError::Decode(_) => "decode",
            ExchangeError::WeightTooLarge { .. } => "weight",
            ExchangeError::Unsupported(_) => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown environment profile '{0}'")]
    UnknownProfile(String),
    #[error("profile '{profile}': missing credential {field}")]
    MissingCredential { profile: String, field: &'static str },
    #[error("profile '{profile}': credential {field} shorter than {min} characters")]
    CredentialTooShort { profile: String, field: &'static str, min: usize },
    #[error("profile '{profile}': {field} must use {scheme}:// (got '{url}')")]
    InsecureEndpoint { profile: String, field: &'static str, scheme: &'static str, url: String },
    #[error("profile '{profile}': {reason}")]
    Invalid { profile: String, reason: String },
    #[error("cannot switch environment while {0} position(s) are open")]
    OpenPositions(usize),
}

#[derive(Debug, Clone, Error)]
#[error("reconciliation of {symbol} failed: {source}")]
pub struct ReconcileError {
    pub symbol: String,
    #[source]
    pub source: ExchangeError,
}

/// Why a listing did not become a position. Returned, never thrown past the trader loop.
#[derive(Debug, Clone, Error)]
pub enum EntryError {
    #[error("position already open for {0}")]
    AlreadyOpen(String),
    #[error("risk check failed: {0}")]
    Risk(#[from] RiskError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("entry for {symbol} not filled (status {status:?})")]
    NotFilled { symbol: String, status: OrderStatus },
    #[error("environment unhealthy, entries paused")]
    Unhealthy,
    #[error("24h quote volume {volume} below minimum {min}")]
    BelowMinVolume { volume: f64, min: f64 },
}

impl EntryError {
    pub fn label(&self) -> &'static str {
        match self {
            EntryError::AlreadyOpen(_) => "already_open",
            EntryError::Risk(_) => "risk",
            EntryError::Exchange(e) => e.label(),
            EntryError::NotFilled { .. } => "not_filled",
            EntryError::Unhealthy => "unhealthy",
            EntryError::BelowMinVolume { .. } => "min_volume",
        }
    }
}

/// Control-plane facing error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error("storage: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("no open position for {0}")]
    NoPosition(String),
    #[error("engine is not running")]
    NotRunning,
}
