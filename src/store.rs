// ===============================
// src/store.rs
// ===============================
//
// External collaborators the trading core talks to:
// - PositionStore : persistence (positions are archived on close, never deleted)
// - Notifier      : fire-and-forget outbound notifications
//
// In-process implementations are provided; real backends plug in behind the traits.
//
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::Position;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("position {symbol}/{order_id} not found")]
    NotFound { symbol: String, order_id: u64 },
    #[error("storage backend: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub context: String,
    pub symbol: Option<String>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(context: &str, symbol: Option<&str>, message: impl ToString) -> Self {
        Self {
            at: Utc::now(),
            context: context.to_string(),
            symbol: symbol.map(String::from),
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn save_position(&self, position: &Position) -> Result<(), StoreError>;
    /// Keyed by symbol + entry order id.
    async fn update_position(&self, symbol: &str, order_id: u64, position: &Position) -> Result<(), StoreError>;
    async fn get_active_positions(&self) -> Result<Vec<Position>, StoreError>;
    async fn get_position_by_symbol(&self, symbol: &str) -> Result<Option<Position>, StoreError>;
    /// Positions closed at or after `since`, oldest first.
    async fn get_closed_since(&self, since: DateTime<Utc>) -> Result<Vec<Position>, StoreError>;
    async fn save_error(&self, record: ErrorRecord) -> Result<(), StoreError>;
}

/// In-memory store: keeps every position ever opened plus the error log.
#[derive(Default)]
pub struct MemoryStore {
    positions: Mutex<Vec<Position>>,
    errors: Mutex<Vec<ErrorRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn all_positions(&self) -> Vec<Position> {
        self.positions.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("lock poisoned".into())
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn save_position(&self, position: &Position) -> Result<(), StoreError> {
        self.positions.lock().map_err(poisoned)?.push(position.clone());
        Ok(())
    }

    async fn update_position(&self, symbol: &str, order_id: u64, position: &Position) -> Result<(), StoreError> {
        let mut all = self.positions.lock().map_err(poisoned)?;
        match all.iter_mut().rev().find(|p| p.symbol == symbol && p.entry_order_id == order_id) {
            Some(slot) => {
                *slot = position.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound { symbol: symbol.to_string(), order_id }),
        }
    }

    async fn get_active_positions(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.positions.lock().map_err(poisoned)?.iter().filter(|p| p.is_open()).cloned().collect())
    }

    async fn get_position_by_symbol(&self, symbol: &str) -> Result<Option<Position>, StoreError> {
        let all = self.positions.lock().map_err(poisoned)?;
        let mut matching = all.iter().rev().filter(|p| p.symbol == symbol);
        let latest = matching.clone().next().cloned();
        Ok(matching.find(|p| p.is_open()).cloned().or(latest))
    }

    async fn get_closed_since(&self, since: DateTime<Utc>) -> Result<Vec<Position>, StoreError> {
        let all = self.positions.lock().map_err(poisoned)?;
        let mut closed: Vec<Position> =
            all.iter().filter(|p| p.exit_time.map_or(false, |t| t >= since)).cloned().collect();
        closed.sort_by_key(|p| p.exit_time);
        Ok(closed)
    }

    async fn save_error(&self, record: ErrorRecord) -> Result<(), StoreError> {
        self.errors.lock().map_err(poisoned)?.push(record);
        Ok(())
    }
}

// ---- notifications ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    Listing,
    Delisting,
    PositionOpened,
    ProtectionAttached,
    PositionClosed,
    EntryBlocked,
    Error,
    EnvironmentSwitched,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event: NotifyEvent,
    pub at: DateTime<Utc>,
    pub payload: Value,
}

/// Must never block or fail the caller.
pub trait Notifier: Send + Sync {
    fn send(&self, event: NotifyEvent, payload: Value);
}

/// Bounded queue in front of the delivery task; when full the newest
/// notification is dropped and logged.
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn send(&self, event: NotifyEvent, payload: Value) {
        let n = Notification { event, at: Utc::now(), payload };
        if let Err(e) = self.tx.try_send(n) {
            warn!(?event, error = %e, "notification dropped");
        }
    }
}

/// Delivery stand-in: writes every notification to the log.
pub async fn run_log_sink(mut rx: mpsc::Receiver<Notification>) {
    while let Some(n) = rx.recv().await {
        info!(event = ?n.event, payload = %n.payload, "notify");
    }
}
