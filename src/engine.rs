// ===============================
// src/engine.rs
// ===============================
//
// Context object wiring the components together (no ambient globals):
//
//   monitor --(bounded mpsc, blocks when full)--> trader <--(mpsc + oneshot)-- EngineClient
//
// The trader task is the single writer of the environment manager and the
// open-position map: listing handling, control-plane commands and the periodic
// reconciliation pass are all serialized through its select loop.
//
use ahash::AHashSet as HashSet;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::domain::{DelistingNotice, ListingEvent, MarketEvent, Position};
use crate::environment::EnvironmentManager;
use crate::error::{EngineError, EntryError};
use crate::feed::{self, MonitorConfig, MonitorHandle, MonitorHealth};
use crate::listing::ListingFilters;
use crate::positions::{BuyResult, LifecycleManager, ProtectionConfig, ProtectionResult};
use crate::risk::RiskEngine;
use crate::store::{Notifier, NotifyEvent, PositionStore};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub quote_asset: String,
    pub monitor: MonitorConfig,
    pub filters: ListingFilters,
    pub protection: ProtectionConfig,
    pub reconcile_interval: Duration,
    pub event_queue: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub environment: String,
    pub real_money: bool,
    pub simulated: bool,
    pub healthy: bool,
    pub quote_asset: String,
    pub balance: f64,
    pub open_positions: Vec<Position>,
    pub listings_handled: usize,
    pub daily_loss: Option<f64>,
    pub monitor: MonitorHealth,
}

enum Command {
    Status(oneshot::Sender<EngineStatus>),
    ExecuteBuy(ListingEvent, oneshot::Sender<Result<BuyResult, EngineError>>),
    Protect(BuyResult, oneshot::Sender<Result<ProtectionResult, EngineError>>),
    Close(String, oneshot::Sender<Result<Position, EngineError>>),
    Switch(String, oneshot::Sender<Result<String, EngineError>>),
}

/// Cheap, cloneable control-plane entry point.
#[derive(Clone)]
pub struct EngineClient {
    tx: mpsc::Sender<Command>,
}

impl EngineClient {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).await.map_err(|_| EngineError::NotRunning)?;
        rx.await.map_err(|_| EngineError::NotRunning)
    }

    pub async fn get_status(&self) -> Result<EngineStatus, EngineError> {
        self.call(Command::Status).await
    }

    pub async fn execute_buy(&self, listing: ListingEvent) -> Result<BuyResult, EngineError> {
        self.call(|tx| Command::ExecuteBuy(listing, tx)).await?
    }

    pub async fn set_take_profit_stop_loss(&self, buy: BuyResult) -> Result<ProtectionResult, EngineError> {
        self.call(|tx| Command::Protect(buy, tx)).await?
    }

    pub async fn close_position(&self, symbol: &str) -> Result<Position, EngineError> {
        let symbol = symbol.to_string();
        self.call(|tx| Command::Close(symbol, tx)).await?
    }

    /// Returns the name of the environment active afterwards.
    pub async fn switch_environment(&self, name: &str) -> Result<String, EngineError> {
        let name = name.to_string();
        self.call(|tx| Command::Switch(name, tx)).await?
    }
}

struct Trader {
    env: EnvironmentManager,
    lifecycle: LifecycleManager,
    notifier: Arc<dyn Notifier>,
    monitor: watch::Receiver<MonitorHealth>,
    quote_asset: String,
    // listing symbols already handled end-to-end; cleared on environment switch
    processed: HashSet<String>,
}

impl Trader {
    async fn run(
        mut self,
        reconcile_every: Duration,
        mut events: mpsc::Receiver<MarketEvent>,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = interval(reconcile_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(environment = %self.env.name(), open = self.lifecycle.open_count(), "trader started");
        loop {
            select! {
                biased;
                _ = shutdown.changed() => break,
                // queued market events drain before control-plane commands
                Some(ev) = events.recv() => self.on_event(ev).await,
                Some(cmd) = commands.recv() => self.on_command(cmd).await,
                _ = tick.tick() => {
                    let errors = self.lifecycle.reconcile_all().await;
                    if !errors.is_empty() {
                        debug!(failed = errors.len(), "reconciliation pass finished with errors");
                    }
                }
            }
        }
        info!(open = self.lifecycle.open_count(), "trader stopped");
    }

    async fn on_event(&mut self, ev: MarketEvent) {
        match ev {
            MarketEvent::Listing(l) => self.on_listing(l).await,
            MarketEvent::Delisting(d) => self.on_delisting(d),
        }
    }

    async fn on_listing(&mut self, ev: ListingEvent) {
        if !self.processed.insert(ev.symbol.clone()) {
            debug!(symbol = %ev.symbol, "listing already handled");
            return;
        }
        self.notifier.send(NotifyEvent::Listing, json!(ev));
        if let Err(e) = self.env.admit_listing(&ev) {
            warn!(symbol = %ev.symbol, reason = %e, "listing not admitted");
            self.notifier.send(NotifyEvent::EntryBlocked, json!({ "symbol": ev.symbol, "reason": e.to_string(), "kind": e.label() }));
            return;
        }
        // failures are logged, recorded and notified inside the lifecycle manager
        if let Ok(buy) = self.lifecycle.execute_buy(&ev).await {
            let _ = self.lifecycle.set_take_profit_stop_loss(&buy).await;
        }
    }

    fn on_delisting(&mut self, d: DelistingNotice) {
        let held = self.lifecycle.is_open(&d.symbol);
        if held {
            warn!(symbol = %d.symbol, "held symbol delisted, position stays under reconciliation");
        } else {
            info!(symbol = %d.symbol, "delisting noticed");
        }
        self.notifier.send(NotifyEvent::Delisting, json!({ "symbol": d.symbol, "held": held, "detected_at": d.detected_at }));
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::ExecuteBuy(listing, reply) => {
                if let Err(e) = self.env.ensure_healthy() {
                    warn!(symbol = %listing.symbol, reason = %e, "manual buy refused");
                    let _ = reply.send(Err(e.into()));
                    return;
                }
                self.processed.insert(listing.symbol.clone());
                let res = self.lifecycle.execute_buy(&listing).await.map_err(EngineError::from);
                let _ = reply.send(res);
            }
            Command::Protect(buy, reply) => {
                let res = self.lifecycle.set_take_profit_stop_loss(&buy).await.map_err(EngineError::from);
                let _ = reply.send(res);
            }
            Command::Close(symbol, reply) => {
                let res = self.lifecycle.close_position(&symbol).await;
                if let Err(e) = &res {
                    warn!(%symbol, error = %e, "manual close failed");
                }
                let _ = reply.send(res);
            }
            Command::Switch(name, reply) => {
                let _ = reply.send(self.switch(&name).await);
            }
        }
    }

    async fn switch(&mut self, name: &str) -> Result<String, EngineError> {
        let from = self.env.name().to_string();
        let active = self.env.switch(name, self.lifecycle.open_count())?;
        let gateway = active.gateway.clone();
        let to = active.profile.name.clone();
        self.lifecycle.rebind(gateway, RiskEngine::new(self.env.risk_limits()), &to);
        self.processed.clear();
        if let Err(e) = self.lifecycle.refresh_balance().await {
            warn!(environment = %to, error = %e, "balance unavailable after switch");
        }
        self.notifier.send(NotifyEvent::EnvironmentSwitched, json!({ "from": from, "to": to }));
        Ok(to)
    }

    fn status(&self) -> EngineStatus {
        let active = self.env.active();
        EngineStatus {
            environment: active.profile.name.clone(),
            real_money: active.profile.is_real_money,
            simulated: self.env.is_simulated(),
            healthy: self.env.is_healthy(),
            quote_asset: self.quote_asset.clone(),
            balance: self.lifecycle.balance(),
            open_positions: self.lifecycle.open_positions(),
            listings_handled: self.processed.len(),
            daily_loss: active.policy.as_ref().map(|p| p.lost_24h(Utc::now())),
            monitor: self.monitor.borrow().clone(),
        }
    }
}

/// The trader half of the engine, without the market monitor.
fn spawn_trader(
    trader: Trader,
    reconcile_every: Duration,
    events: mpsc::Receiver<MarketEvent>,
    shutdown: watch::Receiver<bool>,
) -> (EngineClient, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let join = tokio::spawn(trader.run(reconcile_every, events, rx, shutdown));
    (EngineClient { tx }, join)
}

pub struct Engine {
    cfg: EngineConfig,
    env: EnvironmentManager,
    store: Arc<dyn PositionStore>,
    notifier: Arc<dyn Notifier>,
}

impl Engine {
    pub fn new(cfg: EngineConfig, env: EnvironmentManager, store: Arc<dyn PositionStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { cfg, env, store, notifier }
    }

    /// Resume stored positions and recent losses, then launch the monitor and the trader.
    pub async fn start(self) -> Result<EngineHandle, EngineError> {
        let Engine { cfg, env, store, notifier } = self;
        let now = Utc::now();
        let closed = store.get_closed_since(now - chrono::Duration::hours(24)).await?;
        let seeded = env.seed_losses(&closed, now);
        if seeded > 0 {
            info!(seeded, "recent losses restored into safety policies");
        }
        let active = env.active().clone();
        let mut lifecycle = LifecycleManager::new(
            active.gateway,
            RiskEngine::new(env.risk_limits()),
            cfg.protection.clone(),
            &cfg.quote_asset,
            &active.profile.name,
            store,
            notifier.clone(),
        );
        let resumed = lifecycle.load().await?;
        match lifecycle.refresh_balance().await {
            Ok(b) => info!(balance = b, asset = %cfg.quote_asset, "balance loaded"),
            Err(e) if e.is_fatal() => error!(critical = true, error = %e, "balance unavailable, environment unhealthy"),
            Err(e) => warn!(error = %e, "balance unavailable at start"),
        }

        let (events_tx, events_rx) = mpsc::channel(cfg.event_queue.max(1));
        let monitor = feed::spawn(cfg.monitor.clone(), cfg.filters.clone(), env.venue_rx(), events_tx);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let trader = Trader {
            env,
            lifecycle,
            notifier,
            monitor: monitor.health_rx(),
            quote_asset: cfg.quote_asset.clone(),
            processed: HashSet::new(),
        };
        let (client, join) = spawn_trader(trader, cfg.reconcile_interval, events_rx, shutdown_rx);
        info!(resumed, "engine started");
        Ok(EngineHandle { client, shutdown, trader: join, monitor })
    }
}

pub struct EngineHandle {
    client: EngineClient,
    shutdown: watch::Sender<bool>,
    trader: JoinHandle<()>,
    monitor: MonitorHandle,
}

impl EngineHandle {
    pub fn client(&self) -> EngineClient { self.client.clone() }

    pub fn monitor_health(&self) -> MonitorHealth { self.monitor.health() }

    /// Monitor first so no new events arrive, then the trader.
    pub async fn stop(self) {
        self.monitor.stop().await;
        let _ = self.shutdown.send(true);
        if let Err(e) = self.trader.await {
            error!(?e, "trader task ended abnormally");
        }
        info!("engine stopped");
    }
}
