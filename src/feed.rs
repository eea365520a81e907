// ===============================
// src/feed.rs
// ===============================
//
// Market Stream Monitor:
// - push       : Binance WS `!ticker@arr` (all-market 24h tickers, ~1s cadence)
// - heartbeat  : client pings + liveness deadline; a silent stream is degraded and dropped
// - reconnect  : exponential backoff + jitter, bounded attempt budget
// - fallback   : once the budget is exhausted, poll full snapshots on a fixed interval
//
// Both transports feed the same KnownSymbols, so listing/delisting behaviour is identical.
//
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, sleep, sleep_until, timeout, Duration, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::binance::{Ticker24h, WsTicker};
use crate::client::ExchangeClient;
use crate::domain::MarketEvent;
use crate::error::ExchangeError;
use crate::listing::{Detection, KnownSymbols, ListingFilters};
use crate::metrics::{
    DELISTINGS, KNOWN_SYMBOLS, LISTINGS, MONITOR_STATE, MONITOR_TRANSPORT, WS_LAST_EVENT_TS,
    WS_RECONNECTS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorState { Disconnected, Connecting, Connected, Degraded, Terminated }

impl MonitorState {
    fn gauge(&self) -> i64 {
        match self {
            MonitorState::Disconnected => 0,
            MonitorState::Connecting => 1,
            MonitorState::Connected => 2,
            MonitorState::Degraded => 3,
            MonitorState::Terminated => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transport { Push, Polling }

#[derive(Debug, Clone, Serialize)]
pub struct MonitorHealth {
    pub venue: String,
    pub state: MonitorState,
    pub transport: Transport,
    pub known_symbols: usize,
    pub reconnect_attempts: u32,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl Default for MonitorHealth {
    fn default() -> Self {
        Self {
            venue: String::new(),
            state: MonitorState::Disconnected,
            transport: Transport::Push,
            known_symbols: 0,
            reconnect_attempts: 0,
            last_event_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub snapshot_refresh: Duration,
}

/// Full market snapshot provider (tradable pairs with their 24h stats).
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<Ticker24h>, ExchangeError>;
}

#[async_trait]
impl SnapshotSource for ExchangeClient {
    /// 24h tickers restricted to symbols `exchangeInfo` reports as TRADING.
    async fn snapshot(&self) -> Result<Vec<Ticker24h>, ExchangeError> {
        let info = self.exchange_info().await?;
        let tickers = self.ticker_24h_all().await?;
        let mut by_symbol: ahash::AHashMap<String, Ticker24h> =
            tickers.into_iter().map(|t| (t.symbol.clone(), t)).collect();
        Ok(info
            .symbols
            .iter()
            .filter(|s| s.is_trading())
            .map(|s| {
                by_symbol.remove(&s.symbol).unwrap_or_else(|| Ticker24h {
                    symbol: s.symbol.clone(),
                    last_price: 0.0,
                    volume: 0.0,
                    quote_volume: 0.0,
                    price_change_percent: 0.0,
                })
            })
            .collect())
    }
}

/// What the monitor is pointed at; follows the active environment.
#[derive(Clone)]
pub struct Venue {
    pub profile: String,
    pub stream_url: String,
    pub source: Arc<dyn SnapshotSource>,
}

enum Exit { Stop, VenueChanged, Dropped, Exhausted }

// a dropped venue sender means the owner is gone: stop instead of spinning
fn venue_exit(r: Result<(), watch::error::RecvError>) -> Exit {
    if r.is_ok() { Exit::VenueChanged } else { Exit::Stop }
}

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    health: watch::Receiver<MonitorHealth>,
}

impl MonitorHandle {
    pub fn health(&self) -> MonitorHealth { self.health.borrow().clone() }
    pub fn health_rx(&self) -> watch::Receiver<MonitorHealth> { self.health.clone() }

    /// Cancel timers, release the connection, and wait for the task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(?e, "monitor task ended abnormally");
        }
    }
}

pub struct MarketMonitor {
    cfg: MonitorConfig,
    filters: ListingFilters,
    known: KnownSymbols,
    events: mpsc::Sender<MarketEvent>,
    health: watch::Sender<MonitorHealth>,
    // read-only view of the shutdown flag, used to discard late results
    stopping: watch::Receiver<bool>,
}

/// Spawn the monitor task.
pub fn spawn(
    cfg: MonitorConfig,
    filters: ListingFilters,
    venue_rx: watch::Receiver<Venue>,
    events: mpsc::Sender<MarketEvent>,
) -> MonitorHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (health_tx, health_rx) = watch::channel(MonitorHealth::default());
    let monitor = MarketMonitor {
        cfg,
        known: KnownSymbols::new(filters.clone()),
        filters,
        events,
        health: health_tx,
        stopping: shutdown_rx.clone(),
    };
    let join = tokio::spawn(monitor.run(shutdown_rx, venue_rx));
    MonitorHandle { shutdown, join, health: health_rx }
}

impl MarketMonitor {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>, mut venue_rx: watch::Receiver<Venue>) {
        loop {
            let venue = venue_rx.borrow_and_update().clone();
            // a different venue has a different symbol universe
            self.known = KnownSymbols::new(self.filters.clone());
            self.health.send_modify(|h| {
                h.venue = venue.profile.clone();
                h.reconnect_attempts = 0;
            });
            info!(venue = %venue.profile, stream = %venue.stream_url, "market monitor starting");

            let mut exit = self.run_push(&venue, &mut shutdown, &mut venue_rx).await;
            if matches!(exit, Exit::Exhausted) {
                exit = self.run_polling(&venue, &mut shutdown, &mut venue_rx).await;
            }
            match exit {
                Exit::VenueChanged => continue,
                _ => break,
            }
        }
        self.set_state(MonitorState::Disconnected);
        info!("market monitor stopped");
    }

    fn set_state(&self, state: MonitorState) {
        MONITOR_STATE.set(state.gauge());
        self.health.send_modify(|h| h.state = state);
    }

    fn set_transport(&self, transport: Transport) {
        MONITOR_TRANSPORT.with_label_values(&["push"]).set((transport == Transport::Push) as i64);
        MONITOR_TRANSPORT.with_label_values(&["polling"]).set((transport == Transport::Polling) as i64);
        self.health.send_modify(|h| h.transport = transport);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        let base = self.cfg.reconnect_delay.saturating_mul(1u32 << shift).min(self.cfg.reconnect_max_delay);
        let jitter_cap = (self.cfg.reconnect_delay.as_millis() as u64 / 4).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
    }

    async fn run_push(
        &mut self,
        venue: &Venue,
        shutdown: &mut watch::Receiver<bool>,
        venue_rx: &mut watch::Receiver<Venue>,
    ) -> Exit {
        self.set_transport(Transport::Push);
        let ws_url = format!("{}/!ticker@arr", venue.stream_url.trim_end_matches('/'));
        if let Err(e) = Url::parse(&ws_url) {
            error!(?e, %ws_url, "bad ws url");
            self.set_state(MonitorState::Terminated);
            return Exit::Exhausted;
        }

        let mut attempt: u32 = 0;
        loop {
            self.set_state(MonitorState::Connecting);
            info!(%ws_url, attempt, "connecting ticker stream");
            let connecting = timeout(self.cfg.connect_timeout, connect_async(ws_url.as_str()));
            let connected = select! {
                _ = shutdown.changed() => return Exit::Stop,
                r = venue_rx.changed() => return venue_exit(r),
                r = connecting => r,
            };
            match connected {
                Ok(Ok((ws, _resp))) => {
                    info!(venue = %venue.profile, "ticker stream connected");
                    attempt = 0; // reset backoff
                    self.health.send_modify(|h| h.reconnect_attempts = 0);
                    self.set_state(MonitorState::Connected);
                    self.refresh(venue).await;
                    match self.consume(ws, venue, shutdown, venue_rx).await {
                        Exit::Dropped => {}
                        other => return other,
                    }
                    info!("ticker stream disconnected, will reconnect");
                }
                Ok(Err(e)) => warn!(?e, "ticker stream connect failed"),
                Err(_) => warn!(timeout_ms = self.cfg.connect_timeout.as_millis() as u64, "ticker stream connect timed out"),
            }
            self.set_state(MonitorState::Disconnected);

            attempt = attempt.saturating_add(1);
            self.health.send_modify(|h| h.reconnect_attempts = attempt);
            if attempt > self.cfg.reconnect_attempts {
                error!(attempts = attempt - 1, "reconnect budget exhausted, switching to polling fallback");
                self.set_state(MonitorState::Terminated);
                return Exit::Exhausted;
            }
            WS_RECONNECTS.inc();
            let wait = self.backoff(attempt);
            debug!(wait_ms = wait.as_millis() as u64, attempt, "reconnect backoff");
            select! {
                _ = shutdown.changed() => return Exit::Stop,
                r = venue_rx.changed() => return venue_exit(r),
                _ = sleep(wait) => {}
            }
        }
    }

    async fn consume(
        &mut self,
        ws: Ws,
        venue: &Venue,
        shutdown: &mut watch::Receiver<bool>,
        venue_rx: &mut watch::Receiver<Venue>,
    ) -> Exit {
        let (mut write, mut read) = ws.split();
        let mut ping = interval(self.cfg.heartbeat_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut refresh = interval(self.cfg.snapshot_refresh);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.tick().await;
        let mut last_seen = Instant::now();

        let exit = loop {
            let deadline = last_seen + self.cfg.heartbeat_timeout;
            select! {
                _ = shutdown.changed() => break Exit::Stop,
                r = venue_rx.changed() => break venue_exit(r),
                _ = sleep_until(deadline) => {
                    self.set_state(MonitorState::Degraded);
                    warn!(timeout_ms = self.cfg.heartbeat_timeout.as_millis() as u64, "no heartbeat from ticker stream, forcing reconnect");
                    break Exit::Dropped;
                }
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        warn!(?e, "heartbeat ping failed");
                        break Exit::Dropped;
                    }
                }
                _ = refresh.tick() => self.refresh(venue).await,
                frame = read.next() => match frame {
                    Some(Ok(msg)) => {
                        last_seen = Instant::now();
                        WS_LAST_EVENT_TS.set(Utc::now().timestamp());
                        match msg {
                            Message::Text(txt) => self.on_text(&txt).await,
                            Message::Close(reason) => {
                                info!(?reason, "ticker stream closed by server");
                                break Exit::Dropped;
                            }
                            // ping/pong/binary only count as liveness
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        error!(?e, "ws read error");
                        break Exit::Dropped;
                    }
                    None => break Exit::Dropped,
                },
            }
        };
        // release the connection before returning
        let _ = timeout(Duration::from_secs(1), write.close()).await;
        exit
    }

    async fn run_polling(
        &mut self,
        venue: &Venue,
        shutdown: &mut watch::Receiver<bool>,
        venue_rx: &mut watch::Receiver<Venue>,
    ) -> Exit {
        self.set_transport(Transport::Polling);
        warn!(interval_ms = self.cfg.poll_interval.as_millis() as u64, "market monitor running on polling fallback");
        let mut tick = interval(self.cfg.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = shutdown.changed() => return Exit::Stop,
                r = venue_rx.changed() => return venue_exit(r),
                _ = tick.tick() => self.refresh(venue).await,
            }
        }
    }

    /// Pull a full snapshot and diff it against the known set.
    async fn refresh(&mut self, venue: &Venue) {
        match venue.source.snapshot().await {
            Ok(tickers) => {
                let seeding = !self.known.is_seeded();
                let detection = self.known.apply(&tickers, true);
                if seeding {
                    info!(known = self.known.len(), "known-symbol set seeded");
                }
                self.emit(detection).await;
            }
            Err(e) => warn!(error = %e, "market snapshot failed"),
        }
    }

    async fn on_text(&mut self, txt: &str) {
        match parse_tickers(txt) {
            Some(tickers) => {
                let detection = self.known.apply(&tickers, false);
                self.emit(detection).await;
            }
            None => debug!(len = txt.len(), "ignoring non-ticker frame"),
        }
    }

    async fn emit(&mut self, detection: Detection) {
        KNOWN_SYMBOLS.set(self.known.len() as i64);
        let known = self.known.len();
        self.health.send_modify(|h| h.known_symbols = known);
        if *self.stopping.borrow() {
            // results of in-flight work are discarded once stop was requested
            return;
        }
        for ev in detection.listings {
            LISTINGS.inc();
            info!(symbol = %ev.symbol, price = ev.price, quote_volume = ev.quote_volume, "new listing detected");
            let at = ev.detected_at;
            self.health.send_modify(|h| h.last_event_at = Some(at));
            // listings are rare and must not be lost: block on a full queue
            if self.events.send(MarketEvent::Listing(ev)).await.is_err() {
                warn!("market event receiver gone");
            }
        }
        for ev in detection.delistings {
            DELISTINGS.inc();
            info!(symbol = %ev.symbol, "symbol delisted");
            if self.events.send(MarketEvent::Delisting(ev)).await.is_err() {
                warn!("market event receiver gone");
            }
        }
    }
}

/// Decode a `!ticker@arr` frame (array) or a single ticker object.
pub fn parse_tickers(txt: &str) -> Option<Vec<Ticker24h>> {
    if let Ok(arr) = serde_json::from_str::<Vec<WsTicker>>(txt) {
        return Some(arr.into_iter().map(Ticker24h::from).collect());
    }
    serde_json::from_str::<WsTicker>(txt).ok().map(|t| vec![t.into()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn t(symbol: &str) -> Ticker24h {
        Ticker24h { symbol: symbol.into(), last_price: 2.0, volume: 100.0, quote_volume: 200.0, price_change_percent: 12.0 }
    }

    struct Scripted(Mutex<VecDeque<Vec<Ticker24h>>>);

    #[async_trait]
    impl SnapshotSource for Scripted {
        async fn snapshot(&self) -> Result<Vec<Ticker24h>, ExchangeError> {
            let mut q = self.0.lock().unwrap();
            match q.len() {
                0 => Err(ExchangeError::Transient("empty script".into())),
                1 => Ok(q[0].clone()),
                _ => Ok(q.pop_front().unwrap()),
            }
        }
    }

    fn cfg() -> MonitorConfig {
        MonitorConfig {
            reconnect_attempts: 1,
            reconnect_delay: Duration::from_millis(5),
            reconnect_max_delay: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(150),
            connect_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(20),
            snapshot_refresh: Duration::from_secs(60),
        }
    }

    fn venue(stream_url: &str, snaps: Vec<Vec<Ticker24h>>) -> Venue {
        Venue {
            profile: "testnet".into(),
            stream_url: stream_url.into(),
            source: Arc::new(Scripted(Mutex::new(snaps.into()))),
        }
    }

    async fn next(rx: &mut mpsc::Receiver<MarketEvent>) -> MarketEvent {
        timeout(Duration::from_secs(3), rx.recv()).await.expect("event in time").expect("channel open")
    }

    #[test]
    fn parses_array_and_single_frames() {
        let arr = r#"[{"e":"24hrTicker","s":"NEWUSDT","c":"1.5","v":"10","q":"15","P":"3.1"}]"#;
        let one = r#"{"e":"24hrTicker","s":"NEWUSDT","c":"1.5","v":"10","q":"15","P":"3.1"}"#;
        assert_eq!(parse_tickers(arr).unwrap()[0].quote_volume, 15.0);
        assert_eq!(parse_tickers(one).unwrap()[0].symbol, "NEWUSDT");
        assert!(parse_tickers(r#"{"result":null,"id":1}"#).is_none());
    }

    #[tokio::test]
    async fn exhausted_reconnects_fall_back_to_polling_with_same_diff() {
        // nothing listens on port 1: every connect fails fast
        let v = venue(
            "ws://127.0.0.1:1/ws",
            vec![
                vec![t("BTCUSDT"), t("OLDUSDT")],
                vec![t("BTCUSDT"), t("OLDUSDT"), t("NEWUSDT")],
                vec![t("BTCUSDT"), t("NEWUSDT")],
            ],
        );
        let (_venue_tx, venue_rx) = watch::channel(v);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn(cfg(), ListingFilters::new("USDT"), venue_rx, tx);

        match next(&mut rx).await {
            MarketEvent::Listing(l) => assert_eq!(l.symbol, "NEWUSDT"),
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut rx).await {
            MarketEvent::Delisting(d) => assert_eq!(d.symbol, "OLDUSDT"),
            other => panic!("unexpected {other:?}"),
        }
        // the last snapshot repeats forever: no further events
        assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());

        let h = handle.health();
        assert_eq!(h.transport, Transport::Polling);
        assert_eq!(h.state, MonitorState::Terminated);
        assert_eq!(h.known_symbols, 2);

        let health = handle.health_rx();
        timeout(Duration::from_secs(2), handle.stop()).await.expect("stop is prompt");
        assert_eq!(health.borrow().state, MonitorState::Disconnected);
    }

    #[tokio::test]
    async fn push_feed_emits_one_listing_for_repeated_updates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let frame = r#"[{"s":"BTCUSDT","c":"1","v":"1","q":"1","P":"0"},{"s":"NEWUSDT","c":"0.5","v":"9","q":"4.5","P":"80"}]"#;
            for _ in 0..3 {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            // keep the connection alive and answer pings
            while let Some(Ok(_)) = ws.next().await {}
        });

        let v = venue(&format!("ws://{addr}/ws"), vec![vec![t("BTCUSDT")]]);
        let (_venue_tx, venue_rx) = watch::channel(v);
        let (tx, mut rx) = mpsc::channel(16);
        let mut c = cfg();
        c.heartbeat_timeout = Duration::from_secs(5);
        let handle = spawn(c, ListingFilters::new("USDT"), venue_rx, tx);

        match next(&mut rx).await {
            MarketEvent::Listing(l) => {
                assert_eq!(l.symbol, "NEWUSDT");
                assert_eq!(l.price, 0.5);
                assert_eq!(l.quote_volume, 4.5);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
        assert_eq!(handle.health().state, MonitorState::Connected);
        assert_eq!(handle.health().transport, Transport::Push);
        handle.stop().await;
    }

    #[tokio::test]
    async fn silent_stream_is_dropped_and_reconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                // complete the handshake, then never read or write again
                if let Ok(ws) = accept_async(stream).await {
                    held.push(ws);
                }
            }
        });

        let v = venue(&format!("ws://{addr}/ws"), vec![vec![t("BTCUSDT")]]);
        let (_venue_tx, venue_rx) = watch::channel(v);
        let (tx, _rx) = mpsc::channel(16);
        let mut c = cfg();
        c.reconnect_attempts = 5;
        let handle = spawn(c, ListingFilters::new("USDT"), venue_rx, tx);

        let deadline = Instant::now() + Duration::from_secs(3);
        while accepted.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
        }
        assert!(accepted.load(Ordering::SeqCst) >= 2, "heartbeat timeout should force a reconnect");
        handle.stop().await;
    }
}
