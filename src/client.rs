// ===============================
// src/client.rs
// ===============================
//
// Binance Spot REST client:
// - weight accounting (never dispatches a call that would overrun the window)
// - HMAC signing for SIGNED endpoints
// - bounded exponential backoff for transient failures, cooldown on 429
// - 418 / credential failures are fatal and flip the client unhealthy
//
use rand::Rng;
use reqwest::{header::HeaderMap, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, warn};

use crate::binance::{
    build_query, sign_query, timestamp_ms, AccountInfo, ApiErrorBody, ExchangeInfo, PriceTicker,
    Ticker24h,
};
use crate::error::{codes, ExchangeError};
use crate::metrics::{REQUESTS, USED_WEIGHT};
use crate::weight::WeightBudget;

/// Request weights (Binance Spot, per IP, 1m window).
pub mod weights {
    pub const PING: u32 = 1;
    pub const EXCHANGE_INFO_ALL: u32 = 20;
    pub const EXCHANGE_INFO_SYMBOL: u32 = 2;
    pub const TICKER_24H_ALL: u32 = 80;
    pub const TICKER_PRICE: u32 = 2;
    pub const ACCOUNT: u32 = 20;
    pub const ORDER: u32 = 1;
    pub const ORDER_QUERY: u32 = 4;
    pub const ORDER_CANCEL: u32 = 1;
    pub const OCO: u32 = 1;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub rest_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window_ms: u64,
    pub http_timeout: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub weight_limit: u32,
    pub weight_window: Duration,
}

impl ClientConfig {
    pub fn public(rest_url: &str) -> Self {
        Self {
            rest_url: rest_url.to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            recv_window_ms: 5000,
            http_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(8),
            weight_limit: 1200,
            weight_window: Duration::from_secs(60),
        }
    }
}

/// Outcome of one HTTP attempt, before the retry decision.
#[derive(Debug)]
pub enum Failure {
    /// Worth another attempt, optionally after an exchange-mandated cooldown.
    Retry { err: ExchangeError, after: Option<Duration> },
    Fatal(ExchangeError),
}

pub struct ExchangeClient {
    profile: String,
    cfg: ClientConfig,
    http: reqwest::Client,
    // only this client mutates the budget; the lock is never held across an await
    budget: Mutex<WeightBudget>,
    healthy: AtomicBool,
}

impl ExchangeClient {
    pub fn new(profile: &str, cfg: ClientConfig) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout)
            .connect_timeout(cfg.http_timeout)
            .build()
            .map_err(|e| ExchangeError::Transient(format!("http client: {e}")))?;
        let budget = Mutex::new(WeightBudget::new(cfg.weight_limit, cfg.weight_window));
        Ok(Self { profile: profile.to_string(), cfg, http, budget, healthy: AtomicBool::new(true) })
    }

    pub fn profile(&self) -> &str { &self.profile }
    pub fn rest_url(&self) -> &str { &self.cfg.rest_url }
    pub fn has_credentials(&self) -> bool { !self.cfg.api_key.is_empty() && !self.cfg.api_secret.is_empty() }

    pub fn is_healthy(&self) -> bool { self.healthy.load(Ordering::Relaxed) }

    pub fn mark_unhealthy(&self) { self.healthy.store(false, Ordering::Relaxed); }

    pub fn weight_used(&self) -> u32 {
        self.budget.lock().map(|b| b.current()).unwrap_or_default()
    }

    /// Unsigned market-data call.
    pub async fn public_request(&self, path: &str, params: &[(&str, String)], weight: u32) -> Result<Value, ExchangeError> {
        self.dispatch(Method::GET, path, params, weight, false).await
    }

    /// SIGNED call: appends `recvWindow`, `timestamp` and `signature`.
    pub async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        weight: u32,
    ) -> Result<Value, ExchangeError> {
        self.dispatch(method, path, params, weight, true).await
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        weight: u32,
        signed: bool,
    ) -> Result<Value, ExchangeError> {
        if signed && !self.has_credentials() {
            return Err(ExchangeError::Credentials { code: 0, msg: "no API credentials configured".into() });
        }
        let mut attempt: u32 = 0;
        loop {
            self.acquire_weight(weight).await?;
            // timestamp + signature are rebuilt per attempt so retries stay inside recvWindow
            let outcome = self.send_once(method.clone(), path, params, signed).await;
            let failure = match outcome {
                Ok(v) => {
                    REQUESTS.with_label_values(&["ok"]).inc();
                    return Ok(v);
                }
                Err(f) => f,
            };
            match failure {
                Failure::Retry { err, after } if attempt < self.cfg.max_retries => {
                    let wait = after.unwrap_or_else(|| self.backoff(attempt));
                    REQUESTS.with_label_values(&["retry"]).inc();
                    warn!(profile = %self.profile, %path, attempt = attempt + 1, wait_ms = wait.as_millis() as u64, error = %err, "transient exchange error, retrying");
                    sleep(wait).await;
                    attempt += 1;
                }
                Failure::Retry { err, .. } => {
                    REQUESTS.with_label_values(&["transient"]).inc();
                    error!(profile = %self.profile, %path, attempts = attempt + 1, error = %err, "retries exhausted");
                    return Err(err);
                }
                Failure::Fatal(err) => {
                    REQUESTS.with_label_values(&[err.label()]).inc();
                    if err.is_fatal() {
                        self.mark_unhealthy();
                        error!(critical = true, profile = %self.profile, %path, error = %err, "fatal exchange error, environment marked unhealthy");
                    } else {
                        debug!(profile = %self.profile, %path, error = %err, "request rejected");
                    }
                    return Err(err);
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(6);
        let base = self.cfg.retry_base.saturating_mul(factor).min(self.cfg.retry_max);
        let jitter_cap = (self.cfg.retry_base.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
    }

    /// Block until `cost` fits in the weight window.
    async fn acquire_weight(&self, cost: u32) -> Result<(), ExchangeError> {
        loop {
            let wait = {
                let mut budget = self.budget.lock().unwrap_or_else(|p| p.into_inner());
                if cost > budget.limit() {
                    return Err(ExchangeError::WeightTooLarge { cost, limit: budget.limit() });
                }
                match budget.try_reserve(cost, Instant::now()) {
                    Ok(()) => {
                        USED_WEIGHT.set(budget.current() as i64);
                        return Ok(());
                    }
                    Err(wait) => wait,
                }
            };
            warn!(profile = %self.profile, cost, wait_ms = wait.as_millis() as u64, "weight budget exhausted, waiting for window reset");
            sleep(wait).await;
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<Value, Failure> {
        let mut query = build_query(params);
        if signed {
            let extra = build_query(&[
                ("recvWindow", self.cfg.recv_window_ms.to_string()),
                ("timestamp", timestamp_ms().to_string()),
            ]);
            query = if query.is_empty() { extra } else { format!("{query}&{extra}") };
            let sig = sign_query(&self.cfg.api_secret, &query);
            query = format!("{query}&signature={sig}");
        }
        let base = self.cfg.rest_url.trim_end_matches('/');
        let url = if query.is_empty() { format!("{base}{path}") } else { format!("{base}{path}?{query}") };

        let mut req = self.http.request(method, url);
        if !self.cfg.api_key.is_empty() {
            req = req.header("X-MBX-APIKEY", &self.cfg.api_key);
        }
        let rsp = req.send().await.map_err(|e| Failure::Retry {
            err: ExchangeError::Transient(format!("network: {e}")),
            after: None,
        })?;

        let status = rsp.status().as_u16();
        let headers = rsp.headers().clone();
        self.sync_weight(&headers);
        let body = rsp.text().await.map_err(|e| Failure::Retry {
            err: ExchangeError::Transient(format!("read body: {e}")),
            after: None,
        })?;

        if (200..300).contains(&status) {
            return serde_json::from_str(&body).map_err(|e| Failure::Fatal(ExchangeError::Decode(e.to_string())));
        }
        Err(classify(status, retry_after(&headers), &body))
    }

    fn sync_weight(&self, headers: &HeaderMap) {
        let used = headers
            .get("x-mbx-used-weight-1m")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok());
        if let Some(used) = used {
            let mut budget = self.budget.lock().unwrap_or_else(|p| p.into_inner());
            budget.sync_used(used, Instant::now());
            USED_WEIGHT.set(budget.current() as i64);
        }
    }

    // ---- typed helpers ----

    pub async fn get<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)], weight: u32) -> Result<T, ExchangeError> {
        let v = self.public_request(path, params, weight).await?;
        serde_json::from_value(v).map_err(|e| ExchangeError::Decode(e.to_string()))
    }

    pub async fn exchange_info(&self) -> Result<ExchangeInfo, ExchangeError> {
        self.get("/api/v3/exchangeInfo", &[], weights::EXCHANGE_INFO_ALL).await
    }

    pub async fn symbol_info(&self, symbol: &str) -> Result<ExchangeInfo, ExchangeError> {
        self.get("/api/v3/exchangeInfo", &[("symbol", symbol.to_string())], weights::EXCHANGE_INFO_SYMBOL)
            .await
    }

    pub async fn ticker_24h_all(&self) -> Result<Vec<Ticker24h>, ExchangeError> {
        self.get("/api/v3/ticker/24hr", &[], weights::TICKER_24H_ALL).await
    }

    pub async fn ticker_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let t: PriceTicker = self
            .get("/api/v3/ticker/price", &[("symbol", symbol.to_string())], weights::TICKER_PRICE)
            .await?;
        Ok(t.price)
    }

    pub async fn account(&self) -> Result<AccountInfo, ExchangeError> {
        let v = self.signed_request(Method::GET, "/api/v3/account", &[], weights::ACCOUNT).await?;
        serde_json::from_value(v).map_err(|e| ExchangeError::Decode(e.to_string()))
    }

    pub async fn ping(&self) -> Result<(), ExchangeError> {
        self.public_request("/api/v3/ping", &[], weights::PING).await.map(|_| ())
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-2xx response to a retry decision.
pub fn classify(status: u16, retry_after: Option<Duration>, body: &str) -> Failure {
    let api: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    let (code, msg) = api.map(|a| (a.code, a.msg)).unwrap_or((0, body.chars().take(200).collect()));
    match status {
        418 => Failure::Fatal(ExchangeError::IpBanned { retry_after }),
        429 => Failure::Retry {
            err: ExchangeError::Transient(format!("rate limited (429): {msg}")),
            after: Some(retry_after.unwrap_or(Duration::from_secs(1))),
        },
        500..=599 => Failure::Retry { err: ExchangeError::Transient(format!("http {status}: {msg}")), after: None },
        _ => match code {
            codes::BAD_SIGNATURE | codes::BAD_API_KEY_FORMAT | codes::REJECTED_MBX_KEY => {
                Failure::Fatal(ExchangeError::Credentials { code, msg })
            }
            _ if status == 401 => Failure::Fatal(ExchangeError::Credentials { code, msg }),
            codes::TIMESTAMP_OUTSIDE_WINDOW => Failure::Retry {
                err: ExchangeError::Transient(format!("timestamp outside recvWindow: {msg}")),
                after: None,
            },
            _ => Failure::Fatal(ExchangeError::Rejected { status, code, msg }),
        },
    }
}
