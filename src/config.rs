// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : listing_bot_rust, async new-listing trading bot in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Watches an exchange for newly listed spot pairs, buys them at
          market, attaches take-profit / stop-loss protection, reconciles
          positions to closure, guards real-money profiles with safety
          limits, exposes Prometheus metrics and records a JSONL audit.
=============================================================================
*/
use ahash::AHashSet as HashSet;
use clap::Parser;
use dotenvy::dotenv;
use std::{env, str::FromStr, time::Duration};

use crate::client::ClientConfig;
use crate::engine::EngineConfig;
use crate::environment::{EnvironmentProfile, DEFAULT_MIN_CREDENTIAL_LEN};
use crate::feed::MonitorConfig;
use crate::listing::{default_stablecoins, ListingFilters};
use crate::positions::ProtectionConfig;
use crate::risk::RiskLimits;
use crate::safety::SafetyLimits;

/// Command-line overrides; everything else comes from the environment / `.env`.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "listing_bot", version, about = "New-listing trading bot")]
pub struct Cli {
    /// Profile to activate at start (testnet | mainnet)
    #[arg(long)]
    pub environment: Option<String>,
    /// Fill orders in-process against live prices
    #[arg(long)]
    pub simulate: bool,
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// JSONL audit trail of real-money order attempts
    #[arg(long)]
    pub audit_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub simulate: bool,
    pub metrics_port: u16,
    pub audit_file: String,
    pub notify_queue: usize,
    pub paper_balance: f64,
    pub min_volume_24h: f64,
    pub filter_cache_ttl: Duration,
    /// Timeouts, retries and weight window shared by every profile.
    pub client: ClientConfig,
    pub risk: RiskLimits,
    pub engine: EngineConfig,
    pub profiles: Vec<EnvironmentProfile>,
}

// ---- typed lookups ----

struct Vars<F: Fn(&str) -> Option<String>>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn str(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn num<T: FromStr>(&self, key: &str, default: T) -> T {
        self.raw(key).and_then(|s| s.parse().ok()).unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.raw(key).and_then(|s| parse_bool(&s)).unwrap_or(default)
    }

    fn secs(&self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.num(key, default))
    }

    fn millis(&self, key: &str, default: u64) -> Duration {
        Duration::from_millis(self.num(key, default))
    }

    fn csv(&self, key: &str) -> Option<HashSet<String>> {
        self.raw(key).map(|s| parse_csv(&s))
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_csv(s: &str) -> HashSet<String> {
    s.split(',').map(|x| x.trim().to_ascii_uppercase()).filter(|x| !x.is_empty()).collect()
}

/// Read `.env` and the process environment, then apply CLI overrides.
pub fn load(cli: &Cli) -> Config {
    let _ = dotenv();
    from_vars(|k| env::var(k).ok(), cli)
}

fn profile<F: Fn(&str) -> Option<String>>(
    v: &Vars<F>,
    prefix: &str,
    rest: &str,
    ws: &str,
    real_money: bool,
    defaults: &RiskLimits,
    stop_loss_pct: f64,
) -> EnvironmentProfile {
    let key = |k: &str| format!("{prefix}_{k}");
    let safety = real_money.then(|| SafetyLimits {
        max_order_notional: v.num(&key("MAX_ORDER_NOTIONAL"), 100.0),
        daily_loss_limit: v.num(&key("DAILY_LOSS_LIMIT"), 50.0),
        stop_loss_pct,
    });
    EnvironmentProfile {
        name: prefix.to_ascii_lowercase(),
        is_real_money: real_money,
        rest_url: v.str(&key("REST_URL"), rest),
        stream_url: v.str(&key("WS_URL"), ws),
        api_key: v.str(&key("API_KEY"), ""),
        api_secret: v.str(&key("API_SECRET"), ""),
        max_positions: v.num(&key("MAX_POSITIONS"), defaults.max_positions),
        max_order_size: v.num(&key("MAX_ORDER_SIZE"), defaults.max_order_size),
        min_credential_len: v.num("MIN_CREDENTIAL_LEN", DEFAULT_MIN_CREDENTIAL_LEN),
        safety,
    }
}

fn from_vars(get: impl Fn(&str) -> Option<String>, cli: &Cli) -> Config {
    let v = Vars(get);
    let quote_asset = v.str("QUOTE_ASSET", "USDT").to_ascii_uppercase();

    // ===== Risk / protection =====
    let base = RiskLimits::default();
    let risk = RiskLimits {
        base_order_size: v.num("BASE_ORDER_SIZE", base.base_order_size),
        max_order_size: v.num("MAX_ORDER_SIZE", base.max_order_size),
        max_positions: v.num("MAX_POSITIONS", base.max_positions),
        account_risk_fraction: v.num("ACCOUNT_RISK_FRACTION", base.account_risk_fraction),
        position_risk_fraction: v.num("POSITION_RISK_FRACTION", base.position_risk_fraction),
        balance_utilization: v.num("BALANCE_UTILIZATION", base.balance_utilization),
    };
    let pd = ProtectionConfig::default();
    let protection = ProtectionConfig {
        take_profit_pct: v.num("TAKE_PROFIT_PCT", pd.take_profit_pct),
        stop_loss_pct: v.num("STOP_LOSS_PCT", pd.stop_loss_pct),
        stop_limit_offset_pct: v.num("STOP_LIMIT_OFFSET_PCT", pd.stop_limit_offset_pct),
        prefer_bracket: v.flag("PREFER_BRACKET", pd.prefer_bracket),
        retries: v.num("PROTECTION_RETRIES", pd.retries),
    };

    // ===== Listing filters =====
    let min_volume_24h = v.num("MIN_VOLUME_24H", 0.0);
    let mut filters = ListingFilters::new(&quote_asset);
    filters.exclude_stablecoins = v.flag("EXCLUDE_STABLECOINS", true);
    filters.stablecoins = v.csv("STABLECOINS").unwrap_or_else(default_stablecoins);
    filters.excluded_tokens = v.csv("EXCLUDED_TOKENS").unwrap_or_default();
    filters.min_volume_24h = min_volume_24h;

    // ===== Monitor =====
    let monitor = MonitorConfig {
        reconnect_attempts: v.num("RECONNECT_ATTEMPTS", 10),
        reconnect_delay: v.millis("RECONNECT_DELAY_MS", 1000),
        reconnect_max_delay: v.millis("RECONNECT_MAX_DELAY_MS", 30_000),
        heartbeat_interval: v.secs("HEARTBEAT_INTERVAL_SECS", 30),
        heartbeat_timeout: v.secs("HEARTBEAT_TIMEOUT_SECS", 60),
        connect_timeout: v.secs("CONNECT_TIMEOUT_SECS", 10),
        poll_interval: v.secs("POLL_INTERVAL_SECS", 10),
        snapshot_refresh: v.secs("SNAPSHOT_REFRESH_SECS", 300),
    };

    // ===== Exchange client =====
    let mut client = ClientConfig::public("");
    client.http_timeout = v.secs("HTTP_TIMEOUT_SECS", 10);
    client.recv_window_ms = v.num("RECV_WINDOW_MS", 5000);
    client.max_retries = v.num("MAX_RETRIES", 3);
    client.retry_base = v.millis("RETRY_BASE_MS", 500);
    client.weight_limit = v.num("WEIGHT_LIMIT", 1200);
    client.weight_window = v.secs("WEIGHT_WINDOW_SECS", 60);

    // ===== Profiles =====
    let profiles = vec![
        profile(&v, "TESTNET", "https://testnet.binance.vision", "wss://testnet.binance.vision/ws", false, &risk, protection.stop_loss_pct),
        profile(&v, "MAINNET", "https://api.binance.com", "wss://stream.binance.com:9443/ws", true, &risk, protection.stop_loss_pct),
    ];

    let engine = EngineConfig {
        quote_asset: quote_asset.clone(),
        monitor,
        filters,
        protection,
        reconcile_interval: v.secs("RECONCILE_INTERVAL_SECS", 10),
        event_queue: v.num("EVENT_QUEUE", 256),
    };

    Config {
        environment: cli.environment.clone().unwrap_or_else(|| v.str("ENVIRONMENT", "testnet")).to_ascii_lowercase(),
        simulate: cli.simulate || v.flag("SIMULATION_MODE", false),
        metrics_port: cli.metrics_port.unwrap_or_else(|| v.num("METRICS_PORT", 9898)),
        audit_file: cli.audit_file.clone().unwrap_or_else(|| v.str("AUDIT_FILE", "audit/orders.jsonl")),
        notify_queue: v.num("NOTIFY_QUEUE", 256),
        paper_balance: v.num("PAPER_BALANCE", 1000.0),
        min_volume_24h,
        filter_cache_ttl: v.secs("FILTER_CACHE_SECS", 3600),
        client,
        risk,
        engine,
        profiles,
    }
}
