// ===============================
// src/main.rs
// ===============================
/*
 # which environment is active
curl -s localhost:9898/metrics | grep '^config_environment'

# detections and order flow
curl -s localhost:9898/metrics | egrep '^(listings_detected_total|orders_total|safety_blocks_total)'
*/
/*
=============================================================================
Project : listing_bot_rust, async new-listing trading bot in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Watches an exchange for newly listed spot pairs, buys them at
          market, attaches take-profit / stop-loss protection, reconciles
          positions to closure, guards real-money profiles with safety
          limits, exposes Prometheus metrics and records a JSONL audit.
=============================================================================
*/
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use listing_bot_rust::{
    config::{self, Cli},
    engine::Engine,
    environment::{EnvironmentManager, EnvironmentSettings},
    metrics, recorder,
    store::{self, ChannelNotifier, MemoryStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let cli = Cli::parse();
    let cfg = config::load(&cli);
    info!(
        environment = %cfg.environment,
        simulate = cfg.simulate,
        quote = %cfg.engine.quote_asset,
        tp_pct = cfg.engine.protection.take_profit_pct,
        sl_pct = cfg.engine.protection.stop_loss_pct,
        max_positions = cfg.risk.max_positions,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    // ---- Audit trail / notifications ----
    let (audit_tx, audit_rx) = mpsc::channel(4096);
    tokio::spawn(recorder::run(audit_rx, cfg.audit_file.clone()));
    let (notifier, notify_rx) = ChannelNotifier::new(cfg.notify_queue);
    tokio::spawn(store::run_log_sink(notify_rx));

    // ---- Environment ----
    let settings = EnvironmentSettings {
        client: cfg.client.clone(),
        filter_cache_ttl: cfg.filter_cache_ttl,
        simulate: cfg.simulate,
        paper_balance: cfg.paper_balance,
        quote_asset: cfg.engine.quote_asset.clone(),
        min_volume_24h: cfg.min_volume_24h,
        risk: cfg.risk.clone(),
        audit: Some(audit_tx),
    };
    let (env, _venue) = EnvironmentManager::new(cfg.profiles.clone(), settings, &cfg.environment)
        .with_context(|| format!("cannot activate environment '{}'", cfg.environment))?;

    // ---- Engine ----
    let engine = Engine::new(cfg.engine.clone(), env, Arc::new(MemoryStore::new()), Arc::new(notifier));
    let handle = engine.start().await.context("engine start failed")?;
    match handle.client().get_status().await {
        Ok(s) => info!(environment = %s.environment, balance = s.balance, open = s.open_positions.len(), "running, ctrl-c to stop"),
        Err(e) => warn!(error = %e, "status unavailable"),
    }

    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutdown requested");
    handle.stop().await;
    Ok(())
}
