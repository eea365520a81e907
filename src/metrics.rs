// ===============================
// src/metrics.rs
// ===============================
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market stream --------
pub static LISTINGS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("listings_detected_total", "new listings detected").unwrap());

pub static DELISTINGS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("delistings_detected_total", "delisted symbols detected").unwrap());

pub static KNOWN_SYMBOLS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("known_symbols", "size of the known-symbol set").unwrap());

// 0=disconnected 1=connecting 2=connected 3=degraded 4=terminated
pub static MONITOR_STATE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("monitor_state", "market stream state machine").unwrap());

pub static MONITOR_TRANSPORT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("monitor_transport", "1 for the active transport (label: transport)"),
        &["transport"],
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ws_reconnects_total", "ticker stream reconnect attempts").unwrap());

pub static WS_LAST_EVENT_TS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("ws_last_event_ts", "Unix seconds of the last ticker stream frame").unwrap()
});

// -------- Exchange client --------
pub static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("exchange_requests_total", "REST requests by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub static USED_WEIGHT: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("exchange_used_weight", "request weight used in window").unwrap());

// -------- Trading --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "orders by kind & outcome"),
        &["kind", "outcome"],
    )
    .unwrap()
});

pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "open positions").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "realized PnL (quote asset)").unwrap());

pub static SAFETY_BLOCKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("safety_blocks_total", "entries blocked by the safety policy"),
        &["reason"],
    )
    .unwrap()
});

pub static RECONCILE_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("reconcile_errors_total", "failed position reconciliations").unwrap());

// Latency from listing detection -> entry fill (milliseconds)
pub static LAT_LISTING_FILL: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("latency_listing_to_fill_ms", "Latency from listing detection to entry fill (ms)")
            .buckets(vec![50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]),
    )
    .unwrap()
});

pub static CONFIG_ENVIRONMENT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_environment", "active environment (label: environment)"),
        &["environment"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; double registration is ignored
    for m in [
        REGISTRY.register(Box::new(LISTINGS.clone())),
        REGISTRY.register(Box::new(DELISTINGS.clone())),
        REGISTRY.register(Box::new(KNOWN_SYMBOLS.clone())),
        REGISTRY.register(Box::new(MONITOR_STATE.clone())),
        REGISTRY.register(Box::new(MONITOR_TRANSPORT.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_LAST_EVENT_TS.clone())),
        REGISTRY.register(Box::new(REQUESTS.clone())),
        REGISTRY.register(Box::new(USED_WEIGHT.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(SAFETY_BLOCKS.clone())),
        REGISTRY.register(Box::new(RECONCILE_ERRORS.clone())),
        REGISTRY.register(Box::new(LAT_LISTING_FILL.clone())),
        REGISTRY.register(Box::new(CONFIG_ENVIRONMENT.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let mut rsp = Response::new(Body::from(encode_metrics()));
    rsp.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    Ok(rsp)
}

/// Serve GET / and /metrics until the process exits.
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}
