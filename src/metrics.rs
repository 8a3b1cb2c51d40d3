// ===============================
// src/metrics.rs
// ===============================
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use once_cell::sync::Lazy;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::time::Instant;
use tracing::{error, info};

use crate::domain::{OrderRequest, OrderResult};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

const LATENCY_BUCKETS_MS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0];

fn latency_histogram(name: &str, help: &str) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS_MS.to_vec())).unwrap()
}

// -------- Orders --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "orders answered (labels: side, outcome = ok | error code)"),
        &["side", "outcome"],
    )
    .unwrap()
});

pub static NOTIONAL: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(Opts::new("trade_notional_total", "committed trade value by side"), &["side"]).unwrap()
});

// -------- Latency (milliseconds) --------
pub static ORDER_LATENCY_MS: Lazy<Histogram> =
    Lazy::new(|| latency_histogram("order_latency_ms", "submit -> result, as seen by the caller (ms)"));

pub static QUEUE_WAIT_MS: Lazy<Histogram> =
    Lazy::new(|| latency_histogram("queue_wait_ms", "submit -> dequeued by a worker (ms)"));

pub static LOCK_WAIT_MS: Lazy<Histogram> =
    Lazy::new(|| latency_histogram("user_lock_wait_ms", "time spent waiting for the per-user lock (ms)"));

pub static EXEC_MS: Lazy<Histogram> =
    Lazy::new(|| latency_histogram("order_exec_ms", "ledger transaction time per order (ms)"));

// -------- Pool state --------
pub static QUEUE_DEPTH: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("queue_depth", "orders queued or waiting for queue room").unwrap());

pub static WORKERS_BUSY: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("workers_busy", "workers currently processing an order").unwrap());

pub static POOL_WORKERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("pool_workers", "workers started").unwrap());

pub static LOCK_ENTRIES: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("user_lock_entries", "per-user locks created").unwrap());

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(NOTIONAL.clone())),
        REGISTRY.register(Box::new(ORDER_LATENCY_MS.clone())),
        REGISTRY.register(Box::new(QUEUE_WAIT_MS.clone())),
        REGISTRY.register(Box::new(LOCK_WAIT_MS.clone())),
        REGISTRY.register(Box::new(EXEC_MS.clone())),
        REGISTRY.register(Box::new(QUEUE_DEPTH.clone())),
        REGISTRY.register(Box::new(WORKERS_BUSY.clone())),
        REGISTRY.register(Box::new(POOL_WORKERS.clone())),
        REGISTRY.register(Box::new(LOCK_ENTRIES.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

pub fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

pub fn record_outcome(order: &OrderRequest, result: &OrderResult) {
    ORDERS.with_label_values(&[order.side.as_str(), result.outcome()]).inc();
    if result.success {
        let v = result.total_amount.to_f64().unwrap_or(0.0);
        NOTIONAL.with_label_values(&[order.side.as_str()]).inc_by(v);
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

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = match req.uri().path() {
        "/" | "/metrics" => Response::builder()
            .header(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        "/health" => Response::builder().body(Body::from("ok\n")),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()),
    };
    Ok(resp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serves GET / , /metrics and /health until the process exits.
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });

    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening on / and /metrics");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}
