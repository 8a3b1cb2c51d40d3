// ===============================
// src/main.rs
// ===============================
/*
 # jalankan dengan beban simulasi default (20 user x 2 trader x 200 order)
 cargo run --release

 # lebih banyak worker, antrean kecil (backpressure terlihat di queue_depth)
 WORKERS=16 QUEUE_CAPACITY=8 cargo run --release

 curl -s localhost:9898/metrics | egrep '^(orders_total|queue_depth|workers_busy)'
*/
/*
=============================================================================
Project : trade_engine_rust — per-user serialized trade execution in Rust
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Bounded worker pool that executes cash-settled buy/sell orders
          against a transactional ledger, one user at a time and many users
          in parallel, with Prometheus metrics and a JSONL trade journal.
=============================================================================
*/
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{
    select,
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trade_engine_rust::{
    config,
    domain::{Event, UserId},
    loadgen::{self, LoadCfg, LoadReport},
    metrics, recorder, MemoryStore, WorkerPool,
};

#[tokio::main]
async fn main() {
    // ---- Load config ----
    let (args, pool_cfg) = config::load();

    // ---- Logging ----
    let filter = EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    info!(
        workers = pool_cfg.workers,
        queue_capacity = pool_cfg.queue_capacity,
        users = args.sim_users,
        traders_per_user = args.sim_traders_per_user,
        orders_per_trader = args.sim_orders_per_trader,
        symbols = ?args.symbols,
        starting_balance = %args.starting_balance,
        trade_history_limit = args.trade_history_limit,
        "startup config"
    );

    // ---- Ledger (account provisioning happens outside the engine) ----
    let store = MemoryStore::with_history_limit(args.trade_history_limit);
    let users: Vec<UserId> = (1..=args.sim_users).collect();
    for &user in &users {
        if let Err(e) = store.create_account(user, args.starting_balance) {
            error!(user_id = user, %e, "account provisioning failed");
            return;
        }
    }

    // ---- Engine (+ optional journal) ----
    let mut pool = WorkerPool::new(pool_cfg, Arc::new(store.clone()));
    let mut recorder_task = None;
    if let Some(path) = args.record_file.clone() {
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
        recorder_task = Some(tokio::spawn(recorder::run(rec_rx, path)));
        pool = pool.with_journal(rec_tx);
    }
    pool.start();
    let gateway = pool.gateway();

    // ---- Simulated load ----
    let progress = Arc::new(AtomicU64::new(0));
    let mut load = tokio::spawn(loadgen::run(
        gateway.clone(),
        LoadCfg {
            users: users.clone(),
            symbols: args.symbols.clone(),
            traders_per_user: args.sim_traders_per_user,
            orders_per_trader: args.sim_orders_per_trader,
        },
        progress.clone(),
    ));

    // ---- Heartbeat until the load finishes or Ctrl-C ----
    let mut hb = interval(Duration::from_secs(1));
    hb.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_done: u64 = 0;
    let finished = loop {
        select! {
            res = &mut load => break Some(res),
            _ = tokio::signal::ctrl_c() => {
                warn!("ctrl-c received, draining");
                break None;
            }
            _ = hb.tick() => {
                let done = progress.load(Ordering::Relaxed);
                info!(orders = done - last_done, total = done, queued = gateway.queued(), "heartbeat");
                last_done = done;
            }
        }
    };

    // ---- Graceful shutdown: queued orders still run, new ones are refused ----
    pool.stop().await;
    let report = match finished {
        Some(res) => res,
        None => load.await,
    }
    .unwrap_or_else(|e| {
        error!(?e, "load generator failed");
        LoadReport::default()
    });

    drop(pool);
    if let Some(task) = recorder_task {
        let _ = task.await;
    }

    // ---- Summary ----
    for &user in &users {
        if let Some(p) = store.portfolio(user) {
            info!(
                user_id = user,
                cash = %p.cash,
                positions = p.positions.len(),
                total_value = %p.total_value,
                "portfolio"
            );
        }
    }
    info!(
        submitted = report.submitted,
        filled = report.filled,
        committed = store.committed_trades(),
        rejected = ?report.rejected,
        "run complete"
    );
}
