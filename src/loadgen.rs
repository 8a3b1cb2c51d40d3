// ===============================
// src/loadgen.rs
// ===============================
//
// Simulated users for the binary:
// - one random-walk price per symbol (2 decimals), shared by all traders;
// - `traders_per_user` tasks per user, each submitting `orders_per_trader`
//   random buys/sells through the gateway and waiting for every result.
//
// Several traders per user on purpose: it makes same-user orders race for
// the per-user lock the same way concurrent HTTP requests would.
//
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::{OrderRequest, Side, UserId};
use crate::gateway::Gateway;

#[derive(Debug, Clone)]
pub struct LoadCfg {
    pub users: Vec<UserId>,
    pub symbols: Vec<String>,
    pub traders_per_user: usize,
    pub orders_per_trader: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub submitted: u64,
    pub filled: u64,
    pub rejected: HashMap<&'static str, u64>,
}

impl LoadReport {
    fn merge(&mut self, other: LoadReport) {
        self.submitted += other.submitted;
        self.filled += other.filled;
        for (code, n) in other.rejected {
            *self.rejected.entry(code).or_insert(0) += n;
        }
    }
}

/// Mid prices in cents, one random walk per symbol.
pub struct PriceBoard {
    cents: Mutex<HashMap<String, i64>>,
}

impl PriceBoard {
    pub fn new(symbols: &[String]) -> Self {
        let cents = symbols.iter().map(|s| (s.clone(), 100_00)).collect();
        Self { cents: Mutex::new(cents) }
    }

    /// Moves the symbol by a few cents (floor 50.00) and returns the new price.
    pub fn step(&self, symbol: &str) -> Decimal {
        let delta = rand::thread_rng().gen_range(-3..=3);
        let mut map = self.cents.lock();
        let px = map.entry(symbol.to_string()).or_insert(100_00);
        *px = (*px + delta).max(50_00);
        Decimal::new(*px, 2)
    }
}

fn random_order(user: UserId, symbols: &[String], board: &PriceBoard) -> OrderRequest {
    // ThreadRng is not Send: keep it out of any .await
    let (idx, buy, qty) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(0..symbols.len()), rng.gen_bool(0.6), rng.gen_range(1..=10))
    };
    let symbol = symbols[idx].clone();
    let px = board.step(&symbol);
    let side = if buy { Side::Buy } else { Side::Sell };
    OrderRequest { user_id: user, symbol, side, qty, px }
}

async fn trader(gateway: Gateway, user: UserId, cfg: Arc<LoadCfg>, board: Arc<PriceBoard>, progress: Arc<AtomicU64>) -> LoadReport {
    let mut report = LoadReport::default();
    for _ in 0..cfg.orders_per_trader {
        let order = random_order(user, &cfg.symbols, &board);
        let result = gateway.submit(order).await;
        report.submitted += 1;
        progress.fetch_add(1, Ordering::Relaxed);
        match &result.error {
            None => report.filled += 1,
            Some(e) => {
                *report.rejected.entry(e.code()).or_insert(0) += 1;
                if e.code() == "engine_stopped" {
                    debug!(user_id = user, "engine stopped, trader exits");
                    break;
                }
            }
        }
    }
    report
}

/// Runs every trader to completion and sums their tallies.
pub async fn run(gateway: Gateway, cfg: LoadCfg, progress: Arc<AtomicU64>) -> LoadReport {
    let mut total = LoadReport::default();
    if cfg.symbols.is_empty() {
        warn!("loadgen: no symbols configured");
        return total;
    }
    let board = Arc::new(PriceBoard::new(&cfg.symbols));
    let cfg = Arc::new(cfg);

    let mut tasks = Vec::new();
    for &user in cfg.users.iter() {
        for _ in 0..cfg.traders_per_user {
            tasks.push(tokio::spawn(trader(gateway.clone(), user, cfg.clone(), board.clone(), progress.clone())));
        }
    }
    for t in tasks {
        match t.await {
            Ok(r) => total.merge(r),
            Err(e) => warn!(?e, "loadgen: trader task failed"),
        }
    }
    total
}
