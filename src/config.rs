// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : trade_engine_rust — per-user serialized trade execution in Rust
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Bounded worker pool that executes cash-settled buy/sell orders
          against a transactional ledger, one user at a time and many users
          in parallel, with Prometheus metrics and a JSONL trade journal.
=============================================================================
*/
use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;

/// Every flag can also come from the environment (or `.env`).
#[derive(Parser, Clone, Debug)]
#[command(name = "trade_engine_rust", version, about = "Concurrent stock order execution engine")]
pub struct Args {
    // pool
    #[arg(long, env = "WORKERS", default_value_t = 5)]
    pub workers: usize,
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 100)]
    pub queue_capacity: usize,

    // ledger
    #[arg(long, env = "TRADE_HISTORY_LIMIT", default_value_t = 50)]
    pub trade_history_limit: usize,
    #[arg(long, env = "STARTING_BALANCE", default_value = "10000")]
    pub starting_balance: Decimal,

    // files/metrics/logging
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,
    #[arg(long, env = "LOG_FILTER", default_value = "info")]
    pub log_filter: String,

    // simulated load
    #[arg(long, env = "SIM_USERS", default_value_t = 20)]
    pub sim_users: i64,
    #[arg(long, env = "SIM_TRADERS_PER_USER", default_value_t = 2)]
    pub sim_traders_per_user: usize,
    #[arg(long, env = "SIM_ORDERS_PER_TRADER", default_value_t = 200)]
    pub sim_orders_per_trader: usize,
    #[arg(long, env = "SYMBOLS", value_delimiter = ',', default_value = "AAPL,MSFT,GOOG,TSLA")]
    pub symbols: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolCfg {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolCfg {
    fn default() -> Self {
        Self { workers: 5, queue_capacity: 100 }
    }
}

impl PoolCfg {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        Self { workers, queue_capacity }.sanitized()
    }

    /// At least one worker and room for at least one order.
    pub fn sanitized(self) -> Self {
        Self { workers: self.workers.max(1), queue_capacity: self.queue_capacity.max(1) }
    }
}

impl Args {
    fn normalise(mut self) -> Self {
        self.symbols = self
            .symbols
            .iter()
            .map(|x| x.trim())
            .filter(|x| !x.is_empty())
            .map(|x| x.to_ascii_uppercase())
            .collect();
        if self.symbols.is_empty() {
            self.symbols = vec!["AAPL".to_string()];
        }
        self.sim_users = self.sim_users.max(0);
        self
    }

    pub fn pool_cfg(&self) -> PoolCfg {
        PoolCfg::new(self.workers, self.queue_capacity)
    }
}

pub fn load() -> (Args, PoolCfg) {
    // Pastikan .env dibaca sebelum clap membaca env
    let _ = dotenv();
    let args = Args::parse().normalise();
    let pool = args.pool_cfg();
    (args, pool)
}
