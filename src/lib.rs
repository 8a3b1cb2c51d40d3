// ===============================
// src/lib.rs
// ===============================
//
// Order flow:
//   caller -> Gateway::submit -> bounded queue -> WorkerPool worker
//          -> LockRegistry (per user) -> executor (one ledger transaction)
//          -> release lock -> oneshot reply -> caller
//
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod loadgen;
pub mod locks;
pub mod metrics;
pub mod pool;
pub mod recorder;
pub mod store;

pub use config::PoolCfg;
pub use domain::{Holding, OrderRequest, OrderResult, Position, Side, TradeRecord, UserId};
pub use error::{OrderError, StoreError};
pub use gateway::Gateway;
pub use locks::{LockGuard, LockRegistry};
pub use pool::WorkerPool;
pub use store::{LedgerStore, LedgerTxn, MemoryStore};
