// ===============================
// src/store/mod.rs (ledger store contract)
// ===============================
//
// The executor only talks to these two traits. A store must give row-level
// exclusivity on `for_update` reads and on writes, held until the transaction
// commits or rolls back, and must apply all staged writes atomically.
//
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{Holding, NewTrade, TradeId, UserId};
use crate::error::StoreError;

pub mod memory;

pub use memory::MemoryStore;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTxn>, StoreError>;
}

/// One unit of work. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait LedgerTxn: Send {
    /// `None` when the account does not exist.
    async fn account_balance(&mut self, user: UserId, for_update: bool) -> Result<Option<Decimal>, StoreError>;

    async fn debit_account(&mut self, user: UserId, amount: Decimal) -> Result<(), StoreError>;

    async fn credit_account(&mut self, user: UserId, amount: Decimal) -> Result<(), StoreError>;

    /// `None` when the user holds no row for `symbol`.
    async fn position(&mut self, user: UserId, symbol: &str, for_update: bool) -> Result<Option<Holding>, StoreError>;

    async fn upsert_position(&mut self, user: UserId, symbol: &str, holding: Holding) -> Result<(), StoreError>;

    async fn delete_position(&mut self, user: UserId, symbol: &str) -> Result<(), StoreError>;

    async fn append_trade(&mut self, trade: NewTrade) -> Result<TradeId, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Safe to call on an empty, committed or already rolled back transaction.
    async fn rollback(&mut self);
}
