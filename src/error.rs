// ===============================
// src/error.rs
// ===============================
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an order did not produce a trade. Terminal for that order; the engine never retries.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum OrderError {
    #[error("User not found")]
    AccountNotFound,
    #[error("You don't own this stock")]
    PositionNotFound,
    #[error("Insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: Decimal, required: Decimal },
    #[error("Insufficient shares. You own {owned}, trying to sell {requested}")]
    InsufficientShares { owned: i64, requested: i64 },
    #[error("Transaction failed: {reason}")]
    TransactionBeginFailed { reason: String },
    #[error("Transaction commit failed: {reason}")]
    CommitFailed { reason: String },
    #[error("Database error: {reason}")]
    StoreReadError { reason: String },
    #[error("Failed to update ledger: {reason}")]
    StoreWriteError { reason: String },
    #[error("Invalid order: {reason}")]
    InvalidOrder { reason: String },
    #[error("Order execution aborted: {reason}")]
    ExecutorPanicked { reason: String },
    #[error("Trade engine is stopped")]
    EngineStopped,
}

impl OrderError {
    /// Stable identifier for transport mapping and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            OrderError::AccountNotFound => "account_not_found",
            OrderError::PositionNotFound => "position_not_found",
            OrderError::InsufficientFunds { .. } => "insufficient_funds",
            OrderError::InsufficientShares { .. } => "insufficient_shares",
            OrderError::TransactionBeginFailed { .. } => "transaction_begin_failed",
            OrderError::CommitFailed { .. } => "commit_failed",
            OrderError::StoreReadError { .. } => "store_read_error",
            OrderError::StoreWriteError { .. } => "store_write_error",
            OrderError::InvalidOrder { .. } => "invalid_order",
            OrderError::ExecutorPanicked { .. } => "executor_panicked",
            OrderError::EngineStopped => "engine_stopped",
        }
    }

    /// Rejections caused by the user's own ledger state rather than the system.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            OrderError::AccountNotFound
                | OrderError::PositionNotFound
                | OrderError::InsufficientFunds { .. }
                | OrderError::InsufficientShares { .. }
                | OrderError::InvalidOrder { .. }
        )
    }
}

/// Failures reported by a ledger store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("begin: {0}")]
    Begin(String),
    #[error("read: {0}")]
    Read(String),
    #[error("write: {0}")]
    Write(String),
    #[error("commit: {0}")]
    Commit(String),
}

impl StoreError {
    pub fn reason(&self) -> &str {
        match self {
            StoreError::Begin(r) | StoreError::Read(r) | StoreError::Write(r) | StoreError::Commit(r) => r,
        }
    }
}

impl From<StoreError> for OrderError {
    fn from(e: StoreError) -> Self {
        let reason = e.reason().to_string();
        match e {
            StoreError::Begin(_) => OrderError::TransactionBeginFailed { reason },
            StoreError::Read(_) => OrderError::StoreReadError { reason },
            StoreError::Write(_) => OrderError::StoreWriteError { reason },
            StoreError::Commit(_) => OrderError::CommitFailed { reason },
        }
    }
}
