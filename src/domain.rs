// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::OrderError;

pub type UserId = i64;
pub type TradeId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }

impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Unit of work submitted to the engine. Lives only while it is queued or executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest { pub user_id: UserId, pub symbol: String, pub side: Side, pub qty: i64, pub px: Decimal }

impl OrderRequest {
    pub fn buy(user_id: UserId, symbol: impl Into<String>, qty: i64, px: Decimal) -> Self {
        Self { user_id, symbol: symbol.into(), side: Side::Buy, qty, px }
    }

    pub fn sell(user_id: UserId, symbol: impl Into<String>, qty: i64, px: Decimal) -> Self {
        Self { user_id, symbol: symbol.into(), side: Side::Sell, qty, px }
    }

    /// qty x px, `None` when it does not fit in a Decimal.
    pub fn notional(&self) -> Option<Decimal> { Decimal::from(self.qty).checked_mul(self.px) }

    /// Shape checks done before an order is queued. Normalises the symbol to upper case.
    pub fn validate(mut self) -> Result<Self, OrderError> {
        let symbol = self.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(OrderError::InvalidOrder { reason: "symbol is empty".into() });
        }
        if self.qty <= 0 {
            return Err(OrderError::InvalidOrder { reason: format!("quantity must be positive, got {}", self.qty) });
        }
        if self.px <= Decimal::ZERO {
            return Err(OrderError::InvalidOrder { reason: format!("price must be positive, got {}", self.px) });
        }
        if self.notional().is_none() {
            return Err(OrderError::InvalidOrder { reason: format!("notional of {} x {} is out of range", self.qty, self.px) });
        }
        self.symbol = symbol;
        Ok(self)
    }
}

/// Returned exactly once per submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub trade_id: Option<TradeId>,
    pub total_amount: Decimal,
    pub error: Option<OrderError>,
}

impl OrderResult {
    pub fn filled(trade_id: TradeId, total_amount: Decimal) -> Self {
        Self { success: true, trade_id: Some(trade_id), total_amount, error: None }
    }

    pub fn failed(error: OrderError) -> Self {
        Self { success: false, trade_id: None, total_amount: Decimal::ZERO, error: Some(error) }
    }

    /// "ok" or the error code, used as a metrics label.
    pub fn outcome(&self) -> &'static str {
        self.error.as_ref().map(|e| e.code()).unwrap_or("ok")
    }
}

impl From<Result<Fill, OrderError>> for OrderResult {
    fn from(r: Result<Fill, OrderError>) -> Self {
        match r {
            Ok(fill) => OrderResult::filled(fill.trade_id, fill.total_amount),
            Err(e) => OrderResult::failed(e),
        }
    }
}

/// What the executor hands back for a committed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fill { pub trade_id: TradeId, pub total_amount: Decimal }

// Ledger rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account { pub user_id: UserId, pub balance: Decimal }

/// Quantity and average cost of one (user, symbol) row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding { pub qty: i64, pub avg_cost: Decimal }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position { pub user_id: UserId, pub symbol: String, pub qty: i64, pub avg_cost: Decimal }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrade { pub user_id: UserId, pub symbol: String, pub side: Side, pub qty: i64, pub px: Decimal, pub total: Decimal }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: TradeId,
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub px: Decimal,
    pub total: Decimal,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot { pub user_id: UserId, pub cash: Decimal, pub positions: Vec<Position>, pub total_value: Decimal }

// Journal events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub trade_id: TradeId,
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub px: Decimal,
    pub total: Decimal,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectEvent { pub user_id: UserId, pub symbol: String, pub side: Side, pub qty: i64, pub code: String, pub reason: String, pub ts: DateTime<Utc> }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Fill(FillEvent), Reject(RejectEvent), Note(String) }

impl Event {
    pub fn from_result(order: &OrderRequest, result: &OrderResult) -> Self {
        let ts = Utc::now();
        match (&result.error, result.trade_id) {
            (None, Some(trade_id)) => Event::Fill(FillEvent {
                trade_id,
                user_id: order.user_id,
                symbol: order.symbol.clone(),
                side: order.side,
                qty: order.qty,
                px: order.px,
                total: result.total_amount,
                ts,
            }),
            (err, _) => Event::Reject(RejectEvent {
                user_id: order.user_id,
                symbol: order.symbol.clone(),
                side: order.side,
                qty: order.qty,
                code: err.as_ref().map(|e| e.code()).unwrap_or("unknown").to_string(),
                reason: err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                ts,
            }),
        }
    }
}
