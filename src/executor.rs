// ===============================
// src/executor.rs (one trade = one ledger transaction)
// ===============================
//
// BUY : lock+read balance -> funds check -> debit -> upsert position (weighted avg) -> append trade
// SELL: lock+read position -> shares check -> delete/decrement position -> credit -> append trade
//
// Any error rolls the transaction back, so a failed order leaves the ledger untouched.
// Callers are expected to hold the per-user lock; the store's row locks are a second layer.
//
use rust_decimal::Decimal;
use tracing::debug;

use crate::domain::{Fill, Holding, NewTrade, OrderRequest, Side, TradeId};
use crate::error::OrderError;
use crate::store::{LedgerStore, LedgerTxn};

pub async fn execute(store: &dyn LedgerStore, order: &OrderRequest) -> Result<Fill, OrderError> {
    let total = order
        .notional()
        .ok_or_else(|| OrderError::InvalidOrder { reason: format!("notional of {} x {} is out of range", order.qty, order.px) })?;
    let mut txn = store.begin().await?;

    let staged = match order.side {
        Side::Buy => buy(txn.as_mut(), order, total).await,
        Side::Sell => sell(txn.as_mut(), order, total).await,
    };

    let trade_id = match staged {
        Ok(id) => id,
        Err(e) => {
            txn.rollback().await;
            return Err(e);
        }
    };

    if let Err(e) = txn.commit().await {
        txn.rollback().await;
        return Err(OrderError::CommitFailed { reason: e.reason().to_string() });
    }

    debug!(trade_id, user_id = order.user_id, symbol = %order.symbol, side = %order.side, %total, "trade committed");
    Ok(Fill { trade_id, total_amount: total })
}

async fn buy(txn: &mut dyn LedgerTxn, o: &OrderRequest, total: Decimal) -> Result<TradeId, OrderError> {
    let balance = txn.account_balance(o.user_id, true).await?.ok_or(OrderError::AccountNotFound)?;
    if balance < total {
        return Err(OrderError::InsufficientFunds { balance, required: total });
    }

    txn.debit_account(o.user_id, total).await?;

    let holding = match txn.position(o.user_id, &o.symbol, true).await? {
        Some(cur) => {
            let qty = cur.qty.checked_add(o.qty).ok_or_else(|| out_of_range("position quantity", o))?;
            let avg_cost = weighted_avg_cost(cur, o.qty, o.px).ok_or_else(|| out_of_range("average cost", o))?;
            Holding { qty, avg_cost }
        }
        None => Holding { qty: o.qty, avg_cost: o.px },
    };
    txn.upsert_position(o.user_id, &o.symbol, holding).await?;

    let id = txn.append_trade(new_trade(o, total)).await?;
    Ok(id)
}

async fn sell(txn: &mut dyn LedgerTxn, o: &OrderRequest, total: Decimal) -> Result<TradeId, OrderError> {
    let cur = txn.position(o.user_id, &o.symbol, true).await?.ok_or(OrderError::PositionNotFound)?;
    if cur.qty < o.qty {
        return Err(OrderError::InsufficientShares { owned: cur.qty, requested: o.qty });
    }

    let left = cur.qty - o.qty;
    if left == 0 {
        txn.delete_position(o.user_id, &o.symbol).await?;
    } else {
        // average cost does not move on a sell
        txn.upsert_position(o.user_id, &o.symbol, Holding { qty: left, avg_cost: cur.avg_cost }).await?;
    }

    txn.credit_account(o.user_id, total).await?;

    let id = txn.append_trade(new_trade(o, total)).await?;
    Ok(id)
}

/// (avg x held + px x qty) / (held + qty), `None` on Decimal overflow.
pub fn weighted_avg_cost(cur: Holding, qty: i64, px: Decimal) -> Option<Decimal> {
    let held = Decimal::from(cur.qty);
    let added = Decimal::from(qty);
    let total_qty = held.checked_add(added)?;
    if total_qty.is_zero() {
        return Some(px);
    }
    cur.avg_cost.checked_mul(held)?.checked_add(px.checked_mul(added)?)?.checked_div(total_qty)
}

fn out_of_range(what: &str, o: &OrderRequest) -> OrderError {
    OrderError::InvalidOrder { reason: format!("{what} out of range after buying {} {}", o.qty, o.symbol) }
}

fn new_trade(o: &OrderRequest, total: Decimal) -> NewTrade {
    NewTrade { user_id: o.user_id, symbol: o.symbol.clone(), side: o.side, qty: o.qty, px: o.px, total }
}
