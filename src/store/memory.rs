// ===============================
// src/store/memory.rs (in-process transactional ledger)
// ===============================
//
// - Committed state sits behind one short-lived parking_lot mutex.
// - Row locks (account row, (user, symbol) position row) come from a
//   LockRegistry and are held by the transaction until commit/rollback/drop.
// - Writes are staged inside the transaction and applied in one step on commit.
// - Trade ids come from a sequence; ids of rolled back trades are not reused.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{LedgerStore, LedgerTxn};
use crate::domain::{Account, Holding, NewTrade, PortfolioSnapshot, Position, TradeId, TradeRecord, UserId};
use crate::error::StoreError;
use crate::locks::{LockGuard, LockRegistry};

pub const DEFAULT_TRADE_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Account(UserId),
    Position(UserId, String),
}

#[derive(Default)]
struct Ledger {
    accounts: HashMap<UserId, Decimal>,
    positions: HashMap<(UserId, String), Holding>,
    trades: HashMap<UserId, VecDeque<TradeRecord>>,
}

#[derive(Default)]
struct Faults {
    begin: AtomicBool,
    read: AtomicBool,
    commit: AtomicBool,
}

struct Shared {
    ledger: Mutex<Ledger>,
    rows: LockRegistry<RowKey>,
    next_trade_id: AtomicI64,
    committed_trades: AtomicU64,
    history_limit: usize,
    faults: Faults,
}

#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_TRADE_HISTORY_LIMIT)
    }

    /// Keeps at most `limit` trades per user (oldest trimmed first).
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                ledger: Mutex::new(Ledger::default()),
                rows: LockRegistry::new(),
                next_trade_id: AtomicI64::new(1),
                committed_trades: AtomicU64::new(0),
                history_limit: limit.max(1),
                faults: Faults::default(),
            }),
        }
    }

    /// Provisions an account. Existing accounts and negative balances are refused.
    pub fn create_account(&self, user: UserId, balance: Decimal) -> Result<(), StoreError> {
        if balance < Decimal::ZERO {
            return Err(StoreError::Write(format!("negative opening balance {balance} for user {user}")));
        }
        let mut ledger = self.shared.ledger.lock();
        if ledger.accounts.contains_key(&user) {
            return Err(StoreError::Write(format!("account {user} already exists")));
        }
        ledger.accounts.insert(user, balance);
        Ok(())
    }

    pub fn account(&self, user: UserId) -> Option<Account> {
        let ledger = self.shared.ledger.lock();
        ledger.accounts.get(&user).map(|b| Account { user_id: user, balance: *b })
    }

    pub fn position(&self, user: UserId, symbol: &str) -> Option<Position> {
        let ledger = self.shared.ledger.lock();
        ledger
            .positions
            .get(&(user, symbol.to_string()))
            .map(|h| Position { user_id: user, symbol: symbol.to_string(), qty: h.qty, avg_cost: h.avg_cost })
    }

    /// Open positions ordered by symbol.
    pub fn positions(&self, user: UserId) -> Vec<Position> {
        let ledger = self.shared.ledger.lock();
        let mut out: Vec<Position> = ledger
            .positions
            .iter()
            .filter(|((u, _), h)| *u == user && h.qty > 0)
            .map(|((u, s), h)| Position { user_id: *u, symbol: s.clone(), qty: h.qty, avg_cost: h.avg_cost })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    /// Most recent trades first.
    pub fn trades(&self, user: UserId, limit: usize) -> Vec<TradeRecord> {
        let ledger = self.shared.ledger.lock();
        ledger
            .trades
            .get(&user)
            .map(|q| q.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Cash plus positions valued at their average cost.
    pub fn portfolio(&self, user: UserId) -> Option<PortfolioSnapshot> {
        let cash = self.account(user)?.balance;
        let positions = self.positions(user);
        let total_value = positions
            .iter()
            .try_fold(cash, |acc, p| acc.checked_add(p.avg_cost.checked_mul(Decimal::from(p.qty))?))
            .unwrap_or(Decimal::MAX);
        Some(PortfolioSnapshot { user_id: user, cash, total_value, positions })
    }

    pub fn users(&self) -> Vec<UserId> {
        let ledger = self.shared.ledger.lock();
        let mut users: Vec<UserId> = ledger.accounts.keys().copied().collect();
        users.sort_unstable();
        users
    }

    /// Trades committed since the store was created (unaffected by retention).
    pub fn committed_trades(&self) -> u64 {
        self.shared.committed_trades.load(Ordering::Relaxed)
    }

    // One-shot fault injection, for exercising failure paths.
    pub fn fail_next_begin(&self) {
        self.shared.faults.begin.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_read(&self) {
        self.shared.faults.read.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_commit(&self) {
        self.shared.faults.commit.store(true, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTxn>, StoreError> {
        if self.shared.faults.begin.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Begin("injected begin failure".into()));
        }
        Ok(Box::new(MemoryTxn {
            shared: self.shared.clone(),
            rows: Vec::new(),
            balance_deltas: HashMap::new(),
            positions: HashMap::new(),
            trades: Vec::new(),
            open: true,
        }))
    }
}

pub struct MemoryTxn {
    shared: Arc<Shared>,
    rows: Vec<LockGuard<RowKey>>,
    balance_deltas: HashMap<UserId, Decimal>,
    // None = row deleted in this transaction
    positions: HashMap<(UserId, String), Option<Holding>>,
    trades: Vec<TradeRecord>,
    open: bool,
}

impl MemoryTxn {
    /// Rows of one user are always locked account first, then positions.
    async fn lock_row(&mut self, key: RowKey) {
        if let RowKey::Position(user, _) = &key {
            self.lock_one(RowKey::Account(*user)).await;
        }
        self.lock_one(key).await;
    }

    async fn lock_one(&mut self, key: RowKey) {
        if self.rows.iter().any(|g| g.key() == &key) {
            return;
        }
        let guard = self.shared.rows.acquire(key).await;
        self.rows.push(guard);
    }

    fn check_open(&self) -> Result<(), String> {
        if self.open { Ok(()) } else { Err("transaction already finished".into()) }
    }

    fn check_read_fault(&self) -> Result<(), StoreError> {
        if self.shared.faults.read.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Read("injected read failure".into()));
        }
        Ok(())
    }

    async fn adjust_balance(&mut self, user: UserId, delta: Decimal) -> Result<(), StoreError> {
        self.check_open().map_err(StoreError::Write)?;
        self.lock_row(RowKey::Account(user)).await;
        if !self.shared.ledger.lock().accounts.contains_key(&user) {
            return Err(StoreError::Write(format!("account {user} not found")));
        }
        let staged = self.balance_deltas.entry(user).or_insert(Decimal::ZERO);
        *staged = staged
            .checked_add(delta)
            .ok_or_else(|| StoreError::Write(format!("balance change for user {user} out of range")))?;
        Ok(())
    }

    /// New balances for every touched account, or why the commit must fail.
    fn validate(&self, ledger: &Ledger) -> Result<Vec<(UserId, Decimal)>, String> {
        let mut balances = Vec::with_capacity(self.balance_deltas.len());
        for (user, delta) in &self.balance_deltas {
            let base = ledger.accounts.get(user).ok_or_else(|| format!("account {user} vanished"))?;
            let next = base.checked_add(*delta).ok_or_else(|| format!("balance of user {user} out of range"))?;
            if next < Decimal::ZERO {
                return Err(format!("balance of user {user} would become {next}"));
            }
            balances.push((*user, next));
        }
        for ((user, symbol), staged) in &self.positions {
            if matches!(staged, Some(h) if h.qty < 0) {
                return Err(format!("negative quantity for user {user} symbol {symbol}"));
            }
        }
        Ok(balances)
    }

    fn finish(&mut self) {
        self.balance_deltas.clear();
        self.positions.clear();
        self.trades.clear();
        self.rows.clear();
        self.open = false;
    }
}

#[async_trait]
impl LedgerTxn for MemoryTxn {
    async fn account_balance(&mut self, user: UserId, for_update: bool) -> Result<Option<Decimal>, StoreError> {
        self.check_open().map_err(StoreError::Read)?;
        self.check_read_fault()?;
        if for_update {
            self.lock_row(RowKey::Account(user)).await;
        }
        let base = self.shared.ledger.lock().accounts.get(&user).copied();
        let delta = self.balance_deltas.get(&user).copied().unwrap_or(Decimal::ZERO);
        Ok(base.map(|b| b + delta))
    }

    async fn debit_account(&mut self, user: UserId, amount: Decimal) -> Result<(), StoreError> {
        self.adjust_balance(user, -amount).await
    }

    async fn credit_account(&mut self, user: UserId, amount: Decimal) -> Result<(), StoreError> {
        self.adjust_balance(user, amount).await
    }

    async fn position(&mut self, user: UserId, symbol: &str, for_update: bool) -> Result<Option<Holding>, StoreError> {
        self.check_open().map_err(StoreError::Read)?;
        self.check_read_fault()?;
        if for_update {
            self.lock_row(RowKey::Position(user, symbol.to_string())).await;
        }
        let key = (user, symbol.to_string());
        if let Some(staged) = self.positions.get(&key) {
            return Ok(*staged);
        }
        Ok(self.shared.ledger.lock().positions.get(&key).copied())
    }

    async fn upsert_position(&mut self, user: UserId, symbol: &str, holding: Holding) -> Result<(), StoreError> {
        self.check_open().map_err(StoreError::Write)?;
        self.lock_row(RowKey::Position(user, symbol.to_string())).await;
        self.positions.insert((user, symbol.to_string()), Some(holding));
        Ok(())
    }

    async fn delete_position(&mut self, user: UserId, symbol: &str) -> Result<(), StoreError> {
        self.check_open().map_err(StoreError::Write)?;
        self.lock_row(RowKey::Position(user, symbol.to_string())).await;
        self.positions.insert((user, symbol.to_string()), None);
        Ok(())
    }

    async fn append_trade(&mut self, trade: NewTrade) -> Result<TradeId, StoreError> {
        self.check_open().map_err(StoreError::Write)?;
        let id = self.shared.next_trade_id.fetch_add(1, Ordering::SeqCst);
        self.trades.push(TradeRecord {
            id,
            user_id: trade.user_id,
            symbol: trade.symbol,
            side: trade.side,
            qty: trade.qty,
            px: trade.px,
            total: trade.total,
            ts: Utc::now(),
        });
        Ok(id)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.check_open().map_err(StoreError::Commit)?;
        if self.shared.faults.commit.swap(false, Ordering::SeqCst) {
            self.finish();
            return Err(StoreError::Commit("injected commit failure".into()));
        }

        let shared = self.shared.clone();
        let mut ledger = shared.ledger.lock();
        let balances = match self.validate(&ledger) {
            Ok(b) => b,
            Err(reason) => {
                drop(ledger);
                self.finish();
                return Err(StoreError::Commit(reason));
            }
        };

        for (user, next) in balances {
            ledger.accounts.insert(user, next);
        }
        for (key, staged) in self.positions.drain() {
            match staged {
                Some(h) if h.qty > 0 => {
                    ledger.positions.insert(key, h);
                }
                _ => {
                    ledger.positions.remove(&key);
                }
            }
        }
        let appended = self.trades.len() as u64;
        let limit = shared.history_limit;
        for trade in self.trades.drain(..) {
            let history = ledger.trades.entry(trade.user_id).or_default();
            history.push_back(trade);
            while history.len() > limit {
                history.pop_front();
            }
        }
        drop(ledger);

        shared.committed_trades.fetch_add(appended, Ordering::Relaxed);
        debug!(trades = appended, "memory store: committed");
        self.finish();
        Ok(())
    }

    async fn rollback(&mut self) {
        if self.open {
            debug!("memory store: rolled back");
        }
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use rust_decimal_macros::dec;
    use tokio::time::{timeout, Duration};

    fn trade(user: UserId, symbol: &str, qty: i64, px: Decimal) -> NewTrade {
        NewTrade { user_id: user, symbol: symbol.into(), side: Side::Buy, qty, px, total: px * Decimal::from(qty) }
    }

    #[tokio::test]
    async fn commit_applies_staged_writes() {
        let store = MemoryStore::new();
        store.create_account(1, dec!(1000)).unwrap();

        let mut txn = store.begin().await.unwrap();
        assert_eq!(txn.account_balance(1, true).await.unwrap(), Some(dec!(1000)));
        txn.debit_account(1, dec!(300)).await.unwrap();
        assert_eq!(txn.account_balance(1, true).await.unwrap(), Some(dec!(700)));
        txn.upsert_position(1, "AAPL", Holding { qty: 3, avg_cost: dec!(100) }).await.unwrap();
        let id = txn.append_trade(trade(1, "AAPL", 3, dec!(100))).await.unwrap();

        // nothing visible before commit
        assert_eq!(store.account(1).unwrap().balance, dec!(1000));
        assert!(store.position(1, "AAPL").is_none());

        txn.commit().await.unwrap();
        assert_eq!(store.account(1).unwrap().balance, dec!(700));
        assert_eq!(store.position(1, "AAPL").unwrap().qty, 3);
        assert_eq!(store.trades(1, 10)[0].id, id);
        assert_eq!(store.committed_trades(), 1);
    }

    #[tokio::test]
    async fn rollback_and_drop_discard_everything() {
        let store = MemoryStore::new();
        store.create_account(1, dec!(50)).unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.credit_account(1, dec!(10)).await.unwrap();
        txn.append_trade(trade(1, "X", 1, dec!(10))).await.unwrap();
        txn.rollback().await;
        txn.rollback().await;
        assert!(txn.commit().await.is_err());

        {
            let mut dropped = store.begin().await.unwrap();
            dropped.debit_account(1, dec!(10)).await.unwrap();
        }

        assert_eq!(store.account(1).unwrap().balance, dec!(50));
        assert!(store.trades(1, 10).is_empty());

        // row lock was released by the drop
        let mut again = store.begin().await.unwrap();
        let r = timeout(Duration::from_millis(100), again.account_balance(1, true)).await;
        assert_eq!(r.unwrap().unwrap(), Some(dec!(50)));
    }

    #[tokio::test]
    async fn commit_refuses_negative_balance() {
        let store = MemoryStore::new();
        store.create_account(1, dec!(5)).unwrap();
        let mut txn = store.begin().await.unwrap();
        txn.debit_account(1, dec!(6)).await.unwrap();
        let err = txn.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Commit(_)));
        assert_eq!(store.account(1).unwrap().balance, dec!(5));
    }

    #[tokio::test]
    async fn for_update_read_waits_for_other_transaction() {
        let store = MemoryStore::new();
        store.create_account(1, dec!(100)).unwrap();

        let mut first = store.begin().await.unwrap();
        first.account_balance(1, true).await.unwrap();

        let s2 = store.clone();
        let second = tokio::spawn(async move {
            let mut txn = s2.begin().await.unwrap();
            let seen = txn.account_balance(1, true).await.unwrap();
            txn.rollback().await;
            seen
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!second.is_finished());

        first.debit_account(1, dec!(40)).await.unwrap();
        first.commit().await.unwrap();
        assert_eq!(second.await.unwrap(), Some(dec!(60)));
    }

    #[tokio::test]
    async fn sell_and_buy_shapes_do_not_deadlock() {
        let store = MemoryStore::new();
        store.create_account(1, dec!(1000)).unwrap();
        let mut seed = store.begin().await.unwrap();
        seed.upsert_position(1, "AAPL", Holding { qty: 5, avg_cost: dec!(10) }).await.unwrap();
        seed.commit().await.unwrap();

        // sell shape: position row first, account row later
        let mut sell = store.begin().await.unwrap();
        let held = sell.position(1, "AAPL", true).await.unwrap().unwrap();

        // buy shape on the same user, as a second engine would run it
        let s2 = store.clone();
        let buy = tokio::spawn(async move {
            let mut txn = s2.begin().await.unwrap();
            let balance = txn.account_balance(1, true).await.unwrap().unwrap();
            txn.debit_account(1, dec!(10)).await.unwrap();
            let cur = txn.position(1, "AAPL", true).await.unwrap().unwrap();
            txn.upsert_position(1, "AAPL", Holding { qty: cur.qty + 1, avg_cost: cur.avg_cost }).await.unwrap();
            txn.commit().await.unwrap();
            balance
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!buy.is_finished());

        let credit = timeout(Duration::from_millis(500), sell.credit_account(1, dec!(20))).await;
        credit.expect("sell blocked on its own account row").unwrap();
        sell.upsert_position(1, "AAPL", Holding { qty: held.qty - 2, avg_cost: held.avg_cost }).await.unwrap();
        sell.commit().await.unwrap();

        let seen = timeout(Duration::from_millis(500), buy).await.expect("buy never finished").unwrap();
        assert_eq!(seen, dec!(1020));
        assert_eq!(store.account(1).unwrap().balance, dec!(1010));
        assert_eq!(store.position(1, "AAPL").unwrap().qty, 4);
    }

    #[tokio::test]
    async fn zero_quantity_upsert_removes_row() {
        let store = MemoryStore::new();
        store.create_account(1, dec!(0)).unwrap();
        let mut txn = store.begin().await.unwrap();
        txn.upsert_position(1, "AAPL", Holding { qty: 2, avg_cost: dec!(1) }).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.upsert_position(1, "AAPL", Holding { qty: 0, avg_cost: dec!(1) }).await.unwrap();
        txn.commit().await.unwrap();
        assert!(store.positions(1).is_empty());
    }

    #[tokio::test]
    async fn history_is_trimmed_per_user() {
        let store = MemoryStore::with_history_limit(3);
        store.create_account(1, dec!(0)).unwrap();
        store.create_account(2, dec!(0)).unwrap();
        for _ in 0..5 {
            let mut txn = store.begin().await.unwrap();
            txn.append_trade(trade(1, "A", 1, dec!(1))).await.unwrap();
            txn.commit().await.unwrap();
        }
        let mut txn = store.begin().await.unwrap();
        txn.append_trade(trade(2, "A", 1, dec!(1))).await.unwrap();
        txn.commit().await.unwrap();

        let ids: Vec<TradeId> = store.trades(1, 10).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(store.trades(2, 10).len(), 1);
        assert_eq!(store.committed_trades(), 6);
    }

    #[tokio::test]
    async fn faults_fire_once() {
        let store = MemoryStore::new();
        store.create_account(1, dec!(10)).unwrap();

        store.fail_next_begin();
        assert!(matches!(store.begin().await, Err(StoreError::Begin(_))));
        let mut txn = store.begin().await.unwrap();

        store.fail_next_read();
        assert!(matches!(txn.account_balance(1, false).await, Err(StoreError::Read(_))));
        assert_eq!(txn.account_balance(1, false).await.unwrap(), Some(dec!(10)));

        store.fail_next_commit();
        txn.credit_account(1, dec!(1)).await.unwrap();
        assert!(matches!(txn.commit().await, Err(StoreError::Commit(_))));
        assert_eq!(store.account(1).unwrap().balance, dec!(10));
    }

    #[test]
    fn provisioning_rules() {
        let store = MemoryStore::new();
        store.create_account(1, dec!(10)).unwrap();
        assert!(store.create_account(1, dec!(10)).is_err());
        assert!(store.create_account(2, dec!(-1)).is_err());
        assert_eq!(store.users(), vec![1]);
    }
}
