//! Property-based tests for ledger invariants.
//!
//! Random order streams go through the real pool; the resulting ledger is
//! compared against a plain sequential model.

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use trade_engine_rust::executor::weighted_avg_cost;
use trade_engine_rust::*;

const SYMBOLS: [&str; 3] = ["AAPL", "MSFT", "TSLA"];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn order_strategy(user: UserId) -> impl Strategy<Value = OrderRequest> {
    (any::<bool>(), 0usize..SYMBOLS.len(), 1i64..=20, 1i64..=50_000).prop_map(move |(buy, s, qty, cents)| {
        let px = Decimal::new(cents, 2); // $0.01 to $500
        if buy {
            OrderRequest::buy(user, SYMBOLS[s], qty, px)
        } else {
            OrderRequest::sell(user, SYMBOLS[s], qty, px)
        }
    })
}

/// Sequential reference: what a single-threaded ledger would do.
#[derive(Default)]
struct Model {
    cash: Decimal,
    holdings: HashMap<String, Holding>,
}

impl Model {
    fn apply(&mut self, o: &OrderRequest) -> &'static str {
        let total = o.notional().unwrap();
        match o.side {
            Side::Buy => {
                if self.cash < total {
                    return "insufficient_funds";
                }
                self.cash -= total;
                let next = match self.holdings.get(&o.symbol) {
                    Some(cur) => Holding { qty: cur.qty + o.qty, avg_cost: weighted_avg_cost(*cur, o.qty, o.px).unwrap() },
                    None => Holding { qty: o.qty, avg_cost: o.px },
                };
                self.holdings.insert(o.symbol.clone(), next);
            }
            Side::Sell => {
                let Some(cur) = self.holdings.get(&o.symbol).copied() else {
                    return "position_not_found";
                };
                if cur.qty < o.qty {
                    return "insufficient_shares";
                }
                self.cash += total;
                if cur.qty == o.qty {
                    self.holdings.remove(&o.symbol);
                } else {
                    self.holdings.insert(o.symbol.clone(), Holding { qty: cur.qty - o.qty, avg_cost: cur.avg_cost });
                }
            }
        }
        "ok"
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// One submitter at a time: every outcome and the final ledger match the model.
    #[test]
    fn sequential_orders_match_model(
        start in (100i64..=20_000).prop_map(Decimal::from),
        orders in prop::collection::vec(order_strategy(1), 1..40),
    ) {
        let (codes, balance, positions) = runtime().block_on(async {
            let store = MemoryStore::new();
            store.create_account(1, start).unwrap();
            let mut pool = WorkerPool::new(PoolCfg::new(3, 8), Arc::new(store.clone()));
            pool.start();
            let gw = pool.gateway();
            let mut codes = Vec::new();
            for o in &orders {
                codes.push(gw.submit(o.clone()).await.outcome());
            }
            pool.stop().await;
            (codes, store.account(1).unwrap().balance, store.positions(1))
        });

        let mut model = Model { cash: start, ..Default::default() };
        for (o, got) in orders.iter().zip(&codes) {
            prop_assert_eq!(model.apply(o), *got);
        }
        prop_assert_eq!(balance, model.cash);
        prop_assert!(balance >= Decimal::ZERO);
        prop_assert_eq!(positions.len(), model.holdings.len());
        for p in &positions {
            let h = model.holdings[&p.symbol];
            prop_assert!(p.qty > 0);
            prop_assert_eq!((p.qty, p.avg_cost), (h.qty, h.avg_cost));
        }
    }

    /// Average cost always sits between the cheapest and dearest buy of the position.
    #[test]
    fn average_cost_is_bounded_by_buy_prices(
        buys in prop::collection::vec((1i64..=50, 1i64..=100_000), 1..25),
    ) {
        let holding = runtime().block_on(async {
            let store = MemoryStore::new();
            store.create_account(1, dec!(10_000_000_000)).unwrap();
            let mut pool = WorkerPool::new(PoolCfg::new(2, 4), Arc::new(store.clone()));
            pool.start();
            let gw = pool.gateway();
            for &(qty, cents) in &buys {
                assert!(gw.submit(OrderRequest::buy(1, "AAPL", qty, Decimal::new(cents, 2))).await.success);
            }
            pool.stop().await;
            store.position(1, "AAPL").unwrap()
        });

        let lo = Decimal::new(buys.iter().map(|b| b.1).min().unwrap(), 2);
        let hi = Decimal::new(buys.iter().map(|b| b.1).max().unwrap(), 2);
        let eps = dec!(0.000001);
        prop_assert_eq!(holding.qty, buys.iter().map(|b| b.0).sum::<i64>());
        prop_assert!(holding.avg_cost >= lo - eps && holding.avg_cost <= hi + eps);
    }

    /// Concurrent submitters across users: each user's cash and shares add up
    /// exactly to the fills that user received, whatever the interleaving.
    #[test]
    fn concurrent_fills_add_up_per_user(
        orders in prop::collection::vec((1i64..=3).prop_flat_map(order_strategy), 1..60),
    ) {
        let start = dec!(2000);
        let (results, ledger) = runtime().block_on(async {
            let store = MemoryStore::new();
            for u in 1..=3 {
                store.create_account(u, start).unwrap();
            }
            let mut pool = WorkerPool::new(PoolCfg::new(4, 4), Arc::new(store.clone()));
            pool.start();
            let gw = pool.gateway();
            let tasks: Vec<_> = orders
                .iter()
                .cloned()
                .map(|o| {
                    let gw = gw.clone();
                    tokio::spawn(async move { (o.clone(), gw.submit(o).await) })
                })
                .collect();
            let mut results = Vec::new();
            for t in tasks {
                results.push(t.await.unwrap());
            }
            pool.stop().await;
            let ledger: Vec<(Decimal, Vec<Position>)> =
                (1..=3).map(|u| (store.account(u).unwrap().balance, store.positions(u))).collect();
            (results, ledger)
        });

        let mut cash: HashMap<UserId, Decimal> = (1..=3).map(|u| (u, start)).collect();
        let mut qty: HashMap<(UserId, String), i64> = HashMap::new();
        for (o, r) in &results {
            if !r.success {
                prop_assert!(r.error.as_ref().unwrap().is_business());
                continue;
            }
            prop_assert_eq!(Some(r.total_amount), o.notional());
            let signed = match o.side { Side::Buy => o.qty, Side::Sell => -o.qty };
            *cash.get_mut(&o.user_id).unwrap() -= r.total_amount * Decimal::from(signed.signum());
            *qty.entry((o.user_id, o.symbol.clone())).or_insert(0) += signed;
        }

        for (i, (balance, positions)) in ledger.iter().enumerate() {
            let u = i as UserId + 1;
            prop_assert_eq!(*balance, cash[&u]);
            for s in SYMBOLS {
                let held = positions.iter().find(|p| p.symbol == s).map(|p| p.qty).unwrap_or(0);
                prop_assert_eq!(held, qty.get(&(u, s.to_string())).copied().unwrap_or(0));
            }
        }
    }
}
