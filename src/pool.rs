// ===============================
// src/pool.rs (bounded worker pool)
// ===============================
//
// N workers share one bounded mpsc queue (receiver behind an async mutex).
// Per job: per-user lock -> executor (panic-guarded) -> release -> reply.
//
// Shutdown = drain: stop() flips the watch flag; the first worker that sees it
// closes the queue, so new submissions are refused while everything already
// queued is still processed. stop() returns once every worker has exited.
//
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::config::PoolCfg;
use crate::domain::{Event, OrderRequest, OrderResult, UserId};
use crate::error::OrderError;
use crate::executor;
use crate::gateway::Gateway;
use crate::locks::LockRegistry;
use crate::metrics::{
    self, EXEC_MS, LOCK_ENTRIES, LOCK_WAIT_MS, POOL_WORKERS, QUEUE_DEPTH, QUEUE_WAIT_MS, WORKERS_BUSY,
};
use crate::store::LedgerStore;

/// An order plus the private channel its result goes back on.
pub struct Job {
    pub(crate) order: OrderRequest,
    pub(crate) reply: oneshot::Sender<OrderResult>,
    pub(crate) enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState { Created, Running, Stopped }

pub struct WorkerPool {
    cfg: PoolCfg,
    store: Arc<dyn LedgerStore>,
    locks: Arc<LockRegistry<UserId>>,
    queue_tx: mpsc::Sender<Job>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    shutdown_tx: watch::Sender<bool>,
    journal: Option<mpsc::Sender<Event>>,
    workers: Vec<JoinHandle<()>>,
    state: PoolState,
}

impl WorkerPool {
    pub fn new(cfg: PoolCfg, store: Arc<dyn LedgerStore>) -> Self {
        let cfg = cfg.sanitized();
        let (queue_tx, queue_rx) = mpsc::channel::<Job>(cfg.queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            cfg,
            store,
            locks: Arc::new(LockRegistry::new()),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            shutdown_tx,
            journal: None,
            workers: Vec::new(),
            state: PoolState::Created,
        }
    }

    /// Every processed order is also sent (best effort) to this channel.
    pub fn with_journal(mut self, journal: mpsc::Sender<Event>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn gateway(&self) -> Gateway {
        Gateway::new(self.queue_tx.clone())
    }

    pub fn locks(&self) -> Arc<LockRegistry<UserId>> {
        self.locks.clone()
    }

    pub fn cfg(&self) -> &PoolCfg {
        &self.cfg
    }

    pub fn is_running(&self) -> bool {
        self.state == PoolState::Running
    }

    /// Spawns the workers. Must run inside a tokio runtime; only the first call has an effect.
    pub fn start(&mut self) {
        if self.state != PoolState::Created {
            warn!(state = ?self.state, "start ignored");
            return;
        }
        for id in 0..self.cfg.workers {
            let worker = Worker {
                id,
                store: self.store.clone(),
                locks: self.locks.clone(),
                queue_rx: self.queue_rx.clone(),
                shutdown_rx: self.shutdown_tx.subscribe(),
                journal: self.journal.clone(),
            };
            self.workers.push(tokio::spawn(worker.run()));
        }
        self.state = PoolState::Running;
        POOL_WORKERS.set(self.cfg.workers as i64);
        info!(workers = self.cfg.workers, queue_capacity = self.cfg.queue_capacity, "started trade workers");
    }

    /// Stops intake, waits for queued and in-flight orders to finish, then for every worker to exit.
    pub async fn stop(&mut self) {
        if self.state == PoolState::Stopped {
            warn!("stop ignored, already stopped");
            return;
        }
        self.shutdown_tx.send_replace(true);

        for (id, handle) in self.workers.drain(..).enumerate() {
            if let Err(e) = handle.await {
                error!(worker = id, ?e, "worker task failed");
            }
        }

        // only non-empty when stop() runs without start()
        let mut rx = self.queue_rx.lock().await;
        rx.close();
        let mut refused = 0usize;
        while let Ok(job) = rx.try_recv() {
            QUEUE_DEPTH.dec();
            let _ = job.reply.send(OrderResult::failed(OrderError::EngineStopped));
            refused += 1;
        }
        drop(rx);

        self.state = PoolState::Stopped;
        POOL_WORKERS.set(0);
        info!(refused, "trade processor stopped");
    }
}

struct Worker {
    id: usize,
    store: Arc<dyn LedgerStore>,
    locks: Arc<LockRegistry<UserId>>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    shutdown_rx: watch::Receiver<bool>,
    journal: Option<mpsc::Sender<Event>>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = self.id, "worker started");
        while let Some(job) = self.next_job().await {
            QUEUE_DEPTH.dec();
            self.process(job).await;
        }
        debug!(worker = self.id, "worker stopping");
    }

    /// Idle state. `None` once shutdown was seen and the queue is drained.
    async fn next_job(&mut self) -> Option<Job> {
        let mut rx = self.queue_rx.lock().await;
        if *self.shutdown_rx.borrow() {
            rx.close();
            return rx.recv().await;
        }
        tokio::select! {
            biased;
            job = rx.recv() => job,
            // Err means the pool was dropped: treat like stop()
            _ = self.shutdown_rx.changed() => {
                rx.close();
                rx.recv().await
            }
        }
    }

    async fn process(&self, job: Job) {
        let Job { order, reply, enqueued_at } = job;
        QUEUE_WAIT_MS.observe(metrics::elapsed_ms(enqueued_at));
        WORKERS_BUSY.inc();
        debug!(worker = self.id, user_id = order.user_id, symbol = %order.symbol, side = %order.side, qty = order.qty, "processing order");

        let lock_started = Instant::now();
        let guard = self.locks.acquire(order.user_id).await;
        LOCK_WAIT_MS.observe(metrics::elapsed_ms(lock_started));
        LOCK_ENTRIES.set(self.locks.len() as i64);

        let exec_started = Instant::now();
        let outcome = AssertUnwindSafe(executor::execute(self.store.as_ref(), &order))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic_reason(panic.as_ref());
                error!(worker = self.id, user_id = order.user_id, %reason, "executor panicked");
                Err(OrderError::ExecutorPanicked { reason })
            });
        guard.release();
        EXEC_MS.observe(metrics::elapsed_ms(exec_started));
        WORKERS_BUSY.dec();

        let result = OrderResult::from(outcome);
        self.report(&order, &result);

        if reply.send(result).is_err() {
            debug!(worker = self.id, user_id = order.user_id, "submitter went away before the result");
        }
    }

    fn report(&self, order: &OrderRequest, result: &OrderResult) {
        metrics::record_outcome(order, result);
        match &result.error {
            None => debug!(
                worker = self.id,
                trade_id = ?result.trade_id,
                user_id = order.user_id,
                total = %result.total_amount,
                "worker completed trade"
            ),
            Some(e) if e.is_business() => {
                info!(worker = self.id, user_id = order.user_id, symbol = %order.symbol, code = e.code(), reason = %e, "order rejected")
            }
            Some(e) => {
                warn!(worker = self.id, user_id = order.user_id, symbol = %order.symbol, code = e.code(), reason = %e, "order failed")
            }
        }
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(Event::from_result(order, result));
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
