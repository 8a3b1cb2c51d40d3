// ===============================
// src/gateway.rs (submission gateway)
// ===============================
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::debug;

use crate::domain::{OrderRequest, OrderResult};
use crate::error::OrderError;
use crate::metrics::{self, ORDER_LATENCY_MS, QUEUE_DEPTH};
use crate::pool::Job;

/// Cheap to clone; hand one to every caller (HTTP handler, load generator, test).
#[derive(Clone)]
pub struct Gateway {
    queue_tx: mpsc::Sender<Job>,
}

/// Counts a submission in `queue_depth` until it is handed to the queue.
/// Dropped before that (send failed, or the caller gave up while waiting) = uncounted.
struct DepthSlot {
    queued: bool,
}

impl DepthSlot {
    fn take() -> Self {
        QUEUE_DEPTH.inc();
        Self { queued: false }
    }

    // from here on the worker that dequeues the job does the dec
    fn queued(mut self) {
        self.queued = true;
    }
}

impl Drop for DepthSlot {
    fn drop(&mut self) {
        if !self.queued {
            QUEUE_DEPTH.dec();
        }
    }
}

impl Gateway {
    pub(crate) fn new(queue_tx: mpsc::Sender<Job>) -> Self {
        Self { queue_tx }
    }

    /// Enqueues the order and waits for its result.
    ///
    /// A full queue makes this wait for room (backpressure), it never fails
    /// because of it. Exactly one result comes back per call: the trade, a
    /// rejection, or `EngineStopped` if the pool no longer accepts work.
    pub async fn submit(&self, order: OrderRequest) -> OrderResult {
        let started = Instant::now();
        let side = order.side;
        let order = match order.validate() {
            Ok(o) => o,
            Err(e) => {
                metrics::ORDERS.with_label_values(&[side.as_str(), e.code()]).inc();
                return OrderResult::failed(e);
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job { order, reply: reply_tx, enqueued_at: started };

        let slot = DepthSlot::take();
        match self.queue_tx.send(job).await {
            Ok(()) => slot.queued(),
            Err(mpsc::error::SendError(job)) => {
                drop(slot);
                debug!(user_id = job.order.user_id, "queue closed, order refused");
                let result = OrderResult::failed(OrderError::EngineStopped);
                metrics::record_outcome(&job.order, &result);
                return result;
            }
        }

        // the worker always replies; a dropped sender means its task was torn down
        let result = reply_rx.await.unwrap_or_else(|_| OrderResult::failed(OrderError::EngineStopped));
        ORDER_LATENCY_MS.observe(metrics::elapsed_ms(started));
        result
    }

    /// Orders waiting in the queue right now.
    pub fn queued(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// True once the pool has shut its queue.
    pub fn is_closed(&self) -> bool {
        self.queue_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::time::{sleep, Duration};

    // the only lib test touching QUEUE_DEPTH, so the absolute values are stable
    #[tokio::test]
    async fn queue_depth_survives_cancelled_and_refused_submits() {
        let base = QUEUE_DEPTH.get();
        let (tx, mut rx) = mpsc::channel::<Job>(1);
        let gw = Gateway::new(tx);
        let order = || OrderRequest::buy(1, "AAPL", 1, dec!(10));

        let first = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.submit(order()).await })
        };
        let blocked = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.submit(order()).await })
        };
        sleep(Duration::from_millis(30)).await;
        assert_eq!(gw.queued(), 1);
        assert_eq!(QUEUE_DEPTH.get(), base + 2);

        // caller gives up while waiting for queue room
        blocked.abort();
        let _ = blocked.await;
        assert_eq!(QUEUE_DEPTH.get(), base + 1);

        // stand-in worker
        let job = rx.recv().await.unwrap();
        QUEUE_DEPTH.dec();
        let _ = job.reply.send(OrderResult::filled(7, dec!(10)));
        assert_eq!(first.await.unwrap().trade_id, Some(7));
        assert_eq!(QUEUE_DEPTH.get(), base);

        drop(rx);
        let refused = gw.submit(order()).await;
        assert_eq!(refused.error, Some(OrderError::EngineStopped));
        assert_eq!(QUEUE_DEPTH.get(), base);
    }
}
