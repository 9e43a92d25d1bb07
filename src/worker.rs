//! Pool of queue consumers.
//!
//! Each worker owns one consumer on one queue and handles its deliveries one
//! at a time. A worker that loses its consumer waits for the backoff and
//! starts over; cancellation stops it between deliveries.

use crate::broker::{Broker, DeliveryStream, QueueMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// How a handled delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject,
}

/// Processes one delivery body.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, body: &[u8], queue: &str, worker_id: &str) -> Disposition;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Graceful,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub queues: Vec<String>,
    pub replicas: usize,
    /// Pause before every (re)initialization of a worker's consumer.
    pub backoff: Duration,
}

/// Fixed set of workers: `replicas` per queue.
pub struct WorkerPool {
    workers: JoinSet<()>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawns every worker onto the current runtime.
    pub fn start<B, H>(
        broker: Arc<B>,
        handler: Arc<H>,
        options: PoolOptions,
        cancel: CancellationToken,
    ) -> Self
    where
        B: Broker,
        H: DeliveryHandler,
    {
        let mut workers = JoinSet::new();

        for replica in 1..=options.replicas {
            for queue in &options.queues {
                let worker = Worker {
                    id: format!("{}_{}", queue, replica),
                    queue: queue.clone(),
                    broker: Arc::clone(&broker),
                    handler: Arc::clone(&handler),
                    backoff: options.backoff,
                    cancel: cancel.clone(),
                };
                let span = tracing::info_span!("worker", worker = %worker.id);
                workers.spawn(worker.run().instrument(span));
            }
        }

        info!(workers = workers.len(), "Worker pool started");
        Self { workers, cancel }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Raises cancellation and waits up to `deadline` for every worker.
    ///
    /// Workers still running at the deadline are aborted.
    pub async fn shutdown(mut self, deadline: Duration) -> ShutdownOutcome {
        self.cancel.cancel();
        info!("Waiting for workers to finish");

        let drain = async {
            while let Some(joined) = self.workers.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Worker task failed");
                }
            }
        };

        match tokio::time::timeout(deadline, drain).await {
            Ok(()) => {
                info!("All workers stopped");
                ShutdownOutcome::Graceful
            }
            Err(_) => {
                warn!(
                    remaining = self.workers.len(),
                    "Shutdown deadline of {:?} reached, aborting workers", deadline
                );
                self.workers.abort_all();
                ShutdownOutcome::TimedOut
            }
        }
    }
}

struct Worker<B, H> {
    id: String,
    queue: String,
    broker: Arc<B>,
    handler: Arc<H>,
    backoff: Duration,
    cancel: CancellationToken,
}

impl<B, H> Worker<B, H>
where
    B: Broker,
    H: DeliveryHandler,
{
    async fn run(self) {
        info!(queue = %self.queue, "Starting consumer");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }

            let mut consumer = match self.broker.consume(&self.queue, &self.id).await {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Failed to start consumer, retrying");
                    continue;
                }
            };
            info!(queue = %self.queue, "Consuming, waiting for messages");

            let stop = self.consume(&mut consumer).await;
            consumer.close().await;
            if stop {
                break;
            }
        }

        info!(queue = %self.queue, "Consumer stopped");
    }

    /// Handles deliveries until cancellation (`true`) or consumer loss (`false`).
    async fn consume(&self, consumer: &mut B::Consumer) -> bool {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return true,
                next = consumer.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => self.settle(delivery).await,
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "Consumer failed, reinitializing");
                    return false;
                }
                None => {
                    warn!(queue = %self.queue, "Consumer closed, reinitializing");
                    return false;
                }
            }
        }
    }

    async fn settle(&self, delivery: <B::Consumer as DeliveryStream>::Delivery) {
        let queue = match delivery.routing_key() {
            "" => self.queue.as_str(),
            key => key,
        };

        let disposition = self.handler.handle(delivery.body(), queue, &self.id).await;
        let settled = match disposition {
            Disposition::Ack => delivery.ack().await,
            Disposition::Reject => delivery.reject().await,
        };

        match settled {
            Ok(()) => debug!(queue = %queue, ?disposition, "Delivery settled"),
            Err(e) => error!(queue = %queue, ?disposition, error = %e, "Failed to settle delivery"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Settled {
        Acked(Vec<u8>),
        Rejected(Vec<u8>),
    }

    struct FakeDelivery {
        body: Vec<u8>,
        log: Arc<Mutex<Vec<Settled>>>,
    }

    #[async_trait]
    impl QueueMessage for FakeDelivery {
        fn body(&self) -> &[u8] {
            &self.body
        }

        fn routing_key(&self) -> &str {
            "jobs"
        }

        async fn ack(&self) -> Result<(), BrokerError> {
            self.log.lock().unwrap().push(Settled::Acked(self.body.clone()));
            Ok(())
        }

        async fn reject(&self) -> Result<(), BrokerError> {
            self.log.lock().unwrap().push(Settled::Rejected(self.body.clone()));
            Ok(())
        }
    }

    struct FakeConsumer {
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        log: Arc<Mutex<Vec<Settled>>>,
    }

    #[async_trait]
    impl DeliveryStream for FakeConsumer {
        type Delivery = FakeDelivery;

        async fn next_delivery(&mut self) -> Option<Result<FakeDelivery, BrokerError>> {
            let body = self.rx.recv().await?;
            Some(Ok(FakeDelivery {
                body,
                log: Arc::clone(&self.log),
            }))
        }

        async fn close(&mut self) {
            self.rx.close();
        }
    }

    /// Each `consume` call takes the next prepared message channel.
    struct FakeBroker {
        consumers: Mutex<Vec<mpsc::UnboundedReceiver<Vec<u8>>>>,
        consume_calls: AtomicUsize,
        log: Arc<Mutex<Vec<Settled>>>,
    }

    impl FakeBroker {
        fn new(consumers: Vec<mpsc::UnboundedReceiver<Vec<u8>>>) -> Self {
            Self {
                consumers: Mutex::new(consumers),
                consume_calls: AtomicUsize::new(0),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn settled(&self) -> Vec<Settled> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Broker for FakeBroker {
        type Consumer = FakeConsumer;

        async fn consume(&self, _queue: &str, _tag: &str) -> Result<FakeConsumer, BrokerError> {
            self.consume_calls.fetch_add(1, Ordering::SeqCst);
            let mut consumers = self.consumers.lock().unwrap();
            if consumers.is_empty() {
                return Err(BrokerError::NotConnected);
            }
            Ok(FakeConsumer {
                rx: consumers.remove(0),
                log: Arc::clone(&self.log),
            })
        }
    }

    /// Acks bodies starting with `ok`, rejects everything else.
    struct PrefixHandler {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DeliveryHandler for PrefixHandler {
        async fn handle(&self, body: &[u8], queue: &str, worker_id: &str) -> Disposition {
            self.seen
                .lock()
                .unwrap()
                .push((queue.to_string(), worker_id.to_string()));
            if body.starts_with(b"ok") {
                Disposition::Ack
            } else {
                Disposition::Reject
            }
        }
    }

    fn options(replicas: usize) -> PoolOptions {
        PoolOptions {
            queues: vec!["jobs".to_string()],
            replicas,
            backoff: Duration::from_millis(10),
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_deliveries_are_settled_by_disposition() {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = Arc::new(FakeBroker::new(vec![rx]));
        let handler = Arc::new(PrefixHandler {
            seen: Mutex::new(Vec::new()),
        });

        let pool = WorkerPool::start(
            Arc::clone(&broker),
            Arc::clone(&handler),
            options(1),
            CancellationToken::new(),
        );

        tx.send(b"ok-1".to_vec()).unwrap();
        tx.send(b"bad".to_vec()).unwrap();
        wait_until(|| broker.settled().len() == 2).await;

        assert_eq!(
            broker.settled(),
            vec![Settled::Acked(b"ok-1".to_vec()), Settled::Rejected(b"bad".to_vec())]
        );
        assert_eq!(
            handler.seen.lock().unwrap()[0],
            ("jobs".to_string(), "jobs_1".to_string())
        );

        assert_eq!(pool.shutdown(Duration::from_secs(1)).await, ShutdownOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_closed_consumer_is_reinitialized() {
        let (first_tx, first_rx) = mpsc::unbounded_channel();
        let (second_tx, second_rx) = mpsc::unbounded_channel();
        let broker = Arc::new(FakeBroker::new(vec![first_rx, second_rx]));
        let handler = Arc::new(PrefixHandler {
            seen: Mutex::new(Vec::new()),
        });

        let pool = WorkerPool::start(
            Arc::clone(&broker),
            handler,
            options(1),
            CancellationToken::new(),
        );

        first_tx.send(b"ok-first".to_vec()).unwrap();
        wait_until(|| broker.settled().len() == 1).await;
        drop(first_tx);

        second_tx.send(b"ok-second".to_vec()).unwrap();
        wait_until(|| broker.settled().len() == 2).await;

        assert_eq!(broker.consume_calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.shutdown(Duration::from_secs(1)).await, ShutdownOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_workers_per_queue_and_replica() {
        let broker = Arc::new(FakeBroker::new(Vec::new()));
        let handler = Arc::new(PrefixHandler {
            seen: Mutex::new(Vec::new()),
        });
        let mut opts = options(3);
        opts.queues.push("other".to_string());

        let pool = WorkerPool::start(broker, handler, opts, CancellationToken::new());

        assert_eq!(pool.len(), 6);
        assert_eq!(pool.shutdown(Duration::from_secs(1)).await, ShutdownOutcome::Graceful);
    }

    /// Blocks until released, ignoring cancellation.
    struct SlowHandler {
        started: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl DeliveryHandler for SlowHandler {
        async fn handle(&self, _body: &[u8], _queue: &str, _worker_id: &str) -> Disposition {
            self.started.notify_one();
            self.release.notified().await;
            Disposition::Ack
        }
    }

    #[tokio::test]
    async fn test_in_flight_delivery_finishes_after_cancel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = Arc::new(FakeBroker::new(vec![rx]));
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let handler = Arc::new(SlowHandler {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });

        let pool = WorkerPool::start(
            Arc::clone(&broker),
            handler,
            options(1),
            CancellationToken::new(),
        );

        tx.send(b"ok".to_vec()).unwrap();
        started.notified().await;

        let releaser = {
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                release.notify_one();
            })
        };

        assert_eq!(pool.shutdown(Duration::from_secs(5)).await, ShutdownOutcome::Graceful);
        releaser.await.unwrap();

        assert_eq!(broker.settled(), vec![Settled::Acked(b"ok".to_vec())]);
    }

    #[tokio::test]
    async fn test_shutdown_deadline() {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = Arc::new(FakeBroker::new(vec![rx]));
        let started = Arc::new(tokio::sync::Notify::new());
        let handler = Arc::new(SlowHandler {
            started: Arc::clone(&started),
            release: Arc::new(tokio::sync::Notify::new()),
        });

        let pool = WorkerPool::start(broker, handler, options(1), CancellationToken::new());

        tx.send(b"ok".to_vec()).unwrap();
        started.notified().await;

        assert_eq!(
            pool.shutdown(Duration::from_millis(50)).await,
            ShutdownOutcome::TimedOut
        );
    }
}
