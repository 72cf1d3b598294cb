//! Queue listener pool: a fixed set of workers that dequeue, run a handler,
//! and ack or nack. Stopping refuses new dequeues, then waits for in-flight
//! handlers to finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::task::JoinHandle;

use crate::error::{CResult, Error};
use crate::store::Kv;

use super::QueueMessage;

/// Message handler capability. `on_error` observes handler and queue
/// failures; the default just logs.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> CResult<()>;

    async fn on_error(&self, err: &Error) {
        warn!("queue handler error: {}", err);
    }
}

/// Options for [`Kv::listen`].
#[derive(Clone, Debug)]
pub struct ListenOptions {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
}

impl Default for ListenOptions {
    fn default() -> Self {
        ListenOptions { concurrency: 1, poll_interval_ms: 1000 }
    }
}

/// Handle over a running listener pool.
pub struct QueueListener {
    stopping: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Kv {
    /// Spawns up to `concurrency` workers that each dequeue one message at a
    /// time, run `handler`, and ack on success or nack on failure.
    pub fn listen(&self, handler: Arc<dyn QueueHandler>, options: ListenOptions) -> QueueListener {
        let stopping = Arc::new(AtomicBool::new(false));
        let workers = (0..options.concurrency.max(1))
            .map(|worker| {
                let kv = self.clone();
                let handler = handler.clone();
                let stopping = stopping.clone();
                let poll = Duration::from_millis(options.poll_interval_ms.max(1));
                tokio::spawn(async move {
                    log::debug!("queue worker {} started", worker);
                    while !stopping.load(Ordering::SeqCst) {
                        match kv.dequeue() {
                            Ok(Some(message)) => {
                                let id = message.id.clone();
                                match handler.handle(message).await {
                                    Ok(()) => {
                                        if let Err(err) = kv.ack(&id) {
                                            handler.on_error(&err).await;
                                        }
                                    }
                                    Err(err) => {
                                        handler.on_error(&err).await;
                                        if let Err(err) = kv.nack(&id) {
                                            handler.on_error(&err).await;
                                        }
                                    }
                                }
                            }
                            Ok(None) => tokio::time::sleep(poll).await,
                            Err(err) => {
                                handler.on_error(&err).await;
                                tokio::time::sleep(poll).await;
                            }
                        }
                    }
                    log::debug!("queue worker {} stopped", worker);
                })
            })
            .collect();
        QueueListener { stopping, workers }
    }
}

impl QueueListener {
    /// Refuses new dequeues, waits for in-flight handlers, then returns.
    pub async fn stop(self) {
        self.stopping.store(true, Ordering::SeqCst);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::queue::EnqueueOptions;

    struct Collector {
        seen: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl QueueHandler for Collector {
        async fn handle(&self, message: QueueMessage) -> CResult<()> {
            self.seen.lock().unwrap().push(message.value);
            Ok(())
        }
    }

    struct AlwaysFails {
        errors: AtomicUsize,
    }

    #[async_trait]
    impl QueueHandler for AlwaysFails {
        async fn handle(&self, _message: QueueMessage) -> CResult<()> {
            Err(Error::Handler("refusing".into()))
        }

        async fn on_error(&self, _err: &Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn listener_drains_the_queue_and_acks() {
        let kv = Kv::open_in_memory().unwrap();
        for i in 0..8 {
            kv.enqueue(&json!(i), EnqueueOptions::default()).unwrap();
        }

        let handler = Arc::new(Collector { seen: Mutex::new(Vec::new()) });
        let listener = kv.listen(
            handler.clone(),
            ListenOptions { concurrency: 3, poll_interval_ms: 10 },
        );

        for _ in 0..200 {
            if handler.seen.lock().unwrap().len() == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        listener.stop().await;

        assert_eq!(handler.seen.lock().unwrap().len(), 8);
        assert_eq!(kv.queue_stats().unwrap().total, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_handler_nacks_toward_the_dlq() {
        let kv = Kv::open_in_memory().unwrap();
        kv.enqueue(
            &json!("poison"),
            EnqueueOptions { backoff_schedule: Some(vec![]), ..Default::default() },
        )
        .unwrap();

        let handler = Arc::new(AlwaysFails { errors: AtomicUsize::new(0) });
        let listener = kv.listen(
            handler.clone(),
            ListenOptions { concurrency: 1, poll_interval_ms: 5 },
        );

        for _ in 0..200 {
            if kv.queue_stats().unwrap().dlq == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        listener.stop().await;

        assert_eq!(kv.queue_stats().unwrap().dlq, 1);
        assert!(handler.errors.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_waits_and_refuses_new_work() {
        let kv = Kv::open_in_memory().unwrap();
        let handler = Arc::new(Collector { seen: Mutex::new(Vec::new()) });
        let listener = kv.listen(handler.clone(), ListenOptions::default());
        listener.stop().await;

        // Enqueued after stop: nobody picks it up.
        kv.enqueue(&json!("late"), EnqueueOptions::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handler.seen.lock().unwrap().is_empty());
        assert_eq!(kv.queue_stats().unwrap().pending, 1);
    }
}
