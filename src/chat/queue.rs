//! Ordered effect queue.
//!
//! Records are handed to a single [`EffectHandler`] one at a time, in the
//! order they were enqueued. A spawned worker owns the receiving end, so the
//! producer never waits on the handler. A failing handler is logged and the
//! worker moves on to the next record.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::message::{ToolCall, ToolCallResult};
use crate::error::{CompanionError, Result};

/// A side effect produced while streaming a response.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectRecord {
    /// Append a tool-call slice to the in-flight message.
    ToolCall(ToolCall),
    /// Append a tool result to the in-flight message.
    ToolCallResult(ToolCallResult),
}

/// Consumer of queued records.
#[async_trait]
pub trait EffectHandler<T>: Send + Sync {
    /// Apply one record.
    async fn handle(&self, record: T) -> Result<()>;
}

enum QueueItem<T> {
    Record(T),
    Barrier(oneshot::Sender<()>),
}

/// Strictly sequential dispatcher bound to one handler.
pub struct EffectQueue<T> {
    tx: mpsc::UnboundedSender<QueueItem<T>>,
    worker: JoinHandle<()>,
}

impl<T> std::fmt::Debug for EffectQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<T: Send + 'static> EffectQueue<T> {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn new(handler: Arc<dyn EffectHandler<T>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueItem<T>>();
        let worker = tokio::spawn(async move {
            let mut dispatched = 0usize;
            while let Some(item) = rx.recv().await {
                match item {
                    QueueItem::Record(record) => {
                        dispatched += 1;
                        if let Err(e) = handler.handle(record).await {
                            warn!(error = %e, index = dispatched, "effect handler failed, continuing");
                        }
                    }
                    QueueItem::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(dispatched, "effect queue drained");
        });
        Self { tx, worker }
    }

    /// Add a record to the back of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Pipeline`] if the worker has stopped.
    pub fn enqueue(&self, record: T) -> Result<()> {
        self.tx
            .send(QueueItem::Record(record))
            .map_err(|_| CompanionError::Pipeline("effect queue worker stopped".into()))
    }

    /// Wait until every record enqueued before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(QueueItem::Barrier(done_tx)).is_err() {
            return;
        }
        if done_rx.await.is_err() {
            warn!("effect queue worker exited before flush completed");
        }
    }

    /// Stop accepting records and wait for the worker to finish the backlog.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            warn!(error = %e, "effect queue worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<u32>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_on: Option<u32>,
    }

    impl Recorder {
        fn new(fail_on: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail_on,
            })
        }
    }

    #[async_trait]
    impl EffectHandler<u32> for Recorder {
        async fn handle(&self, record: u32) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            // Earlier records sleep longer so reordering would show up.
            tokio::time::sleep(Duration::from_millis(u64::from(10 - record.min(10)))).await;
            self.seen.lock().unwrap().push(record);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_on == Some(record) {
                return Err(CompanionError::Pipeline(format!("record {record} failed")));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_in_order_one_at_a_time() {
        let recorder = Recorder::new(None);
        let queue = EffectQueue::new(recorder.clone() as Arc<dyn EffectHandler<u32>>);
        for i in 0..6 {
            queue.enqueue(i).unwrap();
        }
        queue.close().await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_record_does_not_stop_later_ones() {
        let recorder = Recorder::new(Some(1));
        let queue = EffectQueue::new(recorder.clone() as Arc<dyn EffectHandler<u32>>);
        for i in 0..4 {
            queue.enqueue(i).unwrap();
        }
        queue.close().await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn flush_waits_for_backlog_and_keeps_queue_open() {
        let recorder = Recorder::new(None);
        let queue = EffectQueue::new(recorder.clone() as Arc<dyn EffectHandler<u32>>);
        queue.enqueue(0).unwrap();
        queue.enqueue(1).unwrap();
        queue.flush().await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);

        queue.enqueue(2).unwrap();
        queue.flush().await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 1, 2]);
    }
}
