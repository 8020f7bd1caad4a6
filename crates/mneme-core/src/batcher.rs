//! Request batching for knowledge queries.
//!
//! Every [`Batcher::query`] call parks a oneshot responder in a shared queue
//! and returns immediately. The queue is flushed to a [`BatchExecutor`] as a
//! single bulk call when either:
//!
//! - it reaches `max_size` (flushed synchronously from the enqueueing call), or
//! - `max_wait` has passed since the first unflushed item arrived.
//!
//! ```text
//! query(a) ─┐
//! query(b) ─┼─► [a b c] ──(size or timer)──► executor([a, b, c]) ──► fan out
//! query(c) ─┘
//! ```
//!
//! A failed bulk call is delivered to every caller of that batch and is not
//! retried here; retry policy belongs to the circuit breaker and the callers.
//!
//! All methods that can flush spawn onto the current Tokio runtime and must be
//! called from within one.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::AppError;
use crate::models::KnowledgeResult;

/// Performs one bulk lookup for a batch of URLs.
///
/// URLs missing from the returned map are treated as unknown.
pub trait BatchExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        urls: Vec<String>,
    ) -> impl Future<Output = Result<HashMap<String, KnowledgeResult>, AppError>> + Send;
}

/// Size and time bounds for a batch.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Largest number of URLs sent in one executor call.
    pub max_size: usize,

    /// How long the first queued URL may wait before its batch is sent.
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_wait: Duration::from_millis(50),
        }
    }
}

type QueryResponder = oneshot::Sender<Result<KnowledgeResult, AppError>>;

/// One caller waiting for its answer.
struct PendingQuery {
    url: String,
    responder: QueryResponder,
}

/// A flush timer. The epoch lets a timer that fires late recognise that it
/// has been replaced.
struct ArmedTimer {
    epoch: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct BatchQueue {
    pending: VecDeque<PendingQuery>,
    timer: Option<ArmedTimer>,
    next_epoch: u64,
}

impl BatchQueue {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }

    /// Takes up to `max_size` of the oldest pending queries.
    fn take_batch(&mut self, max_size: usize) -> Vec<PendingQuery> {
        let n = self.pending.len().min(max_size);
        self.pending.drain(..n).collect()
    }
}

struct Shared<E> {
    config: BatchConfig,
    executor: E,
    queue: Mutex<BatchQueue>,
}

impl<E: BatchExecutor> Shared<E> {
    fn lock_queue(&self) -> MutexGuard<'_, BatchQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned batch queue mutex");
            poisoned.into_inner()
        })
    }

    fn enqueue(self: &Arc<Self>, query: PendingQuery) {
        let mut queue = self.lock_queue();
        queue.pending.push_back(query);

        if queue.pending.len() >= self.config.max_size {
            queue.cancel_timer();
            let batch = queue.take_batch(self.config.max_size);
            drop(queue);
            self.dispatch(batch);
        } else if queue.timer.is_none() {
            self.arm_timer(&mut queue);
        }
    }

    fn arm_timer(self: &Arc<Self>, queue: &mut BatchQueue) {
        let epoch = queue.next_epoch;
        queue.next_epoch += 1;

        let shared = Arc::clone(self);
        let wait = self.config.max_wait;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            shared.flush_on_timer(epoch);
        })
        .abort_handle();

        queue.timer = Some(ArmedTimer { epoch, handle });
    }

    fn flush_on_timer(self: &Arc<Self>, epoch: u64) {
        let mut queue = self.lock_queue();
        match &queue.timer {
            Some(timer) if timer.epoch == epoch => {
                queue.timer = None;
            }
            _ => return,
        }

        let batch = queue.take_batch(self.config.max_size);
        if !queue.pending.is_empty() {
            self.arm_timer(&mut queue);
        }
        drop(queue);
        self.dispatch(batch);
    }

    /// Sends one batch on its own task and fans the answer back out.
    fn dispatch(self: &Arc<Self>, batch: Vec<PendingQuery>) {
        if batch.is_empty() {
            return;
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let urls: Vec<String> = batch.iter().map(|q| q.url.clone()).collect();
            tracing::debug!(batch_size = urls.len(), "Flushing query batch");

            match shared.executor.execute(urls).await {
                Ok(results) => {
                    for query in batch {
                        let result = results
                            .get(&query.url)
                            .cloned()
                            .unwrap_or_else(KnowledgeResult::unknown);
                        let _ = query.responder.send(Ok(result));
                    }
                }
                Err(e) => {
                    tracing::warn!(batch_size = batch.len(), error = %e, "Query batch failed");
                    for query in batch {
                        let _ = query.responder.send(Err(e.clone()));
                    }
                }
            }

            shared.reschedule();
        });
    }

    fn reschedule(self: &Arc<Self>) {
        let mut queue = self.lock_queue();
        if !queue.pending.is_empty() && queue.timer.is_none() {
            self.arm_timer(&mut queue);
        }
    }
}

/// Aggregates concurrent single-URL queries into bounded bulk calls.
///
/// Knows nothing about circuit state; gating happens in the caller.
pub struct Batcher<E> {
    shared: Arc<Shared<E>>,
}

impl<E: BatchExecutor> Batcher<E> {
    /// A `max_size` of zero is treated as one.
    pub fn new(executor: E, mut config: BatchConfig) -> Self {
        config.max_size = config.max_size.max(1);
        Self {
            shared: Arc::new(Shared {
                config,
                executor,
                queue: Mutex::new(BatchQueue::default()),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    /// Enqueues `url` now and returns a future for its answer.
    ///
    /// The enqueue happens before this method returns, so queries issued in
    /// sequence reach the executor in that order even if their futures are
    /// polled later.
    pub fn query(
        &self,
        url: impl Into<String>,
    ) -> impl Future<Output = Result<KnowledgeResult, AppError>> + Send + 'static {
        let (responder, answer) = oneshot::channel();
        self.shared.enqueue(PendingQuery {
            url: url.into(),
            responder,
        });

        async move { answer.await.unwrap_or(Err(AppError::Cancelled)) }
    }

    /// Cancels the pending timer and answers every queued caller with a
    /// fallback result. Batches already sent are left to finish.
    pub fn clear(&self) {
        let drained: Vec<PendingQuery> = {
            let mut queue = self.shared.lock_queue();
            queue.cancel_timer();
            queue.pending.drain(..).collect()
        };

        if !drained.is_empty() {
            tracing::debug!(cleared = drained.len(), "Cleared pending queries");
        }
        for query in drained {
            let _ = query.responder.send(Ok(KnowledgeResult::fallback()));
        }
    }

    /// Number of queries waiting for a flush.
    pub fn queue_size(&self) -> usize {
        self.shared.lock_queue().pending.len()
    }
}
