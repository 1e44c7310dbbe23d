//! Single-worker accumulator that groups items into fixed-size batches.
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use flume::{bounded, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::action::{Action, ActionStage};
use crate::metrics::StageMetrics;
use crate::Error;

/// A user-supplied callback invoked with each completed (or residual) batch.
#[async_trait]
pub trait BatchDone<T>: Send + Sync {
    /// Runs against the accumulated batch, consuming it.
    async fn call(&self, batch: Vec<T>) -> Result<(), Error>;
}

struct AsyncBatchDone<T, F, Fut> {
    f: F,
    _marker: std::marker::PhantomData<fn(Vec<T>) -> Fut>,
}

#[async_trait]
impl<T, F, Fut> BatchDone<T> for AsyncBatchDone<T, F, Fut>
where
    T: Send + Sync + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Error>> + Send,
{
    async fn call(&self, batch: Vec<T>) -> Result<(), Error> {
        (self.f)(batch).await
    }
}

/// Wraps an async closure as a [`BatchDone`].
pub fn batch_done<T, F, Fut>(f: F) -> Arc<dyn BatchDone<T>>
where
    T: Send + Sync + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(AsyncBatchDone {
        f,
        _marker: std::marker::PhantomData,
    })
}

/// A single-worker stage that accumulates items into groups of `batch_size`
/// and flushes them to `done`, in send order, with a residual flush on
/// [`Self::complete`].
///
/// See `SPEC_FULL.md` §4.2. A single worker is used deliberately: size-based
/// batching with a shared buffer across workers would need locking around
/// every enqueue and would let batch boundaries race.
pub struct BatchStage<T> {
    tx: std::sync::Mutex<Option<Sender<T>>>,
    metrics: Arc<StageMetrics>,
    worker: tokio::sync::Mutex<Option<JoinHandle<Result<(), Error>>>>,
}

impl<T: Send + Sync + 'static> BatchStage<T> {
    /// Constructs a stage with `capacity ≥ 1` and `batch_size ≥ 1`.
    ///
    /// `flush_interval`, when set, additionally flushes a partial buffer once
    /// that much time has passed since its first item arrived, even if
    /// `batch_size` has not been reached (the supplemental timed-flush
    /// behavior from `SPEC_FULL.md` §4.2.1).
    pub fn new(
        capacity: usize,
        batch_size: usize,
        done: Arc<dyn BatchDone<T>>,
        flush_interval: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be >= 1".into()));
        }
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be >= 1".into()));
        }

        let (tx, rx) = bounded(capacity);
        let cancel = cancel.unwrap_or_default();
        let metrics = Arc::new(StageMetrics::new());

        let worker = tokio::spawn(batch_worker(
            rx,
            batch_size,
            done,
            flush_interval,
            metrics.clone(),
            cancel,
        ));

        Ok(Self {
            tx: std::sync::Mutex::new(Some(tx)),
            metrics,
            worker: tokio::sync::Mutex::new(Some(worker)),
        })
    }

    /// Enqueues `item`. Suspends while the queue is full; fails with
    /// [`Error::Closed`] once [`Self::complete`] has begun draining.
    pub async fn send(&self, item: T) -> Result<(), Error> {
        let tx = {
            let guard = self.tx.lock().expect("stage sender mutex poisoned");
            guard.clone()
        }
        .ok_or(Error::Closed)?;

        self.metrics.mark_input();
        tx.send_async(item)
            .await
            .map_err(|e| Error::UnableToSendToChannel(e.to_string()))
    }

    /// Closes the queue, awaits the worker, then performs a final residual
    /// flush. Idempotent: a second call is a no-op.
    pub async fn complete(&self) -> Result<(), Error> {
        let handle = {
            let mut guard = self.worker.lock().await;
            match guard.take() {
                Some(h) => h,
                None => return Ok(()),
            }
        };

        {
            let mut guard = self.tx.lock().expect("stage sender mutex poisoned");
            *guard = None;
        }

        match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(Error::WorkerPanicked(join_err.to_string())),
        }
    }

    /// Items for which `send` has completed enqueueing.
    pub fn input_count(&self) -> u64 {
        self.metrics.input_count()
    }

    /// Items currently buffered, awaiting a flush.
    pub fn working_count(&self) -> u64 {
        self.metrics.working_count()
    }

    /// Items that have been included in a flushed batch.
    pub fn output_count(&self) -> u64 {
        self.metrics.output_count()
    }
}

async fn batch_worker<T: Send + Sync + 'static>(
    rx: Receiver<T>,
    batch_size: usize,
    done: Arc<dyn BatchDone<T>>,
    flush_interval: Option<Duration>,
    metrics: Arc<StageMetrics>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut buffer: Vec<T> = Vec::with_capacity(batch_size);
    // Recomputed fresh at the start of every batch-accumulation cycle (after
    // each flush, size- or time-triggered) so every new batch gets the full
    // `flush_interval` budget, not whatever was left on a stale ticker.
    let mut deadline = flush_interval.map(|d| Instant::now() + d);

    loop {
        let deadline_sleep = async {
            match deadline {
                Some(d) => sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!("batch worker observed cancellation, exiting");
                break;
            }
            res = rx.recv_async() => {
                match res {
                    Ok(item) => {
                        metrics.mark_working_start();
                        buffer.push(item);
                        if buffer.len() >= batch_size {
                            flush(&mut buffer, &done, &metrics).await?;
                            deadline = flush_interval.map(|d| Instant::now() + d);
                        }
                    }
                    Err(_) => {
                        trace!("queue closed, batch worker exiting");
                        break;
                    }
                }
            }
            _ = deadline_sleep => {
                if !buffer.is_empty() {
                    flush(&mut buffer, &done, &metrics).await?;
                }
                deadline = flush_interval.map(|d| Instant::now() + d);
            }
        }
    }

    flush(&mut buffer, &done, &metrics).await
}

async fn flush<T: Send + Sync + 'static>(
    buffer: &mut Vec<T>,
    done: &Arc<dyn BatchDone<T>>,
    metrics: &Arc<StageMetrics>,
) -> Result<(), Error> {
    if buffer.is_empty() {
        return Ok(());
    }
    let batch = std::mem::take(buffer);
    let len = batch.len() as u64;
    done.call(batch).await?;
    for _ in 0..len {
        metrics.mark_working_end();
        metrics.mark_output();
    }
    Ok(())
}

/// Composes a [`BatchStage`] with a downstream [`ActionStage`] so that
/// individual batches are processed with their own `action_capacity` /
/// `action_parallelism`, decoupling batch size from how many batches may be
/// in flight at once.
///
/// Supplemental component from `SPEC_FULL.md` §4.2.1: `send`/`complete`
/// delegate to the inner `BatchStage`, whose `done` hook forwards each
/// flushed batch into the inner `ActionStage`.
pub struct BatchActionStage<T> {
    batch_stage: BatchStage<T>,
    action_stage: Arc<ActionStage<Vec<T>>>,
}

impl<T: Send + Sync + 'static> BatchActionStage<T> {
    /// Constructs the composite stage. `action` runs once per flushed batch
    /// (including the residual flush on `complete`); `action_done` is its
    /// post-hook, defaulting to a no-op.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capacity: usize,
        batch_size: usize,
        flush_interval: Option<Duration>,
        action_capacity: usize,
        action_parallelism: usize,
        action: Arc<dyn Action<Vec<T>>>,
        action_done: Option<Arc<dyn Action<Vec<T>>>>,
        cancel: Option<CancellationToken>,
    ) -> Result<Self, Error> {
        let cancel = cancel.unwrap_or_default();
        let action_stage = Arc::new(ActionStage::new(
            action_capacity,
            action_parallelism,
            action,
            action_done,
            Some(cancel.clone()),
        )?);

        let forward_target = action_stage.clone();
        let done = batch_done(move |batch: Vec<T>| {
            let forward_target = forward_target.clone();
            async move { forward_target.send_value(batch).await }
        });

        let batch_stage = BatchStage::new(capacity, batch_size, done, flush_interval, Some(cancel))?;

        Ok(Self {
            batch_stage,
            action_stage,
        })
    }

    /// Enqueues `item` into the inner [`BatchStage`].
    pub async fn send(&self, item: T) -> Result<(), Error> {
        self.batch_stage.send(item).await
    }

    /// Drains the inner `BatchStage` (flushing the residual batch, which
    /// forwards into the inner `ActionStage`), then completes the inner
    /// `ActionStage`.
    pub async fn complete(&self) -> Result<(), Error> {
        self.batch_stage.complete().await?;
        self.action_stage.complete().await
    }

    /// Items enqueued into the batching layer.
    pub fn input_count(&self) -> u64 {
        self.batch_stage.input_count()
    }

    /// Batches currently between dispatch and the per-batch action's
    /// completion.
    pub fn working_count(&self) -> u64 {
        self.action_stage.working_count()
    }

    /// Batches for which the per-batch action and post-hook have completed.
    pub fn output_count(&self) -> u64 {
        self.action_stage.output_count()
    }
}
