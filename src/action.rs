//! Bounded-queue, multi-worker stage: the core building block every other
//! stage in this crate is assembled from.
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use flume::{bounded, Receiver, Sender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::envelope::Envelope;
use crate::metrics::StageMetrics;
use crate::Error;

/// A user-supplied transform or post-hook invoked once per envelope.
///
/// Implementations are shared (`Arc`) across every worker of a stage, so they
/// must be `Send + Sync`. Use the free functions in this module
/// ([`sync_single`], [`async_single`], [`sync_batch`], [`async_batch`],
/// [`noop`]) instead of implementing this trait by hand for the common
/// cases.
#[async_trait]
pub trait Action<T>: Send + Sync {
    /// Runs this action against `envelope`, consuming it.
    async fn call(&self, envelope: Envelope<T>) -> Result<(), Error>;
}

/// Alias used where a post-hook is expected; structurally identical to
/// [`Action`] (same `Envelope<T> -> Future<Result<(), Error>>` shape).
pub type Done<T> = dyn Action<T>;

struct SyncSingle<T, F> {
    f: F,
    _marker: PhantomData<fn(&T)>,
}

#[async_trait]
impl<T, F> Action<T> for SyncSingle<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> Result<(), Error> + Send + Sync,
{
    async fn call(&self, envelope: Envelope<T>) -> Result<(), Error> {
        match envelope.value() {
            Some(v) => (self.f)(v),
            None => Ok(()),
        }
    }
}

struct AsyncSingle<T, F, Fut> {
    f: F,
    _marker: PhantomData<fn(Arc<T>) -> Fut>,
}

#[async_trait]
impl<T, F, Fut> Action<T> for AsyncSingle<T, F, Fut>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Error>> + Send,
{
    async fn call(&self, envelope: Envelope<T>) -> Result<(), Error> {
        match envelope {
            Envelope::Single(v) => (self.f)(v).await,
            _ => Ok(()),
        }
    }
}

struct SyncBatch<T, F> {
    f: F,
    _marker: PhantomData<fn(&[T])>,
}

#[async_trait]
impl<T, F> Action<T> for SyncBatch<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&[T]) -> Result<(), Error> + Send + Sync,
{
    async fn call(&self, envelope: Envelope<T>) -> Result<(), Error> {
        match envelope.array() {
            Some(v) => (self.f)(v),
            None => Ok(()),
        }
    }
}

struct AsyncBatch<T, F, Fut> {
    f: F,
    _marker: PhantomData<fn(Arc<Vec<T>>) -> Fut>,
}

#[async_trait]
impl<T, F, Fut> Action<T> for AsyncBatch<T, F, Fut>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<Vec<T>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Error>> + Send,
{
    async fn call(&self, envelope: Envelope<T>) -> Result<(), Error> {
        match envelope {
            Envelope::Batch(v) => (self.f)(v).await,
            _ => Ok(()),
        }
    }
}

struct NoOp;

#[async_trait]
impl<T: Send + Sync + 'static> Action<T> for NoOp {
    async fn call(&self, _envelope: Envelope<T>) -> Result<(), Error> {
        Ok(())
    }
}

/// Wraps a synchronous, infallible-except-`Error` closure over a single item.
pub fn sync_single<T, F>(f: F) -> Arc<dyn Action<T>>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> Result<(), Error> + Send + Sync + 'static,
{
    Arc::new(SyncSingle {
        f,
        _marker: PhantomData,
    })
}

/// Wraps an async closure over a single item, sharing the item via `Arc`.
pub fn async_single<T, F, Fut>(f: F) -> Arc<dyn Action<T>>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(AsyncSingle {
        f,
        _marker: PhantomData,
    })
}

/// Wraps a synchronous closure over a batch of items.
pub fn sync_batch<T, F>(f: F) -> Arc<dyn Action<T>>
where
    T: Send + Sync + 'static,
    F: Fn(&[T]) -> Result<(), Error> + Send + Sync + 'static,
{
    Arc::new(SyncBatch {
        f,
        _marker: PhantomData,
    })
}

/// Wraps an async closure over a batch of items, sharing the batch via `Arc`.
pub fn async_batch<T, F, Fut>(f: F) -> Arc<dyn Action<T>>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<Vec<T>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(AsyncBatch {
        f,
        _marker: PhantomData,
    })
}

/// A shared no-op action, usable as a default `done` hook.
pub fn noop<T: Send + Sync + 'static>() -> Arc<dyn Action<T>> {
    Arc::new(NoOp)
}

/// A bounded-capacity, back-pressured stage that dispatches each incoming
/// [`Envelope`] to one of `parallelism` cooperating workers, which run
/// `action` then (unless cancellation was observed) `done`.
///
/// See `SPEC_FULL.md` §4.1 for the full operational contract.
pub struct ActionStage<T> {
    tx: std::sync::Mutex<Option<Sender<Envelope<T>>>>,
    metrics: Arc<StageMetrics>,
    workers: tokio::sync::Mutex<Option<JoinSet<Result<(), Error>>>>,
}

impl<T: Send + Sync + 'static> ActionStage<T> {
    /// Constructs a stage with `capacity ≥ 1` and `parallelism ≥ 1`,
    /// launching `parallelism` worker tasks immediately.
    ///
    /// `done` defaults to [`noop`] when `None`. `cancel` defaults to a fresh,
    /// never-cancelled [`CancellationToken`] when `None`.
    pub fn new(
        capacity: usize,
        parallelism: usize,
        action: Arc<dyn Action<T>>,
        done: Option<Arc<dyn Action<T>>>,
        cancel: Option<CancellationToken>,
    ) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be >= 1".into()));
        }
        if parallelism == 0 {
            return Err(Error::InvalidConfig("parallelism must be >= 1".into()));
        }

        let (tx, rx) = bounded(capacity);
        let done = done.unwrap_or_else(noop);
        let cancel = cancel.unwrap_or_default();
        let metrics = Arc::new(StageMetrics::new());

        let mut workers = JoinSet::new();
        for _ in 0..parallelism {
            workers.spawn(worker_loop(
                rx.clone(),
                action.clone(),
                done.clone(),
                metrics.clone(),
                cancel.clone(),
            ));
        }

        Ok(Self {
            tx: std::sync::Mutex::new(Some(tx)),
            metrics,
            workers: tokio::sync::Mutex::new(Some(workers)),
        })
    }

    /// Enqueues `envelope`. Suspends while the queue is full; fails with
    /// [`Error::Closed`] once [`Self::complete`] has begun draining.
    pub async fn send(&self, envelope: Envelope<T>) -> Result<(), Error> {
        let tx = {
            let guard = self.tx.lock().expect("stage sender mutex poisoned");
            guard.clone()
        }
        .ok_or(Error::Closed)?;

        self.metrics.mark_input();
        tx.send_async(envelope)
            .await
            .map_err(|e| Error::UnableToSendToChannel(e.to_string()))
    }

    /// Convenience wrapper: enqueues a single value as [`Envelope::single`].
    pub async fn send_value(&self, value: T) -> Result<(), Error> {
        self.send(Envelope::single(value)).await
    }

    /// Convenience wrapper: enqueues a batch as [`Envelope::batch`].
    pub async fn send_batch(&self, values: Vec<T>) -> Result<(), Error> {
        self.send(Envelope::batch(values)).await
    }

    /// Closes the queue and awaits every worker's exit.
    ///
    /// Calling this more than once is a no-op after the first call returns;
    /// it does not double-drain.
    pub async fn complete(&self) -> Result<(), Error> {
        let mut workers = {
            let mut guard = self.workers.lock().await;
            match guard.take() {
                Some(set) => set,
                None => return Ok(()),
            }
        };

        // Dropping the sender closes the channel once drained: workers
        // observe disconnect via `recv_async` after existing items are
        // consumed.
        {
            let mut guard = self.tx.lock().expect("stage sender mutex poisoned");
            *guard = None;
        }

        let mut first_err = None;
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => first_err.get_or_insert(e),
                Err(join_err) => {
                    first_err.get_or_insert(Error::WorkerPanicked(join_err.to_string()))
                }
            };
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Items for which `send` has completed enqueueing.
    pub fn input_count(&self) -> u64 {
        self.metrics.input_count()
    }

    /// Items currently between `action` start and `done` return.
    pub fn working_count(&self) -> u64 {
        self.metrics.working_count()
    }

    /// Items for which `done` has returned.
    pub fn output_count(&self) -> u64 {
        self.metrics.output_count()
    }
}

async fn worker_loop<T: Send + Sync + 'static>(
    rx: Receiver<Envelope<T>>,
    action: Arc<dyn Action<T>>,
    done: Arc<dyn Action<T>>,
    metrics: Arc<StageMetrics>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!("worker observed cancellation before dequeue, exiting");
                break;
            }
            res = rx.recv_async() => match res {
                Ok(envelope) => envelope,
                Err(_) => {
                    trace!("queue closed, worker exiting");
                    break;
                }
            },
        };

        metrics.mark_working_start();
        let result = action.call(envelope.clone()).await;
        metrics.mark_working_end();
        result?;

        // Checked after `action` returns, matching the documented
        // best-effort (not contractual) race in SPEC_FULL.md §9.
        if !cancel.is_cancelled() {
            done.call(envelope).await?;
            metrics.mark_output();
        } else {
            debug!("skipping done hook: cancellation observed after action");
        }
    }
    Ok(())
}
