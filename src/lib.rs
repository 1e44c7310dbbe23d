//! Building blocks for in-process streaming pipelines.
//!
//! A pipeline here is a directed graph of *stages*, each backed by a bounded
//! queue and one or more worker tasks, that pass typed items downstream. This
//! crate provides the four primitives every stage is built on:
//!
//! - [`ActionStage`]: a bounded-capacity, back-pressured, multi-worker stage
//!   that applies a user action (and optional post-hook) to every item.
//! - [`BatchStage`] (and [`BatchActionStage`]): accumulate items into
//!   fixed-size groups and flush them, including a residual flush on
//!   shutdown.
//! - [`ParallelStage`]: broadcast each item to a fixed set of children and
//!   emit a single completion event once every child has finished that item.
//! - [`Selector`]: a fair multi-waiter primitive with round-robin dispatch.
//!
//! The crate is an embedded library, not a server: there is no durability, no
//! cross-process transport, and no on-disk configuration format. Cancellation
//! is cooperative, propagated via [`tokio_util::sync::CancellationToken`].
use thiserror::Error;

pub mod action;
pub mod batch;
pub mod envelope;
pub mod metrics;
pub mod parallel;
pub mod selector;

pub use action::{Action, ActionStage, Done};
pub use batch::{BatchActionStage, BatchStage};
pub use envelope::{Envelope, EnvelopeId};
pub use metrics::StageMetrics;
pub use parallel::ParallelStage;
pub use selector::Selector;

/// Errors raised by stage construction, sends, and completion.
///
/// This enum intentionally narrows the much larger error surface of a
/// declarative, plugin-driven pipeline runtime down to the four kinds a
/// purely programmatic concurrency primitive can raise.
#[derive(Debug, Error)]
pub enum Error {
    /// Raised synchronously at construction when a numeric parameter is
    /// zero, a required callback is missing, or a `childFactory` produced a
    /// different number of children than `childCount`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Raised synchronously to the sender when `send` is called after
    /// `complete` has begun draining the stage.
    #[error("stage is closed")]
    Closed,

    /// A user-supplied `action` or `done` callback returned an error. The
    /// worker that observed it exits carrying this fault; `complete()`
    /// surfaces the first one seen.
    #[error("user callback failed: {0}")]
    UserFault(String),

    /// Internal channel-send failure; only possible if every receiver for a
    /// stage's queue has already been dropped, which should not happen
    /// through the public API.
    #[error("unable to send to internal channel: {0}")]
    UnableToSendToChannel(String),

    /// Internal channel-receive failure surfaced from `flume`.
    #[error("channel receive error")]
    RecvChannelError(
        #[from]
        #[source]
        flume::RecvError,
    ),

    /// A worker task panicked or was aborted.
    #[error("worker task failed: {0}")]
    WorkerPanicked(String),
}
