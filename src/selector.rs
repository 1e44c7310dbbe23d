//! Fair multi-waiter primitive: races several asynchronous sources and
//! dispatches to exactly one ready handler with round-robin fairness.
use std::future::Future;
use std::pin::Pin;

use futures::future::select_all;
use tracing::trace;

use crate::Error;

type BoxFuture<'a, O> = Pin<Box<dyn Future<Output = O> + Send + 'a>>;

/// A `(waiter, action)` pair. `waiter` is called fresh on every loop
/// iteration to produce the future to race; `action` runs once that future
/// resolves.
pub struct Arm {
    waiter: Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
    action: Box<dyn Fn() -> BoxFuture<'static, Result<(), Error>> + Send + Sync>,
}

impl Arm {
    /// Builds an arm from a waiter future-factory and an action future-factory.
    pub fn new<W, WFut, A, AFut>(waiter: W, action: A) -> Self
    where
        W: Fn() -> WFut + Send + Sync + 'static,
        WFut: Future<Output = ()> + Send + 'static,
        A: Fn() -> AFut + Send + Sync + 'static,
        AFut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self {
            waiter: Box::new(move || Box::pin(waiter())),
            action: Box::new(move || Box::pin(action())),
        }
    }
}

/// Races a fixed set of [`Arm`]s, dispatching to whichever's waiter resolves
/// first, then rotates the served arm to the tail of the list.
///
/// See `SPEC_FULL.md` §4.4. Without the rotation, an arm that is
/// continuously ready would starve the others, since "first to complete"
/// consistently favors the lowest-latency source. Moving the served arm to
/// the tail bounds any arm's worst-case wait to `arms.len() - 1` turns.
pub struct Selector {
    arms: Vec<Arm>,
}

impl Selector {
    /// Constructs a selector over `arms`, served in the given order on first
    /// tie.
    pub fn new(arms: Vec<Arm>) -> Result<Self, Error> {
        if arms.is_empty() {
            return Err(Error::InvalidConfig("selector needs at least one arm".into()));
        }
        Ok(Self { arms })
    }

    /// Runs the selector loop while `should_continue()` returns `true`.
    ///
    /// Each iteration: wait on every arm's waiter concurrently, run the
    /// action of whichever resolves first, then rotate that arm to the tail.
    pub async fn run<F>(&mut self, mut should_continue: F) -> Result<(), Error>
    where
        F: FnMut() -> bool,
    {
        while should_continue() {
            self.step().await?;
        }
        Ok(())
    }

    /// Runs exactly one iteration: race every arm's waiter, dispatch the
    /// winner's action, rotate it to the tail. Exposed for tests and for
    /// callers that want finer-grained control than [`Self::run`].
    pub async fn step(&mut self) -> Result<(), Error> {
        let waits: Vec<_> = self.arms.iter().map(|arm| (arm.waiter)()).collect();
        let (_, index, _) = select_all(waits).await;

        trace!(index, "selector dispatching arm");
        (self.arms[index].action)().await?;

        let served = self.arms.remove(index);
        self.arms.push(served);
        Ok(())
    }
}
