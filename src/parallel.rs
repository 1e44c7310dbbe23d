//! Fork-join broadcast stage: each envelope goes to every child, and a
//! single completion event fires once all children have finished it.
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::action::{Action, ActionStage};
use crate::envelope::{Envelope, EnvelopeId};
use crate::Error;

/// Single-writer completion tracker. Only the JoinSerializer's one worker
/// ever touches this, so no lock is needed around the map itself — it is
/// owned by the closure running inside that worker's `action`.
struct CompletionLedger {
    counts: FxHashMap<EnvelopeId, usize>,
}

impl CompletionLedger {
    fn new() -> Self {
        Self {
            counts: FxHashMap::default(),
        }
    }

    /// Returns `true` once `child_count` distinct children have reported
    /// completion for this identity, removing the entry at that point.
    fn record(&mut self, id: EnvelopeId, child_count: usize) -> bool {
        let entry = self.counts.entry(id).or_insert(0);
        *entry += 1;
        if *entry >= child_count {
            self.counts.remove(&id);
            true
        } else {
            false
        }
    }
}

/// A fixed set of children, each an [`ActionStage`], fed by a common
/// broadcast point and joined through a common completion tracker.
///
/// See `SPEC_FULL.md` §4.3. Built from two internal 1-slot, 1-worker
/// `ActionStage`s acting as serializers: an `InputSerializer` that fans each
/// envelope out to every child, and a `JoinSerializer` that owns the
/// completion ledger and fires the stage-level `done` once every child has
/// reported.
pub struct ParallelStage<T> {
    input_serializer: ActionStage<T>,
    join_serializer: Arc<ActionStage<T>>,
    children: Vec<Arc<ActionStage<T>>>,
}

struct BroadcastAction<T> {
    children: Vec<Arc<ActionStage<T>>>,
}

#[async_trait]
impl<T: Send + Sync + 'static> Action<T> for BroadcastAction<T> {
    async fn call(&self, envelope: Envelope<T>) -> Result<(), Error> {
        let sends = self.children.iter().map(|child| child.send(envelope.clone()));
        for result in futures::future::join_all(sends).await {
            result?;
        }
        Ok(())
    }
}

struct JoinAction<T> {
    child_count: usize,
    ledger: AsyncMutex<CompletionLedger>,
    done: Arc<dyn Action<T>>,
}

#[async_trait]
impl<T: Send + Sync + 'static> Action<T> for JoinAction<T> {
    async fn call(&self, envelope: Envelope<T>) -> Result<(), Error> {
        let id = match envelope.identity() {
            Some(id) => id,
            None => return Ok(()),
        };

        let complete = {
            let mut ledger = self.ledger.lock().await;
            ledger.record(id, self.child_count)
        };

        if complete {
            self.done.call(envelope).await?;
        }
        Ok(())
    }
}

struct ForwardToJoinSerializer<T> {
    target: Arc<ActionStage<T>>,
}

#[async_trait]
impl<T: Send + Sync + 'static> Action<T> for ForwardToJoinSerializer<T> {
    async fn call(&self, envelope: Envelope<T>) -> Result<(), Error> {
        self.target.send(envelope).await
    }
}

impl<T: Send + Sync + 'static> ParallelStage<T> {
    /// Constructs a stage broadcasting to `child_count` children.
    ///
    /// `child_factory` is handed a join-hook (an `Action<T>` that reports a
    /// single child's completion for an envelope to the join serializer) and
    /// must return exactly `child_count` children built against it as their
    /// `done` hook — for example by constructing each with
    /// `ActionStage::new(capacity, parallelism, child_action, Some(join_hook.clone()), cancel)`.
    /// A factory returning a different count fails with
    /// [`Error::InvalidConfig`].
    pub fn new<F>(
        child_count: usize,
        done: Arc<dyn Action<T>>,
        child_factory: F,
        cancel: Option<CancellationToken>,
    ) -> Result<Self, Error>
    where
        F: FnOnce(Arc<dyn Action<T>>) -> Vec<Arc<ActionStage<T>>>,
    {
        if child_count == 0 {
            return Err(Error::InvalidConfig("child_count must be >= 1".into()));
        }

        let cancel = cancel.unwrap_or_default();

        let join_action = Arc::new(JoinAction {
            child_count,
            ledger: AsyncMutex::new(CompletionLedger::new()),
            done,
        });
        let join_serializer = Arc::new(ActionStage::new(
            1,
            1,
            join_action,
            None,
            Some(cancel.clone()),
        )?);

        let join_hook: Arc<dyn Action<T>> = Arc::new(ForwardToJoinSerializer {
            target: join_serializer.clone(),
        });

        let children = child_factory(join_hook);
        if children.len() != child_count {
            return Err(Error::InvalidConfig(format!(
                "child_factory produced {} children, expected {}",
                children.len(),
                child_count
            )));
        }

        let broadcast_action = Arc::new(BroadcastAction {
            children: children.clone(),
        });
        let input_serializer = ActionStage::new(1, 1, broadcast_action, None, Some(cancel))?;

        Ok(Self {
            input_serializer,
            join_serializer,
            children,
        })
    }

    /// Forwards `envelope` through the broadcast serializer to every child.
    pub async fn send(&self, envelope: Envelope<T>) -> Result<(), Error> {
        self.input_serializer.send(envelope).await
    }

    /// Drains, in order: the input serializer (finishing every broadcast),
    /// every child (finishing their work, each reporting into the join
    /// serializer as it does), then the join serializer itself.
    pub async fn complete(&self) -> Result<(), Error> {
        self.input_serializer.complete().await?;

        let mut first_err = None;
        for child in &self.children {
            if let Err(e) = child.complete().await {
                first_err.get_or_insert(e);
            }
        }

        self.join_serializer.complete().await?;

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    fn make_child<T: Send + Sync + 'static>(
        join_hook: Arc<dyn Action<T>>,
        action: Arc<dyn Action<T>>,
    ) -> Arc<ActionStage<T>> {
        Arc::new(ActionStage::new(8, 1, action, Some(join_hook), None).unwrap())
    }

    #[tokio::test]
    async fn broadcasts_to_every_child_and_joins_once() {
        let a_list: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));
        let b_list: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));
        let done_list: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));

        let d = done_list.clone();
        let done = crate::action::async_single::<i32, _, _>(move |v| {
            let d = d.clone();
            async move {
                d.lock().unwrap().push(*v);
                Ok(())
            }
        });

        let a = a_list.clone();
        let b = b_list.clone();

        let stage = ParallelStage::new(
            2,
            done,
            move |join_hook: Arc<dyn Action<i32>>| {
                let action_a = crate::action::async_single::<i32, _, _>(move |v| {
                    let a = a.clone();
                    async move {
                        a.lock().unwrap().push(*v);
                        Ok(())
                    }
                });
                let action_b = crate::action::async_single::<i32, _, _>(move |v| {
                    let b = b.clone();
                    async move {
                        b.lock().unwrap().push(*v);
                        Ok(())
                    }
                });
                vec![
                    make_child(join_hook.clone(), action_a),
                    make_child(join_hook, action_b),
                ]
            },
            None,
        )
        .unwrap();

        stage.send(Envelope::single(1)).await.unwrap();
        stage.send(Envelope::single(2)).await.unwrap();
        stage.complete().await.unwrap();

        let mut a_got = a_list.lock().unwrap().clone();
        let mut b_got = b_list.lock().unwrap().clone();
        let mut done_got = done_list.lock().unwrap().clone();
        a_got.sort_unstable();
        b_got.sort_unstable();
        done_got.sort_unstable();

        assert_eq!(a_got, vec![1, 2]);
        assert_eq!(b_got, vec![1, 2]);
        assert_eq!(done_got, vec![1, 2]);
    }

    #[tokio::test]
    async fn done_runs_strictly_after_every_child() {
        let timestamps: Arc<StdMutex<Vec<(&'static str, Instant)>>> =
            Arc::new(StdMutex::new(Vec::new()));

        let d = timestamps.clone();
        let done = crate::action::async_single::<i32, _, _>(move |_v| {
            let d = d.clone();
            async move {
                d.lock().unwrap().push(("done", Instant::now()));
                Ok(())
            }
        });

        let t1 = timestamps.clone();
        let t2 = timestamps.clone();
        let t3 = timestamps.clone();

        let stage = ParallelStage::new(
            3,
            done,
            move |join_hook: Arc<dyn Action<i32>>| {
                let slow = crate::action::async_single::<i32, _, _>(move |_v| {
                    let t1 = t1.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        t1.lock().unwrap().push(("child-slow", Instant::now()));
                        Ok(())
                    }
                });
                let fast_a = crate::action::async_single::<i32, _, _>(move |_v| {
                    let t2 = t2.clone();
                    async move {
                        t2.lock().unwrap().push(("child-fast-a", Instant::now()));
                        Ok(())
                    }
                });
                let fast_b = crate::action::async_single::<i32, _, _>(move |_v| {
                    let t3 = t3.clone();
                    async move {
                        t3.lock().unwrap().push(("child-fast-b", Instant::now()));
                        Ok(())
                    }
                });
                vec![
                    make_child(join_hook.clone(), slow),
                    make_child(join_hook.clone(), fast_a),
                    make_child(join_hook, fast_b),
                ]
            },
            None,
        )
        .unwrap();

        stage.send(Envelope::single(1)).await.unwrap();
        stage.complete().await.unwrap();

        let events = timestamps.lock().unwrap().clone();
        let done_time = events
            .iter()
            .find(|(name, _)| *name == "done")
            .map(|(_, t)| *t)
            .unwrap();
        for (name, t) in &events {
            if *name != "done" {
                assert!(t <= &done_time, "{name} ran after done");
            }
        }
    }

    #[tokio::test]
    async fn child_count_mismatch_is_rejected() {
        let done = crate::action::noop::<i32>();
        let err = ParallelStage::new(
            2,
            done,
            |join_hook: Arc<dyn Action<i32>>| vec![make_child(join_hook, crate::action::noop())],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn zero_child_count_is_rejected() {
        let done = crate::action::noop::<i32>();
        let err = ParallelStage::new(0, done, |_join_hook| Vec::new(), None).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
