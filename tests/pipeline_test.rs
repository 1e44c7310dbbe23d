//! Wires several stages together into a small pipeline, the way a real
//! embedding application would compose them.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use stagecraft::action::{async_single, noop};
use stagecraft::batch::{batch_done, BatchStage};
use stagecraft::envelope::Envelope;
use stagecraft::{Action, ActionStage, ParallelStage};

#[tokio::test]
async fn action_stage_feeds_a_batch_stage() {
    let batches: Arc<Mutex<Vec<Vec<u64>>>> = Arc::new(Mutex::new(Vec::new()));
    let b = batches.clone();
    let done = batch_done(move |batch: Vec<u64>| {
        let b = b.clone();
        async move {
            b.lock().unwrap().push(batch);
            Ok(())
        }
    });
    let batch_stage = Arc::new(BatchStage::new(16, 5, done, None, None).unwrap());

    let bs = batch_stage.clone();
    let forward = async_single::<u64, _, _>(move |v| {
        let bs = bs.clone();
        async move { bs.send((*v) * 2).await }
    });

    let doubling_stage = ActionStage::new(8, 3, forward, None, None).unwrap();
    for i in 0..12u64 {
        doubling_stage.send_value(i).await.unwrap();
    }
    doubling_stage.complete().await.unwrap();
    batch_stage.complete().await.unwrap();

    let got = batches.lock().unwrap().clone();
    let mut flattened: Vec<u64> = got.into_iter().flatten().collect();
    flattened.sort_unstable();
    let expected: Vec<u64> = (0..12u64).map(|i| i * 2).collect();
    assert_eq!(flattened, expected);
}

#[tokio::test]
async fn fork_join_pipeline_fans_out_and_joins() {
    let counter_total = Arc::new(AtomicU64::new(0));
    let validated: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    let v = validated.clone();
    let stage_done = async_single::<u64, _, _>(move |value| {
        let v = v.clone();
        async move {
            v.lock().unwrap().push(*value);
            Ok(())
        }
    });

    let c1 = counter_total.clone();
    let c2 = counter_total.clone();

    let stage = ParallelStage::new(
        2,
        stage_done,
        move |join_hook: Arc<dyn Action<u64>>| {
            let tally = async_single::<u64, _, _>(move |_v| {
                let c1 = c1.clone();
                async move {
                    c1.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            let tally2 = async_single::<u64, _, _>(move |_v| {
                let c2 = c2.clone();
                async move {
                    c2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            vec![
                Arc::new(ActionStage::new(4, 2, tally, Some(join_hook.clone()), None).unwrap()),
                Arc::new(ActionStage::new(4, 2, tally2, Some(join_hook), None).unwrap()),
            ]
        },
        None,
    )
    .unwrap();

    for i in 0..10u64 {
        stage.send(Envelope::single(i)).await.unwrap();
    }
    stage.complete().await.unwrap();

    assert_eq!(counter_total.load(Ordering::SeqCst), 20);
    let mut got = validated.lock().unwrap().clone();
    got.sort_unstable();
    assert_eq!(got, (0..10u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn empty_pipeline_drains_without_side_effects() {
    let stage: ActionStage<u32> = ActionStage::new(2, 2, noop(), None, None).unwrap();
    stage.complete().await.unwrap();
    assert_eq!(stage.input_count(), 0);
    assert_eq!(stage.output_count(), 0);
}
