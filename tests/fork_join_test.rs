use dataflow_pipeline::{Builder, BuilderOptions, PipelineError, StageOptions};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
struct Record {
    name: String,
    value: i64,
}

fn records(count: usize) -> Vec<serde_json::Value> {
    (0..count)
        .map(|i| serde_json::json!({ "name": format!("item-{}", i), "value": i as i64 * 10 }))
        .collect()
}

#[tokio::test]
async fn test_fork_pairs_each_record_with_itself() {
    let count = 25;
    let pairs = Builder::new()
        .from_iter(records(count))
        .select(|raw| serde_json::from_value::<Record>(raw).unwrap())
        .fork()
        .then(
            |records| records.select(|record| record.name),
            |records| records.select(|record| record.value),
        )
        .end()
        .receive_all()
        .await
        .unwrap();

    assert_eq!(pairs.len(), count);
    let names: HashSet<String> = pairs.iter().map(|(name, _)| name.clone()).collect();
    let values: HashSet<i64> = pairs.iter().map(|(_, value)| *value).collect();
    assert_eq!(names, (0..count).map(|i| format!("item-{}", i)).collect());
    assert_eq!(values, (0..count).map(|i| i as i64 * 10).collect());
    for (name, value) in &pairs {
        assert_eq!(format!("item-{}", value / 10), *name);
    }
}

#[tokio::test]
async fn test_fork_pairs_survive_uneven_branch_speed() {
    let pairs = Builder::new()
        .from_iter(0..20u64)
        .fork()
        .then(
            |slow| {
                slow.select_async(|x| async move {
                    tokio::time::sleep(Duration::from_millis(x % 4)).await;
                    Ok::<u64, String>(x)
                })
            },
            |fast| fast.select(|x| x * 100),
        )
        .end()
        .receive_all()
        .await
        .unwrap();

    assert_eq!(pairs.len(), 20);
    assert!(pairs.iter().all(|(left, right)| left * 100 == *right));
}

#[tokio::test]
async fn test_instrumented_fork_keeps_pairs_aligned() {
    let timed = Arc::new(AtomicUsize::new(0));
    let counter = timed.clone();
    let options = BuilderOptions::new().on_elapsed(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let pairs = Builder::with_options(options)
        .from_iter(0..12u32)
        .select(|x| x + 1)
        .fork()
        .then(|b| b.select(|x| x * 2), |b| b.select(|x| x.to_string()))
        .end()
        .receive_all()
        .await
        .unwrap();

    assert_eq!(pairs.len(), 12);
    assert!(pairs.iter().all(|(doubled, text)| *doubled == text.parse::<u32>().unwrap() * 2));
    // 上游 select 與兩條分支各一個 select
    assert_eq!(timed.load(Ordering::SeqCst), 12 * 3);
}

#[tokio::test]
async fn test_fork_output_feeds_further_stages() {
    let batches = Builder::new()
        .from_iter(0..7u32)
        .fork()
        .then(|b| b.select(|x| x), |b| b.select(|x| x % 2 == 0))
        .select(|(x, even)| if even { x } else { 0 })
        .batch(3)
        .end()
        .receive_all()
        .await
        .unwrap();

    assert_eq!(batches, vec![vec![0, 0, 2], vec![0, 4, 0], vec![6]]);
}

#[tokio::test]
async fn test_unbalanced_branch_stalls_until_faulted() {
    let handle = Builder::new()
        .create_buffer::<u32>()
        .fork()
        .then(|b| b.filter(|x| *x != 3), |b| b.select(|x| x))
        .end();

    for x in 0..6u32 {
        handle.send(x).await.unwrap();
    }

    let mut pairs = Vec::new();
    for _ in 0..3 {
        let pair = tokio::time::timeout(Duration::from_secs(5), handle.receive())
            .await
            .expect("pairs before the dropped message should arrive")
            .unwrap();
        pairs.push(pair);
    }
    assert_eq!(pairs, vec![(0, 0), (1, 1), (2, 2)]);

    // 左邊少了一則，join 不再輸出也不會完成
    let next = tokio::time::timeout(Duration::from_millis(200), handle.receive()).await;
    assert!(next.is_err(), "join must stall instead of mispairing");
    let done = tokio::time::timeout(Duration::from_millis(50), handle.completion()).await;
    assert!(done.is_err());

    handle.fault(PipelineError::faulted("operator cancelled"));
    let err = handle.completion().await.unwrap_err();
    assert!(err.to_string().contains("operator cancelled"));
}

#[tokio::test]
async fn test_branch_failure_faults_joined_output() {
    let result = Builder::new()
        .from_iter(0..10u32)
        .fork()
        .then(
            |b| b.select(|x| x),
            |b| {
                b.select_async(|x| async move {
                    if x == 5 {
                        Err(format!("cannot handle {}", x))
                    } else {
                        Ok(x)
                    }
                })
            },
        )
        .end()
        .receive_all()
        .await;

    match result {
        Err(PipelineError::ProcessingError { message, .. }) => {
            assert!(message.contains("cannot handle 5"));
        }
        other => panic!("expected a processing error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_upstream_fault_reaches_both_branches() {
    let handle = Builder::new()
        .create_buffer::<u32>()
        .fork()
        .then(|b| b.select(|x| x + 1), |b| b.select(|x| x + 2))
        .end();

    handle.send(1).await.unwrap();
    assert_eq!(handle.receive().await, Some((2, 3)));

    handle.fault(PipelineError::faulted("source lost"));
    let err = handle.completion().await.unwrap_err();
    assert!(matches!(err, PipelineError::Faulted { .. }));
}

#[tokio::test]
async fn test_parallel_branches_pair_in_input_order() {
    let options =
        BuilderOptions::new().with_stage_options(StageOptions::default().with_parallelism(4));

    let pairs = tokio::time::timeout(
        Duration::from_secs(10),
        Builder::with_options(options)
            .from_iter(0..20u64)
            .fork()
            .then(
                |slow| {
                    // 先送入的反而較晚完成
                    slow.select_async(|x| async move {
                        tokio::time::sleep(Duration::from_millis(20 - x)).await;
                        Ok::<u64, String>(x)
                    })
                },
                |fast| fast.select(|x| x),
            )
            .end()
            .receive_all(),
    )
    .await
    .expect("parallel branches must not stall the join")
    .unwrap();

    assert_eq!(pairs, (0..20u64).map(|x| (x, x)).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_fork_after_split_pairs_each_element() {
    let pairs = Builder::new()
        .from_iter(0..6u32)
        .batch(3)
        .select_many()
        .fork()
        .then(|l| l.select(|x| x + 100), |r| r.select(|x| x))
        .end()
        .receive_all()
        .await
        .unwrap();

    assert_eq!(pairs, (0..6u32).map(|x| (x + 100, x)).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_filter_after_split_never_mispairs() {
    let handle = Builder::new()
        .from_iter(0..3u32)
        .batch(3)
        .select_many()
        .fork()
        .then(|l| l.filter(|x| *x != 1), |r| r.select(|x| x))
        .end();

    let first = tokio::time::timeout(Duration::from_secs(5), handle.receive())
        .await
        .expect("the first pair should arrive");
    assert_eq!(first, Some((0, 0)));

    let next = tokio::time::timeout(Duration::from_millis(200), handle.receive()).await;
    assert!(next.is_err(), "join must stall instead of pairing 2 with 1");

    handle.fault(PipelineError::faulted("operator cancelled"));
    assert!(handle.completion().await.is_err());
}
