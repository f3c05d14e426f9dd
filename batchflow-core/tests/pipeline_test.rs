//! End-to-end pipeline scenarios
//!
//! These drive complete pipelines through `Pipeline::submit`, covering:
//! - batched segments with fused per-item stages
//! - per-batch stages and their failures
//! - direct (non-batched) chains and mixed chains
//! - batch counts under size and timer flushes
//! - backpressure on a full engine buffer

use std::sync::{Arc, Mutex};
use std::time::Duration;

use batchflow_core::{
    BatchConfig, BatchEngine, BoxError, ItemFailurePolicy, Pipeline, PipelineError, ResultHandle,
    TriggerState, WorkerPool,
};

const ASCII_EXAMPLE: &str = "ascii-example";

async fn collect<R>(handles: Vec<ResultHandle<R>>) -> Vec<Result<R, PipelineError>> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await);
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_binary_length_scenario() {
    let pipeline = Pipeline::builder(WorkerPool::current().unwrap())
        .batched(2, Duration::from_secs(300))
        .map(|s: String| s.len())
        .map(|n: usize| format!("{n:b}"))
        .sequential()
        .unwrap()
        .build();

    let handles =
        ["1", "11", "111", "1111"].iter().map(|s| pipeline.submit(s.to_string())).collect();
    let outputs: Vec<String> = collect(handles).await.into_iter().map(Result::unwrap).collect();

    assert_eq!(outputs, vec!["1", "10", "11", "100"]);

    let metrics = &pipeline.metrics()[0];
    assert_eq!(metrics.batches_flushed, 2);
    assert_eq!(metrics.items_completed, 4);

    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_input_twice() {
    let pipeline = Pipeline::builder(WorkerPool::current().unwrap())
        .batched(2, Duration::from_secs(300))
        .map(|s: &'static str| s.len())
        .sequential()
        .unwrap()
        .build();

    let first = pipeline.submit(ASCII_EXAMPLE);
    let second = pipeline.submit(ASCII_EXAMPLE);

    assert_eq!(first.await.unwrap(), 13);
    assert_eq!(second.await.unwrap(), 13);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_batch_failure_reaches_every_caller() {
    let pipeline = Pipeline::builder(WorkerPool::current().unwrap())
        .batched(2, Duration::from_secs(300))
        .try_map_batch(|batch: Vec<&'static str>| -> anyhow::Result<Vec<usize>> {
            anyhow::bail!("cannot process {} items of {}", batch.len(), batch[0])
        })
        .sequential()
        .unwrap()
        .build();

    let handles = vec![pipeline.submit(ASCII_EXAMPLE), pipeline.submit(ASCII_EXAMPLE)];
    let results = collect(handles).await;

    assert_eq!(results.len(), 2);
    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::Stage { .. }));
        assert!(err.to_string().contains(ASCII_EXAMPLE), "unexpected error: {err}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_direct_chaining() {
    let pipeline = Pipeline::builder(WorkerPool::current().unwrap())
        .map(|s: &'static str| s.as_bytes().to_vec())
        .map(|bytes: Vec<u8>| bytes.len())
        .build();

    assert_eq!(pipeline.submit(ASCII_EXAMPLE).await.unwrap(), 13);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batched_then_direct() {
    let pipeline = Pipeline::builder(WorkerPool::current().unwrap())
        .batched(2, Duration::from_secs(1))
        .map(|s: &'static str| s.len())
        .sequential()
        .unwrap()
        .map(|n: usize| n + 1)
        .build();

    // A lone item waits for the timer
    assert_eq!(pipeline.submit(ASCII_EXAMPLE).await.unwrap(), 14);
    assert_eq!(pipeline.metrics()[0].timer_flushes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batched_maps_fuse() {
    let pipeline = Pipeline::builder(WorkerPool::current().unwrap())
        .batched(2, Duration::from_secs(1))
        .map(|s: &'static str| s.len())
        .map(|n: usize| n * 2)
        .sequential()
        .unwrap()
        .build();

    assert_eq!(pipeline.submit(ASCII_EXAMPLE).await.unwrap(), 26);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_batch_stage_sees_batch_size() {
    let pipeline = Pipeline::builder(WorkerPool::current().unwrap())
        .batched(2, Duration::from_secs(1))
        .map_batch(|batch: Vec<&'static str>| vec![batch.len(); batch.len()])
        .map(|n: usize| n + 1)
        .sequential()
        .unwrap()
        .build();

    assert_eq!(pipeline.submit(ASCII_EXAMPLE).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_item_is_isolated() {
    let pipeline = Pipeline::builder(WorkerPool::current().unwrap())
        .batched(2, Duration::from_secs(300))
        .try_map(|s: &'static str| {
            if s.is_ascii() {
                Ok(s.len())
            } else {
                Err(format!("non-ascii input {s}"))
            }
        })
        .map(|n: usize| n * 10)
        .sequential()
        .unwrap()
        .build();

    let good = pipeline.submit(ASCII_EXAMPLE);
    let bad = pipeline.submit("ünïcode");

    assert_eq!(good.await.unwrap(), 130);
    let err = bad.await.unwrap_err();
    assert!(err.to_string().contains("non-ascii input"));

    let metrics = &pipeline.metrics()[0];
    assert_eq!(metrics.batches_flushed, 1);
    assert_eq!(metrics.items_completed, 1);
    assert_eq!(metrics.items_failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fail_batch_policy() {
    let config = BatchConfig::new(2, Duration::from_secs(300))
        .with_item_failure(ItemFailurePolicy::FailBatch);
    let pipeline = Pipeline::builder(WorkerPool::current().unwrap())
        .batched_with(config)
        .try_map(|n: i64| if n < 0 { Err("negative") } else { Ok(n) })
        .sequential()
        .unwrap()
        .build();

    let results = collect(vec![pipeline.submit(5), pipeline.submit(-5)]).await;
    for result in results {
        assert!(result.unwrap_err().to_string().contains("negative"));
    }
    assert_eq!(pipeline.metrics()[0].batches_failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_size_one_matches_direct() {
    let batched = Pipeline::builder(WorkerPool::current().unwrap())
        .batched(1, Duration::from_secs(300))
        .map(|s: String| s.to_uppercase())
        .sequential()
        .unwrap()
        .build();
    let direct = Pipeline::builder(WorkerPool::current().unwrap())
        .map(|s: String| s.to_uppercase())
        .build();

    let input = ASCII_EXAMPLE.to_string();
    let from_batched = batched.submit(input.clone()).await.unwrap();
    let from_direct = direct.submit(input).await.unwrap();

    assert_eq!(from_batched, from_direct);
    assert_eq!(batched.metrics()[0].size_flushes, 1);
}

type BatchSizes = Arc<Mutex<Vec<usize>>>;

fn recording_pipeline(batch_size: usize, timeout: Duration) -> (Pipeline<u32, u32>, BatchSizes) {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let recorded = sizes.clone();
    let pipeline = Pipeline::builder(WorkerPool::current().unwrap())
        .batched(batch_size, timeout)
        .map_batch(move |batch: Vec<u32>| {
            recorded.lock().unwrap().push(batch.len());
            batch
        })
        .sequential()
        .unwrap()
        .build();
    (pipeline, sizes)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_batches_only_under_size_trigger() {
    let (pipeline, sizes) = recording_pipeline(3, Duration::from_secs(300));

    let handles = (0..9).map(|i| pipeline.submit(i)).collect();
    let mut outputs: Vec<u32> = collect(handles).await.into_iter().map(Result::unwrap).collect();
    outputs.sort_unstable();

    assert_eq!(outputs, (0..9).collect::<Vec<_>>());
    assert_eq!(*sizes.lock().unwrap(), vec![3, 3, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remainder_flushed_by_timer() {
    let (pipeline, sizes) = recording_pipeline(3, Duration::from_secs(1));

    let handles = (0..10).map(|i| pipeline.submit(i)).collect();
    for result in collect(handles).await {
        result.unwrap();
    }

    let sizes = sizes.lock().unwrap().clone();
    assert_eq!(sizes.len(), 4);
    assert!(sizes.iter().all(|&n| n <= 3));
    assert_eq!(sizes.iter().sum::<usize>(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_standalone_engine_submission_order() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = calls.clone();
    let config = BatchConfig::new(3, Duration::from_millis(200));
    let engine = BatchEngine::new(config, move |batch: Vec<u32>| {
        recorded.lock().unwrap().push(batch.clone());
        Ok::<_, BoxError>(batch.into_iter().map(|n| n + 100).collect())
    })
    .unwrap();
    engine.start(&tokio::runtime::Handle::current()).unwrap();

    let mut handles = Vec::new();
    for i in 0..7 {
        handles.push(engine.submit_async(i).await);
    }
    let outputs: Vec<u32> = collect(handles).await.into_iter().map(Result::unwrap).collect();

    assert_eq!(outputs, (100..107).collect::<Vec<_>>());
    assert_eq!(*calls.lock().unwrap(), vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_drains_pending_items() {
    let (pipeline, sizes) = recording_pipeline(100, Duration::from_secs(300));

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(pipeline.submit(i));
    }
    // Let every submission reach the buffer
    while pipeline.metrics()[0].items_submitted < 5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    pipeline.shutdown().await;

    for result in collect(handles).await {
        result.unwrap();
    }
    assert_eq!(*sizes.lock().unwrap(), vec![5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_engine_blocks_submitter_until_flush() {
    let (release, gate) = std::sync::mpsc::channel::<()>();
    let gate = Mutex::new(gate);
    let (started_tx, mut started) = tokio::sync::mpsc::unbounded_channel::<usize>();

    // Capacity is 2 x 2 = 4 buffered entries
    let config = BatchConfig::new(2, Duration::from_secs(300));
    let engine = BatchEngine::new(config, move |batch: Vec<u32>| {
        let _ = started_tx.send(batch.len());
        let _ = gate.lock().unwrap().recv();
        Ok::<_, BoxError>(batch)
    })
    .unwrap();
    let engine = Arc::new(engine);
    engine.start(&tokio::runtime::Handle::current()).unwrap();

    let mut handles = Vec::new();
    for i in 0..2 {
        handles.push(engine.submit_async(i).await);
    }
    assert_eq!(started.recv().await, Some(2));
    assert_eq!(engine.trigger_state(), TriggerState::Running);

    for i in 2..6 {
        handles.push(engine.submit_async(i).await);
    }
    assert_eq!(engine.depth(), 4);

    let blocked = {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.submit(6))
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished(), "submit returned while the buffer was full");

    // [0, 1] [2, 3] [4, 5] by size, then [6] on shutdown
    for _ in 0..4 {
        release.send(()).unwrap();
    }
    let last = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("submitter stayed blocked after a flush")
        .unwrap();

    let outputs: Vec<u32> = collect(handles).await.into_iter().map(Result::unwrap).collect();
    assert_eq!(outputs, (0..6).collect::<Vec<_>>());

    engine.shutdown().await;
    assert_eq!(last.await.unwrap(), 6);

    let metrics = engine.metrics();
    assert_eq!(metrics.batches_flushed, 4);
    assert_eq!(metrics.items_completed, 7);
}
