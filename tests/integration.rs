//! Integration tests for the linear stream DSL: operators, runners and
//! failure propagation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use graphweld::prelude::*;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_collect_basic() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..=5)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_empty_source() {
    let materializer = Materializer::new();
    let collected = Source::<i32>::empty()
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert!(collected.is_empty());
}

#[tokio::test]
async fn test_map_and_filter() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..=10)
        .map(|x| x * 2)
        .filter(|x| x % 3 == 0)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![6, 12, 18]);
}

#[tokio::test]
async fn test_take_stops_pulling_infinite_source() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..)
        .take(3)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_take_more_than_available() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..=2)
        .take(5)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![1, 2]);
}

#[tokio::test]
async fn test_take_zero() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..)
        .take(0)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert!(collected.is_empty());
}

#[tokio::test]
async fn test_take_while_discards_boundary() {
    let materializer = Materializer::new();
    let collected = Source::iter(vec![1, 2, 3, 4, 1])
        .take_while(|&x| x < 3)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![1, 2]);
}

#[tokio::test]
async fn test_drop_while_keeps_boundary() {
    let materializer = Materializer::new();
    let collected = Source::iter(vec![1, 2, 3, 4, 1])
        .drop_while(|&x| x < 3)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![3, 4, 1]);
}

#[tokio::test]
async fn test_take_while_drop_while_partition() {
    // On a partition point the two outputs concatenate back to the input.
    let input = vec![1, 2, 3, 10, 11, 12];
    let materializer = Materializer::new();
    let mut front = Source::iter(input.clone())
        .take_while(|&x| x < 10)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    let back = Source::iter(input.clone())
        .drop_while(|&x| x < 10)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    front.extend(back);
    assert_eq!(front, input);
}

#[tokio::test]
async fn test_drop() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..=5)
        .drop(2)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![3, 4, 5]);
}

#[tokio::test]
async fn test_grouped_with_partial_tail() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..=5)
        .grouped(2)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![vec![1, 2], vec![3, 4], vec![5]]);
}

#[tokio::test]
async fn test_grouped_within_flushes_on_size() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..=5)
        .grouped_within(2, Duration::from_secs(60))
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![vec![1, 2], vec![3, 4], vec![5]]);
}

#[tokio::test]
async fn test_map_concat_expands_and_skips() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..=3)
        .map_concat(|x| if x == 2 { vec![] } else { vec![x, x * 10] })
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![1, 10, 3, 30]);
}

#[tokio::test]
async fn test_buffer_backpressure_is_lossless() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..=20)
        .buffer(4, OverflowStrategy::Backpressure)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_conflate_passes_through_fast_consumer() {
    let materializer = Materializer::new();
    let collected = Source::iter(vec!["A", "B", "C"])
        .conflate(|s: &str| s.to_string(), |acc, s| acc + s)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    // The consumer keeps up, so nothing aggregates.
    assert_eq!(collected.concat(), "ABC");
}

#[tokio::test]
async fn test_expand_with_single_shot_iterator_is_identity() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..=4)
        .expand(std::iter::once)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_map_async_preserves_order() {
    let materializer = Materializer::new();
    let collected = Source::iter(vec!["a", "b", "c"])
        .map_async(4, |s| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(s.to_uppercase())
        })
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_map_async_failure_fails_stream() {
    let materializer = Materializer::new();
    let result = Source::iter(1..=3)
        .map_async(2, |x| async move {
            if x == 2 {
                Err(Error::custom("boom"))
            } else {
                Ok(x)
            }
        })
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_recover_replaces_failure_and_completes() {
    let materializer = Materializer::new();
    let collected = Source::iter(1..=4)
        .map_result(|x| {
            if x == 3 {
                Err(Error::custom("third element rejected"))
            } else {
                Ok(x)
            }
        })
        .recover(|_| Some(0))
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![1, 2, 0]);
}

#[tokio::test]
async fn test_recover_none_passes_failure_through() {
    let materializer = Materializer::new();
    let result = Source::iter(1..=4)
        .map_result(|x| {
            if x == 3 {
                Err(Error::custom("third element rejected"))
            } else {
                Ok(x)
            }
        })
        .recover(|_| None::<i32>)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_map_result_wraps_error_sources() {
    let materializer = Materializer::new();
    let handle = assert_ok!(Source::iter(vec!["1", "2", "x"])
        .map_result(|s| s.parse::<i32>().map_err(Error::stage))
        .run_collect(&materializer));
    let result = handle.value().await;
    assert!(matches!(result, Err(Error::Stage(_))));
}

#[tokio::test]
async fn test_failed_source() {
    let materializer = Materializer::new();
    let result = Source::<i32>::failed(Error::custom("doomed"))
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_run_fold() {
    let materializer = Materializer::new();
    let sum = Source::iter(1..=10)
        .run_fold(0, |acc, x| acc + x, &materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(sum, 55);
}

#[tokio::test]
async fn test_run_head_cancels_rest() {
    let materializer = Materializer::new();
    let head = Source::iter(1..)
        .run_head(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(head, 1);
}

#[tokio::test]
async fn test_run_head_on_empty_stream_errors() {
    let materializer = Materializer::new();
    let result = Source::<i32>::empty()
        .run_head(&materializer)
        .unwrap()
        .value()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_run_foreach_side_effects() {
    let materializer = Materializer::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    Source::iter(1..=7)
        .run_foreach(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }, &materializer)
        .unwrap()
        .done()
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn test_from_fn_source() {
    let materializer = Materializer::new();
    let remaining = Arc::new(AtomicUsize::new(3));
    let counter = remaining.clone();
    let collected = Source::from_fn(move || {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
    })
    .run_collect(&materializer)
    .unwrap()
    .value()
    .await
    .unwrap();
    assert_eq!(collected, vec![3, 2, 1]);
}

#[tokio::test]
async fn test_single_and_repeat() {
    let materializer = Materializer::new();
    let one = Source::single(42)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(one, vec![42]);

    let repeated = Source::repeat(7)
        .take(4)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(repeated, vec![7, 7, 7, 7]);
}

#[tokio::test]
async fn test_blueprint_is_reusable() {
    let materializer = Materializer::new();
    let graph = Source::iter(1..=3).map(|x| x + 1).to(Sink::collect());
    let first = graph.run(&materializer).unwrap().value().await.unwrap();
    let second = graph.run(&materializer).unwrap().value().await.unwrap();
    assert_eq!(first, vec![2, 3, 4]);
    assert_eq!(second, vec![2, 3, 4]);
}

#[tokio::test]
async fn test_shutdown_aborts_running_stream() {
    let materializer = Materializer::new();
    let completion = Source::repeat(1u64)
        .run_with(Sink::ignore(), &materializer)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    materializer.shutdown();
    let result = completion.done().await;
    assert!(matches!(result, Err(Error::Shutdown)));
}

#[tokio::test]
async fn test_flow_fragment_reuse_via() {
    let materializer = Materializer::new();
    let double_then_pos = Flow::new().map(|x: i64| x * 2).filter(|&x| x > 0);
    let collected = Source::iter(vec![-2, -1, 1, 2])
        .via(double_then_pos)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![2, 4]);
}
