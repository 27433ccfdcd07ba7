//! Integration tests for fan-in/fan-out topologies built with the
//! [`GraphBuilder`] API.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use graphweld::core::GraphError;
use graphweld::prelude::*;

#[tokio::test]
async fn test_merge_delivers_every_element_once() {
    let materializer = Materializer::new();
    let mut builder = GraphBuilder::new();
    let left = builder.add_source(Source::iter(vec![1, 2, 3]));
    let right = builder.add_source(Source::iter(vec![10, 20, 30]));
    let merge = builder.add_merge::<i32>(2);
    let sink = builder.add_sink(Sink::collect());
    builder.connect(left, merge.inlet(0));
    builder.connect(right, merge.inlet(1));
    builder.connect(merge.outlet(), sink.inlet());

    let collected = builder
        .build(sink.mat())
        .run(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected.len(), 6);
    let unique: HashSet<i32> = collected.into_iter().collect();
    assert_eq!(unique, [1, 2, 3, 10, 20, 30].into_iter().collect());
}

#[tokio::test]
async fn test_merge_continues_after_one_input_completes() {
    let materializer = Materializer::new();
    let mut builder = GraphBuilder::new();
    let short = builder.add_source(Source::single(99));
    let long = builder.add_source(Source::iter(1..=4));
    let merge = builder.add_merge::<i32>(2);
    let sink = builder.add_sink(Sink::collect());
    builder.connect(short, merge.inlet(0));
    builder.connect(long, merge.inlet(1));
    builder.connect(merge.outlet(), sink.inlet());

    let collected = builder
        .build(sink.mat())
        .run(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    let unique: HashSet<i32> = collected.into_iter().collect();
    assert_eq!(unique, [99, 1, 2, 3, 4].into_iter().collect());
}

#[tokio::test]
async fn test_zip_completes_with_shorter_input() {
    let materializer = Materializer::new();
    let mut builder = GraphBuilder::new();
    let numbers = builder.add_source(Source::iter(vec![1, 2, 3]));
    let letters = builder.add_source(Source::iter(vec!["a", "b", "c", "d", "e"]));
    let zip = builder.add_zip::<i32, &str>();
    let sink = builder.add_sink(Sink::collect());
    builder.connect(numbers, zip.left());
    builder.connect(letters, zip.right());
    builder.connect(zip.outlet(), sink.inlet());

    let collected = builder
        .build(sink.mat())
        .run(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![(1, "a"), (2, "b"), (3, "c")]);
}

#[tokio::test]
async fn test_concat_preserves_input_order() {
    let materializer = Materializer::new();
    let mut builder = GraphBuilder::new();
    let first = builder.add_source(Source::iter(vec![1, 2]));
    let second = builder.add_source(Source::iter(vec![3, 4]));
    let third = builder.add_source(Source::iter(vec![5]));
    let concat = builder.add_concat::<i32>(3);
    let sink = builder.add_sink(Sink::collect());
    builder.connect(first, concat.inlet(0));
    builder.connect(second, concat.inlet(1));
    builder.connect(third, concat.inlet(2));
    builder.connect(concat.outlet(), sink.inlet());

    let collected = builder
        .build(sink.mat())
        .run(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_concat_skips_empty_input() {
    let materializer = Materializer::new();
    let mut builder = GraphBuilder::new();
    let first = builder.add_source(Source::<i32>::empty());
    let second = builder.add_source(Source::iter(vec![7, 8]));
    let concat = builder.add_concat::<i32>(2);
    let sink = builder.add_sink(Sink::collect());
    builder.connect(first, concat.inlet(0));
    builder.connect(second, concat.inlet(1));
    builder.connect(concat.outlet(), sink.inlet());

    let collected = builder
        .build(sink.mat())
        .run(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![7, 8]);
}

#[tokio::test]
async fn test_broadcast_feeds_every_subscriber() {
    let materializer = Materializer::new();
    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let sidecar = seen.clone();

    let mut builder = GraphBuilder::new();
    let source = builder.add_source(Source::iter(vec![1, 2, 3]));
    let broadcast = builder.add_broadcast::<i32>(2);
    let collect = builder.add_sink(Sink::collect());
    let record = builder.add_sink(Sink::foreach(move |x| {
        sidecar.lock().unwrap().push(x);
    }));
    builder.connect(source, broadcast.inlet());
    builder.connect(broadcast.outlet(0), collect.inlet());
    builder.connect(broadcast.outlet(1), record.inlet());

    let collected = builder
        .build(collect.mat())
        .run(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![1, 2, 3]);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_flow_fragment_inside_graph() {
    let materializer = Materializer::new();
    let mut builder = GraphBuilder::new();
    let source = builder.add_source(Source::iter(1..=6));
    let evens = builder.add_flow(Flow::new().filter(|x: &i32| x % 2 == 0));
    let sink = builder.add_sink(Sink::collect());
    builder.connect(source, evens.inlet());
    builder.connect(evens.outlet(), sink.inlet());

    let collected = builder
        .build(sink.mat())
        .run(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![2, 4, 6]);
}

#[tokio::test]
async fn test_unconnected_inlet_fails_validation() {
    let materializer = Materializer::new();
    let mut builder = GraphBuilder::new();
    let source = builder.add_source(Source::iter(vec![1, 2]));
    let merge = builder.add_merge::<i32>(2);
    let sink = builder.add_sink(Sink::collect());
    builder.connect(source, merge.inlet(0));
    // merge.inlet(1) is left dangling
    builder.connect(merge.outlet(), sink.inlet());

    let result = builder.build(sink.mat()).run(&materializer);
    assert!(matches!(
        result,
        Err(Error::Graph(GraphError::UnconnectedPort { .. }))
    ));
}

#[tokio::test]
async fn test_doubly_connected_outlet_fails_validation() {
    let materializer = Materializer::new();
    let mut builder = GraphBuilder::new();
    let source = builder.add_source(Source::iter(vec![1, 2]));
    let first = builder.add_sink(Sink::collect());
    let second = builder.add_sink(Sink::collect());
    builder.connect(source, first.inlet());
    builder.connect(source, second.inlet());

    let result = builder.build(first.mat()).run(&materializer);
    assert!(matches!(
        result,
        Err(Error::Graph(GraphError::DuplicateConnection { .. }))
    ));
}

#[tokio::test]
async fn test_broadcast_continues_after_branch_cancels() {
    let materializer = Materializer::new();
    let mut builder = GraphBuilder::new();
    let source = builder.add_source(Source::iter(vec![1, 2, 3]));
    let broadcast = builder.add_broadcast::<i32>(2);
    let collect = builder.add_sink(Sink::collect());
    // Resolves on the first element and cancels its branch.
    let head = builder.add_sink(Sink::head());
    builder.connect(source, broadcast.inlet());
    builder.connect(broadcast.outlet(0), collect.inlet());
    builder.connect(broadcast.outlet(1), head.inlet());

    let collected = builder
        .build(collect.mat())
        .run(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_diamond_topology() {
    // Broadcast into two flows, merge back together.
    let materializer = Materializer::new();
    let mut builder = GraphBuilder::new();
    let source = builder.add_source(Source::iter(vec![1, 2, 3]));
    let broadcast = builder.add_broadcast::<i32>(2);
    let doubler = builder.add_flow(Flow::new().map(|x: i32| x * 2));
    let negator = builder.add_flow(Flow::new().map(|x: i32| -x));
    let merge = builder.add_merge::<i32>(2);
    let sink = builder.add_sink(Sink::collect());
    builder.connect(source, broadcast.inlet());
    builder.connect(broadcast.outlet(0), doubler.inlet());
    builder.connect(broadcast.outlet(1), negator.inlet());
    builder.connect(doubler.outlet(), merge.inlet(0));
    builder.connect(negator.outlet(), merge.inlet(1));
    builder.connect(merge.outlet(), sink.inlet());

    let collected = builder
        .build(sink.mat())
        .run(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    let unique: HashSet<i32> = collected.into_iter().collect();
    assert_eq!(unique, [2, 4, 6, -1, -2, -3].into_iter().collect());
}
