//! Integration tests for sub-stream operators: `group_by`, `split_when`,
//! `split_after`, `prefix_and_tail` and `flatten_concat`.

use graphweld::prelude::*;

fn materializer() -> Materializer {
    // Generous sub-stream mailboxes keep these tests insensitive to how
    // the runtime interleaves the parent and sub-stream tasks.
    Materializer::with_config(MaterializerConfig {
        substream_buffer: 16,
    })
}

fn words(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_group_by_routes_by_key() {
    let materializer = materializer();
    let input = words(&["Aaa", "Abb", "Bcc", "Cdd", "Cee"]);
    let groups = Source::iter(input)
        .group_by(16, |s| s.as_bytes()[0])
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();

    assert_eq!(groups.len(), 3);
    let mut by_key = Vec::new();
    for (key, sub) in groups {
        let elements = sub
            .into_source()
            .run_collect(&materializer)
            .unwrap()
            .value()
            .await
            .unwrap();
        by_key.push((key, elements));
    }
    by_key.sort_by_key(|(key, _)| *key);
    assert_eq!(
        by_key,
        vec![
            (b'A', words(&["Aaa", "Abb"])),
            (b'B', words(&["Bcc"])),
            (b'C', words(&["Cdd", "Cee"])),
        ]
    );
}

#[tokio::test]
async fn test_group_by_limit_fails_stream() {
    let materializer = materializer();
    let result = Source::iter(0..10)
        .group_by(3, |x| x % 5)
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await;
    assert!(matches!(result, Err(Error::TooManyGroups { limit: 3 })));
}

#[tokio::test]
async fn test_group_by_outer_cancel_keeps_existing_groups() {
    let materializer = materializer();
    let input = words(&["Aaa", "Abb", "Bcc"]);
    let (key, sub) = Source::iter(input)
        .group_by(16, |s| s.as_bytes()[0])
        .run_head(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();

    assert_eq!(key, b'A');
    let elements = sub
        .into_source()
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(elements, words(&["Aaa", "Abb"]));
}

#[tokio::test]
async fn test_group_by_upstream_failure_fails_open_groups() {
    let materializer = materializer();
    let input = words(&["Aaa", "Abb", "boom", "Acc"]);
    let (key, sub) = Source::iter(input)
        .map_result(|s| {
            if s == "boom" {
                Err("poisoned element".into())
            } else {
                Ok(s)
            }
        })
        .group_by(16, |s| s.as_bytes()[0])
        .run_head(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();

    assert_eq!(key, b'A');
    let drained = sub
        .into_source()
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await;
    assert!(matches!(drained, Err(Error::Custom(ref msg)) if msg == "poisoned element"));
}

#[tokio::test]
async fn test_split_when_opens_segment_on_match() {
    let materializer = materializer();
    let input = words(&["A", "B", "C", ".", "D", ".", "E", "F"]);
    let segments = Source::iter(input)
        .split_when(|s| s == ".")
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();

    let mut drained = Vec::new();
    for sub in segments {
        drained.push(
            sub.into_source()
                .run_collect(&materializer)
                .unwrap()
                .value()
                .await
                .unwrap(),
        );
    }
    assert_eq!(
        drained,
        vec![
            words(&["A", "B", "C"]),
            words(&[".", "D"]),
            words(&[".", "E", "F"]),
        ]
    );
}

#[tokio::test]
async fn test_split_after_closes_segment_behind_match() {
    let materializer = materializer();
    let input = words(&["A", "B", "C", ".", "D", ".", "E", "F"]);
    let segments = Source::iter(input)
        .split_after(|s| s == ".")
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();

    let mut drained = Vec::new();
    for sub in segments {
        drained.push(
            sub.into_source()
                .run_collect(&materializer)
                .unwrap()
                .value()
                .await
                .unwrap(),
        );
    }
    assert_eq!(
        drained,
        vec![
            words(&["A", "B", "C", "."]),
            words(&["D", "."]),
            words(&["E", "F"]),
        ]
    );
}

#[tokio::test]
async fn test_split_upstream_failure_fails_open_segment() {
    let materializer = materializer();
    let input = words(&["A", "B", "boom"]);
    let sub = Source::iter(input)
        .map_result(|s| {
            if s == "boom" {
                Err(format!("rejected {s}").into())
            } else {
                Ok(s)
            }
        })
        .split_when(|s| s == ".")
        .run_head(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();

    let drained = sub
        .into_source()
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await;
    assert!(matches!(drained, Err(Error::Custom(ref msg)) if msg == "rejected boom"));
}

#[tokio::test]
async fn test_prefix_and_tail() {
    let materializer = materializer();
    let (prefix, tail) = Source::iter(1..=6)
        .prefix_and_tail(2)
        .run_head(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();

    assert_eq!(prefix, vec![1, 2]);
    let rest = tail
        .into_source()
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(rest, vec![3, 4, 5, 6]);
}

#[tokio::test]
async fn test_prefix_and_tail_short_input() {
    let materializer = materializer();
    let (prefix, tail) = Source::iter(1..=2)
        .prefix_and_tail(5)
        .run_head(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();

    assert_eq!(prefix, vec![1, 2]);
    let rest = tail
        .into_source()
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_flatten_concat_round_trip() {
    let materializer = materializer();
    let collected = Source::iter(1..=10)
        .split_when(|&x| x % 4 == 1)
        .flatten_concat()
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(collected, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_sub_stream_is_single_shot() {
    let materializer = materializer();
    let input = words(&["Aaa", "Abb"]);
    let groups = Source::iter(input)
        .group_by(16, |s| s.as_bytes()[0])
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();

    let (_, sub) = groups.into_iter().next().unwrap();
    let source = sub.into_source();
    let first = source
        .clone()
        .run_collect(&materializer)
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(first, words(&["Aaa", "Abb"]));

    let second = source.run_collect(&materializer).unwrap().value().await;
    assert!(second.is_err());
}
