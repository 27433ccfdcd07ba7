//! Fan-in, fan-out and sub-stream examples for graphweld
//!
//! Run with: cargo run --example fan_shapes

use graphweld::prelude::*;

/// Example 1: Merging two sources
async fn merge_example(materializer: &Materializer) -> Result<()> {
    println!("=== Merge ===");

    let mut builder = GraphBuilder::new();
    let evens = builder.add_source(Source::iter(vec![0, 2, 4, 6]));
    let odds = builder.add_source(Source::iter(vec![1, 3, 5, 7]));
    let merge = builder.add_merge::<i32>(2);
    let sink = builder.add_sink(Sink::collect());
    builder.connect(evens, merge.inlet(0));
    builder.connect(odds, merge.inlet(1));
    builder.connect(merge.outlet(), sink.inlet());

    let merged = builder
        .build(sink.mat())
        .run(materializer)?
        .value()
        .await?;
    println!("Merged: {merged:?}");

    println!();
    Ok(())
}

/// Example 2: Zipping two streams pairwise
async fn zip_example(materializer: &Materializer) -> Result<()> {
    println!("=== Zip ===");

    let mut builder = GraphBuilder::new();
    let ids = builder.add_source(Source::iter(1..=3));
    let names = builder.add_source(Source::iter(vec!["ada", "grace", "edsger"]));
    let zip = builder.add_zip::<i32, &str>();
    let sink = builder.add_sink(Sink::collect());
    builder.connect(ids, zip.left());
    builder.connect(names, zip.right());
    builder.connect(zip.outlet(), sink.inlet());

    let pairs = builder
        .build(sink.mat())
        .run(materializer)?
        .value()
        .await?;
    println!("Pairs: {pairs:?}");

    println!();
    Ok(())
}

/// Example 3: Broadcasting into two differently-shaped branches
async fn broadcast_example(materializer: &Materializer) -> Result<()> {
    println!("=== Broadcast ===");

    let mut builder = GraphBuilder::new();
    let source = builder.add_source(Source::iter(1..=5));
    let broadcast = builder.add_broadcast::<i32>(2);
    let doubled = builder.add_flow(Flow::new().map(|x: i32| x * 2));
    let collect = builder.add_sink(Sink::collect());
    let print = builder.add_sink(Sink::foreach(|x| println!("Original: {x}")));
    builder.connect(source, broadcast.inlet());
    builder.connect(broadcast.outlet(0), doubled.inlet());
    builder.connect(broadcast.outlet(1), print.inlet());
    builder.connect(doubled.outlet(), collect.inlet());

    let doubled_values = builder
        .build(collect.mat())
        .run(materializer)?
        .value()
        .await?;
    println!("Doubled branch: {doubled_values:?}");

    println!();
    Ok(())
}

/// Example 4: Demultiplexing with `group_by`
async fn group_by_example(materializer: &Materializer) -> Result<()> {
    println!("=== Group By ===");

    let words = vec!["apple", "avocado", "banana", "cherry", "citron"];
    let groups = Source::iter(words)
        .group_by(26, |word| word.as_bytes()[0] as char)
        .run_collect(materializer)?
        .value()
        .await?;

    for (letter, sub) in groups {
        let entries = sub
            .into_source()
            .run_collect(materializer)?
            .value()
            .await?;
        println!("{letter}: {entries:?}");
    }

    println!();
    Ok(())
}

/// Example 5: Splitting a stream at sentinel markers
async fn split_example(materializer: &Materializer) -> Result<()> {
    println!("=== Split When ===");

    let lines = vec!["# intro", "one", "two", "# body", "three"];
    let sections = Source::iter(lines)
        .split_when(|line| line.starts_with('#'))
        .run_collect(materializer)?
        .value()
        .await?;

    for section in sections {
        let content = section
            .into_source()
            .run_collect(materializer)?
            .value()
            .await?;
        println!("Section: {content:?}");
    }

    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let materializer = Materializer::with_config(MaterializerConfig {
        substream_buffer: 16,
    });

    merge_example(&materializer).await?;
    zip_example(&materializer).await?;
    broadcast_example(&materializer).await?;
    group_by_example(&materializer).await?;
    split_example(&materializer).await?;

    Ok(())
}
