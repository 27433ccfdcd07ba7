//! Basic usage examples for graphweld
//!
//! Run with: cargo run --example basic

use std::time::Duration;

use graphweld::prelude::*;

/// Example 1: Simple number processing
async fn simple_example(materializer: &Materializer) -> Result<()> {
    println!("=== Simple Number Processing ===");

    Source::iter(1..=10)
        .run_foreach(|x| println!("Number: {x}"), materializer)?
        .done()
        .await?;

    println!();
    Ok(())
}

/// Example 2: Transform and filter
async fn transform_filter_example(materializer: &Materializer) -> Result<()> {
    println!("=== Transform and Filter ===");

    let squares = Source::iter(1..=20)
        .filter(|x| x % 3 == 0)
        .map(|x| x * x)
        .run_collect(materializer)?
        .value()
        .await?;
    println!("Squares of multiples of three: {squares:?}");

    println!();
    Ok(())
}

/// Example 3: Batching with `grouped`
async fn batching_example(materializer: &Materializer) -> Result<()> {
    println!("=== Batching ===");

    Source::iter(1..=10)
        .grouped(3)
        .run_foreach(|batch| println!("Batch: {batch:?}"), materializer)?
        .done()
        .await?;

    println!();
    Ok(())
}

/// Example 4: Asynchronous enrichment with bounded parallelism
async fn map_async_example(materializer: &Materializer) -> Result<()> {
    println!("=== Async Enrichment ===");

    let enriched = Source::iter(vec!["alpha", "beta", "gamma"])
        .map_async(2, |word| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(word.to_uppercase())
        })
        .run_collect(materializer)?
        .value()
        .await?;
    println!("Enriched: {enriched:?}");

    println!();
    Ok(())
}

/// Example 5: Folding a stream into a summary
async fn fold_example(materializer: &Materializer) -> Result<()> {
    println!("=== Fold ===");

    let sum = Source::iter(1..=100)
        .run_fold(0, |acc, x| acc + x, materializer)?
        .value()
        .await?;
    println!("Sum of 1..=100: {sum}");

    println!();
    Ok(())
}

/// Example 6: Recovering from a failure
async fn recover_example(materializer: &Materializer) -> Result<()> {
    println!("=== Recover ===");

    let values = Source::iter(1..=5)
        .map_result(|x| {
            if x == 4 {
                Err(Error::custom("four is not welcome here"))
            } else {
                Ok(x)
            }
        })
        .recover(|_| Some(-1))
        .run_collect(materializer)?
        .value()
        .await?;
    println!("With fallback: {values:?}");

    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let materializer = Materializer::new();

    simple_example(&materializer).await?;
    transform_filter_example(&materializer).await?;
    batching_example(&materializer).await?;
    map_async_example(&materializer).await?;
    fold_example(&materializer).await?;
    recover_example(&materializer).await?;

    Ok(())
}
