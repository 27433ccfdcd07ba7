//! # Demand-Driven Dataflow Graphs for Rust
//!
//! This crate provides a backpressured stream-processing engine: typed
//! sources, flows and sinks are composed into graph blueprints, then
//! materialized into running streams where demand flows upstream and
//! elements flow downstream, one signal at a time.
//!
//! ## Core Concepts
//!
//! - **Source**: emits elements in response to demand
//! - **Flow**: transforms elements between an inlet and an outlet
//! - **Sink**: consumes elements and materializes a result handle
//! - **GraphBuilder**: wires fan-in/fan-out topologies the linear DSL
//!   cannot express
//! - **Materializer**: turns blueprints into running graphs and owns their
//!   shutdown signal
//!
//! ## Example
//!
//! ```rust
//! use graphweld::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let materializer = Materializer::new();
//!     let doubled = Source::iter(1..=100)
//!         .map(|x| x * 2)
//!         .filter(|x| x % 3 == 0)
//!         .run_collect(&materializer)?
//!         .value()
//!         .await?;
//!     assert_eq!(doubled.len(), 33);
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod fan;
pub mod flows;
pub mod operators;
pub mod sinks;
pub mod sources;
pub mod substream;

// Re-export commonly used items
pub mod prelude {
    pub use crate::core::{
        Error, GraphBuilder, Materializer, MaterializerConfig, Result, StreamCompletion,
        StreamResult,
    };
    pub use crate::fan::{BroadcastPorts, ConcatPorts, MergePorts, ZipPorts};
    pub use crate::flows::{Flow, FlowPorts};
    pub use crate::operators::OverflowStrategy;
    pub use crate::sinks::{Sink, SinkPorts};
    pub use crate::sources::Source;
    pub use crate::substream::SubStream;
}

// Re-export main error type
pub use crate::core::error::{Error, Result};
