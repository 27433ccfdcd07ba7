//! Engine internals: the stage protocol, graph blueprints, the signal
//! interpreter, and the materializer.

pub mod error;
pub mod graph;
pub mod interpreter;
pub mod materializer;
pub mod stage;

pub use error::{Error, GraphError, Result};
pub use graph::{GraphBuilder, GraphDef, Inlet, MatRef, Outlet, RunnableGraph};
pub use interpreter::StageCtx;
pub use materializer::{Materializer, MaterializerConfig, StreamCompletion, StreamResult};
pub use stage::{Elem, StageEvent, StageEvents, StageLogic};
