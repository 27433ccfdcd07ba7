//! Error types for the dataflow graph engine.

use std::sync::Arc;
use thiserror::Error;

/// The main error type for materialized streams.
///
/// Stream failures fan out: a single upstream failure may be delivered to
/// several downstream branches and sub-streams, so the payload of
/// [`Error::Stage`] is reference counted and the whole enum is cheap to
/// clone.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A stage's own transform failed; propagates downstream as a stream
    /// failure.
    #[error("stage logic failure: {0}")]
    Stage(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// A stage broke the push/pull contract. Fatal: the materialized graph
    /// is aborted.
    #[error("protocol violation in stage `{stage}`: {detail}")]
    ProtocolViolation { stage: String, detail: String },

    /// The graph description was structurally invalid. Raised at
    /// materialization, before any signal flows.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A `buffer` stage with the `Fail` overflow strategy received an
    /// element it had no room for.
    #[error("buffer overflow: capacity {capacity} exceeded")]
    BufferOverflow { capacity: usize },

    /// `group_by` saw a new key while already at its open-group limit.
    #[error("too many open groups: limit {limit} reached")]
    TooManyGroups { limit: usize },

    /// The materializer was shut down while the stream was still running.
    #[error("stream was shut down before completion")]
    Shutdown,

    /// A custom error with a message.
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Wrap any error type as a stage logic failure.
    pub fn stage<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Stage(Arc::new(error))
    }

    /// Create a custom error with a message.
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    pub(crate) fn violation<S: Into<String>, D: Into<String>>(stage: S, detail: D) -> Self {
        Error::ProtocolViolation {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// An element crossed a connection with an unexpected runtime type.
    ///
    /// The typed DSL makes this unreachable; it exists so the engine never
    /// has to panic on a downcast.
    pub(crate) fn type_mismatch(context: &str) -> Self {
        Error::Custom(format!("internal type mismatch in {context}"))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Structural problems in a graph description.
///
/// These are detected when a
/// [`RunnableGraph`](crate::core::graph::RunnableGraph) is materialized; a
/// description that validates never produces them at run time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A port was never wired to a peer.
    #[error("unconnected {kind} port {port} on stage `{stage}`")]
    UnconnectedPort {
        stage: String,
        port: usize,
        kind: PortKind,
    },

    /// A port was wired to more than one peer.
    #[error("{kind} port {port} on stage `{stage}` connected more than once")]
    DuplicateConnection {
        stage: String,
        port: usize,
        kind: PortKind,
    },

    /// The description contains no stages.
    #[error("graph description is empty")]
    Empty,
}

/// Which side of a stage a port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Inlet,
    Outlet,
}

impl std::fmt::Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortKind::Inlet => write!(f, "inlet"),
            PortKind::Outlet => write!(f, "outlet"),
        }
    }
}

/// Convenience type alias for Results in this crate.
pub type Result<T> = std::result::Result<T, Error>;
