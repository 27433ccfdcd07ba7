//! Turning blueprints into running streams.
//!
//! A [`Materializer`] owns the shutdown token shared by everything it has
//! started. Each run builds fresh stage logic from the blueprint, wires the
//! connections, hands the materialized value back synchronously, and spawns
//! one task that drives the whole graph.

use std::marker::PhantomData;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::{Error, Result};
use crate::core::graph::RunnableGraph;
use crate::core::interpreter::{ConnStatus, Connection, Interpreter, StageSlot, StageState};
use crate::core::stage::{unbox, Elem};

/// Knobs shared by every stream a materializer starts.
#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    /// Mailbox capacity of each sub-stream hand-off channel.
    pub substream_buffer: usize,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            substream_buffer: 1,
        }
    }
}

/// Starts streams and owns their shared shutdown signal.
#[derive(Clone)]
pub struct Materializer {
    token: CancellationToken,
    config: MaterializerConfig,
}

impl Default for Materializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Materializer {
    pub fn new() -> Self {
        Self::with_config(MaterializerConfig::default())
    }

    pub fn with_config(config: MaterializerConfig) -> Self {
        Self {
            token: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &MaterializerConfig {
        &self.config
    }

    /// Abort every stream started by this materializer. Running graphs
    /// terminate with [`Error::Shutdown`]; already-completed ones are
    /// unaffected.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

impl<M: 'static> RunnableGraph<M> {
    /// Materialize and start this graph. The returned value is available
    /// immediately; the stream itself runs on a spawned task until it
    /// terminates or the materializer shuts down.
    pub fn run(&self, materializer: &Materializer) -> Result<M> {
        self.def.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut slots = Vec::with_capacity(self.def.stages.len());
        let mut mats = Vec::with_capacity(self.def.stages.len());
        for plan in &self.def.stages {
            let built = (plan.build)(materializer.config());
            mats.push(Some(built.mat));
            slots.push(StageSlot {
                name: plan.name.clone(),
                logic: Some(built.logic),
                state: StageState::Running,
                in_conns: vec![usize::MAX; plan.inlets],
                out_conns: vec![usize::MAX; plan.outlets],
                emit: Default::default(),
                finish_after_emit: false,
            });
        }

        let mut conns = Vec::with_capacity(self.def.edges.len());
        for edge in &self.def.edges {
            let conn = conns.len();
            conns.push(Connection {
                up: (edge.from_stage, edge.from_port),
                down: (edge.to_stage, edge.to_port),
                pulled: false,
                in_flight: false,
                status: ConnStatus::Open,
            });
            slots[edge.from_stage].out_conns[edge.from_port] = conn;
            slots[edge.to_stage].in_conns[edge.to_port] = conn;
        }

        let mat = mats
            .get_mut(self.mat_stage)
            .and_then(Option::take)
            .ok_or_else(|| Error::custom("materialized value stage out of range"))?;
        let mat = mat
            .downcast::<M>()
            .map_err(|_| Error::custom("materialized value type mismatch"))?;

        debug!(
            stages = slots.len(),
            connections = conns.len(),
            "materializing graph"
        );
        let interpreter = Interpreter::new(slots, conns, events_tx, materializer.config().clone());
        tokio::spawn(interpreter.run(materializer.child_token(), events_rx));
        Ok(*mat)
    }
}

/// Materialized handle resolving when a stream terminates.
pub struct StreamCompletion {
    pub(crate) rx: oneshot::Receiver<Result<()>>,
}

impl StreamCompletion {
    /// Wait for the stream to finish. `Ok(())` on normal completion, the
    /// failing stage's error otherwise. A stream torn down before reporting
    /// resolves to [`Error::Shutdown`].
    pub async fn done(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Shutdown),
        }
    }
}

/// Materialized handle resolving to a single final value of type `T`.
pub struct StreamResult<T> {
    pub(crate) rx: oneshot::Receiver<Result<Elem>>,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> StreamResult<T> {
    /// Wait for the stream's final value.
    pub async fn value(self) -> Result<T> {
        match self.rx.await {
            Ok(Ok(elem)) => unbox(elem, "materialized result"),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Shutdown),
        }
    }
}
