//! Typed stream terminals.
//!
//! A [`Sink`] is a blueprint fragment with one open inlet and a
//! materialized value: a handle the caller keeps when the graph starts.
//! Result-bearing sinks resolve a oneshot channel on termination, so the
//! handle works across the task boundary between caller and interpreter.

use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::core::error::{Error, Result};
use crate::core::graph::{
    BuiltStage, GraphBuilder, GraphDef, Inlet, MatRef, StagePlan,
};
use crate::core::interpreter::StageCtx;
use crate::core::materializer::{MaterializerConfig, StreamCompletion, StreamResult};
use crate::core::stage::{unbox, Elem, StageLogic};
use crate::operators::{AggregateFn, WrapSeqFn};

const IN: usize = 0;

type ResultTx = Option<oneshot::Sender<Result<Elem>>>;
type UnitTx = Option<oneshot::Sender<Result<()>>>;
type EachFn = Arc<dyn Fn(Elem) -> Result<()> + Send + Sync>;

struct CollectLogic {
    items: Vec<Elem>,
    wrap: WrapSeqFn,
    tx: ResultTx,
}

impl CollectLogic {
    fn resolve(&mut self, outcome: Result<Elem>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl StageLogic for CollectLogic {
    fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }

    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        self.items.push(elem);
        ctx.pull(IN);
    }

    fn on_pull(&mut self, _outlet: usize, _ctx: &mut StageCtx<'_>) {}

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        let outcome = (self.wrap)(std::mem::take(&mut self.items));
        self.resolve(outcome);
        ctx.finish_stage();
    }

    fn on_upstream_failure(&mut self, _inlet: usize, error: Error, ctx: &mut StageCtx<'_>) {
        self.resolve(Err(error.clone()));
        ctx.fail_stage(error);
    }

    fn on_abort(&mut self, error: &Error) {
        self.resolve(Err(error.clone()));
    }
}

struct HeadLogic {
    tx: ResultTx,
}

impl HeadLogic {
    fn resolve(&mut self, outcome: Result<Elem>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl StageLogic for HeadLogic {
    fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }

    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        self.resolve(Ok(elem));
        ctx.finish_stage();
    }

    fn on_pull(&mut self, _outlet: usize, _ctx: &mut StageCtx<'_>) {}

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        self.resolve(Err(Error::custom(
            "stream completed without emitting an element",
        )));
        ctx.finish_stage();
    }

    fn on_upstream_failure(&mut self, _inlet: usize, error: Error, ctx: &mut StageCtx<'_>) {
        self.resolve(Err(error.clone()));
        ctx.fail_stage(error);
    }

    fn on_abort(&mut self, error: &Error) {
        self.resolve(Err(error.clone()));
    }
}

struct FoldLogic {
    acc: Option<Elem>,
    f: AggregateFn,
    tx: ResultTx,
}

impl FoldLogic {
    fn resolve(&mut self, outcome: Result<Elem>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl StageLogic for FoldLogic {
    fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }

    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        let Some(acc) = self.acc.take() else {
            return;
        };
        match (self.f)(acc, elem) {
            Ok(acc) => {
                self.acc = Some(acc);
                ctx.pull(IN);
            }
            Err(err) => {
                self.resolve(Err(err.clone()));
                ctx.fail_stage(err);
            }
        }
    }

    fn on_pull(&mut self, _outlet: usize, _ctx: &mut StageCtx<'_>) {}

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        let outcome = self
            .acc
            .take()
            .ok_or_else(|| Error::custom("fold accumulator missing"));
        self.resolve(outcome);
        ctx.finish_stage();
    }

    fn on_upstream_failure(&mut self, _inlet: usize, error: Error, ctx: &mut StageCtx<'_>) {
        self.resolve(Err(error.clone()));
        ctx.fail_stage(error);
    }

    fn on_abort(&mut self, error: &Error) {
        self.resolve(Err(error.clone()));
    }
}

struct DrainLogic {
    each: Option<EachFn>,
    tx: UnitTx,
}

impl DrainLogic {
    fn resolve(&mut self, outcome: Result<()>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl StageLogic for DrainLogic {
    fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }

    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        if let Some(each) = &self.each {
            if let Err(err) = each(elem) {
                self.resolve(Err(err.clone()));
                ctx.fail_stage(err);
                return;
            }
        }
        ctx.pull(IN);
    }

    fn on_pull(&mut self, _outlet: usize, _ctx: &mut StageCtx<'_>) {}

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        self.resolve(Ok(()));
        ctx.finish_stage();
    }

    fn on_upstream_failure(&mut self, _inlet: usize, error: Error, ctx: &mut StageCtx<'_>) {
        self.resolve(Err(error.clone()));
        ctx.fail_stage(error);
    }

    fn on_abort(&mut self, error: &Error) {
        self.resolve(Err(error.clone()));
    }
}

/// A blueprint fragment consuming elements of type `T` and materializing a
/// value of type `M`.
pub struct Sink<T, M> {
    pub(crate) def: GraphDef,
    pub(crate) in_port: (usize, usize),
    pub(crate) mat_stage: usize,
    pub(crate) _marker: PhantomData<fn(T) -> M>,
}

impl<T, M> Clone for Sink<T, M> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            in_port: self.in_port,
            mat_stage: self.mat_stage,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static, M: 'static> Sink<T, M> {
    fn from_stage<B>(name: &str, build: B) -> Self
    where
        B: Fn(&MaterializerConfig) -> BuiltStage + Send + Sync + 'static,
    {
        let mut def = GraphDef::default();
        let stage = def.add_stage(StagePlan {
            name: name.to_string(),
            inlets: 1,
            outlets: 0,
            build: Arc::new(build),
        });
        Self {
            def,
            in_port: (stage, 0),
            mat_stage: stage,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Sink<T, StreamResult<Vec<T>>> {
    /// Gather every element into a `Vec`, resolved when the stream
    /// terminates.
    pub fn collect() -> Self {
        let wrap: WrapSeqFn = Arc::new(|items: Vec<Elem>| {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(unbox::<T>(item, "collected element")?);
            }
            Ok(Box::new(out) as Elem)
        });
        Self::from_stage("collect-sink", move |_| {
            let (tx, rx) = oneshot::channel();
            BuiltStage::with_mat(
                CollectLogic {
                    items: Vec::new(),
                    wrap: wrap.clone(),
                    tx: Some(tx),
                },
                Box::new(StreamResult::<Vec<T>> {
                    rx,
                    _marker: PhantomData,
                }),
            )
        })
    }
}

impl<T: Send + 'static> Sink<T, StreamResult<T>> {
    /// Resolve to the first element, cancelling the rest of the stream.
    /// An empty stream resolves to an error.
    pub fn head() -> Self {
        Self::from_stage("head-sink", |_| {
            let (tx, rx) = oneshot::channel();
            BuiltStage::with_mat(
                HeadLogic { tx: Some(tx) },
                Box::new(StreamResult::<T> {
                    rx,
                    _marker: PhantomData,
                }),
            )
        })
    }
}

impl<T: Send + 'static> Sink<T, StreamCompletion> {
    /// Apply a side effect to every element.
    pub fn foreach<F>(f: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let each: EachFn = Arc::new(move |elem| {
            let value = unbox::<T>(elem, "foreach input")?;
            f(value);
            Ok(())
        });
        Self::from_stage("foreach-sink", move |_| {
            let (tx, rx) = oneshot::channel();
            BuiltStage::with_mat(
                DrainLogic {
                    each: Some(each.clone()),
                    tx: Some(tx),
                },
                Box::new(StreamCompletion { rx }),
            )
        })
    }

    /// Consume and discard every element, resolving on termination.
    pub fn ignore() -> Self {
        Self::from_stage("ignore-sink", |_| {
            let (tx, rx) = oneshot::channel();
            BuiltStage::with_mat(
                DrainLogic {
                    each: None,
                    tx: Some(tx),
                },
                Box::new(StreamCompletion { rx }),
            )
        })
    }
}

impl<T: Send + 'static, A: Send + 'static> Sink<T, StreamResult<A>> {
    /// Fold every element into an accumulator, resolved on completion.
    pub fn fold<F>(zero: A, f: F) -> Self
    where
        A: Clone + Sync,
        F: Fn(A, T) -> A + Send + Sync + 'static,
    {
        let f: AggregateFn = Arc::new(move |acc, elem| {
            let acc = unbox::<A>(acc, "fold accumulator")?;
            let value = unbox::<T>(elem, "fold input")?;
            Ok(Box::new(f(acc, value)) as Elem)
        });
        Self::from_stage("fold-sink", move |_| {
            let (tx, rx) = oneshot::channel();
            BuiltStage::with_mat(
                FoldLogic {
                    acc: Some(Box::new(zero.clone()) as Elem),
                    f: f.clone(),
                    tx: Some(tx),
                },
                Box::new(StreamResult::<A> {
                    rx,
                    _marker: PhantomData,
                }),
            )
        })
    }
}

/// Ports of a sink added to a [`GraphBuilder`].
pub struct SinkPorts<T, M> {
    inlet: Inlet<T>,
    mat: MatRef<M>,
}

impl<T, M> SinkPorts<T, M> {
    pub fn inlet(&self) -> Inlet<T> {
        self.inlet
    }

    pub fn mat(&self) -> MatRef<M> {
        self.mat
    }
}

impl GraphBuilder {
    /// Add a sink fragment, returning its inlet and materialized-value
    /// handle.
    pub fn add_sink<T: Send + 'static, M: 'static>(&mut self, sink: Sink<T, M>) -> SinkPorts<T, M> {
        let offset = self.splice(sink.def);
        SinkPorts {
            inlet: Inlet::new(sink.in_port.0 + offset, sink.in_port.1),
            mat: MatRef::new(sink.mat_stage + offset),
        }
    }
}
