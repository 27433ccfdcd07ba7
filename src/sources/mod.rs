//! Typed stream origins and the linear `Source` DSL.
//!
//! A [`Source`] is a blueprint fragment with one open outlet. Combinators
//! append operator stages; `to`/`run_*` close it with a sink and hand the
//! result to a materializer. Blueprints are inert and reusable, nothing
//! runs until materialization.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::error::{Error, Result};
use crate::core::graph::{BuiltStage, GraphDef, MatRef, Outlet, RunnableGraph, StagePlan};
use crate::core::interpreter::StageCtx;
use crate::core::materializer::{Materializer, StreamCompletion, StreamResult};
use crate::core::stage::{Elem, StageLogic};
use crate::flows::Flow;
use crate::sinks::Sink;
use crate::substream::SubStream;

const OUT: usize = 0;

struct IterLogic<It> {
    iter: It,
}

impl<It> StageLogic for IterLogic<It>
where
    It: Iterator + Send,
    It::Item: Send + 'static,
{
    fn on_push(&mut self, _inlet: usize, _elem: Elem, _ctx: &mut StageCtx<'_>) {}

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        match self.iter.next() {
            Some(item) => ctx.push(OUT, Box::new(item)),
            None => ctx.finish_stage(),
        }
    }
}

struct RepeatLogic<T> {
    value: T,
}

impl<T: Clone + Send + 'static> StageLogic for RepeatLogic<T> {
    fn on_push(&mut self, _inlet: usize, _elem: Elem, _ctx: &mut StageCtx<'_>) {}

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.push(OUT, Box::new(self.value.clone()));
    }
}

struct EmptyLogic;

impl StageLogic for EmptyLogic {
    fn on_push(&mut self, _inlet: usize, _elem: Elem, _ctx: &mut StageCtx<'_>) {}

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.finish_stage();
    }
}

struct FailedLogic {
    error: Error,
}

impl StageLogic for FailedLogic {
    fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
        ctx.fail_stage(self.error.clone());
    }

    fn on_push(&mut self, _inlet: usize, _elem: Elem, _ctx: &mut StageCtx<'_>) {}

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.fail_stage(self.error.clone());
    }
}

struct FromFnLogic<T> {
    f: Arc<dyn Fn() -> Option<T> + Send + Sync>,
}

impl<T: Send + 'static> StageLogic for FromFnLogic<T> {
    fn on_push(&mut self, _inlet: usize, _elem: Elem, _ctx: &mut StageCtx<'_>) {}

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        match (self.f)() {
            Some(item) => ctx.push(OUT, Box::new(item)),
            None => ctx.finish_stage(),
        }
    }
}

/// A stream blueprint producing elements of type `T` through one open
/// outlet.
pub struct Source<T> {
    pub(crate) def: GraphDef,
    pub(crate) out: (usize, usize),
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            out: self.out,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Source<T> {
    pub(crate) fn from_stage(plan: StagePlan) -> Self {
        let mut def = GraphDef::default();
        let stage = def.add_stage(plan);
        Self {
            def,
            out: (stage, 0),
            _marker: PhantomData,
        }
    }

    /// Emit the items of a collection or range, then complete.
    pub fn iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send,
    {
        Self::from_stage(StagePlan {
            name: "iter-source".to_string(),
            inlets: 0,
            outlets: 1,
            build: Arc::new(move |_| {
                BuiltStage::new(IterLogic {
                    iter: items.clone().into_iter(),
                })
            }),
        })
    }

    /// Emit exactly one element, then complete.
    pub fn single(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::iter(std::iter::once(value))
    }

    /// Emit the same element for as long as there is demand.
    pub fn repeat(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_stage(StagePlan {
            name: "repeat-source".to_string(),
            inlets: 0,
            outlets: 1,
            build: Arc::new(move |_| {
                BuiltStage::new(RepeatLogic {
                    value: value.clone(),
                })
            }),
        })
    }

    /// Complete immediately without emitting anything.
    pub fn empty() -> Self {
        Self::from_stage(StagePlan {
            name: "empty-source".to_string(),
            inlets: 0,
            outlets: 1,
            build: Arc::new(|_| BuiltStage::new(EmptyLogic)),
        })
    }

    /// Fail the stream as soon as it starts.
    pub fn failed(error: Error) -> Self {
        Self::from_stage(StagePlan {
            name: "failed-source".to_string(),
            inlets: 0,
            outlets: 1,
            build: Arc::new(move |_| {
                BuiltStage::new(FailedLogic {
                    error: error.clone(),
                })
            }),
        })
    }

    /// Emit elements produced by a generator function until it returns
    /// `None`.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
    {
        let f: Arc<dyn Fn() -> Option<T> + Send + Sync> = Arc::new(f);
        Self::from_stage(StagePlan {
            name: "fn-source".to_string(),
            inlets: 0,
            outlets: 1,
            build: Arc::new(move |_| BuiltStage::new(FromFnLogic { f: f.clone() })),
        })
    }

    /// Append a flow, producing a source of its output type.
    pub fn via<U: Send + 'static>(mut self, flow: Flow<T, U>) -> Source<U> {
        let offset = self.def.splice(flow.def);
        if let Some((in_stage, in_port)) = flow.in_port {
            self.def.add_edge(self.out, (in_stage + offset, in_port));
        }
        let out = match flow.out_port {
            Some((out_stage, out_port)) => (out_stage + offset, out_port),
            None => self.out,
        };
        Source {
            def: self.def,
            out,
            _marker: PhantomData,
        }
    }

    /// Close the blueprint with a sink, keeping the sink's materialized
    /// value.
    pub fn to<M>(mut self, sink: Sink<T, M>) -> RunnableGraph<M> {
        let offset = self.def.splice(sink.def);
        self.def
            .add_edge(self.out, (sink.in_port.0 + offset, sink.in_port.1));
        let builder = crate::core::graph::GraphBuilder { def: self.def };
        builder.build(MatRef::<M>::new(sink.mat_stage + offset))
    }

    /// Run to a sink and return its materialized value.
    pub fn run_with<M: 'static>(self, sink: Sink<T, M>, materializer: &Materializer) -> Result<M> {
        self.to(sink).run(materializer)
    }

    /// Collect every element into a `Vec`.
    pub fn run_collect(
        self,
        materializer: &Materializer,
    ) -> Result<StreamResult<Vec<T>>> {
        self.run_with(Sink::collect(), materializer)
    }

    /// Resolve to the first element; an empty stream resolves to an error.
    pub fn run_head(self, materializer: &Materializer) -> Result<StreamResult<T>> {
        self.run_with(Sink::head(), materializer)
    }

    /// Fold every element into an accumulator.
    pub fn run_fold<A, F>(
        self,
        zero: A,
        f: F,
        materializer: &Materializer,
    ) -> Result<StreamResult<A>>
    where
        A: Clone + Send + Sync + 'static,
        F: Fn(A, T) -> A + Send + Sync + 'static,
    {
        self.run_with(Sink::fold(zero, f), materializer)
    }

    /// Apply a side effect to every element, resolving when the stream
    /// terminates.
    pub fn run_foreach<F>(
        self,
        f: F,
        materializer: &Materializer,
    ) -> Result<StreamCompletion>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.run_with(Sink::foreach(f), materializer)
    }

    // Linear operator shorthands, each delegating to the equivalent flow.

    pub fn map<U, F>(self, f: F) -> Source<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.via(Flow::new().map(f))
    }

    pub fn map_result<U, F>(self, f: F) -> Source<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Result<U> + Send + Sync + 'static,
    {
        self.via(Flow::new().map_result(f))
    }

    pub fn filter<F>(self, pred: F) -> Source<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.via(Flow::new().filter(pred))
    }

    pub fn take(self, n: usize) -> Source<T> {
        self.via(Flow::new().take(n))
    }

    pub fn take_while<F>(self, pred: F) -> Source<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.via(Flow::new().take_while(pred))
    }

    pub fn drop(self, n: usize) -> Source<T> {
        self.via(Flow::new().drop(n))
    }

    pub fn drop_while<F>(self, pred: F) -> Source<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.via(Flow::new().drop_while(pred))
    }

    pub fn grouped(self, size: usize) -> Source<Vec<T>> {
        self.via(Flow::new().grouped(size))
    }

    pub fn grouped_within(self, size: usize, timeout: std::time::Duration) -> Source<Vec<T>> {
        self.via(Flow::new().grouped_within(size, timeout))
    }

    pub fn map_concat<U, I, F>(self, f: F) -> Source<U>
    where
        U: Send + 'static,
        I: IntoIterator<Item = U>,
        F: Fn(T) -> I + Send + Sync + 'static,
    {
        self.via(Flow::new().map_concat(f))
    }

    pub fn buffer(self, capacity: usize, strategy: crate::operators::OverflowStrategy) -> Source<T> {
        self.via(Flow::new().buffer(capacity, strategy))
    }

    pub fn conflate<S, Z, F>(self, seed: Z, aggregate: F) -> Source<S>
    where
        S: Send + 'static,
        Z: Fn(T) -> S + Send + Sync + 'static,
        F: Fn(S, T) -> S + Send + Sync + 'static,
    {
        self.via(Flow::new().conflate(seed, aggregate))
    }

    pub fn expand<U, It, F>(self, f: F) -> Source<U>
    where
        U: Send + 'static,
        It: Iterator<Item = U> + Send + 'static,
        F: Fn(T) -> It + Send + Sync + 'static,
    {
        self.via(Flow::new().expand(f))
    }

    pub fn map_async<U, Fut, F>(self, parallelism: usize, f: F) -> Source<U>
    where
        U: Send + 'static,
        Fut: std::future::Future<Output = Result<U>> + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
    {
        self.via(Flow::new().map_async(parallelism, f))
    }

    pub fn recover<F>(self, handler: F) -> Source<T>
    where
        F: Fn(&Error) -> Option<T> + Send + Sync + 'static,
    {
        self.via(Flow::new().recover(handler))
    }

    pub fn group_by<K, F>(self, max_groups: usize, key: F) -> Source<(K, SubStream<T>)>
    where
        K: std::hash::Hash + Eq + Clone + Send + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        self.via(Flow::new().group_by(max_groups, key))
    }

    pub fn split_when<F>(self, pred: F) -> Source<SubStream<T>>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.via(Flow::new().split_when(pred))
    }

    pub fn split_after<F>(self, pred: F) -> Source<SubStream<T>>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.via(Flow::new().split_after(pred))
    }

    pub fn prefix_and_tail(self, n: usize) -> Source<(Vec<T>, SubStream<T>)> {
        self.via(Flow::new().prefix_and_tail(n))
    }
}

impl<T: Send + 'static> Source<SubStream<T>> {
    /// Drain each inner sub-stream in sequence, concatenating their
    /// elements.
    pub fn flatten_concat(self) -> Source<T> {
        self.via(Flow::new().flatten_concat())
    }
}

impl crate::core::graph::GraphBuilder {
    /// Add a source fragment, returning its open outlet.
    pub fn add_source<T: Send + 'static>(&mut self, source: Source<T>) -> Outlet<T> {
        let offset = self.splice(source.def);
        Outlet::new(source.out.0 + offset, source.out.1)
    }
}

impl<T: Send + 'static> SubStream<T> {
    /// Promote this sub-stream handle into a source. Each handle can back
    /// at most one materialization; a second run fails the stream.
    pub fn into_source(self) -> Source<T> {
        let chan = self.chan;
        Source::from_stage(StagePlan {
            name: "sub-source".to_string(),
            inlets: 0,
            outlets: 1,
            build: Arc::new(move |_| {
                BuiltStage::new(crate::substream::SubSourceLogic {
                    chan: chan.clone(),
                    waiting: false,
                })
            }),
        })
    }
}
