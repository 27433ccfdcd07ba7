//! The typed `Flow` DSL.
//!
//! A [`Flow`] is a blueprint fragment with one open inlet and one open
//! outlet. This is where element types get erased: each combinator wraps
//! the user's typed closure in an `Elem`-level adapter and hands it to the
//! matching operator logic. `Flow::new()` is the identity and adds no
//! stage.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::core::error::{Error, Result};
use crate::core::graph::{BuiltStage, GraphBuilder, GraphDef, Inlet, Outlet, StagePlan};
use crate::core::interpreter::StageCtx;
use crate::core::stage::{unbox, Elem, StageLogic};
use crate::operators::{
    AggregateFn, AsyncFn, BufferLogic, ConflateLogic, DropLogic, DropWhileLogic, ExplodeFn,
    ExpandLogic, FilterLogic, GroupedLogic, GroupedWithinLogic, IterateFn, MapAsyncLogic,
    MapConcatLogic, OverflowStrategy, PredicateFn, RecoverFn, RecoverLogic, TakeLogic,
    TakeWhileLogic, TransformFn, TransformLogic, WrapSeqFn,
};
use crate::substream::{
    FlattenLogic, GroupByLogic, KeyFn, PackGroupFn, PrefixAndTailLogic, SplitLogic, SplitMode,
    SubStream, UnpackSubFn, WrapSubFn, WrapTailFn,
};

/// Forwards elements unchanged. Used when an identity flow must occupy a
/// stage slot of its own.
pub(crate) struct PassThroughLogic;

impl StageLogic for PassThroughLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        ctx.push(0, elem);
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.pull(0);
    }
}

/// A blueprint fragment transforming elements of type `In` into elements
/// of type `Out`.
pub struct Flow<In, Out> {
    pub(crate) def: GraphDef,
    pub(crate) in_port: Option<(usize, usize)>,
    pub(crate) out_port: Option<(usize, usize)>,
    pub(crate) _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out> Clone for Flow<In, Out> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            in_port: self.in_port,
            out_port: self.out_port,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Flow<T, T> {
    /// The identity flow.
    pub fn new() -> Self {
        Flow {
            def: GraphDef::default(),
            in_port: None,
            out_port: None,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Default for Flow<T, T> {
    fn default() -> Self {
        Self::new()
    }
}

fn linear_plan(name: &str, build: crate::core::graph::BuildFn) -> StagePlan {
    StagePlan {
        name: name.to_string(),
        inlets: 1,
        outlets: 1,
        build,
    }
}

impl<In: Send + 'static, Out: Send + 'static> Flow<In, Out> {
    /// Append a single linear stage.
    fn append<U: Send + 'static>(mut self, plan: StagePlan) -> Flow<In, U> {
        let stage = self.def.add_stage(plan);
        if let Some(out) = self.out_port {
            self.def.add_edge(out, (stage, 0));
        }
        Flow {
            def: self.def,
            in_port: self.in_port.or(Some((stage, 0))),
            out_port: Some((stage, 0)),
            _marker: PhantomData,
        }
    }

    /// Chain another flow after this one.
    pub fn via<U: Send + 'static>(mut self, next: Flow<Out, U>) -> Flow<In, U> {
        let offset = self.def.splice(next.def);
        if let (Some(out), Some((in_stage, in_port))) = (self.out_port, next.in_port) {
            self.def.add_edge(out, (in_stage + offset, in_port));
        }
        Flow {
            def: self.def,
            in_port: self
                .in_port
                .or(next.in_port.map(|(s, p)| (s + offset, p))),
            out_port: next
                .out_port
                .map(|(s, p)| (s + offset, p))
                .or(self.out_port),
            _marker: PhantomData,
        }
    }

    /// Transform each element.
    pub fn map<U, F>(self, f: F) -> Flow<In, U>
    where
        U: Send + 'static,
        F: Fn(Out) -> U + Send + Sync + 'static,
    {
        let erased: TransformFn = Arc::new(move |elem| {
            let value = unbox::<Out>(elem, "map input")?;
            Ok(Box::new(f(value)) as Elem)
        });
        self.append(linear_plan(
            "map",
            Arc::new(move |_| BuiltStage::new(TransformLogic { f: erased.clone() })),
        ))
    }

    /// Transform each element fallibly; an `Err` fails the stream.
    pub fn map_result<U, F>(self, f: F) -> Flow<In, U>
    where
        U: Send + 'static,
        F: Fn(Out) -> Result<U> + Send + Sync + 'static,
    {
        let erased: TransformFn = Arc::new(move |elem| {
            let value = unbox::<Out>(elem, "map_result input")?;
            f(value).map(|out| Box::new(out) as Elem)
        });
        self.append(linear_plan(
            "map-result",
            Arc::new(move |_| BuiltStage::new(TransformLogic { f: erased.clone() })),
        ))
    }

    fn erased_pred<F>(pred: F, context: &'static str) -> PredicateFn
    where
        F: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        Arc::new(move |elem| {
            elem.downcast_ref::<Out>()
                .map(&pred)
                .ok_or_else(|| Error::type_mismatch(context))
        })
    }

    /// Keep only elements matching the predicate.
    pub fn filter<F>(self, pred: F) -> Flow<In, Out>
    where
        F: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        let erased = Self::erased_pred(pred, "filter input");
        self.append(linear_plan(
            "filter",
            Arc::new(move |_| {
                BuiltStage::new(FilterLogic {
                    pred: erased.clone(),
                })
            }),
        ))
    }

    /// Pass at most `n` elements, then complete without pulling further.
    pub fn take(self, n: usize) -> Flow<In, Out> {
        self.append(linear_plan(
            "take",
            Arc::new(move |_| BuiltStage::new(TakeLogic { remaining: n })),
        ))
    }

    /// Pass elements while the predicate holds; the first failing element
    /// is discarded and the stream completes.
    pub fn take_while<F>(self, pred: F) -> Flow<In, Out>
    where
        F: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        let erased = Self::erased_pred(pred, "take_while input");
        self.append(linear_plan(
            "take-while",
            Arc::new(move |_| {
                BuiltStage::new(TakeWhileLogic {
                    pred: erased.clone(),
                })
            }),
        ))
    }

    /// Discard the first `n` elements.
    pub fn drop(self, n: usize) -> Flow<In, Out> {
        self.append(linear_plan(
            "drop",
            Arc::new(move |_| BuiltStage::new(DropLogic { remaining: n })),
        ))
    }

    /// Discard elements while the predicate holds; the boundary element is
    /// the first one forwarded.
    pub fn drop_while<F>(self, pred: F) -> Flow<In, Out>
    where
        F: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        let erased = Self::erased_pred(pred, "drop_while input");
        self.append(linear_plan(
            "drop-while",
            Arc::new(move |_| {
                BuiltStage::new(DropWhileLogic {
                    pred: erased.clone(),
                    dropping: true,
                })
            }),
        ))
    }

    fn wrap_seq() -> WrapSeqFn {
        Arc::new(|items: Vec<Elem>| {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(unbox::<Out>(item, "group element")?);
            }
            Ok(Box::new(out) as Elem)
        })
    }

    /// Batch elements into `Vec`s of `size`, emitting a shorter final
    /// batch on completion.
    pub fn grouped(self, size: usize) -> Flow<In, Vec<Out>> {
        let wrap = Self::wrap_seq();
        self.append(linear_plan(
            "grouped",
            Arc::new(move |_| {
                BuiltStage::new(GroupedLogic {
                    size: size.max(1),
                    wrap: wrap.clone(),
                    buf: Vec::new(),
                })
            }),
        ))
    }

    /// Batch up to `size` elements, flushing early when `timeout` elapses
    /// with a non-empty batch.
    pub fn grouped_within(self, size: usize, timeout: Duration) -> Flow<In, Vec<Out>> {
        let wrap = Self::wrap_seq();
        self.append(linear_plan(
            "grouped-within",
            Arc::new(move |_| {
                BuiltStage::new(GroupedWithinLogic {
                    size: size.max(1),
                    timeout,
                    wrap: wrap.clone(),
                    buf: Vec::new(),
                    epoch: 0,
                    flush_pending: false,
                })
            }),
        ))
    }

    /// Expand each element into zero or more output elements.
    pub fn map_concat<U, I, F>(self, f: F) -> Flow<In, U>
    where
        U: Send + 'static,
        I: IntoIterator<Item = U>,
        F: Fn(Out) -> I + Send + Sync + 'static,
    {
        let erased: ExplodeFn = Arc::new(move |elem| {
            let value = unbox::<Out>(elem, "map_concat input")?;
            Ok(f(value)
                .into_iter()
                .map(|item| Box::new(item) as Elem)
                .collect())
        });
        self.append(linear_plan(
            "map-concat",
            Arc::new(move |_| BuiltStage::new(MapConcatLogic { f: erased.clone() })),
        ))
    }

    /// Decouple upstream and downstream rates with a bounded queue.
    pub fn buffer(self, capacity: usize, strategy: OverflowStrategy) -> Flow<In, Out> {
        self.append(linear_plan(
            "buffer",
            Arc::new(move |_| {
                BuiltStage::new(BufferLogic {
                    capacity: capacity.max(1),
                    strategy,
                    buf: Default::default(),
                    draining: false,
                })
            }),
        ))
    }

    /// Fold elements the consumer has not yet asked for into a summary
    /// value. Lossy: a slow consumer sees aggregates, never a backlog.
    pub fn conflate<S, Z, F>(self, seed: Z, aggregate: F) -> Flow<In, S>
    where
        S: Send + 'static,
        Z: Fn(Out) -> S + Send + Sync + 'static,
        F: Fn(S, Out) -> S + Send + Sync + 'static,
    {
        let seed: TransformFn = Arc::new(move |elem| {
            let value = unbox::<Out>(elem, "conflate seed input")?;
            Ok(Box::new(seed(value)) as Elem)
        });
        let aggregate: AggregateFn = Arc::new(move |acc, elem| {
            let acc = unbox::<S>(acc, "conflate accumulator")?;
            let value = unbox::<Out>(elem, "conflate input")?;
            Ok(Box::new(aggregate(acc, value)) as Elem)
        });
        self.append(linear_plan(
            "conflate",
            Arc::new(move |_| {
                BuiltStage::new(ConflateLogic {
                    seed: seed.clone(),
                    aggregate: aggregate.clone(),
                    acc: None,
                })
            }),
        ))
    }

    /// Fill excess downstream demand by iterating on the last element
    /// seen. Lossy counterpart to `conflate` for fast consumers.
    pub fn expand<U, It, F>(self, f: F) -> Flow<In, U>
    where
        U: Send + 'static,
        It: Iterator<Item = U> + Send + 'static,
        F: Fn(Out) -> It + Send + Sync + 'static,
    {
        let erased: IterateFn = Arc::new(move |elem| {
            let value = unbox::<Out>(elem, "expand input")?;
            Ok(Box::new(f(value).map(|item| Box::new(item) as Elem))
                as Box<dyn Iterator<Item = Elem> + Send>)
        });
        self.append(linear_plan(
            "expand",
            Arc::new(move |_| {
                BuiltStage::new(ExpandLogic {
                    iterate: erased.clone(),
                    iter: None,
                })
            }),
        ))
    }

    /// Run up to `parallelism` asynchronous computations concurrently,
    /// emitting results in input order.
    pub fn map_async<U, Fut, F>(self, parallelism: usize, f: F) -> Flow<In, U>
    where
        U: Send + 'static,
        Fut: std::future::Future<Output = Result<U>> + Send + 'static,
        F: Fn(Out) -> Fut + Send + Sync + 'static,
    {
        let erased: AsyncFn = Arc::new(move |elem| {
            let value = unbox::<Out>(elem, "map_async input")?;
            let fut = f(value);
            Ok(async move { fut.await.map(|out| Box::new(out) as Elem) }.boxed())
        });
        self.append(linear_plan(
            "map-async",
            Arc::new(move |_| BuiltStage::new(MapAsyncLogic::new(erased.clone(), parallelism))),
        ))
    }

    /// Intercept one upstream failure. Returning a replacement element
    /// emits it and completes; returning `None` lets the failure pass.
    pub fn recover<F>(self, handler: F) -> Flow<In, Out>
    where
        F: Fn(&Error) -> Option<Out> + Send + Sync + 'static,
    {
        let erased: RecoverFn =
            Arc::new(move |error| Ok(handler(error).map(|out| Box::new(out) as Elem)));
        self.append(linear_plan(
            "recover",
            Arc::new(move |_| {
                BuiltStage::new(RecoverLogic {
                    handler: erased.clone(),
                })
            }),
        ))
    }

    /// Demultiplex into one sub-stream per distinct key, emitting
    /// `(key, sub-stream)` the first time each key appears. A fresh key
    /// beyond `max_groups` fails the stream.
    pub fn group_by<K, F>(self, max_groups: usize, key: F) -> Flow<In, (K, SubStream<Out>)>
    where
        K: std::hash::Hash + Eq + Clone + Send + 'static,
        F: Fn(&Out) -> K + Send + Sync + 'static,
    {
        let keyf: KeyFn<K> = Arc::new(move |elem| {
            elem.downcast_ref::<Out>()
                .map(&key)
                .ok_or_else(|| Error::type_mismatch("group_by key input"))
        });
        let pack: PackGroupFn<K> =
            Arc::new(|key, chan| Box::new((key, SubStream::<Out>::new(chan))) as Elem);
        self.append(linear_plan(
            "group-by",
            Arc::new(move |cfg| {
                BuiltStage::new(GroupByLogic::new(
                    max_groups,
                    cfg.substream_buffer,
                    keyf.clone(),
                    pack.clone(),
                ))
            }),
        ))
    }

    fn split(self, mode: SplitMode, pred: PredicateFn) -> Flow<In, SubStream<Out>> {
        let wrap: WrapSubFn = Arc::new(|chan| Box::new(SubStream::<Out>::new(chan)) as Elem);
        let name = match mode {
            SplitMode::When => "split-when",
            SplitMode::After => "split-after",
        };
        self.append(linear_plan(
            name,
            Arc::new(move |cfg| {
                BuiltStage::new(SplitLogic::new(
                    mode,
                    cfg.substream_buffer,
                    pred.clone(),
                    wrap.clone(),
                ))
            }),
        ))
    }

    /// Start a new sub-stream at each matching element; the match opens
    /// the new sub-stream.
    pub fn split_when<F>(self, pred: F) -> Flow<In, SubStream<Out>>
    where
        F: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        let erased = Self::erased_pred(pred, "split_when input");
        self.split(SplitMode::When, erased)
    }

    /// End the current sub-stream after each matching element; the match
    /// closes the old sub-stream.
    pub fn split_after<F>(self, pred: F) -> Flow<In, SubStream<Out>>
    where
        F: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        let erased = Self::erased_pred(pred, "split_after input");
        self.split(SplitMode::After, erased)
    }

    /// Collect exactly `n` leading elements, then emit
    /// `(prefix, tail sub-stream)` once and complete the outer stream.
    pub fn prefix_and_tail(self, n: usize) -> Flow<In, (Vec<Out>, SubStream<Out>)> {
        let wrap: WrapTailFn = Arc::new(|items, chan| {
            let mut prefix = Vec::with_capacity(items.len());
            for item in items {
                prefix.push(unbox::<Out>(item, "prefix element")?);
            }
            Ok(Box::new((prefix, SubStream::<Out>::new(chan))) as Elem)
        });
        self.append(linear_plan(
            "prefix-and-tail",
            Arc::new(move |cfg| {
                BuiltStage::new(PrefixAndTailLogic::new(n, cfg.substream_buffer, wrap.clone()))
            }),
        ))
    }
}

impl<In: Send + 'static, U: Send + 'static> Flow<In, SubStream<U>> {
    /// Drain each inner sub-stream completely before moving to the next.
    pub fn flatten_concat(self) -> Flow<In, U> {
        let unpack: UnpackSubFn = Arc::new(|elem| {
            unbox::<SubStream<U>>(elem, "flatten_concat input").map(|sub| sub.chan)
        });
        self.append(linear_plan(
            "flatten-concat",
            Arc::new(move |_| BuiltStage::new(FlattenLogic::new(unpack.clone()))),
        ))
    }
}

/// Ports of a flow added to a [`GraphBuilder`].
pub struct FlowPorts<In, Out> {
    inlet: Inlet<In>,
    outlet: Outlet<Out>,
}

impl<In, Out> FlowPorts<In, Out> {
    pub fn inlet(&self) -> Inlet<In> {
        self.inlet
    }

    pub fn outlet(&self) -> Outlet<Out> {
        self.outlet
    }
}

impl GraphBuilder {
    /// Add a flow fragment, returning its open ports.
    pub fn add_flow<In: Send + 'static, Out: Send + 'static>(
        &mut self,
        flow: Flow<In, Out>,
    ) -> FlowPorts<In, Out> {
        // The identity flow has no stage of its own; give it one so both
        // ports exist.
        if flow.in_port.is_none() {
            let stage = self.def.add_stage(StagePlan {
                name: "identity".to_string(),
                inlets: 1,
                outlets: 1,
                build: Arc::new(|_| BuiltStage::new(PassThroughLogic)),
            });
            return FlowPorts {
                inlet: Inlet::new(stage, 0),
                outlet: Outlet::new(stage, 0),
            };
        }
        let offset = self.splice(flow.def);
        let inlet = flow
            .in_port
            .map(|(s, p)| Inlet::new(s + offset, p))
            .unwrap_or_else(|| Inlet::new(offset, 0));
        let outlet = flow
            .out_port
            .map(|(s, p)| Outlet::new(s + offset, p))
            .unwrap_or_else(|| Outlet::new(offset, 0));
        FlowPorts { inlet, outlet }
    }
}
