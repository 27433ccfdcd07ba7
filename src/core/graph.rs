//! Graph blueprints: immutable stage/edge descriptions that materialize
//! into a running interpreter.
//!
//! A [`GraphDef`] is cheap to clone and reusable; every materialization
//! calls each stage's build closure again, so stages never share mutable
//! state between runs.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::error::{GraphError, PortKind};
use crate::core::materializer::MaterializerConfig;
use crate::core::stage::StageLogic;

/// Materialized-value payload produced by a stage build.
pub(crate) type MatValue = Box<dyn Any + Send>;

/// The output of building one stage for one materialization.
pub(crate) struct BuiltStage {
    pub(crate) logic: Box<dyn StageLogic>,
    pub(crate) mat: MatValue,
}

impl BuiltStage {
    pub(crate) fn new(logic: impl StageLogic + 'static) -> Self {
        Self {
            logic: Box::new(logic),
            mat: Box::new(()),
        }
    }

    pub(crate) fn with_mat(logic: impl StageLogic + 'static, mat: MatValue) -> Self {
        Self {
            logic: Box::new(logic),
            mat,
        }
    }
}

pub(crate) type BuildFn = Arc<dyn Fn(&MaterializerConfig) -> BuiltStage + Send + Sync>;

/// Blueprint for a single stage: its shape plus a factory for fresh logic.
#[derive(Clone)]
pub(crate) struct StagePlan {
    pub(crate) name: String,
    pub(crate) inlets: usize,
    pub(crate) outlets: usize,
    pub(crate) build: BuildFn,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Edge {
    pub(crate) from_stage: usize,
    pub(crate) from_port: usize,
    pub(crate) to_stage: usize,
    pub(crate) to_port: usize,
}

/// The full blueprint of a stream topology.
#[derive(Clone, Default)]
pub struct GraphDef {
    pub(crate) stages: Vec<StagePlan>,
    pub(crate) edges: Vec<Edge>,
}

impl GraphDef {
    pub(crate) fn add_stage(&mut self, plan: StagePlan) -> usize {
        self.stages.push(plan);
        self.stages.len() - 1
    }

    /// Absorb another blueprint, returning the stage index offset applied
    /// to its stages.
    pub(crate) fn splice(&mut self, other: GraphDef) -> usize {
        let offset = self.stages.len();
        self.stages.extend(other.stages);
        self.edges.extend(other.edges.into_iter().map(|e| Edge {
            from_stage: e.from_stage + offset,
            from_port: e.from_port,
            to_stage: e.to_stage + offset,
            to_port: e.to_port,
        }));
        offset
    }

    pub(crate) fn add_edge(&mut self, from: (usize, usize), to: (usize, usize)) {
        self.edges.push(Edge {
            from_stage: from.0,
            from_port: from.1,
            to_stage: to.0,
            to_port: to.1,
        });
    }

    /// Every declared port must be connected by exactly one edge.
    pub(crate) fn validate(&self) -> Result<(), GraphError> {
        if self.stages.is_empty() {
            return Err(GraphError::Empty);
        }
        for (idx, plan) in self.stages.iter().enumerate() {
            for port in 0..plan.outlets {
                let count = self
                    .edges
                    .iter()
                    .filter(|e| e.from_stage == idx && e.from_port == port)
                    .count();
                if count == 0 {
                    return Err(GraphError::UnconnectedPort {
                        stage: plan.name.clone(),
                        port,
                        kind: PortKind::Outlet,
                    });
                }
                if count > 1 {
                    return Err(GraphError::DuplicateConnection {
                        stage: plan.name.clone(),
                        port,
                        kind: PortKind::Outlet,
                    });
                }
            }
            for port in 0..plan.inlets {
                let count = self
                    .edges
                    .iter()
                    .filter(|e| e.to_stage == idx && e.to_port == port)
                    .count();
                if count == 0 {
                    return Err(GraphError::UnconnectedPort {
                        stage: plan.name.clone(),
                        port,
                        kind: PortKind::Inlet,
                    });
                }
                if count > 1 {
                    return Err(GraphError::DuplicateConnection {
                        stage: plan.name.clone(),
                        port,
                        kind: PortKind::Inlet,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Typed handle to an unconnected output port inside a [`GraphBuilder`].
pub struct Outlet<T> {
    pub(crate) stage: usize,
    pub(crate) port: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Outlet<T> {
    pub(crate) fn new(stage: usize, port: usize) -> Self {
        Self {
            stage,
            port,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Outlet<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Outlet<T> {}

/// Typed handle to an unconnected input port inside a [`GraphBuilder`].
pub struct Inlet<T> {
    pub(crate) stage: usize,
    pub(crate) port: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Inlet<T> {
    pub(crate) fn new(stage: usize, port: usize) -> Self {
        Self {
            stage,
            port,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Inlet<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Inlet<T> {}

/// Typed handle to the materialized value of a stage added to a builder.
pub struct MatRef<M> {
    pub(crate) stage: usize,
    _marker: PhantomData<fn() -> M>,
}

impl<M> MatRef<M> {
    pub(crate) fn new(stage: usize) -> Self {
        Self {
            stage,
            _marker: PhantomData,
        }
    }
}

impl<M> Clone for MatRef<M> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<M> Copy for MatRef<M> {}

/// Explicit topology construction for graphs the linear combinators cannot
/// express: fan-in, fan-out, and diamonds.
///
/// ```no_run
/// # use graphweld::prelude::*;
/// let mut builder = GraphBuilder::new();
/// let left = builder.add_source(Source::iter(1..=3));
/// let right = builder.add_source(Source::iter(4..=6));
/// let merge = builder.add_merge::<i32>(2);
/// let sink = builder.add_sink(Sink::collect());
/// builder.connect(left, merge.inlet(0));
/// builder.connect(right, merge.inlet(1));
/// builder.connect(merge.outlet(), sink.inlet());
/// let graph = builder.build(sink.mat());
/// ```
#[derive(Default)]
pub struct GraphBuilder {
    pub(crate) def: GraphDef,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn splice(&mut self, other: GraphDef) -> usize {
        self.def.splice(other)
    }

    /// Connect an outlet to an inlet carrying the same element type.
    pub fn connect<T>(&mut self, from: Outlet<T>, to: Inlet<T>) {
        self.def.add_edge((from.stage, from.port), (to.stage, to.port));
    }

    /// Seal the topology, designating `mat`'s stage as the source of the
    /// graph's materialized value. Connectivity is checked at run time.
    pub fn build<M>(self, mat: MatRef<M>) -> RunnableGraph<M> {
        RunnableGraph {
            def: self.def,
            mat_stage: mat.stage,
            _marker: PhantomData,
        }
    }
}

/// A closed blueprint ready to be run by a
/// [`Materializer`](crate::core::materializer::Materializer). Running it
/// repeatedly starts independent stream instances.
pub struct RunnableGraph<M> {
    pub(crate) def: GraphDef,
    pub(crate) mat_stage: usize,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Clone for RunnableGraph<M> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            mat_stage: self.mat_stage,
            _marker: PhantomData,
        }
    }
}
