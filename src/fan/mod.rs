//! Fan-in and fan-out stages: merge, zip, concat, broadcast.
//!
//! These are the stages with more than one port on a side. Each manages
//! per-port demand explicitly; the typed entry points are the `add_*`
//! methods on [`GraphBuilder`], which return port bundles for wiring.

use std::sync::Arc;

use crate::core::error::{Error, Result};
use crate::core::graph::{BuiltStage, GraphBuilder, Inlet, Outlet, StagePlan};
use crate::core::interpreter::StageCtx;
use crate::core::stage::{unbox, Elem, StageLogic};

const IN: usize = 0;
const OUT: usize = 0;

type PackFn = Arc<dyn Fn(Elem, Elem) -> Result<Elem> + Send + Sync>;
type CloneFn = Arc<dyn Fn(&Elem) -> Result<Elem> + Send + Sync>;

/// Fair n-way merge. Each inlet holds at most one parked element; filled
/// slots are served round-robin so no input can starve the others.
pub(crate) struct MergeLogic {
    slots: Vec<Option<Elem>>,
    cursor: usize,
}

impl MergeLogic {
    pub(crate) fn new(inputs: usize) -> Self {
        Self {
            slots: (0..inputs).map(|_| None).collect(),
            cursor: 0,
        }
    }

    fn all_drained(&self, ctx: &StageCtx<'_>) -> bool {
        self.slots.iter().all(Option::is_none)
            && (0..self.slots.len()).all(|i| ctx.inlet_closed(i))
    }
}

impl StageLogic for MergeLogic {
    fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
        for inlet in 0..self.slots.len() {
            ctx.pull(inlet);
        }
    }

    fn on_push(&mut self, inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        if ctx.is_pulled(OUT) && self.slots.iter().all(Option::is_none) {
            ctx.push(OUT, elem);
            ctx.pull(inlet);
        } else {
            self.slots[inlet] = Some(elem);
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        let n = self.slots.len();
        for step in 0..n {
            let inlet = (self.cursor + step) % n;
            if let Some(elem) = self.slots[inlet].take() {
                self.cursor = (inlet + 1) % n;
                ctx.push(OUT, elem);
                if !ctx.inlet_closed(inlet) {
                    ctx.pull(inlet);
                } else if self.all_drained(ctx) {
                    ctx.finish_stage();
                }
                return;
            }
        }
        if self.all_drained(ctx) {
            ctx.finish_stage();
        }
        // Otherwise every open inlet has a pull outstanding.
    }

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        if self.all_drained(ctx) {
            ctx.finish_stage();
        }
    }

    fn has_pending(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }
}

/// Two-way lockstep zip. Emits a pair only when both sides have delivered;
/// completes as soon as a side that owes an element finishes.
pub(crate) struct ZipLogic {
    pack: PackFn,
    left: Option<Elem>,
    right: Option<Elem>,
}

impl ZipLogic {
    pub(crate) fn new(pack: PackFn) -> Self {
        Self {
            pack,
            left: None,
            right: None,
        }
    }

    fn emit_pair(&mut self, ctx: &mut StageCtx<'_>) {
        let (Some(left), Some(right)) = (self.left.take(), self.right.take()) else {
            return;
        };
        match (self.pack)(left, right) {
            Ok(pair) => {
                ctx.push(OUT, pair);
                if ctx.inlet_closed(0) || ctx.inlet_closed(1) {
                    ctx.finish_stage();
                }
            }
            Err(err) => ctx.fail_stage(err),
        }
    }

    fn slot(&mut self, inlet: usize) -> &mut Option<Elem> {
        if inlet == 0 {
            &mut self.left
        } else {
            &mut self.right
        }
    }
}

impl StageLogic for ZipLogic {
    fn on_push(&mut self, inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        *self.slot(inlet) = Some(elem);
        if self.left.is_some() && self.right.is_some() && ctx.is_pulled(OUT) {
            self.emit_pair(ctx);
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if self.left.is_some() && self.right.is_some() {
            self.emit_pair(ctx);
            return;
        }
        if (self.left.is_none() && ctx.inlet_closed(0))
            || (self.right.is_none() && ctx.inlet_closed(1))
        {
            ctx.finish_stage();
            return;
        }
        if self.left.is_none() && !ctx.is_pulling(0) {
            ctx.pull(0);
        }
        if self.right.is_none() && !ctx.is_pulling(1) {
            ctx.pull(1);
        }
    }

    fn on_upstream_finish(&mut self, inlet: usize, ctx: &mut StageCtx<'_>) {
        if self.left.is_some() && self.right.is_some() {
            let (Some(left), Some(right)) = (self.left.take(), self.right.take()) else {
                return;
            };
            match (self.pack)(left, right) {
                Ok(pair) => ctx.emit_all_and_finish(OUT, vec![pair]),
                Err(err) => ctx.fail_stage(err),
            }
        } else if self.slot(inlet).is_none() {
            // The finished side owes an element that will never come.
            ctx.finish_stage();
        }
    }

    fn has_pending(&self) -> bool {
        self.left.is_some() || self.right.is_some()
    }
}

/// Sequential concatenation: the next inlet is pulled only after the
/// current one completes.
pub(crate) struct ConcatLogic {
    inputs: usize,
    current: usize,
}

impl ConcatLogic {
    pub(crate) fn new(inputs: usize) -> Self {
        Self { inputs, current: 0 }
    }

    fn advance(&mut self, ctx: &mut StageCtx<'_>) {
        while self.current < self.inputs && ctx.inlet_closed(self.current) {
            self.current += 1;
        }
        if self.current >= self.inputs {
            ctx.finish_stage();
        } else if ctx.is_pulled(OUT) {
            ctx.pull(self.current);
        }
    }
}

impl StageLogic for ConcatLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        ctx.push(OUT, elem);
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if self.current >= self.inputs {
            ctx.finish_stage();
        } else {
            ctx.pull(self.current);
        }
    }

    fn on_upstream_finish(&mut self, inlet: usize, ctx: &mut StageCtx<'_>) {
        // Later inlets can complete spontaneously; only the current one
        // drives advancement.
        if inlet == self.current {
            self.current += 1;
            self.advance(ctx);
        }
    }
}

/// One-to-n fan-out. Pulls upstream only when every subscribed outlet has
/// demand, so the slowest consumer sets the pace. A cancelled outlet drops
/// out; the stage finishes when the last one cancels.
pub(crate) struct BroadcastLogic {
    cloner: CloneFn,
    ready: Vec<bool>,
    closed: Vec<bool>,
}

impl BroadcastLogic {
    pub(crate) fn new(outputs: usize, cloner: CloneFn) -> Self {
        Self {
            cloner,
            ready: vec![false; outputs],
            closed: vec![false; outputs],
        }
    }

    fn barrier_complete(&self) -> bool {
        self.ready
            .iter()
            .zip(&self.closed)
            .all(|(&ready, &closed)| ready || closed)
    }

    fn pull_if_ready(&self, ctx: &mut StageCtx<'_>) {
        if self.barrier_complete() && !ctx.is_pulling(IN) && !ctx.inlet_closed(IN) {
            ctx.pull(IN);
        }
    }
}

impl StageLogic for BroadcastLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        let live: Vec<usize> = (0..self.ready.len())
            .filter(|&o| !self.closed[o])
            .collect();
        let Some((&last, rest)) = live.split_last() else {
            ctx.finish_stage();
            return;
        };
        for &outlet in rest {
            match (self.cloner)(&elem) {
                Ok(copy) => ctx.push(outlet, copy),
                Err(err) => return ctx.fail_stage(err),
            }
            self.ready[outlet] = false;
        }
        ctx.push(last, elem);
        self.ready[last] = false;
    }

    fn on_pull(&mut self, outlet: usize, ctx: &mut StageCtx<'_>) {
        self.ready[outlet] = true;
        self.pull_if_ready(ctx);
    }

    fn on_downstream_cancel(&mut self, outlet: usize, ctx: &mut StageCtx<'_>) {
        self.closed[outlet] = true;
        if self.closed.iter().all(|&c| c) {
            ctx.finish_stage();
        } else {
            self.pull_if_ready(ctx);
        }
    }

    fn has_pending(&self) -> bool {
        !self.barrier_complete()
    }
}

/// Port bundle of a merge stage added to a [`GraphBuilder`].
pub struct MergePorts<T> {
    inlets: Vec<Inlet<T>>,
    outlet: Outlet<T>,
}

impl<T> MergePorts<T> {
    pub fn inlet(&self, index: usize) -> Inlet<T> {
        self.inlets[index]
    }

    pub fn inputs(&self) -> usize {
        self.inlets.len()
    }

    pub fn outlet(&self) -> Outlet<T> {
        self.outlet
    }
}

/// Port bundle of a zip stage.
pub struct ZipPorts<A, B> {
    left: Inlet<A>,
    right: Inlet<B>,
    outlet: Outlet<(A, B)>,
}

impl<A, B> ZipPorts<A, B> {
    pub fn left(&self) -> Inlet<A> {
        self.left
    }

    pub fn right(&self) -> Inlet<B> {
        self.right
    }

    pub fn outlet(&self) -> Outlet<(A, B)> {
        self.outlet
    }
}

/// Port bundle of a concat stage.
pub struct ConcatPorts<T> {
    inlets: Vec<Inlet<T>>,
    outlet: Outlet<T>,
}

impl<T> ConcatPorts<T> {
    pub fn inlet(&self, index: usize) -> Inlet<T> {
        self.inlets[index]
    }

    pub fn outlet(&self) -> Outlet<T> {
        self.outlet
    }
}

/// Port bundle of a broadcast stage.
pub struct BroadcastPorts<T> {
    inlet: Inlet<T>,
    outlets: Vec<Outlet<T>>,
}

impl<T> BroadcastPorts<T> {
    pub fn inlet(&self) -> Inlet<T> {
        self.inlet
    }

    pub fn outlet(&self, index: usize) -> Outlet<T> {
        self.outlets[index]
    }

    pub fn outputs(&self) -> usize {
        self.outlets.len()
    }
}

impl GraphBuilder {
    /// Add a fair n-way merge of elements of type `T`.
    pub fn add_merge<T: Send + 'static>(&mut self, inputs: usize) -> MergePorts<T> {
        let stage = self.def.add_stage(StagePlan {
            name: format!("merge({inputs})"),
            inlets: inputs,
            outlets: 1,
            build: Arc::new(move |_| BuiltStage::new(MergeLogic::new(inputs))),
        });
        MergePorts {
            inlets: (0..inputs).map(|p| Inlet::new(stage, p)).collect(),
            outlet: Outlet::new(stage, 0),
        }
    }

    /// Add a two-way zip pairing an `A` with a `B`.
    pub fn add_zip<A: Send + 'static, B: Send + 'static>(&mut self) -> ZipPorts<A, B> {
        let pack: PackFn = Arc::new(|left, right| {
            let left = unbox::<A>(left, "zip left input")?;
            let right = unbox::<B>(right, "zip right input")?;
            Ok(Box::new((left, right)) as Elem)
        });
        let stage = self.def.add_stage(StagePlan {
            name: "zip".to_string(),
            inlets: 2,
            outlets: 1,
            build: Arc::new(move |_| BuiltStage::new(ZipLogic::new(pack.clone()))),
        });
        ZipPorts {
            left: Inlet::new(stage, 0),
            right: Inlet::new(stage, 1),
            outlet: Outlet::new(stage, 0),
        }
    }

    /// Add an n-way sequential concatenation.
    pub fn add_concat<T: Send + 'static>(&mut self, inputs: usize) -> ConcatPorts<T> {
        let stage = self.def.add_stage(StagePlan {
            name: format!("concat({inputs})"),
            inlets: inputs,
            outlets: 1,
            build: Arc::new(move |_| BuiltStage::new(ConcatLogic::new(inputs))),
        });
        ConcatPorts {
            inlets: (0..inputs).map(|p| Inlet::new(stage, p)).collect(),
            outlet: Outlet::new(stage, 0),
        }
    }

    /// Add a one-to-n broadcast. Elements are cloned per subscriber.
    pub fn add_broadcast<T: Clone + Send + 'static>(&mut self, outputs: usize) -> BroadcastPorts<T> {
        let cloner: CloneFn = Arc::new(|elem| {
            elem.downcast_ref::<T>()
                .map(|v| Box::new(v.clone()) as Elem)
                .ok_or_else(|| Error::type_mismatch("broadcast input"))
        });
        let stage = self.def.add_stage(StagePlan {
            name: format!("broadcast({outputs})"),
            inlets: 1,
            outlets: outputs,
            build: Arc::new(move |_| BuiltStage::new(BroadcastLogic::new(outputs, cloner.clone()))),
        });
        BroadcastPorts {
            inlet: Inlet::new(stage, 0),
            outlets: (0..outputs).map(|p| Outlet::new(stage, p)).collect(),
        }
    }
}
