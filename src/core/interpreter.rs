//! The graph interpreter: connection bookkeeping, FIFO signal delivery, and
//! the run loop that drives a materialized graph.
//!
//! One interpreter instance runs per materialization, inside a single spawned
//! task. Signal propagation through a chain of stages happens synchronously
//! within [`Interpreter::drain`]: a chain of N stages moves one element in
//! O(N) steps without task hops. The task only awaits when every stage is
//! quiescent, at which point progress can come solely from a suspension
//! resolving: a timer, an asynchronous computation, or a sub-stream mailbox,
//! all of which re-enter through the event channel.

use std::collections::VecDeque;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::error::{Error, Result};
use crate::core::materializer::MaterializerConfig;
use crate::core::stage::{Elem, RoutedEvent, Signal, StageEvent, StageEvents, StageLogic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnStatus {
    Open,
    Completed,
    Failed,
    Cancelled,
}

/// Runtime state of one connected port pair. `pulled` and `in_flight`
/// together enforce the backpressure invariant: at most one unacknowledged
/// signal per direction.
pub(crate) struct Connection {
    pub(crate) up: (usize, usize),
    pub(crate) down: (usize, usize),
    pub(crate) pulled: bool,
    pub(crate) in_flight: bool,
    pub(crate) status: ConnStatus,
}

impl Connection {
    fn is_open(&self) -> bool {
        self.status == ConnStatus::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageState {
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl StageState {
    pub(crate) fn is_terminal(self) -> bool {
        self != StageState::Running
    }
}

pub(crate) struct StageSlot {
    pub(crate) name: String,
    pub(crate) logic: Option<Box<dyn StageLogic>>,
    pub(crate) state: StageState,
    /// Connection index per inlet position.
    pub(crate) in_conns: Vec<usize>,
    /// Connection index per outlet position.
    pub(crate) out_conns: Vec<usize>,
    /// Emissions queued by `emit_all`, served on subsequent pulls without
    /// re-entering the stage logic.
    pub(crate) emit: VecDeque<(usize, Elem)>,
    pub(crate) finish_after_emit: bool,
}

pub(crate) struct Interpreter {
    pub(crate) stages: Vec<StageSlot>,
    pub(crate) conns: Vec<Connection>,
    queue: VecDeque<(usize, Signal)>,
    events_tx: mpsc::UnboundedSender<RoutedEvent>,
    config: MaterializerConfig,
    aborted: bool,
}

impl Interpreter {
    pub(crate) fn new(
        stages: Vec<StageSlot>,
        conns: Vec<Connection>,
        events_tx: mpsc::UnboundedSender<RoutedEvent>,
        config: MaterializerConfig,
    ) -> Self {
        Self {
            stages,
            conns,
            queue: VecDeque::new(),
            events_tx,
            config,
            aborted: false,
        }
    }

    /// Signals processed per scheduling slice before yielding back to the
    /// runtime. Keeps an always-busy graph from starving its neighbors and
    /// lets shutdown interrupt it.
    const FUEL: usize = 4096;

    /// Run the materialized graph to termination.
    pub(crate) async fn run(
        mut self,
        shutdown: CancellationToken,
        mut events_rx: mpsc::UnboundedReceiver<RoutedEvent>,
    ) {
        self.start();

        loop {
            self.drain();
            if self.finished() {
                break;
            }
            if !self.queue.is_empty() {
                if shutdown.is_cancelled() {
                    self.abort(Error::Shutdown);
                    break;
                }
                while let Ok(routed) = events_rx.try_recv() {
                    self.deliver_event(routed);
                }
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.abort(Error::Shutdown);
                    break;
                }
                routed = events_rx.recv() => {
                    match routed {
                        Some(ev) => self.deliver_event(ev),
                        // The interpreter itself holds a sender, so this
                        // only happens on teardown.
                        None => break,
                    }
                }
            }
        }
        debug!(stages = self.stages.len(), aborted = self.aborted, "graph terminated");
    }

    fn start(&mut self) {
        for stage in 0..self.stages.len() {
            self.invoke(stage, InvokeKind::Other, |logic, ctx| logic.on_start(ctx));
            if self.aborted {
                return;
            }
        }
    }

    fn finished(&self) -> bool {
        self.aborted || self.stages.iter().all(|s| s.state.is_terminal())
    }

    /// Process queued signals towards quiescence, bounded by [`Self::FUEL`].
    /// FIFO order per connection is a consequence of the single global FIFO
    /// queue.
    fn drain(&mut self) {
        for _ in 0..Self::FUEL {
            if self.aborted {
                self.queue.clear();
                return;
            }
            let Some((conn, signal)) = self.queue.pop_front() else {
                return;
            };
            self.deliver(conn, signal);
        }
    }

    fn deliver(&mut self, conn: usize, signal: Signal) {
        match signal {
            Signal::Pull => {
                let (stage, outlet) = self.conns[conn].up;
                if self.stages[stage].state.is_terminal() || !self.conns[conn].is_open() {
                    return;
                }
                // The stage may have pushed after observing the demand but
                // before this signal was delivered; the signal is then stale.
                if !self.conns[conn].pulled {
                    return;
                }
                // Queued emissions satisfy demand without re-entering the
                // stage logic.
                let pos = self.stages[stage].emit.iter().position(|(o, _)| *o == outlet);
                if let Some((_, elem)) = pos.and_then(|p| self.stages[stage].emit.remove(p)) {
                    self.conns[conn].pulled = false;
                    self.conns[conn].in_flight = true;
                    self.queue.push_back((conn, Signal::Push(elem)));
                    if self.stages[stage].emit.is_empty() && self.stages[stage].finish_after_emit {
                        self.finish_stage_slot(stage);
                    }
                    return;
                }
                self.invoke(stage, InvokeKind::Pull(stage), |logic, ctx| {
                    logic.on_pull(outlet, ctx)
                });
            }
            Signal::Push(elem) => {
                self.conns[conn].in_flight = false;
                let (stage, inlet) = self.conns[conn].down;
                // An element in transit past a cancellation or failure is
                // dropped; one racing a completion is still delivered, the
                // Complete signal is queued behind it.
                let severed = matches!(
                    self.conns[conn].status,
                    ConnStatus::Cancelled | ConnStatus::Failed
                );
                if severed || self.stages[stage].state.is_terminal() {
                    return;
                }
                self.invoke(stage, InvokeKind::Other, |logic, ctx| {
                    logic.on_push(inlet, elem, ctx)
                });
            }
            Signal::Complete => {
                let (stage, inlet) = self.conns[conn].down;
                if self.stages[stage].state.is_terminal() {
                    return;
                }
                self.invoke(stage, InvokeKind::Other, |logic, ctx| {
                    logic.on_upstream_finish(inlet, ctx)
                });
            }
            Signal::Error(err) => {
                let (stage, inlet) = self.conns[conn].down;
                if self.stages[stage].state.is_terminal() {
                    return;
                }
                self.invoke(stage, InvokeKind::Other, |logic, ctx| {
                    logic.on_upstream_failure(inlet, err, ctx)
                });
            }
            Signal::Cancel => {
                let (stage, outlet) = self.conns[conn].up;
                if self.stages[stage].state.is_terminal() {
                    return;
                }
                self.invoke(stage, InvokeKind::Other, |logic, ctx| {
                    logic.on_downstream_cancel(outlet, ctx)
                });
            }
        }
    }

    fn deliver_event(&mut self, routed: RoutedEvent) {
        let RoutedEvent { stage, event } = routed;
        if stage >= self.stages.len() || self.stages[stage].state.is_terminal() {
            return;
        }
        self.invoke(stage, InvokeKind::Other, |logic, ctx| {
            logic.on_event(event, ctx)
        });
    }

    /// Take the stage logic out of its slot, run a callback against it with
    /// a context borrowing the rest of the interpreter, and put it back.
    /// Detects protocol violations afterwards.
    fn invoke(
        &mut self,
        stage: usize,
        kind: InvokeKind,
        f: impl FnOnce(&mut Box<dyn StageLogic>, &mut StageCtx<'_>),
    ) {
        let Some(mut logic) = self.stages[stage].logic.take() else {
            return;
        };
        let mut ctx = StageCtx {
            engine: self,
            stage,
            acted: false,
            violation: None,
        };
        f(&mut logic, &mut ctx);
        let acted = ctx.acted;
        let violation = ctx.violation.take();
        let pending = logic.has_pending();
        self.stages[stage].logic = Some(logic);

        if let Some(detail) = violation {
            self.abort(Error::violation(self.stages[stage].name.clone(), detail));
            return;
        }
        if let InvokeKind::Pull(pulled_stage) = kind {
            if !acted
                && !pending
                && self.stages[pulled_stage].emit.is_empty()
                && !self.has_outstanding_upstream_pull(pulled_stage)
            {
                self.abort(Error::violation(
                    self.stages[pulled_stage].name.clone(),
                    "on_pull produced neither an element nor upstream demand",
                ));
                return;
            }
        }
        self.sweep_terminal(stage);
    }

    fn has_outstanding_upstream_pull(&self, stage: usize) -> bool {
        self.stages[stage]
            .in_conns
            .iter()
            .any(|&c| self.conns[c].is_open() && (self.conns[c].pulled || self.conns[c].in_flight))
    }

    /// A stage whose every connection closed is done; mark it so late
    /// signals are absorbed.
    fn sweep_terminal(&mut self, stage: usize) {
        let slot = &self.stages[stage];
        if slot.state.is_terminal() || !slot.emit.is_empty() {
            return;
        }
        let all_closed = slot
            .in_conns
            .iter()
            .chain(slot.out_conns.iter())
            .all(|&c| !self.conns[c].is_open());
        if all_closed {
            self.stages[stage].state = StageState::Finished;
        }
    }

    fn finish_stage_slot(&mut self, stage: usize) {
        for i in 0..self.stages[stage].out_conns.len() {
            let conn = self.stages[stage].out_conns[i];
            if self.conns[conn].is_open() {
                self.conns[conn].status = ConnStatus::Completed;
                self.queue.push_back((conn, Signal::Complete));
            }
        }
        for i in 0..self.stages[stage].in_conns.len() {
            let conn = self.stages[stage].in_conns[i];
            if self.conns[conn].is_open() {
                self.conns[conn].status = ConnStatus::Cancelled;
                self.queue.push_back((conn, Signal::Cancel));
            }
        }
        self.stages[stage].emit.clear();
        self.stages[stage].finish_after_emit = false;
        self.stages[stage].state = StageState::Finished;
    }

    /// Fatal path: a protocol violation or shutdown tears the whole
    /// materialized graph down at once.
    fn abort(&mut self, err: Error) {
        if self.aborted {
            return;
        }
        match &err {
            Error::Shutdown => warn!("materialized graph shut down while running"),
            other => error!(error = %other, "materialized graph aborted"),
        }
        self.aborted = true;
        self.queue.clear();
        for slot in &mut self.stages {
            if let Some(logic) = slot.logic.as_mut() {
                logic.on_abort(&err);
            }
            slot.state = StageState::Failed;
            slot.emit.clear();
        }
        for conn in &mut self.conns {
            if conn.is_open() {
                conn.status = ConnStatus::Failed;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum InvokeKind {
    Pull(usize),
    Other,
}

/// The effect surface handed to stage callbacks.
///
/// All interaction with the rest of the graph goes through this context:
/// pushing and pulling, emitting queued sequences, terminating the stage,
/// and registering the sanctioned suspensions (timers, watched futures,
/// sub-stream wakeups). Actions take effect in the order they are made.
pub struct StageCtx<'a> {
    engine: &'a mut Interpreter,
    stage: usize,
    acted: bool,
    violation: Option<String>,
}

impl StageCtx<'_> {
    fn out_conn(&self, outlet: usize) -> Option<usize> {
        self.engine.stages[self.stage].out_conns.get(outlet).copied()
    }

    fn in_conn(&self, inlet: usize) -> Option<usize> {
        self.engine.stages[self.stage].in_conns.get(inlet).copied()
    }

    /// Push one element downstream on `outlet`. Requires an unsatisfied
    /// pull on that connection; pushing without demand is a protocol
    /// violation. Pushing to a cancelled outlet silently drops the element.
    pub fn push(&mut self, outlet: usize, elem: Elem) {
        self.acted = true;
        let Some(conn) = self.out_conn(outlet) else {
            self.violation = Some(format!("push on unknown outlet {outlet}"));
            return;
        };
        if !self.engine.conns[conn].is_open() {
            return;
        }
        if !self.engine.conns[conn].pulled || self.engine.conns[conn].in_flight {
            self.violation = Some(format!("push without demand on outlet {outlet}"));
            return;
        }
        self.engine.conns[conn].pulled = false;
        self.engine.conns[conn].in_flight = true;
        self.engine.queue.push_back((conn, Signal::Push(elem)));
    }

    /// Request the next element from upstream on `inlet`. Pulling while a
    /// prior pull is unsatisfied is a protocol violation; pulling a closed
    /// inlet is ignored.
    pub fn pull(&mut self, inlet: usize) {
        self.acted = true;
        let Some(conn) = self.in_conn(inlet) else {
            self.violation = Some(format!("pull on unknown inlet {inlet}"));
            return;
        };
        if !self.engine.conns[conn].is_open() {
            return;
        }
        if self.engine.conns[conn].pulled || self.engine.conns[conn].in_flight {
            self.violation = Some(format!("double pull on inlet {inlet}"));
            return;
        }
        self.engine.conns[conn].pulled = true;
        self.engine.queue.push_back((conn, Signal::Pull));
    }

    /// True when `outlet` has an unsatisfied downstream pull.
    pub fn is_pulled(&self, outlet: usize) -> bool {
        self.out_conn(outlet)
            .map(|c| self.engine.conns[c].is_open() && self.engine.conns[c].pulled)
            .unwrap_or(false)
    }

    /// True when this stage has an unsatisfied pull outstanding on `inlet`.
    pub fn is_pulling(&self, inlet: usize) -> bool {
        self.in_conn(inlet)
            .map(|c| {
                self.engine.conns[c].is_open()
                    && (self.engine.conns[c].pulled || self.engine.conns[c].in_flight)
            })
            .unwrap_or(false)
    }

    /// True when `inlet`'s upstream has completed, failed, or been
    /// cancelled.
    pub fn inlet_closed(&self, inlet: usize) -> bool {
        self.in_conn(inlet)
            .map(|c| !self.engine.conns[c].is_open())
            .unwrap_or(true)
    }

    /// True when `outlet`'s downstream side is closed.
    pub fn outlet_closed(&self, outlet: usize) -> bool {
        self.out_conn(outlet)
            .map(|c| !self.engine.conns[c].is_open())
            .unwrap_or(true)
    }

    /// Queue a finite sequence for emission on `outlet`, delivering one
    /// element per downstream pull. The first element goes out immediately
    /// when demand is already present.
    pub fn emit_all(&mut self, outlet: usize, items: Vec<Elem>) {
        self.acted = true;
        for elem in items {
            self.emit(outlet, elem);
        }
    }

    /// Queue a single element for emission on `outlet`.
    pub fn emit(&mut self, outlet: usize, elem: Elem) {
        self.acted = true;
        let Some(conn) = self.out_conn(outlet) else {
            self.violation = Some(format!("emit on unknown outlet {outlet}"));
            return;
        };
        if !self.engine.conns[conn].is_open() {
            return;
        }
        let queued_here = self.engine.stages[self.stage]
            .emit
            .iter()
            .any(|(o, _)| *o == outlet);
        if !queued_here && self.engine.conns[conn].pulled && !self.engine.conns[conn].in_flight {
            self.engine.conns[conn].pulled = false;
            self.engine.conns[conn].in_flight = true;
            self.engine.queue.push_back((conn, Signal::Push(elem)));
        } else {
            self.engine.stages[self.stage].emit.push_back((outlet, elem));
        }
    }

    /// Emit a sequence, then finish the stage once the last element has
    /// been delivered.
    pub fn emit_all_and_finish(&mut self, outlet: usize, items: Vec<Elem>) {
        self.emit_all(outlet, items);
        if self.engine.stages[self.stage].emit.is_empty() {
            self.finish_stage();
        } else {
            self.engine.stages[self.stage].finish_after_emit = true;
        }
    }

    /// Complete a single outlet, leaving the rest of the stage running.
    pub fn finish(&mut self, outlet: usize) {
        self.acted = true;
        let Some(conn) = self.out_conn(outlet) else {
            self.violation = Some(format!("finish on unknown outlet {outlet}"));
            return;
        };
        if self.engine.conns[conn].is_open() {
            self.engine.conns[conn].status = ConnStatus::Completed;
            self.engine.queue.push_back((conn, Signal::Complete));
        }
    }

    /// Terminate successfully: complete all outlets, cancel all inlets.
    pub fn finish_stage(&mut self) {
        self.acted = true;
        self.engine.finish_stage_slot(self.stage);
    }

    /// Terminate with an error: fail all outlets, cancel all inlets.
    pub fn fail_stage(&mut self, error: Error) {
        self.acted = true;
        let stage = self.stage;
        for i in 0..self.engine.stages[stage].out_conns.len() {
            let conn = self.engine.stages[stage].out_conns[i];
            if self.engine.conns[conn].is_open() {
                self.engine.conns[conn].status = ConnStatus::Failed;
                self.engine
                    .queue
                    .push_back((conn, Signal::Error(error.clone())));
            }
        }
        for i in 0..self.engine.stages[stage].in_conns.len() {
            let conn = self.engine.stages[stage].in_conns[i];
            if self.engine.conns[conn].is_open() {
                self.engine.conns[conn].status = ConnStatus::Cancelled;
                self.engine.queue.push_back((conn, Signal::Cancel));
            }
        }
        self.engine.stages[stage].emit.clear();
        self.engine.stages[stage].state = StageState::Failed;
    }

    /// Cancel a single inlet, leaving the rest of the stage running.
    pub fn cancel(&mut self, inlet: usize) {
        self.acted = true;
        let Some(conn) = self.in_conn(inlet) else {
            self.violation = Some(format!("cancel on unknown inlet {inlet}"));
            return;
        };
        if self.engine.conns[conn].is_open() {
            self.engine.conns[conn].status = ConnStatus::Cancelled;
            self.engine.queue.push_back((conn, Signal::Cancel));
        }
    }

    /// Schedule a one-shot timer. Fires back into `on_event` as
    /// [`StageEvent::Timer`] with the given token.
    pub fn schedule_timer(&mut self, after: Duration, token: u64) {
        self.acted = true;
        let events = self.events();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            events.send(StageEvent::Timer { token });
        });
    }

    /// Observe an asynchronous computation. Its single eventual value or
    /// failure re-enters `on_event` as [`StageEvent::FutureDone`].
    pub fn watch_future(&mut self, token: u64, fut: BoxFuture<'static, Result<Elem>>) {
        self.acted = true;
        let events = self.events();
        tokio::spawn(async move {
            let result = fut.await;
            events.send(StageEvent::FutureDone { token, result });
        });
    }

    /// A handle for delivering events back into this stage from outside the
    /// interpreter task.
    pub fn events(&self) -> StageEvents {
        StageEvents {
            stage: self.stage,
            tx: self.engine.events_tx.clone(),
        }
    }

    /// The configuration of the materializer that started this graph.
    pub fn config(&self) -> &MaterializerConfig {
        &self.engine.config
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::core::graph::{BuiltStage, GraphBuilder, StagePlan};
    use crate::core::materializer::Materializer;
    use crate::sinks::Sink;
    use crate::sources::Source;

    /// Responds to demand by doing nothing at all.
    struct Unresponsive;

    impl StageLogic for Unresponsive {
        fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
            ctx.push(0, elem);
        }

        fn on_pull(&mut self, _outlet: usize, _ctx: &mut StageCtx<'_>) {}
    }

    /// Issues demand twice for a single element.
    struct Greedy;

    impl StageLogic for Greedy {
        fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
            ctx.push(0, elem);
        }

        fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
            ctx.pull(0);
            ctx.pull(0);
        }
    }

    /// Pushes to both outlets as soon as both carry demand, so the queued
    /// signal for whichever outlet pulled second is already satisfied by
    /// the time it would be delivered.
    struct EagerFanout {
        next: i32,
    }

    impl StageLogic for EagerFanout {
        fn on_push(&mut self, _inlet: usize, _elem: Elem, _ctx: &mut StageCtx<'_>) {}

        fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
            if !ctx.is_pulled(0) || !ctx.is_pulled(1) {
                return;
            }
            let value = self.next;
            self.next += 1;
            ctx.push(0, Box::new(value));
            ctx.push(1, Box::new(value));
            if value == 3 {
                ctx.finish_stage();
            }
        }
    }

    async fn run_through<L>(name: &str, logic: fn() -> L) -> Result<Vec<i32>>
    where
        L: StageLogic + 'static,
    {
        let materializer = Materializer::new();
        let mut builder = GraphBuilder::new();
        let out = builder.add_source(Source::iter(1..=3));
        let middle = builder.def.add_stage(StagePlan {
            name: name.to_string(),
            inlets: 1,
            outlets: 1,
            build: Arc::new(move |_| BuiltStage::new(logic())),
        });
        let sink = builder.add_sink(Sink::<i32, _>::collect());
        builder.def.add_edge((out.stage, out.port), (middle, 0));
        builder
            .def
            .add_edge((middle, 0), (sink.inlet().stage, sink.inlet().port));
        builder.build(sink.mat()).run(&materializer)?.value().await
    }

    #[tokio::test]
    async fn test_ignoring_demand_aborts_the_graph() {
        let result = run_through("unresponsive", || Unresponsive).await;
        assert!(matches!(
            result,
            Err(Error::ProtocolViolation { ref stage, .. }) if stage == "unresponsive"
        ));
    }

    #[tokio::test]
    async fn test_double_pull_aborts_the_graph() {
        let result = run_through("greedy", || Greedy).await;
        assert!(matches!(
            result,
            Err(Error::ProtocolViolation { ref stage, .. }) if stage == "greedy"
        ));
    }

    #[tokio::test]
    async fn test_satisfied_demand_signal_is_not_redelivered() {
        let materializer = Materializer::new();
        let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        let sidecar = seen.clone();

        let mut builder = GraphBuilder::new();
        let fanout = builder.def.add_stage(StagePlan {
            name: "eager-fanout".to_string(),
            inlets: 0,
            outlets: 2,
            build: Arc::new(|_| BuiltStage::new(EagerFanout { next: 1 })),
        });
        let collect = builder.add_sink(Sink::<i32, _>::collect());
        let record = builder.add_sink(Sink::foreach(move |x: i32| {
            sidecar.lock().unwrap().push(x);
        }));
        builder
            .def
            .add_edge((fanout, 0), (collect.inlet().stage, collect.inlet().port));
        builder
            .def
            .add_edge((fanout, 1), (record.inlet().stage, record.inlet().port));

        let collected = builder
            .build(collect.mat())
            .run(&materializer)
            .unwrap()
            .value()
            .await
            .unwrap();
        assert_eq!(collected, vec![1, 2, 3]);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }
}
