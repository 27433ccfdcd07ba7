//! Linear operator stage logics.
//!
//! Every operator here is a one-in one-out [`StageLogic`] over type-erased
//! elements. The typed closures live in the flow layer; what arrives here is
//! already erased to `Elem`-level functions so a single logic implementation
//! serves all element types. Operator state is plain struct fields, reachable
//! only through the protocol callbacks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::core::error::{Error, Result};
use crate::core::interpreter::StageCtx;
use crate::core::stage::{Elem, StageEvent, StageLogic};

pub(crate) type TransformFn = Arc<dyn Fn(Elem) -> Result<Elem> + Send + Sync>;
pub(crate) type PredicateFn = Arc<dyn Fn(&Elem) -> Result<bool> + Send + Sync>;
pub(crate) type WrapSeqFn = Arc<dyn Fn(Vec<Elem>) -> Result<Elem> + Send + Sync>;
pub(crate) type ExplodeFn = Arc<dyn Fn(Elem) -> Result<Vec<Elem>> + Send + Sync>;
pub(crate) type AggregateFn = Arc<dyn Fn(Elem, Elem) -> Result<Elem> + Send + Sync>;
pub(crate) type IterateFn =
    Arc<dyn Fn(Elem) -> Result<Box<dyn Iterator<Item = Elem> + Send>> + Send + Sync>;
pub(crate) type AsyncFn =
    Arc<dyn Fn(Elem) -> Result<BoxFuture<'static, Result<Elem>>> + Send + Sync>;
pub(crate) type RecoverFn = Arc<dyn Fn(&Error) -> Result<Option<Elem>> + Send + Sync>;

const IN: usize = 0;
const OUT: usize = 0;

/// What `buffer` does when a new element arrives into a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// Stop pulling upstream until space frees. Lossless.
    Backpressure,
    /// Evict the oldest buffered element.
    DropHead,
    /// Evict the newest buffered element.
    DropTail,
    /// Discard the entire buffer.
    DropBuffer,
    /// Fail the stream with [`Error::BufferOverflow`].
    Fail,
}

/// `map` and fallible transforms. One element in, one element out.
pub(crate) struct TransformLogic {
    pub(crate) f: TransformFn,
}

impl StageLogic for TransformLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        match (self.f)(elem) {
            Ok(out) => ctx.push(OUT, out),
            Err(err) => ctx.fail_stage(err),
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }
}

/// `filter`: forwards matching elements, silently re-pulls for the rest.
pub(crate) struct FilterLogic {
    pub(crate) pred: PredicateFn,
}

impl StageLogic for FilterLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        match (self.pred)(&elem) {
            Ok(true) => ctx.push(OUT, elem),
            Ok(false) => ctx.pull(IN),
            Err(err) => ctx.fail_stage(err),
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }
}

/// `take(n)`: forwards n elements then finishes without pulling further.
pub(crate) struct TakeLogic {
    pub(crate) remaining: usize,
}

impl StageLogic for TakeLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        self.remaining = self.remaining.saturating_sub(1);
        ctx.push(OUT, elem);
        if self.remaining == 0 {
            ctx.finish_stage();
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if self.remaining == 0 {
            ctx.finish_stage();
        } else {
            ctx.pull(IN);
        }
    }
}

/// `take_while(p)`: finishes on the first non-matching element, which is
/// not forwarded.
pub(crate) struct TakeWhileLogic {
    pub(crate) pred: PredicateFn,
}

impl StageLogic for TakeWhileLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        match (self.pred)(&elem) {
            Ok(true) => ctx.push(OUT, elem),
            Ok(false) => ctx.finish_stage(),
            Err(err) => ctx.fail_stage(err),
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }
}

/// `drop(n)`: discards the first n elements.
pub(crate) struct DropLogic {
    pub(crate) remaining: usize,
}

impl StageLogic for DropLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        if self.remaining > 0 {
            self.remaining -= 1;
            ctx.pull(IN);
        } else {
            ctx.push(OUT, elem);
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }
}

/// `drop_while(p)`: discards the matching prefix. The boundary element, the
/// first for which the predicate fails, is forwarded.
pub(crate) struct DropWhileLogic {
    pub(crate) pred: PredicateFn,
    pub(crate) dropping: bool,
}

impl StageLogic for DropWhileLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        if self.dropping {
            match (self.pred)(&elem) {
                Ok(true) => return ctx.pull(IN),
                Ok(false) => self.dropping = false,
                Err(err) => return ctx.fail_stage(err),
            }
        }
        ctx.push(OUT, elem);
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }
}

/// `grouped(n)`: batches into sequences of n, emitting a shorter final
/// group on completion.
pub(crate) struct GroupedLogic {
    pub(crate) size: usize,
    pub(crate) wrap: WrapSeqFn,
    pub(crate) buf: Vec<Elem>,
}

impl GroupedLogic {
    fn flush(&mut self, ctx: &mut StageCtx<'_>) {
        match (self.wrap)(std::mem::take(&mut self.buf)) {
            Ok(group) => ctx.push(OUT, group),
            Err(err) => ctx.fail_stage(err),
        }
    }
}

impl StageLogic for GroupedLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        self.buf.push(elem);
        if self.buf.len() >= self.size {
            self.flush(ctx);
        } else {
            ctx.pull(IN);
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        if self.buf.is_empty() {
            ctx.finish_stage();
        } else {
            match (self.wrap)(std::mem::take(&mut self.buf)) {
                Ok(group) => ctx.emit_all_and_finish(OUT, vec![group]),
                Err(err) => ctx.fail_stage(err),
            }
        }
    }

    fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// `grouped_within(n, d)`: like `grouped` but also flushes a non-empty
/// partial group when the timer elapses. The epoch counter invalidates
/// timers from already-flushed groups.
pub(crate) struct GroupedWithinLogic {
    pub(crate) size: usize,
    pub(crate) timeout: Duration,
    pub(crate) wrap: WrapSeqFn,
    pub(crate) buf: Vec<Elem>,
    pub(crate) epoch: u64,
    pub(crate) flush_pending: bool,
}

impl GroupedWithinLogic {
    fn flush(&mut self, ctx: &mut StageCtx<'_>) {
        self.epoch += 1;
        self.flush_pending = false;
        match (self.wrap)(std::mem::take(&mut self.buf)) {
            Ok(group) => ctx.push(OUT, group),
            Err(err) => ctx.fail_stage(err),
        }
    }

    fn pull_if_idle(&self, ctx: &mut StageCtx<'_>) {
        if !ctx.is_pulling(IN) && !ctx.inlet_closed(IN) {
            ctx.pull(IN);
        }
    }
}

impl StageLogic for GroupedWithinLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        if self.buf.is_empty() {
            ctx.schedule_timer(self.timeout, self.epoch);
        }
        self.buf.push(elem);
        if self.buf.len() >= self.size && ctx.is_pulled(OUT) {
            self.flush(ctx);
        }
        if self.buf.len() < self.size {
            ctx.pull(IN);
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if !self.buf.is_empty() && (self.flush_pending || self.buf.len() >= self.size) {
            self.flush(ctx);
        }
        self.pull_if_idle(ctx);
    }

    fn on_event(&mut self, event: StageEvent, ctx: &mut StageCtx<'_>) {
        if let StageEvent::Timer { token } = event {
            if token != self.epoch || self.buf.is_empty() {
                return;
            }
            if ctx.is_pulled(OUT) {
                self.flush(ctx);
                self.pull_if_idle(ctx);
            } else {
                self.flush_pending = true;
            }
        }
    }

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        if self.buf.is_empty() {
            ctx.finish_stage();
        } else {
            self.epoch += 1;
            match (self.wrap)(std::mem::take(&mut self.buf)) {
                Ok(group) => ctx.emit_all_and_finish(OUT, vec![group]),
                Err(err) => ctx.fail_stage(err),
            }
        }
    }

    fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// `map_concat`: one element in, zero or more out, delivered one per pull.
pub(crate) struct MapConcatLogic {
    pub(crate) f: ExplodeFn,
}

impl StageLogic for MapConcatLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        match (self.f)(elem) {
            Ok(items) if items.is_empty() => ctx.pull(IN),
            Ok(items) => ctx.emit_all(OUT, items),
            Err(err) => ctx.fail_stage(err),
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        // Queued expansion leftovers are served before this callback runs,
        // so reaching it means the queue is dry.
        ctx.pull(IN);
    }
}

/// `buffer(n, strategy)`: decouples upstream rate from downstream rate with
/// a bounded queue. Pulls eagerly to keep the buffer warm.
pub(crate) struct BufferLogic {
    pub(crate) capacity: usize,
    pub(crate) strategy: OverflowStrategy,
    pub(crate) buf: VecDeque<Elem>,
    pub(crate) draining: bool,
}

impl BufferLogic {
    fn want_more(&self) -> bool {
        self.buf.len() < self.capacity || self.strategy != OverflowStrategy::Backpressure
    }

    fn refill(&self, ctx: &mut StageCtx<'_>) {
        if self.want_more() && !ctx.is_pulling(IN) && !ctx.inlet_closed(IN) {
            ctx.pull(IN);
        }
    }
}

impl StageLogic for BufferLogic {
    fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }

    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        if self.buf.is_empty() && ctx.is_pulled(OUT) {
            ctx.push(OUT, elem);
        } else if self.buf.len() >= self.capacity {
            match self.strategy {
                OverflowStrategy::Backpressure => {
                    // A pull is only sent with free space, so a push into a
                    // full buffer cannot happen under backpressure.
                    self.buf.push_back(elem);
                }
                OverflowStrategy::DropHead => {
                    self.buf.pop_front();
                    self.buf.push_back(elem);
                }
                OverflowStrategy::DropTail => {
                    self.buf.pop_back();
                    self.buf.push_back(elem);
                }
                OverflowStrategy::DropBuffer => {
                    self.buf.clear();
                    self.buf.push_back(elem);
                }
                OverflowStrategy::Fail => {
                    return ctx.fail_stage(Error::BufferOverflow {
                        capacity: self.capacity,
                    });
                }
            }
        } else {
            self.buf.push_back(elem);
        }
        self.refill(ctx);
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if let Some(elem) = self.buf.pop_front() {
            ctx.push(OUT, elem);
            if self.draining && self.buf.is_empty() {
                ctx.finish_stage();
                return;
            }
        } else if self.draining || ctx.inlet_closed(IN) {
            ctx.finish_stage();
            return;
        }
        self.refill(ctx);
    }

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        if self.buf.is_empty() {
            ctx.finish_stage();
        } else {
            self.draining = true;
        }
    }

    fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// `conflate(seed, aggregate)`: lossy rate decoupling. Runs upstream at
/// full speed, folding elements the consumer has not yet asked for into a
/// single accumulator.
pub(crate) struct ConflateLogic {
    pub(crate) seed: TransformFn,
    pub(crate) aggregate: AggregateFn,
    pub(crate) acc: Option<Elem>,
}

impl StageLogic for ConflateLogic {
    fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }

    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        let folded = match self.acc.take() {
            None => (self.seed)(elem),
            Some(acc) => (self.aggregate)(acc, elem),
        };
        match folded {
            Ok(acc) => self.acc = Some(acc),
            Err(err) => return ctx.fail_stage(err),
        }
        if ctx.is_pulled(OUT) {
            if let Some(acc) = self.acc.take() {
                ctx.push(OUT, acc);
            }
        }
        ctx.pull(IN);
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if let Some(acc) = self.acc.take() {
            ctx.push(OUT, acc);
            if ctx.inlet_closed(IN) {
                ctx.finish_stage();
            }
        } else if ctx.inlet_closed(IN) {
            ctx.finish_stage();
        }
        // Otherwise the standing upstream pull will deliver the next seed.
    }

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        match self.acc.take() {
            Some(acc) => ctx.emit_all_and_finish(OUT, vec![acc]),
            None => ctx.finish_stage(),
        }
    }

    fn has_pending(&self) -> bool {
        self.acc.is_some()
    }
}

/// `expand(iterate)`: lossy in the other direction. When downstream is
/// faster, the last element seen is expanded through an iterator until a
/// fresh element replaces it.
pub(crate) struct ExpandLogic {
    pub(crate) iterate: IterateFn,
    pub(crate) iter: Option<Box<dyn Iterator<Item = Elem> + Send>>,
}

impl StageLogic for ExpandLogic {
    fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }

    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        match (self.iterate)(elem) {
            Ok(iter) => self.iter = Some(iter),
            Err(err) => return ctx.fail_stage(err),
        }
        if ctx.is_pulled(OUT) {
            if let Some(next) = self.iter.as_mut().and_then(Iterator::next) {
                ctx.push(OUT, next);
            }
        }
        ctx.pull(IN);
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        match self.iter.as_mut().and_then(Iterator::next) {
            Some(next) => ctx.push(OUT, next),
            None => {
                self.iter = None;
                if ctx.inlet_closed(IN) {
                    ctx.finish_stage();
                }
                // A live upstream pull is always outstanding here.
            }
        }
    }

    fn has_pending(&self) -> bool {
        self.iter.is_some()
    }
}

struct AsyncSlot {
    token: u64,
    result: Option<Result<Elem>>,
}

/// `map_async(parallelism, f)`: runs up to `parallelism` element futures
/// concurrently while emitting results in upstream order.
pub(crate) struct MapAsyncLogic {
    pub(crate) f: AsyncFn,
    pub(crate) parallelism: usize,
    slots: VecDeque<AsyncSlot>,
    next_token: u64,
    upstream_done: bool,
}

impl MapAsyncLogic {
    pub(crate) fn new(f: AsyncFn, parallelism: usize) -> Self {
        Self {
            f,
            parallelism: parallelism.max(1),
            slots: VecDeque::new(),
            next_token: 0,
            upstream_done: false,
        }
    }

    fn maybe_pull(&self, ctx: &mut StageCtx<'_>) {
        if !self.upstream_done
            && self.slots.len() < self.parallelism
            && !ctx.is_pulling(IN)
            && !ctx.inlet_closed(IN)
        {
            ctx.pull(IN);
        }
    }

    /// Emit the front result if it is ready; ordering never lets a later
    /// slot jump the queue.
    fn deliver_front(&mut self, ctx: &mut StageCtx<'_>) {
        let ready = self
            .slots
            .front()
            .map(|s| s.result.is_some())
            .unwrap_or(false);
        if !ready || !ctx.is_pulled(OUT) {
            return;
        }
        if let Some(slot) = self.slots.pop_front() {
            match slot.result {
                Some(Ok(elem)) => ctx.push(OUT, elem),
                Some(Err(err)) => return ctx.fail_stage(err),
                None => return,
            }
        }
        if self.upstream_done && self.slots.is_empty() {
            ctx.finish_stage();
        }
    }
}

impl StageLogic for MapAsyncLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        let token = self.next_token;
        self.next_token += 1;
        match (self.f)(elem) {
            Ok(fut) => {
                self.slots.push_back(AsyncSlot {
                    token,
                    result: None,
                });
                ctx.watch_future(token, fut);
            }
            Err(err) => return ctx.fail_stage(err),
        }
        self.maybe_pull(ctx);
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        self.deliver_front(ctx);
        if self.upstream_done && self.slots.is_empty() {
            ctx.finish_stage();
            return;
        }
        self.maybe_pull(ctx);
    }

    fn on_event(&mut self, event: StageEvent, ctx: &mut StageCtx<'_>) {
        if let StageEvent::FutureDone { token, result } = event {
            if let Err(err) = &result {
                return ctx.fail_stage(err.clone());
            }
            if let Some(slot) = self.slots.iter_mut().find(|s| s.token == token) {
                slot.result = Some(result);
            }
            self.deliver_front(ctx);
        }
    }

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        self.upstream_done = true;
        if self.slots.is_empty() {
            ctx.finish_stage();
        }
    }

    fn has_pending(&self) -> bool {
        !self.slots.is_empty()
    }
}

/// `recover(handler)`: intercepts one upstream failure. A replacement
/// element completes the stream; `None` lets the failure through.
pub(crate) struct RecoverLogic {
    pub(crate) handler: RecoverFn,
}

impl StageLogic for RecoverLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        ctx.push(OUT, elem);
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.pull(IN);
    }

    fn on_upstream_failure(&mut self, _inlet: usize, error: Error, ctx: &mut StageCtx<'_>) {
        match (self.handler)(&error) {
            Ok(Some(fallback)) => ctx.emit_all_and_finish(OUT, vec![fallback]),
            Ok(None) => ctx.fail_stage(error),
            Err(err) => ctx.fail_stage(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use super::*;
    use crate::core::graph::{BuiltStage, GraphBuilder, MatRef, StagePlan};
    use crate::core::materializer::Materializer;
    use crate::flows::Flow;
    use crate::sources::Source;

    /// A sink that withholds its first demand until a timer fires, letting
    /// rate-mismatch stages upstream accumulate state.
    struct SleepyCollect {
        delay: Duration,
        items: Vec<Elem>,
        tx: Option<oneshot::Sender<Result<Vec<Elem>>>>,
    }

    impl SleepyCollect {
        fn resolve(&mut self, outcome: Result<()>) {
            if let Some(tx) = self.tx.take() {
                let items = std::mem::take(&mut self.items);
                let _ = tx.send(outcome.map(|()| items));
            }
        }
    }

    impl StageLogic for SleepyCollect {
        fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
            ctx.schedule_timer(self.delay, 0);
        }

        fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
            self.items.push(elem);
            ctx.pull(IN);
        }

        fn on_pull(&mut self, _outlet: usize, _ctx: &mut StageCtx<'_>) {}

        fn on_event(&mut self, event: StageEvent, ctx: &mut StageCtx<'_>) {
            if matches!(event, StageEvent::Timer { .. }) && !ctx.inlet_closed(IN) {
                ctx.pull(IN);
            }
        }

        fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
            self.resolve(Ok(()));
            ctx.finish_stage();
        }

        fn on_upstream_failure(&mut self, _inlet: usize, error: Error, ctx: &mut StageCtx<'_>) {
            self.resolve(Err(error.clone()));
            ctx.fail_stage(error);
        }

        fn has_pending(&self) -> bool {
            true
        }

        fn on_abort(&mut self, error: &Error) {
            self.resolve(Err(error.clone()));
        }
    }

    fn run_sleepy<T: Send + 'static>(
        source: Source<T>,
        delay: Duration,
        materializer: &Materializer,
    ) -> oneshot::Receiver<Result<Vec<Elem>>> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let mut builder = GraphBuilder::new();
        let out = builder.add_source(source);
        let sink = builder.def.add_stage(StagePlan {
            name: "sleepy-collect".to_string(),
            inlets: 1,
            outlets: 0,
            build: Arc::new(move |_| {
                BuiltStage::new(SleepyCollect {
                    delay,
                    items: Vec::new(),
                    tx: slot.lock().unwrap().take(),
                })
            }),
        });
        builder.def.add_edge((out.stage, out.port), (sink, 0));
        builder
            .build(MatRef::<()>::new(sink))
            .run(materializer)
            .unwrap();
        rx
    }

    fn typed<T: 'static>(items: Vec<Elem>) -> Vec<T> {
        items
            .into_iter()
            .map(|elem| *elem.downcast::<T>().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_conflate_aggregates_while_consumer_sleeps() {
        let materializer = Materializer::new();
        let source = Source::iter(vec!["A", "B", "C"])
            .conflate(|s: &str| s.to_string(), |acc, s| acc + s);
        let rx = run_sleepy(source, Duration::from_millis(40), &materializer);
        let items = typed::<String>(rx.await.unwrap().unwrap());
        assert_eq!(items, vec!["ABC".to_string()]);
    }

    #[tokio::test]
    async fn test_buffer_drop_head_keeps_newest() {
        let materializer = Materializer::new();
        let source = Source::iter(1..=5).buffer(2, OverflowStrategy::DropHead);
        let rx = run_sleepy(source, Duration::from_millis(40), &materializer);
        let items = typed::<i32>(rx.await.unwrap().unwrap());
        assert_eq!(items, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_buffer_drop_tail_keeps_oldest() {
        let materializer = Materializer::new();
        let source = Source::iter(1..=5).buffer(2, OverflowStrategy::DropTail);
        let rx = run_sleepy(source, Duration::from_millis(40), &materializer);
        let items = typed::<i32>(rx.await.unwrap().unwrap());
        assert_eq!(items, vec![1, 5]);
    }

    #[tokio::test]
    async fn test_buffer_drop_buffer_clears_on_overflow() {
        let materializer = Materializer::new();
        let source = Source::iter(1..=5).buffer(2, OverflowStrategy::DropBuffer);
        let rx = run_sleepy(source, Duration::from_millis(40), &materializer);
        let items = typed::<i32>(rx.await.unwrap().unwrap());
        assert_eq!(items, vec![5]);
    }

    #[tokio::test]
    async fn test_buffer_fail_on_overflow() {
        let materializer = Materializer::new();
        let source = Source::iter(1..=5).buffer(2, OverflowStrategy::Fail);
        let rx = run_sleepy(source, Duration::from_millis(40), &materializer);
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::BufferOverflow { capacity: 2 })));
    }

    /// A source that emits its elements on demand, then goes silent without
    /// completing.
    struct StallingSource {
        pending: VecDeque<Elem>,
    }

    impl StageLogic for StallingSource {
        fn on_push(&mut self, _inlet: usize, _elem: Elem, _ctx: &mut StageCtx<'_>) {}

        fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
            if let Some(elem) = self.pending.pop_front() {
                ctx.push(OUT, elem);
            }
        }

        fn has_pending(&self) -> bool {
            true
        }
    }

    /// A sink that resolves with the first element it receives, then
    /// cancels upstream.
    struct FirstItem {
        tx: Option<oneshot::Sender<Result<Elem>>>,
    }

    impl StageLogic for FirstItem {
        fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
            ctx.pull(IN);
        }

        fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
            if let Some(tx) = self.tx.take() {
                let _ = tx.send(Ok(elem));
            }
            ctx.finish_stage();
        }

        fn on_pull(&mut self, _outlet: usize, _ctx: &mut StageCtx<'_>) {}

        fn on_abort(&mut self, error: &Error) {
            if let Some(tx) = self.tx.take() {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    #[tokio::test]
    async fn test_grouped_within_flushes_partial_group_on_timeout() {
        let materializer = Materializer::new();
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let source: Source<i32> = Source::from_stage(StagePlan {
            name: "stalling".to_string(),
            inlets: 0,
            outlets: 1,
            build: Arc::new(|_| {
                BuiltStage::new(StallingSource {
                    pending: (1..=3).map(|x| Box::new(x) as Elem).collect(),
                })
            }),
        });

        let mut builder = GraphBuilder::new();
        let out = builder.add_source(
            source.via(Flow::new().grouped_within(10, Duration::from_millis(20))),
        );
        let sink = builder.def.add_stage(StagePlan {
            name: "first-item".to_string(),
            inlets: 1,
            outlets: 0,
            build: Arc::new(move |_| {
                BuiltStage::new(FirstItem {
                    tx: slot.lock().unwrap().take(),
                })
            }),
        });
        builder.def.add_edge((out.stage, out.port), (sink, 0));
        builder
            .build(MatRef::<()>::new(sink))
            .run(&materializer)
            .unwrap();

        let group = rx.await.unwrap().unwrap();
        let group = *group.downcast::<Vec<i32>>().unwrap();
        assert_eq!(group, vec![1, 2, 3]);
        materializer.shutdown();
    }
}
