//! Dynamically created sub-streams: `group_by`, `split_when`/`split_after`,
//! `prefix_and_tail`, and `flatten_concat`.
//!
//! A parent stage emits [`SubStream`] handles as ordinary elements. Each
//! handle wraps a [`SubChannel`], a small bounded mailbox bridging the parent
//! stage (producer side) to a sub-source stage materialized later, possibly
//! in a different graph (consumer side). The channel carries its own demand:
//! the parent parks at most one element per sub-stream when a mailbox is
//! full, and wakeups cross interpreter tasks through stage events.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::error::{Error, Result};
use crate::core::interpreter::StageCtx;
use crate::core::stage::{Elem, StageEvent, StageEvents, StageLogic};
use crate::operators::PredicateFn;

/// Producer-side outcome of offering an element to a mailbox. A full
/// mailbox hands the element back so the producer can park it.
pub(crate) enum Offer {
    Accepted,
    Full(Elem),
    /// The consumer cancelled; the element was discarded.
    Cancelled,
}

/// Consumer-side outcome of taking from a mailbox.
pub(crate) enum Popped {
    Item(Elem),
    Empty,
    Done,
    Failed(Error),
}

struct SubInner {
    queue: VecDeque<Elem>,
    capacity: usize,
    closed: Option<Result<()>>,
    cancelled: bool,
    consumer: Option<(StageEvents, u64)>,
    producer: Option<(StageEvents, u64)>,
    claimed: bool,
}

/// The bounded hand-off mailbox behind every [`SubStream`].
pub(crate) struct SubChannel {
    inner: Mutex<SubInner>,
}

impl SubChannel {
    pub(crate) fn new(capacity: usize, producer: Option<(StageEvents, u64)>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SubInner {
                queue: VecDeque::new(),
                capacity: capacity.max(1),
                closed: None,
                cancelled: false,
                consumer: None,
                producer,
                claimed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SubInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claim the consumer side. A sub-stream materializes at most once.
    pub(crate) fn attach_consumer(&self, events: StageEvents, token: u64) -> Result<()> {
        let mut inner = self.lock();
        if inner.claimed {
            return Err(Error::custom(
                "sub-stream source already materialized; a sub-stream can only be run once",
            ));
        }
        inner.claimed = true;
        inner.consumer = Some((events, token));
        Ok(())
    }

    pub(crate) fn offer(&self, elem: Elem) -> Offer {
        let mut inner = self.lock();
        if inner.cancelled {
            return Offer::Cancelled;
        }
        if inner.queue.len() >= inner.capacity {
            return Offer::Full(elem);
        }
        inner.queue.push_back(elem);
        if let Some((events, token)) = &inner.consumer {
            events.send(StageEvent::SubReady { token: *token });
        }
        Offer::Accepted
    }

    pub(crate) fn close_ok(&self) {
        let mut inner = self.lock();
        if inner.closed.is_none() {
            inner.closed = Some(Ok(()));
            if let Some((events, token)) = &inner.consumer {
                events.send(StageEvent::SubReady { token: *token });
            }
        }
    }

    pub(crate) fn close_err(&self, error: Error) {
        let mut inner = self.lock();
        if inner.closed.is_none() {
            inner.closed = Some(Err(error));
            if let Some((events, token)) = &inner.consumer {
                events.send(StageEvent::SubReady { token: *token });
            }
        }
    }

    /// Consumer lost interest. Buffered elements are discarded and the
    /// producer is notified once.
    pub(crate) fn cancel(&self) {
        let mut inner = self.lock();
        if inner.cancelled {
            return;
        }
        inner.cancelled = true;
        inner.queue.clear();
        if let Some((events, token)) = &inner.producer {
            events.send(StageEvent::SubCancelled { token: *token });
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub(crate) fn pop(&self) -> Popped {
        let mut inner = self.lock();
        if let Some(elem) = inner.queue.pop_front() {
            if let Some((events, token)) = &inner.producer {
                events.send(StageEvent::SubSpace { token: *token });
            }
            return Popped::Item(elem);
        }
        match &inner.closed {
            None => Popped::Empty,
            Some(Ok(())) => Popped::Done,
            Some(Err(err)) => Popped::Failed(err.clone()),
        }
    }
}

/// A handle to a dynamically created sub-stream of `T` elements.
///
/// Emitted as an ordinary element by `group_by`, `split_when`,
/// `split_after` and `prefix_and_tail`. Convert it into a
/// [`Source`](crate::sources::Source) to attach further processing; each
/// handle can be materialized exactly once.
pub struct SubStream<T> {
    pub(crate) chan: Arc<SubChannel>,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T> SubStream<T> {
    pub(crate) fn new(chan: Arc<SubChannel>) -> Self {
        Self {
            chan,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for SubStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SubStream")
    }
}

/// Source-side stage reading from a [`SubChannel`]. Zero inlets, one
/// outlet.
pub(crate) struct SubSourceLogic {
    pub(crate) chan: Arc<SubChannel>,
    pub(crate) waiting: bool,
}

const OUT: usize = 0;
const IN: usize = 0;

impl SubSourceLogic {
    fn serve(&mut self, ctx: &mut StageCtx<'_>) {
        match self.chan.pop() {
            Popped::Item(elem) => {
                self.waiting = false;
                ctx.push(OUT, elem);
            }
            Popped::Empty => self.waiting = true,
            Popped::Done => ctx.finish_stage(),
            Popped::Failed(err) => ctx.fail_stage(err),
        }
    }
}

impl StageLogic for SubSourceLogic {
    fn on_start(&mut self, ctx: &mut StageCtx<'_>) {
        if let Err(err) = self.chan.attach_consumer(ctx.events(), 0) {
            ctx.fail_stage(err);
        }
    }

    fn on_push(&mut self, _inlet: usize, _elem: Elem, _ctx: &mut StageCtx<'_>) {
        // No inlets.
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        self.serve(ctx);
    }

    fn on_event(&mut self, event: StageEvent, ctx: &mut StageCtx<'_>) {
        if matches!(event, StageEvent::SubReady { .. }) && self.waiting && ctx.is_pulled(OUT) {
            self.serve(ctx);
        }
    }

    fn on_downstream_cancel(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        self.chan.cancel();
        ctx.finish_stage();
    }

    fn on_abort(&mut self, _error: &Error) {
        self.chan.cancel();
    }

    fn has_pending(&self) -> bool {
        self.waiting
    }
}

pub(crate) type KeyFn<K> = Arc<dyn Fn(&Elem) -> Result<K> + Send + Sync>;
pub(crate) type PackGroupFn<K> = Arc<dyn Fn(K, Arc<SubChannel>) -> Elem + Send + Sync>;
pub(crate) type WrapSubFn = Arc<dyn Fn(Arc<SubChannel>) -> Elem + Send + Sync>;
pub(crate) type WrapTailFn = Arc<dyn Fn(Vec<Elem>, Arc<SubChannel>) -> Result<Elem> + Send + Sync>;
pub(crate) type UnpackSubFn = Arc<dyn Fn(Elem) -> Result<Arc<SubChannel>> + Send + Sync>;

struct Group {
    chan: Arc<SubChannel>,
}

/// `group_by(max_groups, key_fn)`: demultiplexes by key into one
/// sub-stream per distinct key, emitting `(key, sub-stream)` downstream
/// the first time a key appears.
///
/// Outer cancellation stops new groups from forming but lets live ones
/// run; elements for a cancelled group are dropped. The number of open
/// groups is capped, a fresh key beyond the cap fails the stream.
pub(crate) struct GroupByLogic<K> {
    keyf: KeyFn<K>,
    pack: PackGroupFn<K>,
    max_groups: usize,
    buffer: usize,
    groups: HashMap<K, Group>,
    tokens: HashMap<u64, K>,
    next_token: u64,
    parked: Option<Elem>,
    outer_cancelled: bool,
    upstream_done: bool,
}

impl<K: Hash + Eq + Clone + Send + 'static> GroupByLogic<K> {
    pub(crate) fn new(max_groups: usize, buffer: usize, keyf: KeyFn<K>, pack: PackGroupFn<K>) -> Self {
        Self {
            keyf,
            pack,
            max_groups,
            buffer,
            groups: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 0,
            parked: None,
            outer_cancelled: false,
            upstream_done: false,
        }
    }

    fn pull_more(&mut self, ctx: &mut StageCtx<'_>) {
        if self.upstream_done {
            self.finish_if_drained(ctx);
        } else if !ctx.is_pulling(IN) && !ctx.inlet_closed(IN) {
            ctx.pull(IN);
        } else if ctx.inlet_closed(IN) {
            self.upstream_done = true;
            self.finish_if_drained(ctx);
        }
    }

    fn finish_if_drained(&mut self, ctx: &mut StageCtx<'_>) {
        if self.parked.is_none() {
            for group in self.groups.values() {
                group.chan.close_ok();
            }
            ctx.finish_stage();
        }
    }

    fn route(&mut self, elem: Elem, ctx: &mut StageCtx<'_>) {
        let key = match (self.keyf)(&elem) {
            Ok(key) => key,
            Err(err) => return ctx.fail_stage(err),
        };
        if let Some(group) = self.groups.get(&key) {
            match group.chan.offer(elem) {
                Offer::Accepted | Offer::Cancelled => self.pull_more(ctx),
                Offer::Full(elem) => self.parked = Some(elem),
            }
            return;
        }
        if self.outer_cancelled {
            // No new groups after the outer stream lost interest.
            self.pull_more(ctx);
            return;
        }
        if self.groups.len() >= self.max_groups {
            return ctx.fail_stage(Error::TooManyGroups {
                limit: self.max_groups,
            });
        }
        if !ctx.is_pulled(OUT) {
            self.parked = Some(elem);
            return;
        }
        let token = self.next_token;
        self.next_token += 1;
        let chan = SubChannel::new(self.buffer, Some((ctx.events(), token)));
        // Capacity is at least one, the first element always fits.
        let _ = chan.offer(elem);
        self.tokens.insert(token, key.clone());
        self.groups.insert(key.clone(), Group { chan: chan.clone() });
        ctx.push(OUT, (self.pack)(key, chan));
        self.pull_more(ctx);
    }
}

impl<K: Hash + Eq + Clone + Send + 'static> StageLogic for GroupByLogic<K> {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        self.route(elem, ctx);
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if let Some(parked) = self.parked.take() {
            self.route(parked, ctx);
        } else {
            self.pull_more(ctx);
        }
    }

    fn on_event(&mut self, event: StageEvent, ctx: &mut StageCtx<'_>) {
        match event {
            StageEvent::SubSpace { .. } => {
                if let Some(parked) = self.parked.take() {
                    self.route(parked, ctx);
                    if self.parked.is_none() && self.upstream_done {
                        self.finish_if_drained(ctx);
                    }
                }
            }
            StageEvent::SubCancelled { token } => {
                // The group stays known so late elements for it are
                // dropped rather than reopening it.
                let key = self.tokens.get(&token).cloned();
                if let (Some(key), Some(parked)) = (key, self.parked.take()) {
                    match (self.keyf)(&parked) {
                        Ok(parked_key) if parked_key == key => self.pull_more(ctx),
                        Ok(_) | Err(_) => self.parked = Some(parked),
                    }
                }
                if self.outer_cancelled
                    && self.groups.values().all(|g| g.chan.is_cancelled())
                {
                    ctx.finish_stage();
                }
            }
            _ => {}
        }
    }

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        self.upstream_done = true;
        self.finish_if_drained(ctx);
    }

    fn on_upstream_failure(&mut self, _inlet: usize, error: Error, ctx: &mut StageCtx<'_>) {
        for group in self.groups.values() {
            group.chan.close_err(error.clone());
        }
        ctx.fail_stage(error);
    }

    fn on_downstream_cancel(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        self.outer_cancelled = true;
        if let Some(parked) = self.parked.take() {
            match (self.keyf)(&parked) {
                Ok(key) if self.groups.contains_key(&key) => self.parked = Some(parked),
                // A parked group opener will never be emitted now.
                Ok(_) => {}
                Err(_) => {}
            }
        }
        if self.groups.is_empty() || self.groups.values().all(|g| g.chan.is_cancelled()) {
            ctx.finish_stage();
        } else {
            self.pull_more(ctx);
        }
    }

    fn on_abort(&mut self, error: &Error) {
        for group in self.groups.values() {
            group.chan.close_err(error.clone());
        }
    }

    fn has_pending(&self) -> bool {
        self.parked.is_some()
    }
}

/// Boundary placement for [`SplitLogic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SplitMode {
    /// The matching element starts the new sub-stream.
    When,
    /// The matching element ends the current sub-stream.
    After,
}

/// `split_when` / `split_after`: chops the stream into consecutive
/// sub-streams at predicate boundaries. Exactly one sub-stream is live at
/// a time.
pub(crate) struct SplitLogic {
    pred: PredicateFn,
    mode: SplitMode,
    buffer: usize,
    current: Option<Arc<SubChannel>>,
    next_token: u64,
    wrap: WrapSubFn,
    /// Element waiting for mailbox space in the current sub-stream.
    parked: Option<Elem>,
    /// Element waiting for outer demand to open the next sub-stream.
    pending_open: Option<Elem>,
    /// Close the current sub-stream once the parked element lands.
    close_after_park: bool,
    outer_cancelled: bool,
    upstream_done: bool,
}

impl SplitLogic {
    pub(crate) fn new(mode: SplitMode, buffer: usize, pred: PredicateFn, wrap: WrapSubFn) -> Self {
        Self {
            pred,
            mode,
            buffer,
            current: None,
            next_token: 0,
            wrap,
            parked: None,
            pending_open: None,
            close_after_park: false,
            outer_cancelled: false,
            upstream_done: false,
        }
    }

    fn close_current(&mut self) {
        if let Some(chan) = self.current.take() {
            chan.close_ok();
        }
    }

    fn finish_if_drained(&mut self, ctx: &mut StageCtx<'_>) {
        if self.parked.is_none() && self.pending_open.is_none() {
            self.close_current();
            ctx.finish_stage();
        }
    }

    fn pull_more(&mut self, ctx: &mut StageCtx<'_>) {
        if self.upstream_done || ctx.inlet_closed(IN) {
            self.upstream_done = true;
            self.finish_if_drained(ctx);
        } else if !ctx.is_pulling(IN) {
            ctx.pull(IN);
        }
    }

    fn open_with(&mut self, elem: Elem, ctx: &mut StageCtx<'_>) {
        if self.outer_cancelled {
            // Nobody will ever consume another sub-stream.
            self.close_current();
            ctx.finish_stage();
            return;
        }
        if !ctx.is_pulled(OUT) {
            self.pending_open = Some(elem);
            return;
        }
        let token = self.next_token;
        self.next_token += 1;
        let chan = SubChannel::new(self.buffer, Some((ctx.events(), token)));
        let _ = chan.offer(elem);
        self.current = Some(chan.clone());
        ctx.push(OUT, (self.wrap)(chan));
        self.pull_more(ctx);
    }

    fn deliver(&mut self, elem: Elem, close_after: bool, ctx: &mut StageCtx<'_>) {
        let Some(chan) = self.current.clone() else {
            return;
        };
        match chan.offer(elem) {
            Offer::Accepted | Offer::Cancelled => {
                if close_after {
                    self.close_current();
                }
                self.pull_more(ctx);
            }
            Offer::Full(elem) => {
                self.parked = Some(elem);
                self.close_after_park = close_after;
            }
        }
    }

    fn route(&mut self, elem: Elem, ctx: &mut StageCtx<'_>) {
        if self.current.is_none() {
            self.open_with(elem, ctx);
            return;
        }
        match (self.pred)(&elem) {
            Ok(true) => match self.mode {
                SplitMode::When => {
                    self.close_current();
                    self.open_with(elem, ctx);
                }
                SplitMode::After => self.deliver(elem, true, ctx),
            },
            Ok(false) => self.deliver(elem, false, ctx),
            Err(err) => ctx.fail_stage(err),
        }
    }
}

impl StageLogic for SplitLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        self.route(elem, ctx);
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if let Some(pending) = self.pending_open.take() {
            self.open_with(pending, ctx);
        } else {
            self.pull_more(ctx);
        }
    }

    fn on_event(&mut self, event: StageEvent, ctx: &mut StageCtx<'_>) {
        match event {
            StageEvent::SubSpace { .. } => {
                if let Some(parked) = self.parked.take() {
                    let close_after = self.close_after_park;
                    self.close_after_park = false;
                    self.deliver(parked, close_after, ctx);
                    if self.upstream_done {
                        self.finish_if_drained(ctx);
                    }
                }
            }
            StageEvent::SubCancelled { .. } => {
                // Offers to a cancelled mailbox are discarded, so a parked
                // element can be let go now.
                if self.parked.take().is_some() {
                    if self.close_after_park {
                        self.close_after_park = false;
                        self.close_current();
                    }
                    self.pull_more(ctx);
                }
            }
            _ => {}
        }
    }

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        self.upstream_done = true;
        self.finish_if_drained(ctx);
    }

    fn on_upstream_failure(&mut self, _inlet: usize, error: Error, ctx: &mut StageCtx<'_>) {
        if let Some(chan) = self.current.take() {
            chan.close_err(error.clone());
        }
        ctx.fail_stage(error);
    }

    fn on_downstream_cancel(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        self.outer_cancelled = true;
        self.pending_open = None;
        if self.current.is_none() || self.current.as_ref().is_some_and(|c| c.is_cancelled()) {
            self.close_current();
            ctx.finish_stage();
        } else {
            self.pull_more(ctx);
        }
    }

    fn on_abort(&mut self, error: &Error) {
        if let Some(chan) = self.current.take() {
            chan.close_err(error.clone());
        }
    }

    fn has_pending(&self) -> bool {
        self.parked.is_some() || self.pending_open.is_some()
    }
}

/// `prefix_and_tail(n)`: collects exactly n elements, emits the pair
/// `(prefix, tail sub-stream)` once, completes the outer stream, then
/// keeps forwarding upstream into the tail mailbox.
pub(crate) struct PrefixAndTailLogic {
    n: usize,
    buffer: usize,
    wrap: WrapTailFn,
    prefix: Vec<Elem>,
    tail: Option<Arc<SubChannel>>,
    emitted: bool,
    parked: Option<Elem>,
    upstream_done: bool,
}

impl PrefixAndTailLogic {
    pub(crate) fn new(n: usize, buffer: usize, wrap: WrapTailFn) -> Self {
        Self {
            n,
            buffer,
            wrap,
            prefix: Vec::with_capacity(n),
            tail: None,
            emitted: false,
            parked: None,
            upstream_done: false,
        }
    }

    fn emit_pair(&mut self, ctx: &mut StageCtx<'_>) {
        let chan = SubChannel::new(self.buffer, Some((ctx.events(), 0)));
        self.tail = Some(chan.clone());
        self.emitted = true;
        match (self.wrap)(std::mem::take(&mut self.prefix), chan) {
            Ok(pair) => {
                ctx.push(OUT, pair);
                ctx.finish(OUT);
                self.pull_more(ctx);
            }
            Err(err) => ctx.fail_stage(err),
        }
    }

    fn pull_more(&mut self, ctx: &mut StageCtx<'_>) {
        if self.upstream_done || ctx.inlet_closed(IN) {
            self.upstream_done = true;
            if self.parked.is_none() {
                if let Some(chan) = self.tail.take() {
                    chan.close_ok();
                }
                ctx.finish_stage();
            }
        } else if !ctx.is_pulling(IN) {
            ctx.pull(IN);
        }
    }
}

impl StageLogic for PrefixAndTailLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        if !self.emitted {
            self.prefix.push(elem);
            if self.prefix.len() >= self.n {
                self.emit_pair(ctx);
            } else {
                ctx.pull(IN);
            }
            return;
        }
        let Some(chan) = self.tail.clone() else {
            ctx.pull(IN);
            return;
        };
        match chan.offer(elem) {
            Offer::Accepted | Offer::Cancelled => self.pull_more(ctx),
            Offer::Full(elem) => self.parked = Some(elem),
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if self.emitted {
            return;
        }
        if self.n == 0 {
            self.emit_pair(ctx);
        } else {
            ctx.pull(IN);
        }
    }

    fn on_event(&mut self, event: StageEvent, ctx: &mut StageCtx<'_>) {
        match event {
            StageEvent::SubSpace { .. } => {
                if let Some(parked) = self.parked.take() {
                    if let Some(chan) = self.tail.clone() {
                        match chan.offer(parked) {
                            Offer::Accepted | Offer::Cancelled => self.pull_more(ctx),
                            Offer::Full(parked) => self.parked = Some(parked),
                        }
                    }
                }
            }
            StageEvent::SubCancelled { .. } => {
                // Tail consumer gone: nothing left to forward to.
                self.parked = None;
                self.tail = None;
                ctx.finish_stage();
            }
            _ => {}
        }
    }

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        self.upstream_done = true;
        if !self.emitted {
            // Short input: emit what was collected with an already-finished
            // tail.
            let chan = SubChannel::new(self.buffer, None);
            chan.close_ok();
            self.emitted = true;
            match (self.wrap)(std::mem::take(&mut self.prefix), chan) {
                Ok(pair) => ctx.emit_all_and_finish(OUT, vec![pair]),
                Err(err) => ctx.fail_stage(err),
            }
            return;
        }
        if self.parked.is_none() {
            if let Some(chan) = self.tail.take() {
                chan.close_ok();
            }
            ctx.finish_stage();
        }
    }

    fn on_upstream_failure(&mut self, _inlet: usize, error: Error, ctx: &mut StageCtx<'_>) {
        if let Some(chan) = self.tail.take() {
            chan.close_err(error.clone());
        }
        ctx.fail_stage(error);
    }

    fn on_downstream_cancel(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if self.emitted {
            // The pair is out; keep feeding the tail.
            self.pull_more(ctx);
        } else {
            ctx.finish_stage();
        }
    }

    fn on_abort(&mut self, error: &Error) {
        if let Some(chan) = self.tail.take() {
            chan.close_err(error.clone());
        }
    }

    fn has_pending(&self) -> bool {
        self.parked.is_some()
    }
}

/// `flatten_concat`: consumes a stream of sub-streams, draining each one
/// completely before asking upstream for the next.
pub(crate) struct FlattenLogic {
    unpack: UnpackSubFn,
    current: Option<Arc<SubChannel>>,
    next_token: u64,
    waiting: bool,
    upstream_done: bool,
}

impl FlattenLogic {
    pub(crate) fn new(unpack: UnpackSubFn) -> Self {
        Self {
            unpack,
            current: None,
            next_token: 0,
            waiting: false,
            upstream_done: false,
        }
    }

    fn serve(&mut self, ctx: &mut StageCtx<'_>) {
        let Some(chan) = self.current.clone() else {
            return;
        };
        match chan.pop() {
            Popped::Item(elem) => {
                self.waiting = false;
                ctx.push(OUT, elem);
            }
            Popped::Empty => self.waiting = true,
            Popped::Done => {
                self.waiting = false;
                self.current = None;
                if self.upstream_done || ctx.inlet_closed(IN) {
                    ctx.finish_stage();
                } else if !ctx.is_pulling(IN) {
                    ctx.pull(IN);
                }
            }
            Popped::Failed(err) => ctx.fail_stage(err),
        }
    }
}

impl StageLogic for FlattenLogic {
    fn on_push(&mut self, _inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>) {
        let chan = match (self.unpack)(elem) {
            Ok(chan) => chan,
            Err(err) => return ctx.fail_stage(err),
        };
        let token = self.next_token;
        self.next_token += 1;
        if let Err(err) = chan.attach_consumer(ctx.events(), token) {
            return ctx.fail_stage(err);
        }
        self.current = Some(chan);
        if ctx.is_pulled(OUT) {
            self.serve(ctx);
        }
    }

    fn on_pull(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if self.current.is_some() {
            self.serve(ctx);
        } else if self.upstream_done || ctx.inlet_closed(IN) {
            ctx.finish_stage();
        } else if !ctx.is_pulling(IN) {
            ctx.pull(IN);
        }
    }

    fn on_event(&mut self, event: StageEvent, ctx: &mut StageCtx<'_>) {
        if let StageEvent::SubReady { token } = event {
            if token + 1 == self.next_token && self.waiting && ctx.is_pulled(OUT) {
                self.serve(ctx);
            }
        }
    }

    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        self.upstream_done = true;
        if self.current.is_none() {
            ctx.finish_stage();
        }
    }

    fn on_downstream_cancel(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        if let Some(chan) = self.current.take() {
            chan.cancel();
        }
        ctx.finish_stage();
    }

    fn on_abort(&mut self, _error: &Error) {
        if let Some(chan) = self.current.take() {
            chan.cancel();
        }
    }

    fn has_pending(&self) -> bool {
        self.current.is_some()
    }
}
