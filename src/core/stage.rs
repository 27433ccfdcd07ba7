//! The stage protocol: signals, the stage logic contract, and async re-entry
//! events.
//!
//! Every processing unit in a graph, built-in operator or custom stage,
//! implements [`StageLogic`]. A stage owns private mutable state and
//! is only ever reached through its protocol callbacks; the interpreter
//! guarantees callbacks run to completion, one at a time, with signals
//! delivered in FIFO order per connection.

use std::any::Any;

use crate::core::error::{Error, Result};
use crate::core::interpreter::StageCtx;

/// A type-erased stream element.
///
/// Elements cross stage boundaries erased; the typed `Source`/`Flow`/`Sink`
/// DSL guarantees the runtime types line up, so downcasts inside operator
/// closures only fail on internal bugs.
pub type Elem = Box<dyn Any + Send>;

/// Recover a typed value from an erased element without panicking.
pub(crate) fn unbox<T: 'static>(elem: Elem, context: &str) -> Result<T> {
    match elem.downcast::<T>() {
        Ok(boxed) => Ok(*boxed),
        Err(_) => Err(Error::type_mismatch(context)),
    }
}

/// The only cross-stage communication primitive.
///
/// Signals travel along a connected port pair; at most one unacknowledged
/// signal may be outstanding per direction per connection. `Push`, `Complete`
/// and `Error` travel downstream; `Pull` and `Cancel` travel upstream.
pub enum Signal {
    /// An element, satisfying a prior `Pull`.
    Push(Elem),
    /// Demand for the next element.
    Pull,
    /// Upstream finished successfully.
    Complete,
    /// Upstream failed.
    Error(Error),
    /// Downstream lost interest.
    Cancel,
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Push(_) => write!(f, "Push(..)"),
            Signal::Pull => write!(f, "Pull"),
            Signal::Complete => write!(f, "Complete"),
            Signal::Error(e) => write!(f, "Error({e})"),
            Signal::Cancel => write!(f, "Cancel"),
        }
    }
}

/// An event re-entering a stage after a sanctioned suspension: a timer
/// firing, an asynchronous computation completing, or a sub-stream mailbox
/// changing state.
pub enum StageEvent {
    /// A timer scheduled with [`StageCtx::schedule_timer`] fired.
    Timer { token: u64 },
    /// A future watched with [`StageCtx::watch_future`] resolved.
    FutureDone { token: u64, result: Result<Elem> },
    /// A sub-stream mailbox gained an element or reached a terminal state.
    SubReady { token: u64 },
    /// A sub-stream mailbox freed space or its consumer caught up.
    SubSpace { token: u64 },
    /// A sub-stream consumer cancelled.
    SubCancelled { token: u64 },
}

impl std::fmt::Debug for StageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageEvent::Timer { token } => write!(f, "Timer({token})"),
            StageEvent::FutureDone { token, .. } => write!(f, "FutureDone({token})"),
            StageEvent::SubReady { token } => write!(f, "SubReady({token})"),
            StageEvent::SubSpace { token } => write!(f, "SubSpace({token})"),
            StageEvent::SubCancelled { token } => write!(f, "SubCancelled({token})"),
        }
    }
}

/// A handle for delivering a [`StageEvent`] back into a specific stage of a
/// running graph. Cheap to clone; sends are lossy once the graph has
/// terminated.
#[derive(Clone)]
pub struct StageEvents {
    pub(crate) stage: usize,
    pub(crate) tx: tokio::sync::mpsc::UnboundedSender<RoutedEvent>,
}

impl StageEvents {
    /// Deliver an event to the owning stage. The event re-enters the stage's
    /// protocol exactly once, never concurrently with another callback.
    pub fn send(&self, event: StageEvent) {
        let _ = self.tx.send(RoutedEvent {
            stage: self.stage,
            event,
        });
    }
}

pub(crate) struct RoutedEvent {
    pub(crate) stage: usize,
    pub(crate) event: StageEvent,
}

/// The contract every processing stage implements.
///
/// Callbacks receive a [`StageCtx`] through which all effects flow: pushing
/// and pulling on ports, emitting buffered sequences, terminating, and
/// registering suspensions. Port indices are positions in the stage's shape
/// (inlets and outlets are numbered independently from zero).
///
/// Defaults implement the conventional linear behavior: completion and
/// failure propagate downstream, cancellation propagates upstream.
pub trait StageLogic: Send {
    /// Invoked once when the graph starts, before any signal flows. Sinks
    /// issue their initial demand here.
    fn on_start(&mut self, _ctx: &mut StageCtx<'_>) {}

    /// An upstream neighbor delivered an element to `inlet`, satisfying a
    /// prior pull.
    fn on_push(&mut self, inlet: usize, elem: Elem, ctx: &mut StageCtx<'_>);

    /// Downstream requested the next element on `outlet`. The stage must
    /// act: push, propagate demand upstream, terminate, queue emissions, or
    /// hold a sanctioned suspension. Returning having done none of these is
    /// a protocol violation.
    fn on_pull(&mut self, outlet: usize, ctx: &mut StageCtx<'_>);

    /// Upstream on `inlet` finished. A stage may still emit buffered output
    /// before finishing downstream.
    fn on_upstream_finish(&mut self, _inlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.finish_stage();
    }

    /// Upstream on `inlet` failed.
    fn on_upstream_failure(&mut self, _inlet: usize, error: Error, ctx: &mut StageCtx<'_>) {
        ctx.fail_stage(error);
    }

    /// Downstream on `outlet` cancelled. The default tears the stage down,
    /// propagating cancellation upstream.
    fn on_downstream_cancel(&mut self, _outlet: usize, ctx: &mut StageCtx<'_>) {
        ctx.finish_stage();
    }

    /// A suspension resolved: timer fired, future completed, or a sub-stream
    /// mailbox changed state.
    fn on_event(&mut self, _event: StageEvent, _ctx: &mut StageCtx<'_>) {}

    /// Whether the stage currently holds a sanctioned suspension (a pending
    /// timer, in-flight asynchronous computation, or sub-stream wait).
    /// Consulted by the protocol-violation check after `on_pull`.
    fn has_pending(&self) -> bool {
        false
    }

    /// The materialized graph is being aborted. Stages holding materialized
    /// value channels resolve them here; buffered state is dropped.
    fn on_abort(&mut self, _error: &Error) {}
}
