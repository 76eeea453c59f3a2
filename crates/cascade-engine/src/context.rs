use std::time::Duration;

use cascade_types::{DataBag, DispatchError, DispatchResult, HandlerFailure, Phase, Priority, Stage};

use crate::event::Event;

/// The view a handler receives while it runs.
///
/// Everything here is a read-only observation of the in-flight dispatch,
/// except `resume`/`abort`/`fail`, which are the async-completion surface.
/// Those three are safe to call from any thread and from inside the handler
/// itself; a call that races the handler's own Waiting return is queued and
/// applied at the engine's next checkpoint.
pub struct HandlerContext {
    event: Event,
    stage: Stage,
    priority: Priority,
    index: usize,
}

impl HandlerContext {
    pub(crate) fn new(event: Event, stage: Stage, priority: Priority, index: usize) -> Self {
        Self {
            event,
            stage,
            priority,
            index,
        }
    }

    /// The event being processed.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Shortcut to the event's data bag.
    pub fn data(&self) -> &DataBag {
        self.event.data()
    }

    /// The stage this handler was selected for.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The business phase, when the stage is one.
    pub fn phase(&self) -> Option<Phase> {
        self.stage.phase()
    }

    /// The priority this handler was registered with.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Ordinal of this handler within the stage's selected set.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Time since `dispatch` began on this event.
    pub fn elapsed(&self) -> Duration {
        self.event.elapsed().unwrap_or_default()
    }

    /// Snapshot of the failures recorded so far, in invocation order.
    pub fn errors(&self) -> Vec<HandlerFailure> {
        self.event.errors()
    }

    /// Signal completion of external work this dispatch is waiting on.
    pub fn resume(&self) -> Result<DispatchResult, DispatchError> {
        self.event.resume()
    }

    /// Signal completion and request cancellation of the event.
    pub fn abort(&self) -> Result<DispatchResult, DispatchError> {
        self.event.abort()
    }

    /// Signal completion and mark the event failed.
    pub fn fail(&self) -> Result<DispatchResult, DispatchError> {
        self.event.fail()
    }
}
