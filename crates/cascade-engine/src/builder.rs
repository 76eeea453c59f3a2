use std::any::Any;
use std::sync::Arc;

use cascade_types::{
    HandlerId, Phase, PhaseResult, Priority, RegistrationError, Target, Terminal,
};

use crate::context::HandlerContext;
use crate::entry::{HandlerEntry, HandlerFn, HandlerResult};
use crate::event::Event;

/// Fluent construction of handler entries.
///
/// The same builder serves both registration surfaces: pass it to
/// [`crate::Dispatcher::register`] for global entries or to
/// [`Event::with_callbacks`] for event-scoped ones.
///
/// Each `on_phase`/`on_terminal` call opens one entry draft; the draft's
/// `handler`/`try_handler` finalizer consumes it and appends the entry. A
/// draft that is never finalized registers nothing, so an entry without a
/// callable cannot exist.
#[derive(Default)]
pub struct RegistrationBuilder {
    entries: Vec<Arc<HandlerEntry>>,
}

impl RegistrationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an entry draft targeting business phase `phase`.
    pub fn on_phase(&mut self, phase: Phase) -> EntryBuilder<'_> {
        EntryBuilder::new(self, Target::Phase(phase))
    }

    /// Open an entry draft targeting terminal state `terminal`.
    pub fn on_terminal(&mut self, terminal: Terminal) -> EntryBuilder<'_> {
        EntryBuilder::new(self, Target::Terminal(terminal))
    }

    /// Number of finalized entries so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finish the builder, yielding the entry list. Errs on an empty set so
    /// a forgotten finalizer surfaces instead of silently registering
    /// nothing.
    pub fn build(self) -> Result<Vec<Arc<HandlerEntry>>, RegistrationError> {
        if self.entries.is_empty() {
            return Err(RegistrationError::Empty);
        }
        Ok(self.entries)
    }
}

/// One entry under construction. All knobs default to the permissive
/// setting: Normal priority, no predicate, no instance filter, unlimited
/// executions, non-blocking waits.
pub struct EntryBuilder<'a> {
    owner: &'a mut RegistrationBuilder,
    target: Target,
    priority: Priority,
    predicate: Option<Arc<dyn Fn(&Event) -> bool + Send + Sync>>,
    instance_filter: Option<Arc<dyn Any + Send + Sync>>,
    max_executions: Option<u32>,
    blocks_on_waiting: bool,
}

impl<'a> EntryBuilder<'a> {
    fn new(owner: &'a mut RegistrationBuilder, target: Target) -> Self {
        Self {
            owner,
            target,
            priority: Priority::default(),
            predicate: None,
            instance_filter: None,
            max_executions: None,
            blocks_on_waiting: false,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Only run the handler when `predicate` admits the event. Evaluated at
    /// stage entry, once per dispatch.
    pub fn when(mut self, predicate: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Only run the handler for events whose owner is this exact instance
    /// (matched by handle identity).
    pub fn for_instance<T: Any + Send + Sync>(mut self, instance: &Arc<T>) -> Self {
        let erased: Arc<dyn Any + Send + Sync> = instance.clone();
        self.instance_filter = Some(erased);
        self
    }

    /// Cap how many times the handler may run across all events.
    pub fn max_executions(mut self, limit: u32) -> Self {
        self.max_executions = Some(limit);
        self
    }

    /// In Execute/Cleanup, make a Waiting return pause the phase in place
    /// instead of accumulating on the outstanding-waiter count.
    pub fn blocks_on_waiting(mut self, blocks: bool) -> Self {
        self.blocks_on_waiting = blocks;
        self
    }

    /// Finalize with an infallible handler.
    pub fn handler(
        self,
        handler: impl Fn(&HandlerContext) -> PhaseResult + Send + Sync + 'static,
    ) -> HandlerId {
        self.finish(Arc::new(move |ctx: &HandlerContext| Ok(handler(ctx))))
    }

    /// Finalize with a fallible handler. An `Err` is captured into the
    /// event's error list and treated as Failure.
    pub fn try_handler(
        self,
        handler: impl Fn(&HandlerContext) -> HandlerResult + Send + Sync + 'static,
    ) -> HandlerId {
        self.finish(Arc::new(handler))
    }

    fn finish(self, handler: HandlerFn) -> HandlerId {
        let entry = HandlerEntry::new(
            self.target,
            self.priority,
            self.predicate,
            self.instance_filter,
            self.max_executions,
            self.blocks_on_waiting,
            handler,
        );
        let id = entry.id();
        self.owner.entries.push(Arc::new(entry));
        id
    }
}
