use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use cascade_types::{HandlerId, PhaseResult, Priority, Target};

use crate::context::HandlerContext;
use crate::event::Event;

/// Error type handlers may surface. Captured into the event's error list and
/// never propagated out of `dispatch`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler callable returns to the engine.
pub type HandlerResult = Result<PhaseResult, HandlerError>;

pub(crate) type HandlerFn = Arc<dyn Fn(&HandlerContext) -> HandlerResult + Send + Sync>;
pub(crate) type PredicateFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// One registered handler: identity, selection criteria, and the callable.
///
/// Entries are shared `Arc`s. For global registrations the execution count
/// therefore persists across events, which is what makes `max_executions` a
/// registry-wide cap rather than a per-event one.
pub struct HandlerEntry {
    id: HandlerId,
    target: Target,
    priority: Priority,
    predicate: Option<PredicateFn>,
    instance_filter: Option<Arc<dyn Any + Send + Sync>>,
    max_executions: Option<u32>,
    execution_count: AtomicU32,
    blocks_on_waiting: bool,
    handler: HandlerFn,
}

impl HandlerEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        target: Target,
        priority: Priority,
        predicate: Option<PredicateFn>,
        instance_filter: Option<Arc<dyn Any + Send + Sync>>,
        max_executions: Option<u32>,
        blocks_on_waiting: bool,
        handler: HandlerFn,
    ) -> Self {
        Self {
            id: HandlerId::new(),
            target,
            priority,
            predicate,
            instance_filter,
            max_executions,
            execution_count: AtomicU32::new(0),
            blocks_on_waiting,
            handler,
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// None means unlimited.
    pub fn max_executions(&self) -> Option<u32> {
        self.max_executions
    }

    /// How many times the handler has run so far.
    pub fn execution_count(&self) -> u32 {
        self.execution_count.load(Ordering::Relaxed)
    }

    /// Whether a Waiting return from this handler pauses the phase in place
    /// rather than accumulating on the outstanding-waiter count. Only
    /// consulted in Execute and Cleanup.
    pub fn blocks_on_waiting(&self) -> bool {
        self.blocks_on_waiting
    }

    /// Whether the execution cap has been reached.
    pub(crate) fn is_exhausted(&self) -> bool {
        match self.max_executions {
            Some(limit) => self.execution_count() >= limit,
            None => false,
        }
    }

    /// Whether the instance filter admits `event`. Filters match by handle
    /// identity against the event's owner, never by value.
    pub(crate) fn matches_instance(&self, event: &Event) -> bool {
        match &self.instance_filter {
            Some(wanted) => match event.owner() {
                Some(owner) => Arc::ptr_eq(wanted, &owner),
                None => false,
            },
            None => true,
        }
    }

    /// Whether the predicate admits `event`. Absent predicates admit all.
    pub(crate) fn passes_predicate(&self, event: &Event) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(event),
            None => true,
        }
    }

    pub(crate) fn invoke(&self, ctx: &HandlerContext) -> HandlerResult {
        (self.handler)(ctx)
    }

    pub(crate) fn record_execution(&self) {
        self.execution_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("priority", &self.priority)
            .field("max_executions", &self.max_executions)
            .field("execution_count", &self.execution_count())
            .field("blocks_on_waiting", &self.blocks_on_waiting)
            .field("has_predicate", &self.predicate.is_some())
            .field("has_instance_filter", &self.instance_filter.is_some())
            .finish()
    }
}
