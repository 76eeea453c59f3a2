use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use cascade_types::{
    DataBag, DispatchError, DispatchResult, EventId, HandlerFailure, HandlerId, PhaseSet,
    Resumption, Stage, Target,
};

use crate::builder::RegistrationBuilder;
use crate::dispatcher::Dispatcher;
use crate::entry::HandlerEntry;
use crate::machine::MachineState;

/// Construction options for an event.
///
/// A missing dispatcher binds the process-wide default at construction time.
#[derive(Clone, Default)]
pub struct EventOptions {
    dispatcher: Option<Dispatcher>,
    owner: Option<Arc<dyn Any + Send + Sync>>,
}

impl EventOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch through `dispatcher` instead of the process-wide default.
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Attach the owning domain object. Instance-filtered handlers match it
    /// by handle identity.
    pub fn owner<T: Any + Send + Sync>(mut self, owner: &Arc<T>) -> Self {
        let erased: Arc<dyn Any + Send + Sync> = owner.clone();
        self.owner = Some(erased);
        self
    }
}

/// Mutable per-event engine state. Every field here is only touched under
/// the event's state mutex.
pub(crate) struct EventState {
    pub(crate) stage: Stage,
    pub(crate) completed_phases: PhaseSet,
    pub(crate) cancelled: bool,
    pub(crate) failed: bool,
    /// True only between the engine unwinding at a pause point and the
    /// resumption that re-enters it.
    pub(crate) waiting: bool,
    /// Set when `waiting` came from an in-phase pause (Configure, or a
    /// blocking Execute/Cleanup handler) rather than an Execute phase-end
    /// park on outstanding waiters.
    pub(crate) paused_in_phase: bool,
    /// Requested by the last handler result; converted into `waiting` (or
    /// cancelled by a deferred resumption) at the next engine checkpoint.
    pub(crate) pause_pending: bool,
    pub(crate) completed: bool,
    pub(crate) callbacks_attached: bool,
    pub(crate) dispatched: bool,
    /// True while some thread is inside the drive loop for this event.
    /// Resumptions arriving in that window are deferred, never re-entrant.
    pub(crate) driving: bool,
    pub(crate) deferred: Vec<Resumption>,
    pub(crate) error_message: Option<String>,
    pub(crate) errors: Vec<HandlerFailure>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) scoped: Vec<Arc<HandlerEntry>>,
    pub(crate) machine: Option<MachineState>,
    pub(crate) dispatch_started: Option<Instant>,
}

impl EventState {
    fn new(dispatcher: Dispatcher) -> Self {
        Self {
            stage: Stage::Unstarted,
            completed_phases: PhaseSet::empty(),
            cancelled: false,
            failed: false,
            waiting: false,
            paused_in_phase: false,
            pause_pending: false,
            completed: false,
            callbacks_attached: false,
            dispatched: false,
            driving: false,
            deferred: Vec::new(),
            error_message: None,
            errors: Vec::new(),
            dispatcher,
            scoped: Vec::new(),
            machine: None,
            dispatch_started: None,
        }
    }
}

struct EventInner {
    id: EventId,
    created_at: DateTime<Utc>,
    kind: TypeId,
    kind_name: &'static str,
    owner: Option<Arc<dyn Any + Send + Sync>>,
    data: DataBag,
    state: Mutex<EventState>,
}

/// The stateful unit driven through the phase machine.
///
/// `Event` is a cheap cloneable handle; clones observe and control the same
/// underlying dispatch. The kind tag `K` keys global handler selection.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new<K: 'static>(options: EventOptions) -> Self {
        let dispatcher = options
            .dispatcher
            .unwrap_or_else(|| Dispatcher::global().clone());
        Self {
            inner: Arc::new(EventInner {
                id: EventId::new(),
                created_at: Utc::now(),
                kind: TypeId::of::<K>(),
                kind_name: std::any::type_name::<K>(),
                owner: options.owner,
                data: DataBag::new(),
                state: Mutex::new(EventState::new(dispatcher)),
            }),
        }
    }

    pub fn id(&self) -> EventId {
        self.inner.id
    }

    /// Wall-clock construction stamp, for logs and debugging only; elapsed
    /// time observed by handlers is measured monotonically.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// The kind tag used for global handler selection.
    pub fn kind(&self) -> TypeId {
        self.inner.kind
    }

    pub fn kind_name(&self) -> &'static str {
        self.inner.kind_name
    }

    /// The owning domain object, when one was attached.
    pub fn owner(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.owner.clone()
    }

    /// The keyed bag handlers use to exchange values.
    pub fn data(&self) -> &DataBag {
        &self.inner.data
    }

    pub fn stage(&self) -> Stage {
        self.lock_state().stage
    }

    pub fn completed_phases(&self) -> PhaseSet {
        self.lock_state().completed_phases
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock_state().cancelled
    }

    pub fn has_failures(&self) -> bool {
        self.lock_state().failed
    }

    pub fn is_waiting(&self) -> bool {
        self.lock_state().waiting
    }

    pub fn is_completed(&self) -> bool {
        self.lock_state().completed
    }

    /// Message of the first recorded failure, if any.
    pub fn error_message(&self) -> Option<String> {
        self.lock_state().error_message.clone()
    }

    /// Snapshot of the failures recorded so far, in invocation order.
    pub fn errors(&self) -> Vec<HandlerFailure> {
        self.lock_state().errors.clone()
    }

    /// Time since `dispatch` began, or `None` before dispatch.
    pub fn elapsed(&self) -> Option<Duration> {
        self.lock_state().dispatch_started.map(|t| t.elapsed())
    }

    /// Attach event-scoped handlers. Allowed at most once, and only before
    /// dispatch; the entries are discarded when the event finishes.
    pub fn with_callbacks(
        &self,
        builder: RegistrationBuilder,
    ) -> Result<Vec<HandlerId>, DispatchError> {
        let entries = builder.build().map_err(DispatchError::Registration)?;
        let mut state = self.lock_state();
        if state.dispatched {
            return Err(DispatchError::AlreadyDispatched);
        }
        if state.callbacks_attached {
            return Err(DispatchError::CallbacksAlreadyAttached);
        }
        state.callbacks_attached = true;
        let ids = entries.iter().map(|e| e.id()).collect();
        state.scoped.extend(entries);
        Ok(ids)
    }

    /// Begin processing through the bound dispatcher.
    pub fn dispatch(&self) -> Result<DispatchResult, DispatchError> {
        self.dispatcher().dispatch(self)
    }

    /// Signal completion of external work this dispatch is waiting on.
    pub fn resume(&self) -> Result<DispatchResult, DispatchError> {
        self.dispatcher().resume(self)
    }

    /// Signal completion and request cancellation of the event.
    pub fn abort(&self) -> Result<DispatchResult, DispatchError> {
        self.dispatcher().abort(self)
    }

    /// Signal completion and mark the event failed.
    pub fn fail(&self) -> Result<DispatchResult, DispatchError> {
        self.dispatcher().fail(self)
    }

    /// The dispatcher that owns (or will own) processing.
    pub fn dispatcher(&self) -> Dispatcher {
        self.lock_state().dispatcher.clone()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EventState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Clone of the scoped entries registered against `target`.
    pub(crate) fn scoped_entries_for(&self, target: Target) -> Vec<Arc<HandlerEntry>> {
        let state = self.lock_state();
        state
            .scoped
            .iter()
            .filter(|e| e.target() == target)
            .cloned()
            .collect()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind_name)
            .field("stage", &state.stage)
            .field("cancelled", &state.cancelled)
            .field("failed", &state.failed)
            .field("waiting", &state.waiting)
            .finish()
    }
}
