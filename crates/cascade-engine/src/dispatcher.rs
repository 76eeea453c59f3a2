use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use cascade_types::{
    DispatchError, DispatchResult, HandlerId, RegistrationError, Resumption, Target,
};

use crate::builder::RegistrationBuilder;
use crate::entry::HandlerEntry;
use crate::event::Event;
use crate::machine;

static GLOBAL: Lazy<Dispatcher> = Lazy::new(Dispatcher::new);

#[derive(Default)]
struct DispatcherInner {
    /// Event kind → entries in insertion order. Sorting happens per stage
    /// at selection time, not here.
    registry: Mutex<HashMap<TypeId, Vec<Arc<HandlerEntry>>>>,
}

/// The engine: owns the global handler registry, drives events through the
/// phase machine, and services resumptions.
///
/// `Dispatcher` is a cheap cloneable handle; clones share one registry.
/// Different events may be dispatched concurrently from different threads.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default, used by events constructed without an
    /// explicit dispatcher.
    pub fn global() -> &'static Dispatcher {
        &GLOBAL
    }

    /// Register the builder's entries for event kind `K`, returning their
    /// IDs in insertion order.
    pub fn register<K: 'static>(
        &self,
        builder: RegistrationBuilder,
    ) -> Result<Vec<HandlerId>, RegistrationError> {
        Ok(self.install::<K>(builder.build()?))
    }

    /// Register a pre-built entry list for event kind `K`.
    pub fn install<K: 'static>(&self, entries: Vec<Arc<HandlerEntry>>) -> Vec<HandlerId> {
        let ids: Vec<HandlerId> = entries.iter().map(|e| e.id()).collect();
        let mut registry = self.lock_registry();
        registry.entry(TypeId::of::<K>()).or_default().extend(entries);
        ids
    }

    /// Remove a registration by ID. Returns whether it was present.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut registry = self.lock_registry();
        let mut removed = false;
        for entries in registry.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.id() != id);
            removed |= entries.len() != before;
        }
        removed
    }

    /// Number of live registrations for event kind `K`.
    pub fn handler_count<K: 'static>(&self) -> usize {
        let registry = self.lock_registry();
        registry.get(&TypeId::of::<K>()).map_or(0, Vec::len)
    }

    /// Begin processing `event`. Runs the phase machine on the calling
    /// thread until the event finishes or parks on a waiting handler.
    ///
    /// Never panics on handler failure; handler errors surface through the
    /// event's error list and the returned result.
    pub fn dispatch(&self, event: &Event) -> Result<DispatchResult, DispatchError> {
        {
            let mut state = event.lock_state();
            if state.dispatched {
                warn!(event = %event.id(), "dispatch rejected: already dispatched");
                return Err(DispatchError::AlreadyDispatched);
            }
            state.dispatched = true;
            state.driving = true;
            state.dispatcher = self.clone();
            state.dispatch_started = Some(Instant::now());
        }
        debug!(event = %event.id(), kind = event.kind_name(), "dispatch started");
        let result = machine::drive(self, event);
        debug!(event = %event.id(), result = %result, "dispatch unwound");
        Ok(result)
    }

    /// Signal completion of external work `event` is waiting on.
    pub fn resume(&self, event: &Event) -> Result<DispatchResult, DispatchError> {
        machine::signal(self, event, Resumption::Resume)
    }

    /// Signal completion and request cancellation of `event`.
    pub fn abort(&self, event: &Event) -> Result<DispatchResult, DispatchError> {
        machine::signal(self, event, Resumption::Abort)
    }

    /// Signal completion and mark `event` failed.
    pub fn fail(&self, event: &Event) -> Result<DispatchResult, DispatchError> {
        machine::signal(self, event, Resumption::Fail)
    }

    /// Clone of the global entries for `kind` registered against `target`,
    /// in insertion order. Entries whose execution cap is spent are purged
    /// from the registry on the way through.
    pub(crate) fn global_candidates(
        &self,
        kind: TypeId,
        target: Target,
    ) -> Vec<Arc<HandlerEntry>> {
        let mut registry = self.lock_registry();
        let Some(entries) = registry.get_mut(&kind) else {
            return Vec::new();
        };
        entries.retain(|e| !e.is_exhausted());
        entries
            .iter()
            .filter(|e| e.target() == target)
            .cloned()
            .collect()
    }

    fn lock_registry(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<TypeId, Vec<Arc<HandlerEntry>>>> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock_registry();
        let entries: usize = registry.values().map(Vec::len).sum();
        f.debug_struct("Dispatcher")
            .field("kinds", &registry.len())
            .field("entries", &entries)
            .finish()
    }
}
