//! The resumption surface and the pre-unwind race.
//!
//! `resume`/`abort`/`fail` land here. Three states are possible at the
//! moment of the call, and each gets a different treatment:
//!
//! - The event is waiting: the intent's flag effect is applied, the pause is
//!   released (or one outstanding waiter is accounted for), and the calling
//!   thread re-enters the drive loop.
//! - The engine is driving and the event is not yet waiting: the intent is
//!   queued on the event and applied at the engine's next checkpoint. This
//!   is the pre-unwind race (the ostensibly asynchronous operation finished
//!   before its handler returned Waiting), and it must never re-enter the
//!   engine from inside itself.
//! - Neither: the call is misuse; it is logged and rejected without touching
//!   event state.
//!
//! All decisions happen under the event's state mutex, which is what
//! serializes racing resumptions from different threads.

use tracing::{debug, trace, warn};

use cascade_types::{DispatchError, DispatchResult, Resumption};

use crate::dispatcher::Dispatcher;
use crate::event::{Event, EventState};

/// Service one `resume`/`abort`/`fail` call against `event`.
pub(crate) fn signal(
    dispatcher: &Dispatcher,
    event: &Event,
    kind: Resumption,
) -> Result<DispatchResult, DispatchError> {
    {
        let mut state = event.lock_state();
        if state.waiting {
            apply_intent(&mut state, kind);
            if state.paused_in_phase {
                state.paused_in_phase = false;
                state.waiting = false;
                state.driving = true;
            } else {
                // Parked at an Execute phase end on outstanding waiters.
                let remaining = match state.machine.as_mut() {
                    Some(machine) => {
                        machine.outstanding_waiters =
                            machine.outstanding_waiters.saturating_sub(1);
                        machine.outstanding_waiters
                    }
                    None => 0,
                };
                if remaining > 0 && kind != Resumption::Abort {
                    trace!(event = %event.id(), remaining, "waiter resolved; event stays parked");
                    return Ok(DispatchResult::Waiting);
                }
                state.waiting = false;
                state.driving = true;
            }
        } else if state.driving {
            state.deferred.push(kind);
            trace!(
                event = %event.id(),
                kind = kind.name(),
                "resumption deferred until the engine's next checkpoint"
            );
            return Ok(DispatchResult::Waiting);
        } else {
            warn!(
                event = %event.id(),
                kind = kind.name(),
                "resumption rejected: event is neither waiting nor processing"
            );
            return Err(DispatchError::InvalidResumption);
        }
    }
    debug!(event = %event.id(), kind = kind.name(), "event resumed");
    Ok(super::drive(dispatcher, event))
}

/// Apply queued intents at an engine checkpoint. Caller holds the state
/// lock; nothing here may re-lock the event.
///
/// Each intent applies its flag effect, then satisfies a pending pause
/// before an outstanding waiter: when both exist the engine cannot know
/// which operation completed, and releasing the pause is the choice that
/// keeps the machine moving.
pub(crate) fn settle_deferred(event: &Event, state: &mut EventState) {
    while !state.deferred.is_empty() {
        let intent = state.deferred.remove(0);
        apply_intent(state, intent);
        if state.pause_pending {
            // The pausing handler's completion overtook its Waiting return.
            state.pause_pending = false;
            trace!(event = %event.id(), intent = intent.name(), "pre-unwind resumption consumed a pending pause");
            continue;
        }
        let absorbed = match state.machine.as_mut() {
            Some(machine) if machine.outstanding_waiters > 0 => {
                machine.outstanding_waiters -= 1;
                true
            }
            _ => false,
        };
        if !absorbed {
            warn!(
                event = %event.id(),
                intent = intent.name(),
                "resumption had no outstanding waiter to satisfy"
            );
        }
    }
}

fn apply_intent(state: &mut EventState, kind: Resumption) {
    match kind {
        Resumption::Resume => {}
        Resumption::Abort => state.cancelled = true,
        Resumption::Fail => state.failed = true,
    }
}
