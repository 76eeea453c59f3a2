//! The phase state machine.
//!
//! One dispatch walks Validate → Configure → Execute → Cleanup, then the
//! terminal states (Success or Cancelled, then Completed), then Finished.
//! The walk is a loop of small locked steps: each iteration decides the next
//! action under the event's state mutex, then performs it with no locks held
//! (handler invocation, stage selection). A handler can therefore call back
//! into the engine, for resumptions, data-bag access, even registrations,
//! without deadlocking.
//!
//! Suspension is cooperative. A pause unwinds the loop back to the caller of
//! `dispatch` (or of the resumption that re-entered it); re-entry happens on
//! whichever thread services the next resumption. The `driving` flag
//! guarantees at most one thread is inside the loop per event.

mod select;
mod waiting;

pub(crate) use waiting::signal;

use std::sync::Arc;

use tracing::{debug, trace, warn};

use cascade_types::{DispatchResult, Phase, PhaseResult, Priority, Stage, Target, Terminal};

use crate::context::HandlerContext;
use crate::dispatcher::Dispatcher;
use crate::entry::{HandlerEntry, HandlerResult};
use crate::event::{Event, EventState};

/// Engine cursor for the stage currently being processed. Lives on the
/// event (under its state mutex) so a parked dispatch can be picked up by a
/// resumption on another thread.
pub(crate) struct MachineState {
    /// Handler snapshot selected at stage entry, in execution order.
    pub(crate) queue: Vec<Arc<HandlerEntry>>,
    /// Index of the next handler to run.
    pub(crate) next_index: usize,
    /// Waiting returns in Execute/Cleanup not yet matched by a resumption.
    pub(crate) outstanding_waiters: usize,
}

enum Step {
    /// Enter `stage`: select handlers and install a fresh cursor.
    Open(Stage),
    /// Run one handler.
    Invoke {
        entry: Arc<HandlerEntry>,
        stage: Stage,
        index: usize,
    },
    /// Unwind; the event is waiting.
    Park,
    /// Unwind; the event finished with this result.
    Done(DispatchResult),
}

/// Run the machine until the event parks or finishes.
///
/// Precondition: the calling thread owns the drive (it set `driving` under
/// the state lock in `dispatch` or `signal`).
pub(crate) fn drive(dispatcher: &Dispatcher, event: &Event) -> DispatchResult {
    loop {
        match next_step(event) {
            Step::Open(stage) => open_stage(dispatcher, event, stage),
            Step::Invoke {
                entry,
                stage,
                index,
            } => invoke(event, entry, stage, index),
            Step::Park => return DispatchResult::Waiting,
            Step::Done(result) => return result,
        }
    }
}

/// Decide the next action. This is the engine checkpoint: queued
/// resumptions settle here, pending pauses commit here, and cancellation is
/// honoured here.
fn next_step(event: &Event) -> Step {
    let mut state = event.lock_state();
    waiting::settle_deferred(event, &mut state);

    if state.pause_pending {
        // No queued resumption cancelled it, so the pause is real.
        state.pause_pending = false;
        state.waiting = true;
        state.paused_in_phase = true;
        state.driving = false;
        return Step::Park;
    }

    match state.stage {
        Stage::Unstarted => Step::Open(Stage::Phase(Phase::Validate)),
        Stage::Phase(phase) => {
            if state.cancelled {
                if let Some(machine) = state.machine.take() {
                    if machine.outstanding_waiters > 0 {
                        debug!(
                            event = %event.id(),
                            abandoned = machine.outstanding_waiters,
                            "cancellation abandons outstanding waiters"
                        );
                    }
                }
                return Step::Open(Stage::Terminal(Terminal::Cancelled));
            }

            let (taken, outstanding) = match state.machine.as_mut() {
                Some(machine) => (take_next_entry(machine), machine.outstanding_waiters),
                None => return Step::Open(Stage::Phase(phase)),
            };
            if let Some((index, entry)) = taken {
                return Step::Invoke {
                    entry,
                    stage: Stage::Phase(phase),
                    index,
                };
            }

            // All handlers have returned.
            if outstanding > 0 {
                if phase == Phase::Cleanup {
                    warn!(
                        event = %event.id(),
                        abandoned = outstanding,
                        "cleanup ended with unresolved waiters"
                    );
                    if let Some(machine) = state.machine.as_mut() {
                        machine.outstanding_waiters = 0;
                    }
                } else {
                    state.waiting = true;
                    state.driving = false;
                    return Step::Park;
                }
            }

            state.completed_phases.insert(phase.bit());
            state.machine = None;
            match phase.next() {
                Some(next) => Step::Open(Stage::Phase(next)),
                None => Step::Open(Stage::Terminal(route_terminal(&state))),
            }
        }
        Stage::Terminal(terminal) => {
            let taken = match state.machine.as_mut() {
                Some(machine) => take_next_entry(machine),
                None => return Step::Open(Stage::Terminal(terminal)),
            };
            if let Some((index, entry)) = taken {
                return Step::Invoke {
                    entry,
                    stage: Stage::Terminal(terminal),
                    index,
                };
            }

            state.machine = None;
            match terminal {
                Terminal::Success | Terminal::Cancelled => {
                    Step::Open(Stage::Terminal(Terminal::Completed))
                }
                Terminal::Completed => {
                    state.stage = Stage::Finished;
                    state.completed = true;
                    state.driving = false;
                    // Scoped entries live exactly as long as their event.
                    state.scoped.clear();
                    Step::Done(final_result(&state))
                }
            }
        }
        Stage::Finished => {
            state.driving = false;
            Step::Done(final_result(&state))
        }
    }
}

/// Pop the next runnable entry, skipping any whose execution cap was spent
/// since selection (another event may have consumed a shared cap).
fn take_next_entry(machine: &mut MachineState) -> Option<(usize, Arc<HandlerEntry>)> {
    while machine.next_index < machine.queue.len() {
        let index = machine.next_index;
        machine.next_index += 1;
        let entry = Arc::clone(&machine.queue[index]);
        if entry.is_exhausted() {
            continue;
        }
        return Some((index, entry));
    }
    None
}

/// Select handlers for `stage` and install a fresh cursor. Selection runs
/// with no event lock held so predicates may read the event freely.
fn open_stage(dispatcher: &Dispatcher, event: &Event, stage: Stage) {
    let target = match stage {
        Stage::Phase(p) => Target::Phase(p),
        Stage::Terminal(t) => Target::Terminal(t),
        Stage::Unstarted | Stage::Finished => return,
    };
    let queue = select::assemble(dispatcher, event, target);
    trace!(event = %event.id(), stage = %stage, handlers = queue.len(), "entering stage");
    let mut state = event.lock_state();
    state.stage = stage;
    state.machine = Some(MachineState {
        queue,
        next_index: 0,
        outstanding_waiters: 0,
    });
}

/// Run one handler with no locks held, then fold its outcome into the event
/// state.
fn invoke(event: &Event, entry: Arc<HandlerEntry>, stage: Stage, index: usize) {
    let ctx = HandlerContext::new(event.clone(), stage, entry.priority(), index);
    trace!(event = %event.id(), handler = %entry.id(), stage = %stage, index, "invoking handler");
    let outcome = entry.invoke(&ctx);
    entry.record_execution();

    let mut state = event.lock_state();
    apply_result(event, &mut state, &entry, stage, outcome);
}

fn apply_result(
    event: &Event,
    state: &mut EventState,
    entry: &HandlerEntry,
    stage: Stage,
    outcome: HandlerResult,
) {
    let phase = match stage {
        Stage::Phase(phase) => phase,
        Stage::Terminal(_) => {
            // Terminal handlers observe; their returns are coerced to
            // Success and their errors are isolated from later terminals.
            if let Err(err) = outcome {
                debug!(event = %event.id(), handler = %entry.id(), "terminal handler failed");
                push_failure(state, entry, stage, err.to_string());
            }
            return;
        }
        Stage::Unstarted | Stage::Finished => return,
    };

    match outcome {
        Err(err) => {
            push_failure(state, entry, stage, err.to_string());
            if phase == Phase::Validate && entry.priority() == Priority::Critical {
                // The one place priority changes semantics: a failing
                // critical validation cancels instead of merely failing.
                state.cancelled = true;
            } else {
                state.failed = true;
            }
        }
        Ok(PhaseResult::Success) => {}
        Ok(PhaseResult::Failure) => state.failed = true,
        Ok(PhaseResult::Cancelled) => {
            if phase == Phase::Cleanup {
                // Local to Cleanup: the phase stops but Success still runs.
                if let Some(machine) = state.machine.as_mut() {
                    machine.next_index = machine.queue.len();
                }
            } else {
                state.cancelled = true;
            }
        }
        Ok(PhaseResult::SkipRemaining) => {
            if let Some(machine) = state.machine.as_mut() {
                machine.next_index = machine.queue.len();
            }
        }
        Ok(PhaseResult::Waiting) => match phase {
            Phase::Validate => {
                push_failure(
                    state,
                    entry,
                    stage,
                    "waiting is not permitted during validation".to_string(),
                );
                state.failed = true;
            }
            Phase::Configure => state.pause_pending = true,
            Phase::Execute | Phase::Cleanup => {
                if entry.blocks_on_waiting() {
                    state.pause_pending = true;
                } else if let Some(machine) = state.machine.as_mut() {
                    machine.outstanding_waiters += 1;
                }
            }
        },
    }
}

fn push_failure(state: &mut EventState, entry: &HandlerEntry, stage: Stage, message: String) {
    if state.error_message.is_none() {
        state.error_message = Some(message.clone());
    }
    state.errors.push(cascade_types::HandlerFailure {
        handler: entry.id(),
        stage,
        message,
    });
}

/// Which of Success/Cancelled/Completed opens after the business phases.
/// Failures run no Success handlers, so they route straight to Completed.
fn route_terminal(state: &EventState) -> Terminal {
    if state.cancelled {
        Terminal::Cancelled
    } else if state.failed {
        Terminal::Completed
    } else {
        Terminal::Success
    }
}

fn final_result(state: &EventState) -> DispatchResult {
    if state.cancelled {
        DispatchResult::Cancelled
    } else if state.failed {
        DispatchResult::Failure
    } else {
        DispatchResult::Success
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use std::sync::{Arc, Mutex};

    use cascade_types::{
        DispatchError, DispatchResult, Phase, PhaseResult, PhaseSet, Priority, Stage, Terminal,
    };

    use crate::builder::RegistrationBuilder;
    use crate::dispatcher::Dispatcher;
    use crate::event::{Event, EventOptions};

    struct Ping;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn recorded(log: &Log) -> Vec<&'static str> {
        log.lock().unwrap().clone()
    }

    fn event_on(dispatcher: &Dispatcher) -> Event {
        Event::new::<Ping>(EventOptions::new().dispatcher(dispatcher.clone()))
    }

    /// Registers one recording handler per business phase plus Success,
    /// Cancelled, and Completed terminals.
    fn register_full_trace(dispatcher: &Dispatcher, log: &Log) {
        let mut builder = RegistrationBuilder::new();
        for (phase, name) in [
            (Phase::Validate, "Validate"),
            (Phase::Configure, "Configure"),
            (Phase::Execute, "Execute"),
            (Phase::Cleanup, "Cleanup"),
        ] {
            let l = Arc::clone(log);
            builder.on_phase(phase).handler(move |_| {
                l.lock().unwrap().push(name);
                PhaseResult::Success
            });
        }
        for (terminal, name) in [
            (Terminal::Success, "Success"),
            (Terminal::Cancelled, "Cancelled"),
            (Terminal::Completed, "Completed"),
        ] {
            let l = Arc::clone(log);
            builder.on_terminal(terminal).handler(move |_| {
                l.lock().unwrap().push(name);
                PhaseResult::Success
            });
        }
        dispatcher.register::<Ping>(builder).unwrap();
    }

    #[test_log::test]
    fn happy_path_runs_phases_then_success_then_completed() {
        let dispatcher = Dispatcher::new();
        let log = log();
        register_full_trace(&dispatcher, &log);

        let event = event_on(&dispatcher);
        let result = event.dispatch().unwrap();

        assert_eq!(result, DispatchResult::Success);
        assert_eq!(
            recorded(&log),
            vec!["Validate", "Configure", "Execute", "Cleanup", "Success", "Completed"]
        );
        assert!(event.is_completed());
        assert_eq!(event.stage(), Stage::Finished);
        assert_eq!(event.completed_phases(), PhaseSet::all());
    }

    #[test]
    fn validate_cancellation_skips_remaining_business_phases() {
        let dispatcher = Dispatcher::new();
        let log = log();
        {
            let l = Arc::clone(&log);
            let mut builder = RegistrationBuilder::new();
            builder.on_phase(Phase::Validate).handler(move |_| {
                l.lock().unwrap().push("Validate");
                PhaseResult::Cancelled
            });
            dispatcher.register::<Ping>(builder).unwrap();
        }
        register_full_trace(&dispatcher, &log);

        let event = event_on(&dispatcher);
        let result = event.dispatch().unwrap();

        assert_eq!(result, DispatchResult::Cancelled);
        assert_eq!(recorded(&log), vec!["Validate", "Cancelled", "Completed"]);
        assert!(event.is_cancelled());
        assert_eq!(event.completed_phases(), PhaseSet::empty());
    }

    #[test]
    fn cleanup_cancellation_does_not_prevent_success() {
        let dispatcher = Dispatcher::new();
        let log = log();
        let mut builder = RegistrationBuilder::new();
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Cleanup).handler(move |_| {
            l.lock().unwrap().push("Cleanup");
            PhaseResult::Cancelled
        });
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Cleanup).handler(move |_| {
            l.lock().unwrap().push("Cleanup-after");
            PhaseResult::Success
        });
        let l = Arc::clone(&log);
        builder.on_terminal(Terminal::Success).handler(move |_| {
            l.lock().unwrap().push("Success");
            PhaseResult::Success
        });
        let l = Arc::clone(&log);
        builder.on_terminal(Terminal::Cancelled).handler(move |_| {
            l.lock().unwrap().push("Cancelled");
            PhaseResult::Success
        });
        let l = Arc::clone(&log);
        builder.on_terminal(Terminal::Completed).handler(move |_| {
            l.lock().unwrap().push("Completed");
            PhaseResult::Success
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        let result = event.dispatch().unwrap();

        assert_eq!(result, DispatchResult::Success);
        assert_eq!(recorded(&log), vec!["Cleanup", "Success", "Completed"]);
        assert!(!event.is_cancelled());
        assert_eq!(event.completed_phases(), PhaseSet::all());
    }

    #[test]
    fn execute_resumption_before_unwind_completes_without_parking() {
        let dispatcher = Dispatcher::new();
        let log = log();
        let mut builder = RegistrationBuilder::new();
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Execute).handler(move |_| {
            l.lock().unwrap().push("H1-start");
            PhaseResult::Waiting
        });
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Execute).handler(move |ctx| {
            l.lock().unwrap().push("H2-executed");
            // H1's external work completes while the engine is still inside
            // the phase: the resumption must be deferred, not re-entrant.
            assert_eq!(ctx.resume().unwrap(), DispatchResult::Waiting);
            l.lock().unwrap().push("H1-resumed");
            PhaseResult::Success
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        let result = event.dispatch().unwrap();

        assert_eq!(result, DispatchResult::Success);
        assert_eq!(recorded(&log), vec!["H1-start", "H2-executed", "H1-resumed"]);
        assert!(!event.is_waiting());
        assert!(event.is_completed());
    }

    #[test_log::test]
    fn execute_resumption_after_unwind_finishes_on_resume() {
        let dispatcher = Dispatcher::new();
        let log = log();
        let mut builder = RegistrationBuilder::new();
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Execute).handler(move |_| {
            l.lock().unwrap().push("H1-start");
            PhaseResult::Waiting
        });
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Execute).handler(move |_| {
            l.lock().unwrap().push("H2-executed");
            PhaseResult::Success
        });
        let l = Arc::clone(&log);
        builder.on_terminal(Terminal::Success).handler(move |_| {
            l.lock().unwrap().push("Success");
            PhaseResult::Success
        });
        let l = Arc::clone(&log);
        builder.on_terminal(Terminal::Completed).handler(move |_| {
            l.lock().unwrap().push("Completed");
            PhaseResult::Success
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        let parked = event.dispatch().unwrap();

        assert_eq!(parked, DispatchResult::Waiting);
        assert_eq!(recorded(&log), vec!["H1-start", "H2-executed"]);
        assert!(event.is_waiting());

        log.lock().unwrap().push("H1-resumed");
        let result = event.resume().unwrap();

        assert_eq!(result, DispatchResult::Success);
        assert_eq!(
            recorded(&log),
            vec!["H1-start", "H2-executed", "H1-resumed", "Success", "Completed"]
        );
        assert!(!event.is_waiting());
    }

    #[test]
    fn fail_while_configure_waits_skips_success_but_runs_completed() {
        let dispatcher = Dispatcher::new();
        let log = log();
        let mut builder = RegistrationBuilder::new();
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Configure).handler(move |_| {
            l.lock().unwrap().push("Configure-wait");
            PhaseResult::Waiting
        });
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Execute).handler(move |_| {
            l.lock().unwrap().push("Execute");
            PhaseResult::Success
        });
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Cleanup).handler(move |_| {
            l.lock().unwrap().push("Cleanup");
            PhaseResult::Success
        });
        let l = Arc::clone(&log);
        builder.on_terminal(Terminal::Success).handler(move |_| {
            l.lock().unwrap().push("Success");
            PhaseResult::Success
        });
        let l = Arc::clone(&log);
        builder.on_terminal(Terminal::Completed).handler(move |_| {
            l.lock().unwrap().push("Completed");
            PhaseResult::Success
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        assert_eq!(event.dispatch().unwrap(), DispatchResult::Waiting);

        let result = event.fail().unwrap();

        assert_eq!(result, DispatchResult::Failure);
        assert!(event.has_failures());
        assert_eq!(
            recorded(&log),
            vec!["Configure-wait", "Execute", "Cleanup", "Completed"]
        );
    }

    #[test]
    fn configure_waiting_pauses_before_later_configure_handlers() {
        let dispatcher = Dispatcher::new();
        let log = log();
        let mut builder = RegistrationBuilder::new();
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Configure).handler(move |_| {
            l.lock().unwrap().push("first");
            PhaseResult::Waiting
        });
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Configure).handler(move |_| {
            l.lock().unwrap().push("second");
            PhaseResult::Success
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        assert_eq!(event.dispatch().unwrap(), DispatchResult::Waiting);
        assert_eq!(recorded(&log), vec!["first"]);

        assert_eq!(event.resume().unwrap(), DispatchResult::Success);
        assert_eq!(recorded(&log), vec!["first", "second"]);
    }

    #[test]
    fn second_dispatch_reports_already_dispatched_and_leaves_state() {
        let dispatcher = Dispatcher::new();
        let event = event_on(&dispatcher);
        event.dispatch().unwrap();
        let phases = event.completed_phases();

        assert_eq!(
            event.dispatch().unwrap_err(),
            DispatchError::AlreadyDispatched
        );
        assert_eq!(event.stage(), Stage::Finished);
        assert_eq!(event.completed_phases(), phases);
        assert!(event.is_completed());
    }

    #[test]
    fn validate_waiting_is_a_failure_and_never_parks() {
        let dispatcher = Dispatcher::new();
        let log = log();
        let mut builder = RegistrationBuilder::new();
        builder
            .on_phase(Phase::Validate)
            .handler(|_| PhaseResult::Waiting);
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Validate).handler(move |_| {
            l.lock().unwrap().push("second-validator");
            PhaseResult::Success
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        let result = event.dispatch().unwrap();

        assert_eq!(result, DispatchResult::Failure);
        assert!(!event.is_waiting());
        assert!(event.has_failures());
        assert_eq!(recorded(&log), vec!["second-validator"]);
        assert_eq!(event.errors().len(), 1);
        assert!(event.completed_phases().contains(PhaseSet::VALIDATE));
    }

    #[test]
    fn handler_error_is_captured_and_treated_as_failure() {
        let dispatcher = Dispatcher::new();
        let log = log();
        let mut builder = RegistrationBuilder::new();
        builder
            .on_phase(Phase::Execute)
            .try_handler(|_| Err("boom".into()));
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Execute).handler(move |ctx| {
            assert_eq!(ctx.errors().len(), 1);
            l.lock().unwrap().push("after-error");
            PhaseResult::Success
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        let result = event.dispatch().unwrap();

        assert_eq!(result, DispatchResult::Failure);
        assert_eq!(recorded(&log), vec!["after-error"]);
        assert_eq!(event.errors().len(), 1);
        assert_eq!(event.error_message().as_deref(), Some("boom"));
        assert!(!event.is_cancelled());
    }

    #[test]
    fn critical_validate_error_cancels_the_event() {
        let dispatcher = Dispatcher::new();
        let log = log();
        {
            let mut builder = RegistrationBuilder::new();
            builder
                .on_phase(Phase::Validate)
                .priority(Priority::Critical)
                .try_handler(|_| Err("config missing".into()));
            dispatcher.register::<Ping>(builder).unwrap();
        }
        register_full_trace(&dispatcher, &log);

        let event = event_on(&dispatcher);
        let result = event.dispatch().unwrap();

        assert_eq!(result, DispatchResult::Cancelled);
        assert!(event.is_cancelled());
        assert_eq!(recorded(&log), vec!["Cancelled", "Completed"]);
        assert_eq!(event.errors().len(), 1);
    }

    #[test]
    fn critical_error_outside_validate_is_an_ordinary_failure() {
        let dispatcher = Dispatcher::new();
        let mut builder = RegistrationBuilder::new();
        builder
            .on_phase(Phase::Execute)
            .priority(Priority::Critical)
            .try_handler(|_| Err("boom".into()));
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);

        assert_eq!(event.dispatch().unwrap(), DispatchResult::Failure);
        assert!(!event.is_cancelled());
    }

    #[test]
    fn skip_remaining_stops_the_phase_and_counts_as_success() {
        let dispatcher = Dispatcher::new();
        let log = log();
        let mut builder = RegistrationBuilder::new();
        builder
            .on_phase(Phase::Execute)
            .handler(|_| PhaseResult::SkipRemaining);
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Execute).handler(move |_| {
            l.lock().unwrap().push("skipped");
            PhaseResult::Success
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        let result = event.dispatch().unwrap();

        assert_eq!(result, DispatchResult::Success);
        assert!(recorded(&log).is_empty());
        assert!(event.completed_phases().contains(PhaseSet::EXECUTE));
    }

    #[test]
    fn abort_while_parked_cancels_and_abandons_other_waiters() {
        let dispatcher = Dispatcher::new();
        let log = log();
        {
            let mut builder = RegistrationBuilder::new();
            builder
                .on_phase(Phase::Execute)
                .handler(|_| PhaseResult::Waiting);
            builder
                .on_phase(Phase::Execute)
                .handler(|_| PhaseResult::Waiting);
            dispatcher.register::<Ping>(builder).unwrap();
        }
        register_full_trace(&dispatcher, &log);

        let event = event_on(&dispatcher);
        assert_eq!(event.dispatch().unwrap(), DispatchResult::Waiting);

        let result = event.abort().unwrap();

        assert_eq!(result, DispatchResult::Cancelled);
        assert!(event.is_cancelled());
        assert!(recorded(&log).ends_with(&["Cancelled", "Completed"]));
    }

    #[test]
    fn fail_of_one_waiter_keeps_the_event_parked_until_the_last() {
        let dispatcher = Dispatcher::new();
        let mut builder = RegistrationBuilder::new();
        builder
            .on_phase(Phase::Execute)
            .handler(|_| PhaseResult::Waiting);
        builder
            .on_phase(Phase::Execute)
            .handler(|_| PhaseResult::Waiting);
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        assert_eq!(event.dispatch().unwrap(), DispatchResult::Waiting);

        assert_eq!(event.fail().unwrap(), DispatchResult::Waiting);
        assert!(event.is_waiting());

        assert_eq!(event.resume().unwrap(), DispatchResult::Failure);
        assert!(event.has_failures());
        assert!(event.is_completed());
    }

    #[test]
    fn cleanup_waiters_never_block_the_terminal_states() {
        let dispatcher = Dispatcher::new();
        let log = log();
        {
            let mut builder = RegistrationBuilder::new();
            builder
                .on_phase(Phase::Cleanup)
                .handler(|_| PhaseResult::Waiting);
            dispatcher.register::<Ping>(builder).unwrap();
        }
        register_full_trace(&dispatcher, &log);

        let event = event_on(&dispatcher);
        let result = event.dispatch().unwrap();

        assert_eq!(result, DispatchResult::Success);
        assert!(recorded(&log).ends_with(&["Success", "Completed"]));
        assert_eq!(
            event.resume().unwrap_err(),
            DispatchError::InvalidResumption
        );
    }

    #[test]
    fn blocking_execute_waiter_pauses_the_phase_in_place() {
        let dispatcher = Dispatcher::new();
        let log = log();
        let mut builder = RegistrationBuilder::new();
        let l = Arc::clone(&log);
        builder
            .on_phase(Phase::Execute)
            .blocks_on_waiting(true)
            .handler(move |_| {
                l.lock().unwrap().push("blocker");
                PhaseResult::Waiting
            });
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Execute).handler(move |_| {
            l.lock().unwrap().push("after-blocker");
            PhaseResult::Success
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        assert_eq!(event.dispatch().unwrap(), DispatchResult::Waiting);
        assert_eq!(recorded(&log), vec!["blocker"]);

        assert_eq!(event.resume().unwrap(), DispatchResult::Success);
        assert_eq!(recorded(&log), vec!["blocker", "after-blocker"]);
    }

    #[test]
    fn abort_during_cleanup_routes_to_cancelled_terminal() {
        let dispatcher = Dispatcher::new();
        let log = log();
        {
            let mut builder = RegistrationBuilder::new();
            builder
                .on_phase(Phase::Cleanup)
                .blocks_on_waiting(true)
                .handler(|_| PhaseResult::Waiting);
            dispatcher.register::<Ping>(builder).unwrap();
        }
        register_full_trace(&dispatcher, &log);

        let event = event_on(&dispatcher);
        assert_eq!(event.dispatch().unwrap(), DispatchResult::Waiting);

        let result = event.abort().unwrap();

        assert_eq!(result, DispatchResult::Cancelled);
        assert!(recorded(&log).ends_with(&["Cancelled", "Completed"]));
    }

    #[test]
    fn completed_phase_bits_skip_cancelled_phases() {
        let dispatcher = Dispatcher::new();
        let mut builder = RegistrationBuilder::new();
        builder
            .on_phase(Phase::Execute)
            .handler(|_| PhaseResult::Cancelled);
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        event.dispatch().unwrap();

        assert_eq!(
            event.completed_phases(),
            PhaseSet::VALIDATE | PhaseSet::CONFIGURE
        );
    }

    #[test]
    fn terminal_handler_results_are_coerced_to_success() {
        let dispatcher = Dispatcher::new();
        let mut builder = RegistrationBuilder::new();
        builder
            .on_terminal(Terminal::Success)
            .handler(|_| PhaseResult::Cancelled);
        builder
            .on_terminal(Terminal::Completed)
            .handler(|_| PhaseResult::Waiting);
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        let result = event.dispatch().unwrap();

        assert_eq!(result, DispatchResult::Success);
        assert!(!event.is_cancelled());
        assert!(!event.is_waiting());
        assert!(event.is_completed());
    }

    #[test]
    fn terminal_handler_error_does_not_block_later_terminals() {
        let dispatcher = Dispatcher::new();
        let log = log();
        let mut builder = RegistrationBuilder::new();
        builder
            .on_terminal(Terminal::Success)
            .try_handler(|_| Err("observer broke".into()));
        let l = Arc::clone(&log);
        builder.on_terminal(Terminal::Completed).handler(move |_| {
            l.lock().unwrap().push("Completed");
            PhaseResult::Success
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        let result = event.dispatch().unwrap();

        assert_eq!(result, DispatchResult::Success);
        assert_eq!(recorded(&log), vec!["Completed"]);
        assert_eq!(event.errors().len(), 1);
    }

    #[test]
    fn data_bag_flows_between_phases() {
        let dispatcher = Dispatcher::new();
        let mut builder = RegistrationBuilder::new();
        builder.on_phase(Phase::Configure).handler(|ctx| {
            ctx.data().set("answer", 42u32);
            PhaseResult::Success
        });
        builder.on_phase(Phase::Execute).handler(|ctx| {
            match ctx.data().try_get::<u32>("answer") {
                Some(answer) if *answer == 42 => PhaseResult::Success,
                _ => PhaseResult::Failure,
            }
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);

        assert_eq!(event.dispatch().unwrap(), DispatchResult::Success);
        assert_eq!(*event.data().get::<u32>("answer").unwrap(), 42);
    }

    #[test]
    fn context_reports_stage_priority_and_ordinal() {
        let dispatcher = Dispatcher::new();
        let seen: Arc<Mutex<Vec<(Stage, Priority, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut builder = RegistrationBuilder::new();
        let s = Arc::clone(&seen);
        builder
            .on_phase(Phase::Execute)
            .priority(Priority::Low)
            .handler(move |ctx| {
                s.lock().unwrap().push((ctx.stage(), ctx.priority(), ctx.index()));
                PhaseResult::Success
            });
        let s = Arc::clone(&seen);
        builder
            .on_phase(Phase::Execute)
            .priority(Priority::High)
            .handler(move |ctx| {
                s.lock().unwrap().push((ctx.stage(), ctx.priority(), ctx.index()));
                PhaseResult::Success
            });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);
        event.dispatch().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (Stage::Phase(Phase::Execute), Priority::High, 0),
                (Stage::Phase(Phase::Execute), Priority::Low, 1),
            ]
        );
    }

    #[test]
    fn registration_during_dispatch_affects_later_stages() {
        let dispatcher = Dispatcher::new();
        let log = log();
        let mut builder = RegistrationBuilder::new();
        let registrar = dispatcher.clone();
        let l = Arc::clone(&log);
        builder.on_phase(Phase::Validate).handler(move |_| {
            let late = Arc::clone(&l);
            let mut extra = RegistrationBuilder::new();
            extra.on_phase(Phase::Execute).handler(move |_| {
                late.lock().unwrap().push("late-execute");
                PhaseResult::Success
            });
            registrar.register::<Ping>(extra).unwrap();
            PhaseResult::Success
        });
        dispatcher.register::<Ping>(builder).unwrap();

        let event = event_on(&dispatcher);

        assert_eq!(event.dispatch().unwrap(), DispatchResult::Success);
        assert_eq!(recorded(&log), vec!["late-execute"]);
    }

    #[test]
    fn scoped_handlers_run_alongside_globals() {
        let dispatcher = Dispatcher::new();
        let log = log();
        {
            let l = Arc::clone(&log);
            let mut builder = RegistrationBuilder::new();
            builder.on_phase(Phase::Execute).handler(move |_| {
                l.lock().unwrap().push("global");
                PhaseResult::Success
            });
            dispatcher.register::<Ping>(builder).unwrap();
        }

        let event = event_on(&dispatcher);
        let l = Arc::clone(&log);
        let mut scoped = RegistrationBuilder::new();
        scoped.on_phase(Phase::Execute).handler(move |_| {
            l.lock().unwrap().push("scoped");
            PhaseResult::Success
        });
        event.with_callbacks(scoped).unwrap();

        assert_eq!(event.dispatch().unwrap(), DispatchResult::Success);
        assert_eq!(recorded(&log), vec!["global", "scoped"]);
    }
}
