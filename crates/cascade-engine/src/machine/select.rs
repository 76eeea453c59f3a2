//! Handler selection for one stage of one event.
//!
//! Candidates are the global registry entries for the event's kind followed
//! by the event's scoped entries, filtered in a fixed order (execution cap,
//! instance filter, predicate) and stable-sorted by priority so insertion
//! order breaks ties. Selection runs once at stage entry; the surviving
//! snapshot is what the driver walks, so handlers registered mid-stage only
//! affect later stages.

use std::sync::Arc;

use cascade_types::Target;

use crate::dispatcher::Dispatcher;
use crate::entry::HandlerEntry;
use crate::event::Event;

/// Assemble the ordered handler snapshot for `target` on `event`.
///
/// No event or registry lock is held while predicates run, so predicates may
/// freely read the event's flags and data bag.
pub(crate) fn assemble(
    dispatcher: &Dispatcher,
    event: &Event,
    target: Target,
) -> Vec<Arc<HandlerEntry>> {
    let mut candidates = dispatcher.global_candidates(event.kind(), target);
    candidates.extend(event.scoped_entries_for(target));
    candidates.retain(|entry| eligible(entry, event));
    // Stable sort: equal priorities keep registration order, globals first.
    candidates.sort_by_key(|entry| entry.priority());
    candidates
}

fn eligible(entry: &HandlerEntry, event: &Event) -> bool {
    if entry.is_exhausted() {
        return false;
    }
    if !entry.matches_instance(event) {
        return false;
    }
    entry.passes_predicate(event)
}
