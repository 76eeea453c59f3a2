pub mod builder;
pub mod context;
pub mod dispatcher;
pub mod entry;
pub mod event;
mod machine;

pub use builder::{EntryBuilder, RegistrationBuilder};
pub use context::HandlerContext;
pub use dispatcher::Dispatcher;
pub use entry::{HandlerEntry, HandlerError, HandlerResult};
pub use event::{Event, EventOptions};

// Re-export the type vocabulary so most users need a single import.
pub use cascade_types::{
    DataBag, DataError, DispatchError, DispatchResult, EventId, HandlerFailure, HandlerId, Phase,
    PhaseResult, PhaseSet, Priority, RegistrationError, Resumption, Stage, Target, Terminal,
};
