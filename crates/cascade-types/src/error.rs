use std::fmt;

use crate::id::HandlerId;
use crate::phase::Stage;

/// Errors from typed data-bag retrieval.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DataError {
    #[error("no value stored under key '{key}'")]
    Missing { key: String },
    #[error("value under key '{key}' is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },
}

/// Errors from building a registration.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// The builder finalized no entries; nothing to register.
    #[error("registration produced no handler entries")]
    Empty,
}

/// Errors from the dispatch control surface.
///
/// `dispatch` itself never fails once processing starts: handler errors are
/// captured into the event's error list and surface through the dispatch
/// result, not through this enum.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// A second `dispatch` on the same event, or callbacks attached after
    /// dispatch. Event state is unchanged.
    #[error("event has already been dispatched")]
    AlreadyDispatched,
    /// A second attempt to attach event-scoped callbacks.
    #[error("event-scoped callbacks were already attached")]
    CallbacksAlreadyAttached,
    /// `resume`/`abort`/`fail` while the event is neither waiting nor being
    /// driven by the engine.
    #[error("resumption signalled while the event is neither waiting nor processing")]
    InvalidResumption,
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),
}

/// One captured handler error.
///
/// The engine appends these in invocation order; they are visible to later
/// handlers through the context and to the caller through the event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerFailure {
    /// The registration whose handler failed.
    pub handler: HandlerId,
    /// Where the failure happened.
    pub stage: Stage,
    /// Rendered error message.
    pub message: String,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.handler, self.stage, self.message)
    }
}
