use std::fmt;

use serde::{Deserialize, Serialize};

/// What a handler tells the engine about the remainder of its phase.
///
/// Terminal-state handlers use the same protocol but their return is coerced
/// to `Success`; they observe, they do not redirect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseResult {
    /// Continue with the next handler.
    Success,
    /// Continue with the next handler; the event finishes as Failure.
    Failure,
    /// Stop the phase. In Validate/Configure/Execute this cancels the event;
    /// in Cleanup it is local to the phase.
    Cancelled,
    /// Pause for external work. Meaning depends on the phase; see the
    /// engine's waiting rules.
    Waiting,
    /// Stop the phase and treat it as successfully concluded.
    SkipRemaining,
}

impl PhaseResult {
    /// Returns the variant name as a static string for error messages and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Cancelled => "Cancelled",
            Self::Waiting => "Waiting",
            Self::SkipRemaining => "SkipRemaining",
        }
    }
}

/// Outcome of `dispatch`, `resume`, `abort`, and `fail`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchResult {
    /// The event finished with no failures and no cancellation.
    Success,
    /// The event finished with at least one recorded failure.
    Failure,
    /// The event finished cancelled.
    Cancelled,
    /// The event is paused; a later `resume`/`abort`/`fail` continues it.
    Waiting,
    /// Caller-side sentinel for "not yet decided". The engine never returns
    /// this from a settled dispatch.
    Unknown,
}

impl DispatchResult {
    /// Whether the event has reached a final outcome.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    /// Returns the variant name as a static string for error messages and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Cancelled => "Cancelled",
            Self::Waiting => "Waiting",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DispatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Intent carried by a resumption call.
///
/// Queued on the event when the call races the handler that is about to
/// return Waiting, and applied when the engine reaches its next checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resumption {
    /// Continue processing unchanged.
    Resume,
    /// Mark the event cancelled, then continue processing.
    Abort,
    /// Mark the event failed, then continue processing.
    Fail,
}

impl Resumption {
    /// Returns the variant name as a static string for error messages and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Resume => "Resume",
            Self::Abort => "Abort",
            Self::Fail => "Fail",
        }
    }
}
