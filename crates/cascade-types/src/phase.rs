use std::fmt;

use serde::{Deserialize, Serialize};

/// The four business phases, in processing order.
///
/// Every event walks Validate → Configure → Execute → Cleanup unless
/// cancellation cuts the walk short.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Synchronous gate. Waiting is not permitted here.
    Validate,
    /// Sequential setup. A Waiting return pauses the phase in place.
    Configure,
    /// Main work. Waiting returns accumulate and the phase continues.
    Execute,
    /// Teardown. Runs like Execute, but never blocks the terminal states.
    Cleanup,
}

impl Phase {
    /// All business phases in processing order.
    pub const ORDER: [Phase; 4] = [
        Phase::Validate,
        Phase::Configure,
        Phase::Execute,
        Phase::Cleanup,
    ];

    /// The phase that follows this one, or `None` after Cleanup.
    pub fn next(self) -> Option<Phase> {
        match self {
            Self::Validate => Some(Self::Configure),
            Self::Configure => Some(Self::Execute),
            Self::Execute => Some(Self::Cleanup),
            Self::Cleanup => None,
        }
    }

    /// The completed-phases bit for this phase.
    pub fn bit(self) -> PhaseSet {
        match self {
            Self::Validate => PhaseSet::VALIDATE,
            Self::Configure => PhaseSet::CONFIGURE,
            Self::Execute => PhaseSet::EXECUTE,
            Self::Cleanup => PhaseSet::CLEANUP,
        }
    }

    /// Returns the variant name as a static string for error messages and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validate => "Validate",
            Self::Configure => "Configure",
            Self::Execute => "Execute",
            Self::Cleanup => "Cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags::bitflags! {
    /// Bitmap over the business phases an event has completed.
    ///
    /// Grows monotonically across a dispatch chain; a bit is set when its
    /// phase concludes (for Cleanup, regardless of outcome).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PhaseSet: u8 {
        const VALIDATE = 1 << 0;
        const CONFIGURE = 1 << 1;
        const EXECUTE = 1 << 2;
        const CLEANUP = 1 << 3;
    }
}

/// Terminal states fired after the business phases.
///
/// Exactly one of Success/Cancelled runs, then Completed always runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Terminal {
    Success,
    Cancelled,
    Completed,
}

impl Terminal {
    /// Returns the variant name as a static string for error messages and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Cancelled => "Cancelled",
            Self::Completed => "Completed",
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The event's current position in the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Constructed but not yet dispatched.
    Unstarted,
    /// Inside a business phase.
    Phase(Phase),
    /// Inside a terminal state.
    Terminal(Terminal),
    /// All terminal handlers have run; the event is done.
    Finished,
}

impl Stage {
    /// Whether the event is inside a business phase.
    pub fn is_business(&self) -> bool {
        matches!(self, Self::Phase(_))
    }

    /// Whether the event is inside a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// The business phase, if the event is inside one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Phase(p) => Some(*p),
            _ => None,
        }
    }

    /// Returns the stage name as a static string for error messages and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unstarted => "Unstarted",
            Self::Phase(p) => p.name(),
            Self::Terminal(t) => t.name(),
            Self::Finished => "Finished",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a handler entry is registered against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Phase(Phase),
    Terminal(Terminal),
}

impl Target {
    /// The stage this target corresponds to during selection.
    pub fn stage(self) -> Stage {
        match self {
            Self::Phase(p) => Stage::Phase(p),
            Self::Terminal(t) => Stage::Terminal(t),
        }
    }
}
