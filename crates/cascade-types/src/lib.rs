pub mod data;
pub mod error;
pub mod id;
pub mod phase;
pub mod priority;
pub mod result;

pub use data::DataBag;
pub use error::{DataError, DispatchError, HandlerFailure, RegistrationError};
pub use id::{EventId, HandlerId};
pub use phase::{Phase, PhaseSet, Stage, Target, Terminal};
pub use priority::Priority;
pub use result::{DispatchResult, PhaseResult, Resumption};
