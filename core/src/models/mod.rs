//! Domain models for the time-management core

pub mod message;
pub mod queue;
pub mod time_status;

// Re-exports
pub use message::{Delivery, Message, Payload};
pub use queue::{EventQueue, FlushResult, ReleaseContext};
pub use time_status::{
    AdvanceKind, AdvanceRequest, FederateHandle, TimeStatus, TimeStatusError, TimeSwitch, TriState,
};
