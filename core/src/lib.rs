//! HLA Time Core - Federated Time Management Engine
//!
//! Tracks each federate's regulating/constrained status and lookahead,
//! computes the federation LBTS, decides when time advances can be granted and
//! releases queued messages in timestamp order.
//!
//! # Architecture
//!
//! - **models**: Per-federate data (TimeStatus, EventQueue, Message)
//! - **time**: Federation-wide TimeManager (LBTS/GALT, grant decisions)
//! - **events**: Time-management requests, notices and their handlers
//! - **federation**: Locked engine, configuration, save/restore snapshots
//!
//! # Critical Invariants
//!
//! 1. A federate's current time never decreases
//! 2. A constrained federate is never granted past its GALT
//! 3. A rejected request leaves time state unchanged
//! 4. No I/O happens while federation time state is locked

// Module declarations
pub mod events;
pub mod federation;
pub mod models;
pub mod time;

// Re-exports for convenience
pub use events::{
    HandlerOutcome, SaveRestoreStatus, TimeAdvanceGrant, TimeNotice, TimeRequest, TimeRequestError,
    TimeRequestHandler,
};
pub use federation::{
    Broadcaster, CheckpointError, ConfigError, Federation, NullBroadcaster, RecordingBroadcaster,
    RegulationBarrier, RequestDisposition, TimeConfig, TimeSnapshot,
};
pub use models::{
    message::{Delivery, Message, Payload},
    queue::EventQueue,
    time_status::{FederateHandle, TimeStatus, TimeStatusError, TimeSwitch, TriState},
};
pub use time::{next_event_target, TimeManager, TimeManagerError};

// FFI module (when feature enabled)
#[cfg(feature = "pyo3")]
pub mod ffi;

#[cfg(feature = "pyo3")]
use pyo3::prelude::*;

#[cfg(feature = "pyo3")]
#[pymodule]
fn hla_time_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<ffi::federation::PyFederation>()?;
    Ok(())
}
