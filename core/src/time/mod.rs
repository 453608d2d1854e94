//! Federation time management: LBTS, grant decisions, advance bookkeeping

pub mod manager;

pub use manager::{next_event_target, FederateEntry, FlushOutcome, TimeManager, TimeManagerError};
