//! Time-management request and notice types
//!
//! Requests arrive from federates; notices go out to the federation through
//! the broadcast layer. Both carry the federation and source identity in an
//! envelope. Wire encoding is the transport's business, these types only
//! derive serde so any encoding can be plugged in.
//!
//! # Design Principles
//!
//! 1. **Self-contained**: every request carries all data its handler needs
//! 2. **Mirrored**: accepted requests are re-broadcast so every federate's view
//!    of federation time state converges
//! 3. **Targeted grants**: a grant names exactly one federate

use crate::models::time_status::FederateHandle;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Time-management request issued by a federate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeRequest {
    /// Become a regulator at `federate_time` with the given lookahead
    EnableTimeRegulation { federate_time: f64, lookahead: f64 },

    DisableTimeRegulation,

    EnableTimeConstrained,

    DisableTimeConstrained,

    /// Advance to `time`. With `next_event` set the target is clamped down to
    /// the next queued TSO event.
    TimeAdvanceRequest { time: f64, next_event: bool },

    ModifyLookahead { lookahead: f64 },

    /// Deliver everything queued up to `max_time` and advance as far as allowed
    FlushQueueRequest { max_time: f64 },

    EnableAsynchronousDelivery,

    DisableAsynchronousDelivery,

    /// A peer has absorbed the news that `regulator` is enabling regulation
    RegulationAcknowledged { regulator: FederateHandle },
}

impl TimeRequest {
    /// Request name for logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            TimeRequest::EnableTimeRegulation { .. } => "EnableTimeRegulation",
            TimeRequest::DisableTimeRegulation => "DisableTimeRegulation",
            TimeRequest::EnableTimeConstrained => "EnableTimeConstrained",
            TimeRequest::DisableTimeConstrained => "DisableTimeConstrained",
            TimeRequest::TimeAdvanceRequest {
                next_event: false, ..
            } => "TimeAdvanceRequest",
            TimeRequest::TimeAdvanceRequest {
                next_event: true, ..
            } => "NextEventRequest",
            TimeRequest::ModifyLookahead { .. } => "ModifyLookahead",
            TimeRequest::FlushQueueRequest { .. } => "FlushQueueRequest",
            TimeRequest::EnableAsynchronousDelivery => "EnableAsynchronousDelivery",
            TimeRequest::DisableAsynchronousDelivery => "DisableAsynchronousDelivery",
            TimeRequest::RegulationAcknowledged { .. } => "RegulationAcknowledged",
        }
    }

    /// Requests that change federation time state and need a quiet
    /// save/restore status
    pub fn blocked_by_save_restore(&self) -> bool {
        matches!(
            self,
            TimeRequest::EnableTimeRegulation { .. }
                | TimeRequest::EnableTimeConstrained
                | TimeRequest::TimeAdvanceRequest { .. }
                | TimeRequest::ModifyLookahead { .. }
                | TimeRequest::FlushQueueRequest { .. }
        )
    }
}

/// A request together with who sent it and where
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub federation: Uuid,
    pub source: FederateHandle,
    pub request: TimeRequest,
}

/// Advance granted to one federate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeAdvanceGrant {
    pub federate: FederateHandle,
    pub time: f64,
}

/// Outgoing notice published to the federation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum TimeNotice {
    /// Accepted request, mirrored to every federate
    Request(TimeRequest),

    TimeAdvanceGrant(TimeAdvanceGrant),

    RegulationEnabled { federate: FederateHandle, time: f64 },

    ConstrainedEnabled { federate: FederateHandle, time: f64 },
}
