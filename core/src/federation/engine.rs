//! Federation engine
//!
//! Owns the time state of one federation behind a single mutex and routes
//! requests, incoming messages and polls to it.
//!
//! # Request Flow
//!
//! ```text
//! process(source, request)
//!   ├─ lock
//!   │   ├─ drop if source is not a member
//!   │   └─ handler validates → mutates → returns notices and grants
//!   ├─ unlock
//!   └─ publish notices and grants through the Broadcaster
//! ```
//!
//! Nothing is published while the lock is held, so a slow transport never
//! stalls other federates' requests.

use crate::events::handler::{
    HandlerContext, HandlerOutcome, SaveRestoreStatus, TimeRequestError, TimeRequestHandler,
};
use crate::events::types::{RequestEnvelope, TimeAdvanceGrant, TimeNotice, TimeRequest};
use crate::federation::checkpoint::{CheckpointError, TimeSnapshot};
use crate::federation::config::{ConfigError, TimeConfig};
use crate::models::message::Message;
use crate::models::time_status::{FederateHandle, TimeStatus};
use crate::time::manager::TimeManager;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound side of the federation: the messaging layer
pub trait Broadcaster: Send + Sync {
    /// Publish a notice to every joined federate
    fn broadcast(&self, federation: Uuid, source: FederateHandle, notice: &TimeNotice);

    /// Deliver a grant to the single federate it names
    fn grant(&self, federation: Uuid, grant: &TimeAdvanceGrant);
}

impl<B: Broadcaster + ?Sized> Broadcaster for Arc<B> {
    fn broadcast(&self, federation: Uuid, source: FederateHandle, notice: &TimeNotice) {
        (**self).broadcast(federation, source, notice)
    }

    fn grant(&self, federation: Uuid, grant: &TimeAdvanceGrant) {
        (**self).grant(federation, grant)
    }
}

/// Discards everything; grants still reach federates through their queues
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn broadcast(&self, _federation: Uuid, _source: FederateHandle, _notice: &TimeNotice) {}

    fn grant(&self, _federation: Uuid, _grant: &TimeAdvanceGrant) {}
}

/// One item handed to a `RecordingBroadcaster`
#[derive(Debug, Clone, PartialEq)]
pub enum Published {
    Broadcast {
        source: FederateHandle,
        notice: TimeNotice,
    },
    Grant(TimeAdvanceGrant),
}

/// Keeps everything published, in order
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    published: Mutex<Vec<Published>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    /// Drain the record
    pub fn take(&self) -> Vec<Published> {
        std::mem::take(&mut *self.published.lock())
    }

    pub fn grants(&self) -> Vec<TimeAdvanceGrant> {
        self.published
            .lock()
            .iter()
            .filter_map(|item| match item {
                Published::Grant(grant) => Some(*grant),
                Published::Broadcast { .. } => None,
            })
            .collect()
    }

    pub fn notices(&self) -> Vec<TimeNotice> {
        self.published
            .lock()
            .iter()
            .filter_map(|item| match item {
                Published::Broadcast { notice, .. } => Some(notice.clone()),
                Published::Grant(_) => None,
            })
            .collect()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, _federation: Uuid, source: FederateHandle, notice: &TimeNotice) {
        self.published.lock().push(Published::Broadcast {
            source,
            notice: notice.clone(),
        });
    }

    fn grant(&self, _federation: Uuid, grant: &TimeAdvanceGrant) {
        self.published.lock().push(Published::Grant(*grant));
    }
}

/// What happened to a routed request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestDisposition {
    /// Applied; carries everything the request produced
    Accepted(HandlerOutcome),

    /// Not for this federation, or from a federate that is not a member
    Dropped,
}

impl RequestDisposition {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RequestDisposition::Accepted(_))
    }

    pub fn outcome(&self) -> Option<&HandlerOutcome> {
        match self {
            RequestDisposition::Accepted(outcome) => Some(outcome),
            RequestDisposition::Dropped => None,
        }
    }
}

#[derive(Debug, Default)]
struct FederationState {
    time: TimeManager,
    handler: TimeRequestHandler,
    save_restore: SaveRestoreStatus,
}

/// Time management for one federation
///
/// All methods take `&self`; share a `Federation` between worker threads with
/// an `Arc`.
///
/// # Example
///
/// ```rust
/// use hla_time_core::federation::{Federation, NullBroadcaster, TimeConfig};
/// use hla_time_core::TimeRequest;
///
/// let federation = Federation::new(TimeConfig::default(), NullBroadcaster).unwrap();
/// federation.join(1);
///
/// federation
///     .process(1, &TimeRequest::TimeAdvanceRequest { time: 4.0, next_event: false })
///     .unwrap();
/// assert_eq!(federation.status(1).unwrap().current_time(), 4.0);
/// ```
pub struct Federation<B: Broadcaster = NullBroadcaster> {
    id: Uuid,
    config: TimeConfig,
    state: Mutex<FederationState>,
    broadcaster: B,
}

impl<B: Broadcaster> Federation<B> {
    /// Create a federation with a fresh id
    pub fn new(config: TimeConfig, broadcaster: B) -> Result<Self, ConfigError> {
        Self::with_id(Uuid::new_v4(), config, broadcaster)
    }

    pub fn with_id(id: Uuid, config: TimeConfig, broadcaster: B) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(federation = %id, "federation time management created");
        Ok(Self {
            id,
            config,
            state: Mutex::new(FederationState::default()),
            broadcaster,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &TimeConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &B {
        &self.broadcaster
    }

    // ========================================================================
    // Membership
    // ========================================================================

    pub fn join(&self, federate: FederateHandle) {
        self.state.lock().time.joined_federation(federate, None);
    }

    /// Join with a status carried over from elsewhere
    pub fn join_with_status(&self, status: TimeStatus) {
        self.state
            .lock()
            .time
            .joined_federation(status.federate(), Some(status));
    }

    /// Remove a federate and publish whatever its departure unblocks
    pub fn resign(&self, federate: FederateHandle) -> Result<(), TimeRequestError> {
        let outcome = {
            let mut state = self.state.lock();
            if !state.time.contains(federate) {
                return Err(TimeRequestError::FederateNotJoined(federate));
            }
            let FederationState { time, handler, .. } = &mut *state;
            handler.resigned(time, federate)?
        };
        self.publish(federate, &outcome);
        Ok(())
    }

    pub fn is_member(&self, federate: FederateHandle) -> bool {
        self.state.lock().time.contains(federate)
    }

    pub fn members(&self) -> Vec<FederateHandle> {
        self.state.lock().time.federates().collect()
    }

    // ========================================================================
    // Requests and messages
    // ========================================================================

    /// Route a request envelope, dropping it if it is for another federation
    pub fn process_envelope(
        &self,
        envelope: &RequestEnvelope,
    ) -> Result<RequestDisposition, TimeRequestError> {
        if envelope.federation != self.id {
            warn!(
                federation = %self.id,
                target = %envelope.federation,
                federate = envelope.source,
                "dropping request addressed to another federation"
            );
            return Ok(RequestDisposition::Dropped);
        }
        self.process(envelope.source, &envelope.request)
    }

    /// Handle one time-management request from `source`
    ///
    /// Requests from federates that are not members are dropped, not
    /// rejected.
    pub fn process(
        &self,
        source: FederateHandle,
        request: &TimeRequest,
    ) -> Result<RequestDisposition, TimeRequestError> {
        let outcome = {
            let mut state = self.state.lock();
            if !state.time.contains(source) {
                warn!(federate = source, request = request.name(), "dropping request from non-member");
                return Ok(RequestDisposition::Dropped);
            }
            let ctx = HandlerContext {
                config: &self.config,
                save_restore: state.save_restore,
            };
            let FederationState { time, handler, .. } = &mut *state;
            handler.handle(time, &ctx, source, request)?
        };

        self.publish(source, &outcome);
        Ok(RequestDisposition::Accepted(outcome))
    }

    /// Queue an incoming message for `target`
    ///
    /// Fails without queueing when a regulating sender's TSO timestamp is
    /// below its bound.
    pub fn deliver(&self, target: FederateHandle, message: Message) -> Result<(), TimeRequestError> {
        let grants = self.state.lock().time.deliver(target, message)?;
        self.publish_grants(&grants);
        Ok(())
    }

    /// One step of `federate`'s incoming-message cycle
    ///
    /// Completes a pending constrained enable, then releases the next
    /// deliverable message if there is one.
    pub fn poll(&self, federate: FederateHandle) -> Result<Option<Message>, TimeRequestError> {
        let (outcome, message) = {
            let mut state = self.state.lock();
            let FederationState { time, handler, .. } = &mut *state;
            let outcome = handler.confirm_pending(time, federate)?;
            let message = time.poll(federate)?;
            (outcome, message)
        };

        self.publish(federate, &outcome);
        if let Some(message) = &message {
            debug!(federate, kind = message.kind(), "message released");
        }
        Ok(message)
    }

    /// Poll until nothing more is deliverable
    pub fn drain(&self, federate: FederateHandle) -> Result<Vec<Message>, TimeRequestError> {
        let mut released = Vec::new();
        while let Some(message) = self.poll(federate)? {
            released.push(message);
        }
        Ok(released)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn lbts(&self) -> f64 {
        self.state.lock().time.lbts()
    }

    pub fn galt_for(&self, federate: FederateHandle) -> f64 {
        self.state.lock().time.galt_for(federate)
    }

    /// Earliest TSO timestamp `federate` can still receive; `None` if not joined
    pub fn lits_for(&self, federate: FederateHandle) -> Option<f64> {
        self.state.lock().time.lits_for(federate)
    }

    pub fn status(&self, federate: FederateHandle) -> Option<TimeStatus> {
        self.state.lock().time.status(federate).cloned()
    }

    pub fn queue_len(&self, federate: FederateHandle) -> Option<usize> {
        self.state.lock().time.queue(federate).map(|queue| queue.len())
    }

    /// Copy of the current time state
    pub fn time_manager(&self) -> TimeManager {
        self.state.lock().time.clone()
    }

    pub fn save_restore_status(&self) -> SaveRestoreStatus {
        self.state.lock().save_restore
    }

    // ========================================================================
    // Save / Restore
    // ========================================================================

    pub fn begin_save(&self) -> Result<(), CheckpointError> {
        self.switch_save_restore(SaveRestoreStatus::Idle, SaveRestoreStatus::Saving)
    }

    pub fn complete_save(&self) -> Result<(), CheckpointError> {
        self.switch_save_restore(SaveRestoreStatus::Saving, SaveRestoreStatus::Idle)
    }

    pub fn begin_restore(&self) -> Result<(), CheckpointError> {
        self.switch_save_restore(SaveRestoreStatus::Idle, SaveRestoreStatus::Restoring)
    }

    pub fn complete_restore(&self) -> Result<(), CheckpointError> {
        self.switch_save_restore(SaveRestoreStatus::Restoring, SaveRestoreStatus::Idle)
    }

    fn switch_save_restore(
        &self,
        expected: SaveRestoreStatus,
        next: SaveRestoreStatus,
    ) -> Result<(), CheckpointError> {
        let mut state = self.state.lock();
        if state.save_restore != expected {
            return Err(CheckpointError::WrongStatus {
                expected: status_name(expected),
                actual: status_name(state.save_restore),
            });
        }
        state.save_restore = next;
        info!(federation = %self.id, status = status_name(next), "save/restore status changed");
        Ok(())
    }

    /// Capture the current time state
    pub fn snapshot(&self) -> Result<TimeSnapshot, CheckpointError> {
        let state = self.state.lock();
        TimeSnapshot::capture(self.id, &self.config, &state.time, &state.handler)
    }

    /// Capture the current time state as JSON
    pub fn save_snapshot(&self) -> Result<String, CheckpointError> {
        self.snapshot()?.to_json()
    }

    /// Replace time state with a saved snapshot
    ///
    /// Only allowed while a restore is in progress. On error the current state
    /// is kept.
    pub fn restore_snapshot(&self, json: &str) -> Result<(), CheckpointError> {
        let snapshot = TimeSnapshot::from_json(json)?;
        if snapshot.federation != self.id {
            warn!(federation = %self.id, snapshot = %snapshot.federation, "rejecting snapshot from another federation");
            return Err(CheckpointError::FederationMismatch {
                snapshot: snapshot.federation,
                federation: self.id,
            });
        }

        let mut state = self.state.lock();
        if state.save_restore != SaveRestoreStatus::Restoring {
            return Err(CheckpointError::WrongStatus {
                expected: status_name(SaveRestoreStatus::Restoring),
                actual: status_name(state.save_restore),
            });
        }

        let (time, handler) = snapshot.into_state(&self.config).map_err(|err| {
            warn!(federation = %self.id, error = %err, "rejecting snapshot");
            err
        })?;
        info!(federation = %self.id, federates = time.num_federates(), lbts = time.lbts(), "time state restored");
        state.time = time;
        state.handler = handler;
        Ok(())
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    fn publish(&self, source: FederateHandle, outcome: &HandlerOutcome) {
        for notice in &outcome.broadcasts {
            self.broadcaster.broadcast(self.id, source, notice);
        }
        self.publish_grants(&outcome.grants);
    }

    fn publish_grants(&self, grants: &[TimeAdvanceGrant]) {
        for grant in grants {
            self.broadcaster.grant(self.id, grant);
        }
    }
}

fn status_name(status: SaveRestoreStatus) -> &'static str {
    match status {
        SaveRestoreStatus::Idle => "idle",
        SaveRestoreStatus::Saving => "saving",
        SaveRestoreStatus::Restoring => "restoring",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Payload;

    #[test]
    fn test_request_from_non_member_is_dropped() {
        let federation = Federation::new(TimeConfig::default(), NullBroadcaster).unwrap();
        let disposition = federation
            .process(7, &TimeRequest::EnableTimeConstrained)
            .unwrap();
        assert_eq!(disposition, RequestDisposition::Dropped);
    }

    #[test]
    fn test_envelope_for_other_federation_is_dropped() {
        let federation = Federation::new(TimeConfig::default(), NullBroadcaster).unwrap();
        federation.join(1);
        let envelope = RequestEnvelope {
            federation: Uuid::nil(),
            source: 1,
            request: TimeRequest::EnableTimeConstrained,
        };
        assert_eq!(
            federation.process_envelope(&envelope).unwrap(),
            RequestDisposition::Dropped
        );
    }

    #[test]
    fn test_poll_confirms_pending_constrained() {
        let federation = Federation::new(TimeConfig::default(), NullBroadcaster).unwrap();
        federation.join(1);
        federation
            .process(1, &TimeRequest::EnableTimeConstrained)
            .unwrap();
        assert!(federation.status(1).unwrap().constrained().is_pending());

        let message = federation.poll(1).unwrap().unwrap();
        assert_eq!(message.payload, Payload::TimeConstrainedEnabled { time: 0.0 });
        assert!(federation.status(1).unwrap().is_constrained());
    }

    #[test]
    fn test_save_restore_status_cycle() {
        let federation = Federation::new(TimeConfig::default(), NullBroadcaster).unwrap();
        assert!(federation.complete_save().is_err());
        federation.begin_save().unwrap();
        assert!(federation.begin_restore().is_err());
        federation.complete_save().unwrap();
        assert_eq!(federation.save_restore_status(), SaveRestoreStatus::Idle);
    }
}
