//! Time-management request handlers
//!
//! Every handler follows the same shape:
//! 1. Validate all preconditions against current state
//! 2. Mutate `TimeManager` (only after every check passed)
//! 3. Return the notices to broadcast and the grants that became possible
//!
//! A rejected request leaves federation time state exactly as it was. Network
//! I/O is left to the caller so the handler can run under the federation lock.
//!
//! # Regulation Barrier
//!
//! With `RegulationBarrier::Acknowledged` a new regulator stays PENDING until
//! every federate that was joined when it asked has sent
//! `RegulationAcknowledged`. Its bound already counts toward LBTS while
//! pending, so nobody can be granted past it in the meantime.

use crate::events::types::{TimeAdvanceGrant, TimeNotice, TimeRequest};
use crate::federation::config::{RegulationBarrier, TimeConfig};
use crate::models::message::{Message, Payload};
use crate::models::time_status::{
    effective_lookahead, validate_time, FederateHandle, TimeStatus, TimeStatusError, TimeSwitch,
    TriState,
};
use crate::time::manager::{TimeManager, TimeManagerError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info};

/// Errors returned to a federate whose request was rejected
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TimeRequestError {
    #[error("federate {0} is not joined to the federation")]
    FederateNotJoined(FederateHandle),

    #[error("a federation save is in progress")]
    SaveInProgress,

    #[error("a federation restore is in progress")]
    RestoreInProgress,

    #[error("lookahead would lower the federate bound to {requested}, below federation LBTS {federation_lbts}")]
    LookaheadViolatesLbts { requested: f64, federation_lbts: f64 },

    #[error("federate {from} owes no acknowledgement for regulator {regulator}")]
    NotAwaitingAcknowledgement {
        regulator: FederateHandle,
        from: FederateHandle,
    },

    #[error(transparent)]
    Status(#[from] TimeStatusError),
}

impl From<TimeManagerError> for TimeRequestError {
    fn from(err: TimeManagerError) -> Self {
        match err {
            TimeManagerError::UnknownFederate(federate) => TimeRequestError::FederateNotJoined(federate),
            TimeManagerError::Status(status) => TimeRequestError::Status(status),
        }
    }
}

/// Federation save/restore state, owned by the save/restore service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveRestoreStatus {
    #[default]
    Idle,
    Saving,
    Restoring,
}

/// Read-only inputs a handler needs besides time state
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext<'a> {
    pub config: &'a TimeConfig,
    pub save_restore: SaveRestoreStatus,
}

/// What a handled request produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutcome {
    /// Notices for every federate in the federation
    pub broadcasts: Vec<TimeNotice>,
    /// Grants, each for exactly one federate
    pub grants: Vec<TimeAdvanceGrant>,
    /// Messages flushed straight back to the requester
    pub flushed: Vec<Message>,
}

impl HandlerOutcome {
    fn broadcast(notice: TimeNotice) -> Self {
        Self {
            broadcasts: vec![notice],
            ..Self::default()
        }
    }

    fn merge(&mut self, other: HandlerOutcome) {
        self.broadcasts.extend(other.broadcasts);
        self.grants.extend(other.grants);
        self.flushed.extend(other.flushed);
    }
}

/// Dispatches time requests and tracks open regulation barriers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRequestHandler {
    /// Regulator → federates that still owe an acknowledgement
    awaiting_acks: BTreeMap<FederateHandle, BTreeSet<FederateHandle>>,
}

impl TimeRequestHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Federates that still owe `regulator` an acknowledgement
    pub fn awaiting_acknowledgements(&self, regulator: FederateHandle) -> Option<&BTreeSet<FederateHandle>> {
        self.awaiting_acks.get(&regulator)
    }

    /// Every open barrier with the federates it is still waiting on
    pub fn open_barriers(&self) -> impl Iterator<Item = (FederateHandle, &BTreeSet<FederateHandle>)> {
        self.awaiting_acks
            .iter()
            .map(|(regulator, awaiting)| (*regulator, awaiting))
    }

    /// Validate and apply one request from `source`
    pub fn handle(
        &mut self,
        time: &mut TimeManager,
        ctx: &HandlerContext<'_>,
        source: FederateHandle,
        request: &TimeRequest,
    ) -> Result<HandlerOutcome, TimeRequestError> {
        debug!(federate = source, request = request.name(), "handling time request");

        let result = self.dispatch(time, ctx, source, request);
        if let Err(err) = &result {
            debug!(federate = source, request = request.name(), error = %err, "time request rejected");
        }
        result
    }

    fn dispatch(
        &mut self,
        time: &mut TimeManager,
        ctx: &HandlerContext<'_>,
        source: FederateHandle,
        request: &TimeRequest,
    ) -> Result<HandlerOutcome, TimeRequestError> {
        if !time.contains(source) {
            return Err(TimeRequestError::FederateNotJoined(source));
        }
        if request.blocked_by_save_restore() {
            check_save_restore(ctx.save_restore)?;
        }

        match *request {
            TimeRequest::EnableTimeRegulation {
                federate_time,
                lookahead,
            } => self.enable_time_regulation(time, ctx.config, source, federate_time, lookahead),
            TimeRequest::DisableTimeRegulation => disable_time_regulation(time, source),
            TimeRequest::EnableTimeConstrained => enable_time_constrained(time, source),
            TimeRequest::DisableTimeConstrained => disable_time_constrained(time, source),
            TimeRequest::TimeAdvanceRequest {
                time: requested,
                next_event,
            } => time_advance_request(time, source, requested, next_event),
            TimeRequest::ModifyLookahead { lookahead } => {
                modify_lookahead(time, ctx.config, source, lookahead)
            }
            TimeRequest::FlushQueueRequest { max_time } => flush_queue_request(time, source, max_time),
            TimeRequest::EnableAsynchronousDelivery => set_asynchronous_delivery(time, source, true),
            TimeRequest::DisableAsynchronousDelivery => set_asynchronous_delivery(time, source, false),
            TimeRequest::RegulationAcknowledged { regulator } => {
                self.regulation_acknowledged(time, source, regulator)
            }
        }
    }

    // ========================================================================
    // Regulation
    // ========================================================================

    fn enable_time_regulation(
        &mut self,
        time: &mut TimeManager,
        config: &TimeConfig,
        source: FederateHandle,
        federate_time: f64,
        lookahead: f64,
    ) -> Result<HandlerOutcome, TimeRequestError> {
        let status = joined_status(time, source)?;
        status
            .regulating()
            .transition(TimeSwitch::Regulation, TriState::Pending)?;
        if let Some(requested) = status.requested_time() {
            return Err(TimeStatusError::AdvanceAlreadyInProgress { requested }.into());
        }
        validate_time(federate_time)?;
        let lookahead = effective_lookahead(lookahead, config.zero_lookahead_epsilon)?;

        time.begin_regulating(source, federate_time, lookahead)?;
        let regulating_at = joined_status(time, source)?.current_time();
        info!(federate = source, time = regulating_at, lookahead, "time regulation requested");

        let mut outcome = HandlerOutcome::broadcast(TimeNotice::Request(TimeRequest::EnableTimeRegulation {
            federate_time: regulating_at,
            lookahead,
        }));

        let peers: BTreeSet<FederateHandle> = time.federates().filter(|f| *f != source).collect();
        if config.regulation_barrier == RegulationBarrier::Immediate || peers.is_empty() {
            outcome.merge(confirm_regulation(time, source)?);
        } else {
            debug!(federate = source, peers = peers.len(), "waiting for regulation acknowledgements");
            self.awaiting_acks.insert(source, peers);
        }
        Ok(outcome)
    }

    fn regulation_acknowledged(
        &mut self,
        time: &mut TimeManager,
        source: FederateHandle,
        regulator: FederateHandle,
    ) -> Result<HandlerOutcome, TimeRequestError> {
        let owes = self
            .awaiting_acks
            .get(&regulator)
            .is_some_and(|awaiting| awaiting.contains(&source));
        if !owes {
            return Err(TimeRequestError::NotAwaitingAcknowledgement {
                regulator,
                from: source,
            });
        }

        if let Some(awaiting) = self.awaiting_acks.get_mut(&regulator) {
            awaiting.remove(&source);
        }
        self.release_barriers(time)
    }

    /// Confirm every regulator whose barrier has closed
    fn release_barriers(&mut self, time: &mut TimeManager) -> Result<HandlerOutcome, TimeRequestError> {
        let closed: Vec<FederateHandle> = self
            .awaiting_acks
            .iter()
            .filter(|(_, awaiting)| awaiting.is_empty())
            .map(|(regulator, _)| *regulator)
            .collect();

        let mut outcome = HandlerOutcome::default();
        for regulator in closed {
            self.awaiting_acks.remove(&regulator);
            outcome.merge(confirm_regulation(time, regulator)?);
        }
        Ok(outcome)
    }

    // ========================================================================
    // Membership and incoming-message cycle
    // ========================================================================

    /// Clean up after a resigned federate
    ///
    /// Drops its own barrier, removes it from every barrier it owed, and
    /// re-evaluates advances now that its bound is gone.
    pub fn resigned(
        &mut self,
        time: &mut TimeManager,
        federate: FederateHandle,
    ) -> Result<HandlerOutcome, TimeRequestError> {
        self.awaiting_acks.remove(&federate);
        for awaiting in self.awaiting_acks.values_mut() {
            awaiting.remove(&federate);
        }

        let mut outcome = HandlerOutcome {
            grants: time.resigned_federation(federate),
            ..HandlerOutcome::default()
        };
        outcome.merge(self.release_barriers(time)?);
        Ok(outcome)
    }

    /// Complete a PENDING constrained enable for `federate`
    ///
    /// Runs at the start of the federate's incoming-message cycle.
    pub fn confirm_pending(
        &mut self,
        time: &mut TimeManager,
        federate: FederateHandle,
    ) -> Result<HandlerOutcome, TimeRequestError> {
        if !joined_status(time, federate)?.constrained().is_pending() {
            return Ok(HandlerOutcome::default());
        }

        let at = time.confirm_constrained(federate)?;
        time.deliver(
            federate,
            Message::receive_order(None, Payload::TimeConstrainedEnabled { time: at }),
        )?;
        Ok(HandlerOutcome::broadcast(TimeNotice::ConstrainedEnabled { federate, time: at }))
    }
}

fn check_save_restore(status: SaveRestoreStatus) -> Result<(), TimeRequestError> {
    match status {
        SaveRestoreStatus::Idle => Ok(()),
        SaveRestoreStatus::Saving => Err(TimeRequestError::SaveInProgress),
        SaveRestoreStatus::Restoring => Err(TimeRequestError::RestoreInProgress),
    }
}

fn joined_status(time: &TimeManager, federate: FederateHandle) -> Result<&TimeStatus, TimeRequestError> {
    time.status(federate)
        .ok_or(TimeRequestError::FederateNotJoined(federate))
}

/// Neither switch may be half-enabled when asking to move in time
fn check_no_pending_switch(status: &TimeStatus) -> Result<(), TimeRequestError> {
    if status.regulating().is_pending() {
        return Err(TimeStatusError::EnablePending(TimeSwitch::Regulation).into());
    }
    if status.constrained().is_pending() {
        return Err(TimeStatusError::EnablePending(TimeSwitch::Constrained).into());
    }
    Ok(())
}

fn confirm_regulation(time: &mut TimeManager, federate: FederateHandle) -> Result<HandlerOutcome, TimeRequestError> {
    let at = time.confirm_regulating(federate)?;
    time.deliver(
        federate,
        Message::receive_order(None, Payload::TimeRegulationEnabled { time: at }),
    )?;
    Ok(HandlerOutcome::broadcast(TimeNotice::RegulationEnabled { federate, time: at }))
}

fn disable_time_regulation(time: &mut TimeManager, source: FederateHandle) -> Result<HandlerOutcome, TimeRequestError> {
    joined_status(time, source)?
        .regulating()
        .transition(TimeSwitch::Regulation, TriState::Off)?;

    let grants = time.disable_regulating(source)?;
    Ok(HandlerOutcome {
        broadcasts: vec![TimeNotice::Request(TimeRequest::DisableTimeRegulation)],
        grants,
        flushed: Vec::new(),
    })
}

// ============================================================================
// Constraint
// ============================================================================

fn enable_time_constrained(time: &mut TimeManager, source: FederateHandle) -> Result<HandlerOutcome, TimeRequestError> {
    let status = joined_status(time, source)?;
    status
        .constrained()
        .transition(TimeSwitch::Constrained, TriState::Pending)?;
    if let Some(requested) = status.requested_time() {
        return Err(TimeStatusError::AdvanceAlreadyInProgress { requested }.into());
    }

    time.begin_constrained(source)?;
    info!(federate = source, "time constrained requested");
    Ok(HandlerOutcome::broadcast(TimeNotice::Request(
        TimeRequest::EnableTimeConstrained,
    )))
}

fn disable_time_constrained(time: &mut TimeManager, source: FederateHandle) -> Result<HandlerOutcome, TimeRequestError> {
    joined_status(time, source)?
        .constrained()
        .transition(TimeSwitch::Constrained, TriState::Off)?;

    let grants = time.disable_constrained(source)?;
    Ok(HandlerOutcome {
        broadcasts: vec![TimeNotice::Request(TimeRequest::DisableTimeConstrained)],
        grants,
        flushed: Vec::new(),
    })
}

// ============================================================================
// Advancing
// ============================================================================

/// Time-advance and next-event requests share this path; the next-event
/// clamp is computed by the time manager.
fn time_advance_request(
    time: &mut TimeManager,
    source: FederateHandle,
    requested: f64,
    next_event: bool,
) -> Result<HandlerOutcome, TimeRequestError> {
    let status = joined_status(time, source)?;
    check_no_pending_switch(status)?;
    status.check_advance_request(requested)?;

    let grants = time.request_advance(source, requested, next_event)?;
    Ok(HandlerOutcome {
        broadcasts: vec![TimeNotice::Request(TimeRequest::TimeAdvanceRequest {
            time: requested,
            next_event,
        })],
        grants,
        flushed: Vec::new(),
    })
}

fn modify_lookahead(
    time: &mut TimeManager,
    config: &TimeConfig,
    source: FederateHandle,
    lookahead: f64,
) -> Result<HandlerOutcome, TimeRequestError> {
    let status = joined_status(time, source)?;
    match status.regulating() {
        TriState::On => {}
        TriState::Pending => return Err(TimeStatusError::EnablePending(TimeSwitch::Regulation).into()),
        TriState::Off => return Err(TimeStatusError::WasNotEnabled(TimeSwitch::Regulation).into()),
    }
    let lookahead = effective_lookahead(lookahead, config.zero_lookahead_epsilon)?;

    let requested = status.release_time() + lookahead;
    if time.has_constrained_federates() && requested < time.lbts() {
        return Err(TimeRequestError::LookaheadViolatesLbts {
            requested,
            federation_lbts: time.lbts(),
        });
    }

    let grants = time.set_lookahead(source, lookahead)?;
    debug!(federate = source, lookahead, lbts = time.lbts(), "lookahead modified");
    Ok(HandlerOutcome {
        broadcasts: vec![TimeNotice::Request(TimeRequest::ModifyLookahead { lookahead })],
        grants,
        flushed: Vec::new(),
    })
}

fn flush_queue_request(
    time: &mut TimeManager,
    source: FederateHandle,
    max_time: f64,
) -> Result<HandlerOutcome, TimeRequestError> {
    check_no_pending_switch(joined_status(time, source)?)?;

    let outcome = time.flush_queue(source, max_time)?;
    Ok(HandlerOutcome {
        broadcasts: vec![TimeNotice::TimeAdvanceGrant(outcome.grant)],
        grants: outcome.released,
        flushed: outcome.flush.messages,
    })
}

fn set_asynchronous_delivery(
    time: &mut TimeManager,
    source: FederateHandle,
    enabled: bool,
) -> Result<HandlerOutcome, TimeRequestError> {
    time.set_asynchronous(source, enabled)?;
    let request = if enabled {
        TimeRequest::EnableAsynchronousDelivery
    } else {
        TimeRequest::DisableAsynchronousDelivery
    };
    Ok(HandlerOutcome::broadcast(TimeNotice::Request(request)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(federates: &[FederateHandle]) -> (TimeRequestHandler, TimeManager, TimeConfig) {
        let mut time = TimeManager::new();
        for federate in federates {
            time.joined_federation(*federate, None);
        }
        (TimeRequestHandler::new(), time, TimeConfig::default())
    }

    #[test]
    fn test_lone_regulator_is_confirmed_immediately() {
        let (mut handler, mut time, config) = setup(&[1]);
        let ctx = HandlerContext {
            config: &config,
            save_restore: SaveRestoreStatus::Idle,
        };
        let request = TimeRequest::EnableTimeRegulation {
            federate_time: 0.0,
            lookahead: 1.0,
        };

        let outcome = handler.handle(&mut time, &ctx, 1, &request).unwrap();
        assert!(time.status(1).unwrap().is_regulating());
        assert!(outcome
            .broadcasts
            .contains(&TimeNotice::RegulationEnabled { federate: 1, time: 0.0 }));
    }

    #[test]
    fn test_acknowledgement_from_stranger_is_rejected() {
        let (mut handler, mut time, config) = setup(&[1, 2, 3]);
        let ctx = HandlerContext {
            config: &config,
            save_restore: SaveRestoreStatus::Idle,
        };
        let err = handler
            .handle(&mut time, &ctx, 2, &TimeRequest::RegulationAcknowledged { regulator: 1 })
            .unwrap_err();
        assert_eq!(err, TimeRequestError::NotAwaitingAcknowledgement { regulator: 1, from: 2 });
    }

    #[test]
    fn test_manager_error_maps_to_not_joined() {
        let err: TimeRequestError = TimeManagerError::UnknownFederate(4).into();
        assert_eq!(err, TimeRequestError::FederateNotJoined(4));
    }
}
