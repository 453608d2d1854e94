//! Per-federate time status
//!
//! One `TimeStatus` exists for every joined federate. It records the
//! regulating/constrained switches, the federate's logical time, its
//! lookahead and the advance request it is waiting on (if any).
//!
//! # Critical Invariants
//!
//! 1. `current_time` never decreases
//! 2. An advance request is outstanding only while `requested_time() > current_time`
//!    held at request time
//! 3. `lookahead >= 0`, and a requested lookahead of exactly zero is stored as
//!    a small positive epsilon
//! 4. Regulating/constrained only move through OFF → PENDING → ON → OFF
//! 5. A regulator never sends a TSO message below its `bound()`
//!
//! Mutators check their own preconditions and return an error without touching
//! state, but handlers are expected to validate first so a whole request is
//! rejected before anything changes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable identity of a joined federate
pub type FederateHandle = u32;

/// Lookahead stored when a federate asks for exactly zero
///
/// Zero lookahead lets a regulator's bound sit on its own current time, which
/// stalls any constrained federate trying to pass that instant. The value is a
/// tunable policy constant; see `TimeConfig::zero_lookahead_epsilon`.
pub const DEFAULT_ZERO_LOOKAHEAD_EPSILON: f64 = 1e-9;

/// Which time-management switch an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSwitch {
    Regulation,
    Constrained,
    AsynchronousDelivery,
}

impl fmt::Display for TimeSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSwitch::Regulation => write!(f, "time regulation"),
            TimeSwitch::Constrained => write!(f, "time constrained"),
            TimeSwitch::AsynchronousDelivery => write!(f, "asynchronous delivery"),
        }
    }
}

/// Errors raised by `TimeStatus` mutators
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TimeStatusError {
    #[error("{0} is already enabled")]
    AlreadyEnabled(TimeSwitch),

    #[error("{0} was not enabled")]
    WasNotEnabled(TimeSwitch),

    #[error("enabling {0} is still pending")]
    EnablePending(TimeSwitch),

    #[error("invalid {switch} transition from {from:?} to {to:?}")]
    InvalidTransition {
        switch: TimeSwitch,
        from: TriState,
        to: TriState,
    },

    #[error("time {requested} has already passed (current time {current})")]
    AlreadyPassed { requested: f64, current: f64 },

    #[error("a time advance is already in progress (requested {requested})")]
    AdvanceAlreadyInProgress { requested: f64 },

    #[error("no time advance is in progress")]
    NoAdvanceInProgress,

    #[error("invalid lookahead: {0}")]
    InvalidLookahead(f64),

    #[error("invalid logical time: {0}")]
    InvalidTime(f64),

    #[error("TSO timestamp {timestamp} is below the sender's bound {bound}")]
    InvalidTimestamp { timestamp: f64, bound: f64 },
}

/// Three-valued switch used for regulation and constraint
///
/// PENDING covers the window between a federate asking to enable the switch
/// and the federation confirming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    #[default]
    Off,
    Pending,
    On,
}

impl TriState {
    pub fn is_on(self) -> bool {
        self == TriState::On
    }

    pub fn is_pending(self) -> bool {
        self == TriState::Pending
    }

    pub fn is_off(self) -> bool {
        self == TriState::Off
    }

    /// Validate a move to `to`, returning the new state
    ///
    /// Only OFF → PENDING, PENDING → ON and ON → OFF are legal.
    pub fn transition(self, switch: TimeSwitch, to: TriState) -> Result<TriState, TimeStatusError> {
        match (self, to) {
            (TriState::Off, TriState::Pending)
            | (TriState::Pending, TriState::On)
            | (TriState::On, TriState::Off) => Ok(to),
            (TriState::On, TriState::Pending) | (TriState::On, TriState::On) => {
                Err(TimeStatusError::AlreadyEnabled(switch))
            }
            (TriState::Pending, TriState::Pending) | (TriState::Pending, TriState::Off) => {
                Err(TimeStatusError::EnablePending(switch))
            }
            (TriState::Off, TriState::Off) => Err(TimeStatusError::WasNotEnabled(switch)),
            (TriState::Off, TriState::On) => Err(TimeStatusError::InvalidTransition {
                switch,
                from: self,
                to,
            }),
        }
    }
}

/// How an outstanding advance chooses its target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdvanceKind {
    /// Advance exactly to the requested time
    TimeAdvance,

    /// Advance to the requested time or the next queued TSO event, whichever
    /// is earlier. `ceiling` is the time the federate originally asked for.
    NextEvent { ceiling: f64 },
}

/// An advance the federate is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdvanceRequest {
    /// Effective target time
    pub time: f64,
    pub kind: AdvanceKind,
}

/// Time-related status of one federate
///
/// # Example
/// ```
/// use hla_time_core::models::time_status::{TimeStatus, TriState};
///
/// let mut status = TimeStatus::new(1);
/// status.set_lookahead(5.0).unwrap();
/// status.time_advance_requested(10.0).unwrap();
/// assert_eq!(status.requested_time(), Some(10.0));
///
/// status.advance_granted(10.0).unwrap();
/// assert_eq!(status.current_time(), 10.0);
/// assert_eq!(status.requested_time(), None);
/// assert_eq!(status.regulating(), TriState::Off);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeStatus {
    federate: FederateHandle,
    regulating: TriState,
    constrained: TriState,
    /// Whether RO messages may be delivered while no advance is outstanding
    asynchronous: bool,
    lookahead: f64,
    current_time: f64,
    advance: Option<AdvanceRequest>,
}

impl TimeStatus {
    /// Fresh status for a federate that has just joined
    pub fn new(federate: FederateHandle) -> Self {
        Self {
            federate,
            regulating: TriState::Off,
            constrained: TriState::Off,
            asynchronous: false,
            lookahead: 0.0,
            current_time: 0.0,
            advance: None,
        }
    }

    pub fn federate(&self) -> FederateHandle {
        self.federate
    }

    pub fn regulating(&self) -> TriState {
        self.regulating
    }

    pub fn constrained(&self) -> TriState {
        self.constrained
    }

    pub fn is_regulating(&self) -> bool {
        self.regulating.is_on()
    }

    pub fn is_constrained(&self) -> bool {
        self.constrained.is_on()
    }

    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    pub fn lookahead(&self) -> f64 {
        self.lookahead
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    /// Target of the outstanding advance, `None` while idle
    pub fn requested_time(&self) -> Option<f64> {
        self.advance.map(|advance| advance.time)
    }

    pub fn advance(&self) -> Option<AdvanceRequest> {
        self.advance
    }

    pub fn is_advancing(&self) -> bool {
        self.advance.is_some()
    }

    /// This federate's contribution to the federation LBTS
    ///
    /// While an advance is outstanding the federate may only send TSO messages
    /// at or after `requested + lookahead`, so the bound moves with the request.
    pub fn bound(&self) -> f64 {
        self.release_time() + self.lookahead
    }

    /// Check the timestamp of a TSO message this federate is sending
    ///
    /// Regulators (ON or PENDING) may not send below their bound.
    pub fn check_send_timestamp(&self, timestamp: f64) -> Result<(), TimeStatusError> {
        validate_time(timestamp)?;
        if !self.regulating.is_off() && timestamp < self.bound() {
            return Err(TimeStatusError::InvalidTimestamp {
                timestamp,
                bound: self.bound(),
            });
        }
        Ok(())
    }

    /// Upper bound on TSO timestamps this federate may currently receive
    pub fn release_time(&self) -> f64 {
        self.requested_time().unwrap_or(self.current_time)
    }

    pub fn set_regulating(&mut self, state: TriState) -> Result<(), TimeStatusError> {
        self.regulating = self.regulating.transition(TimeSwitch::Regulation, state)?;
        Ok(())
    }

    pub fn set_constrained(&mut self, state: TriState) -> Result<(), TimeStatusError> {
        self.constrained = self.constrained.transition(TimeSwitch::Constrained, state)?;
        Ok(())
    }

    pub fn set_asynchronous(&mut self, enabled: bool) -> Result<(), TimeStatusError> {
        match (self.asynchronous, enabled) {
            (true, true) => Err(TimeStatusError::AlreadyEnabled(TimeSwitch::AsynchronousDelivery)),
            (false, false) => Err(TimeStatusError::WasNotEnabled(TimeSwitch::AsynchronousDelivery)),
            _ => {
                self.asynchronous = enabled;
                Ok(())
            }
        }
    }

    /// Set lookahead with the default zero-lookahead epsilon
    ///
    /// Returns the value actually stored.
    pub fn set_lookahead(&mut self, value: f64) -> Result<f64, TimeStatusError> {
        self.set_lookahead_with(value, DEFAULT_ZERO_LOOKAHEAD_EPSILON)
    }

    /// Set lookahead, storing `epsilon` in place of an exact zero
    pub fn set_lookahead_with(&mut self, value: f64, epsilon: f64) -> Result<f64, TimeStatusError> {
        let stored = effective_lookahead(value, epsilon)?;
        self.lookahead = stored;
        Ok(stored)
    }

    /// Check that an advance to `time` could be requested right now
    pub fn check_advance_request(&self, time: f64) -> Result<(), TimeStatusError> {
        validate_time(time)?;
        if let Some(advance) = self.advance {
            return Err(TimeStatusError::AdvanceAlreadyInProgress {
                requested: advance.time,
            });
        }
        if time <= self.current_time {
            return Err(TimeStatusError::AlreadyPassed {
                requested: time,
                current: self.current_time,
            });
        }
        Ok(())
    }

    /// Record a plain time-advance request
    pub fn time_advance_requested(&mut self, time: f64) -> Result<(), TimeStatusError> {
        self.advance_requested(AdvanceRequest {
            time,
            kind: AdvanceKind::TimeAdvance,
        })
    }

    /// Record an advance request of either kind
    pub fn advance_requested(&mut self, request: AdvanceRequest) -> Result<(), TimeStatusError> {
        self.check_advance_request(request.time)?;
        self.advance = Some(request);
        Ok(())
    }

    /// Move the target of an outstanding next-event advance
    pub(crate) fn retarget_advance(&mut self, time: f64) {
        if let Some(advance) = self.advance.as_mut() {
            if time > self.current_time {
                advance.time = time;
            }
        }
    }

    /// Complete the outstanding advance at `time`
    pub fn advance_granted(&mut self, time: f64) -> Result<(), TimeStatusError> {
        if self.advance.is_none() {
            return Err(TimeStatusError::NoAdvanceInProgress);
        }
        self.move_to(time)?;
        self.advance = None;
        Ok(())
    }

    /// Move current time forward without an outstanding advance
    ///
    /// Used by flush-queue grants and when regulation is enabled at a later time.
    pub fn move_to(&mut self, time: f64) -> Result<(), TimeStatusError> {
        validate_time(time)?;
        if time < self.current_time {
            return Err(TimeStatusError::AlreadyPassed {
                requested: time,
                current: self.current_time,
            });
        }
        self.current_time = time;
        Ok(())
    }
}

/// Lookahead that would be stored for `value`
///
/// Negative or non-finite values are rejected; exactly zero becomes `epsilon`.
pub fn effective_lookahead(value: f64, epsilon: f64) -> Result<f64, TimeStatusError> {
    if !value.is_finite() || value < 0.0 {
        return Err(TimeStatusError::InvalidLookahead(value));
    }
    if value == 0.0 {
        Ok(epsilon)
    } else {
        Ok(value)
    }
}

/// Reject NaN, infinite and negative logical times
pub fn validate_time(time: f64) -> Result<(), TimeStatusError> {
    if !time.is_finite() || time < 0.0 {
        return Err(TimeStatusError::InvalidTime(time));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tristate_cycle() {
        let state = TriState::Off;
        let state = state.transition(TimeSwitch::Regulation, TriState::Pending).unwrap();
        let state = state.transition(TimeSwitch::Regulation, TriState::On).unwrap();
        let state = state.transition(TimeSwitch::Regulation, TriState::Off).unwrap();
        assert_eq!(state, TriState::Off);
    }

    #[test]
    fn test_tristate_rejects_skipping_pending() {
        let err = TriState::Off
            .transition(TimeSwitch::Constrained, TriState::On)
            .unwrap_err();
        assert!(matches!(err, TimeStatusError::InvalidTransition { .. }));
    }

    #[test]
    fn test_zero_lookahead_uses_epsilon() {
        assert_eq!(effective_lookahead(0.0, 1e-9).unwrap(), 1e-9);
        assert_eq!(effective_lookahead(2.5, 1e-9).unwrap(), 2.5);
        assert!(effective_lookahead(-1.0, 1e-9).is_err());
        assert!(effective_lookahead(f64::NAN, 1e-9).is_err());
    }

    #[test]
    fn test_retarget_ignores_past_times() {
        let mut status = TimeStatus::new(3);
        status.move_to(5.0).unwrap();
        status
            .advance_requested(AdvanceRequest {
                time: 20.0,
                kind: AdvanceKind::NextEvent { ceiling: 20.0 },
            })
            .unwrap();

        status.retarget_advance(4.0);
        assert_eq!(status.requested_time(), Some(20.0));

        status.retarget_advance(8.0);
        assert_eq!(status.requested_time(), Some(8.0));
    }

    #[test]
    fn test_bound_follows_outstanding_advance() {
        let mut status = TimeStatus::new(1);
        status.set_lookahead(5.0).unwrap();
        assert_eq!(status.bound(), 5.0);

        status.time_advance_requested(10.0).unwrap();
        assert_eq!(status.bound(), 15.0);

        status.advance_granted(10.0).unwrap();
        assert_eq!(status.bound(), 15.0);
    }

    #[test]
    fn test_regulator_cannot_send_below_bound() {
        let mut status = TimeStatus::new(1);
        status.set_lookahead(5.0).unwrap();
        // not regulating: any valid timestamp passes
        assert!(status.check_send_timestamp(1.0).is_ok());

        status.set_regulating(TriState::Pending).unwrap();
        assert_eq!(
            status.check_send_timestamp(4.0),
            Err(TimeStatusError::InvalidTimestamp {
                timestamp: 4.0,
                bound: 5.0
            })
        );
        assert!(status.check_send_timestamp(5.0).is_ok());
    }
}
