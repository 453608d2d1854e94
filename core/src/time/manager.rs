//! Federation-wide time manager
//!
//! Keeps the `TimeStatus` and `EventQueue` of every joined federate and decides
//! when outstanding advances can be granted.
//!
//! # LBTS
//!
//! The federation LBTS is the minimum regulator bound over every regulating
//! federate (ON or PENDING), or infinity when nobody regulates. A regulator's
//! bound is `current_time + lookahead` while idle and `requested + lookahead`
//! while it has an advance outstanding. No TSO message with a smaller timestamp
//! can still be sent by a regulator: `deliver` rejects a regulator's message
//! below its bound.
//!
//! A federate's GALT is the same minimum taken over the *other* regulators; a
//! federate never waits on its own messages. For a federate that does not
//! regulate, GALT equals the federation LBTS.
//!
//! # Grant Rule
//!
//! An outstanding advance to `T` is granted when the federate is not
//! constrained, or when `T <= GALT`. Next-event advances first clamp `T` to
//! the earliest queued TSO event after the federate's current time.
//!
//! Every mutation that can move LBTS or a target (enable/disable, lookahead,
//! advance request, join, resign, new TSO message) finishes with a
//! re-evaluation pass. Next-event targets are settled and LBTS recomputed
//! before any grant is decided; a grant lands on the federate's target, so it
//! leaves every bound where it was and one pass is enough.
//!
//! The manager validates only what `TimeStatus` validates. Handlers check
//! request preconditions before calling in.

use crate::events::types::TimeAdvanceGrant;
use crate::models::message::Message;
use crate::models::queue::{EventQueue, FlushResult, ReleaseContext};
use crate::models::time_status::{
    validate_time, AdvanceKind, AdvanceRequest, FederateHandle, TimeStatus, TimeStatusError,
    TimeSwitch, TriState,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by `TimeManager` operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TimeManagerError {
    #[error("federate {0} is not joined to the federation")]
    UnknownFederate(FederateHandle),

    #[error(transparent)]
    Status(#[from] TimeStatusError),
}

/// Time state owned for one joined federate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederateEntry {
    pub status: TimeStatus,
    pub queue: EventQueue,
}

/// Outcome of a flush-queue request
#[derive(Debug, Clone, PartialEq)]
pub struct FlushOutcome {
    /// Flushed messages and the time the federate was moved to
    pub flush: FlushResult,
    /// Grant to the flushing federate
    pub grant: TimeAdvanceGrant,
    /// Advances of other federates unblocked by the move
    pub released: Vec<TimeAdvanceGrant>,
}

/// Single source of truth for federation time state
///
/// # Example
///
/// ```rust
/// use hla_time_core::TimeManager;
///
/// let mut time = TimeManager::new();
/// time.joined_federation(1, None);
/// time.joined_federation(2, None);
///
/// time.begin_regulating(1, 0.0, 5.0).unwrap();
/// assert_eq!(time.lbts(), 5.0);
///
/// time.begin_constrained(2).unwrap();
/// time.confirm_constrained(2).unwrap();
/// let grants = time.request_advance(2, 10.0, false).unwrap();
/// assert!(grants.is_empty()); // 10 > LBTS 5
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TimeManager {
    federates: BTreeMap<FederateHandle, FederateEntry>,
    /// Federates whose regulation is ON or PENDING
    regulating: BTreeSet<FederateHandle>,
    /// Federates whose constraint is ON
    constrained: BTreeSet<FederateHandle>,
    lbts: f64,
}

impl Default for TimeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeManager {
    pub fn new() -> Self {
        Self {
            federates: BTreeMap::new(),
            regulating: BTreeSet::new(),
            constrained: BTreeSet::new(),
            lbts: f64::INFINITY,
        }
    }

    /// Rebuild a manager from saved entries
    pub fn from_entries(entries: impl IntoIterator<Item = FederateEntry>) -> Self {
        let mut manager = Self::new();
        for entry in entries {
            let federate = entry.status.federate();
            manager.index(federate, &entry.status);
            manager.federates.insert(federate, entry);
        }
        manager.recalculate_lbts();
        manager
    }

    fn index(&mut self, federate: FederateHandle, status: &TimeStatus) {
        if !status.regulating().is_off() {
            self.regulating.insert(federate);
        }
        if status.is_constrained() {
            self.constrained.insert(federate);
        }
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Create time state for a federate that has just joined
    ///
    /// `existing` carries a status transferred from elsewhere (for example a
    /// restored federate); `None` starts from defaults.
    pub fn joined_federation(&mut self, federate: FederateHandle, existing: Option<TimeStatus>) {
        let status = existing.unwrap_or_else(|| TimeStatus::new(federate));
        let mut queue = EventQueue::new();
        queue.set_constrained(status.is_constrained());

        self.index(federate, &status);
        self.federates.insert(federate, FederateEntry { status, queue });
        self.recalculate_lbts();
        info!(federate, lbts = self.lbts, "federate joined time management");
    }

    /// Drop a resigned federate and grant whatever its departure unblocks
    pub fn resigned_federation(&mut self, federate: FederateHandle) -> Vec<TimeAdvanceGrant> {
        if self.federates.remove(&federate).is_none() {
            return Vec::new();
        }
        self.regulating.remove(&federate);
        self.constrained.remove(&federate);
        self.recalculate_lbts();
        info!(federate, lbts = self.lbts, "federate resigned from time management");
        self.evaluate_advances()
    }

    pub fn contains(&self, federate: FederateHandle) -> bool {
        self.federates.contains_key(&federate)
    }

    pub fn federates(&self) -> impl Iterator<Item = FederateHandle> + '_ {
        self.federates.keys().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FederateEntry> {
        self.federates.values()
    }

    pub fn num_federates(&self) -> usize {
        self.federates.len()
    }

    pub fn status(&self, federate: FederateHandle) -> Option<&TimeStatus> {
        self.federates.get(&federate).map(|entry| &entry.status)
    }

    pub fn queue(&self, federate: FederateHandle) -> Option<&EventQueue> {
        self.federates.get(&federate).map(|entry| &entry.queue)
    }

    fn entry_mut(&mut self, federate: FederateHandle) -> Result<&mut FederateEntry, TimeManagerError> {
        self.federates
            .get_mut(&federate)
            .ok_or(TimeManagerError::UnknownFederate(federate))
    }

    // ========================================================================
    // LBTS / GALT
    // ========================================================================

    /// Federation-wide LBTS as of the last recalculation
    pub fn lbts(&self) -> f64 {
        self.lbts
    }

    /// Recompute LBTS from the current regulating set
    pub fn recalculate_lbts(&mut self) -> f64 {
        let lbts = self.bound_excluding(None);
        if lbts != self.lbts {
            debug!(old = self.lbts, new = lbts, "federation LBTS changed");
            self.lbts = lbts;
        }
        self.lbts
    }

    /// Greatest time `federate` may be granted while constrained
    pub fn galt_for(&self, federate: FederateHandle) -> f64 {
        if self.regulating.contains(&federate) {
            self.bound_excluding(Some(federate))
        } else {
            self.lbts
        }
    }

    fn bound_excluding(&self, excluded: Option<FederateHandle>) -> f64 {
        self.regulating
            .iter()
            .filter(|handle| Some(**handle) != excluded)
            .filter_map(|handle| self.federates.get(handle))
            .map(|entry| entry.status.bound())
            .fold(f64::INFINITY, f64::min)
    }

    pub fn regulating_federates(&self) -> &BTreeSet<FederateHandle> {
        &self.regulating
    }

    pub fn constrained_federates(&self) -> &BTreeSet<FederateHandle> {
        &self.constrained
    }

    pub fn has_regulating_federates(&self) -> bool {
        !self.regulating.is_empty()
    }

    pub fn has_constrained_federates(&self) -> bool {
        !self.constrained.is_empty()
    }

    // ========================================================================
    // Regulation and constraint
    // ========================================================================

    /// Mark `federate` as a PENDING regulator at `federate_time`
    ///
    /// Current time moves to `federate_time` if that is later. The regulator's
    /// bound counts toward LBTS from this point on.
    pub fn begin_regulating(
        &mut self,
        federate: FederateHandle,
        federate_time: f64,
        lookahead: f64,
    ) -> Result<(), TimeManagerError> {
        validate_time(federate_time)?;
        let entry = self.entry_mut(federate)?;
        entry
            .status
            .regulating()
            .transition(TimeSwitch::Regulation, TriState::Pending)?;
        let target = federate_time.max(entry.status.current_time());

        entry.status.set_lookahead(lookahead)?;
        entry.status.set_regulating(TriState::Pending)?;
        entry.status.move_to(target)?;
        self.regulating.insert(federate);
        self.recalculate_lbts();
        Ok(())
    }

    /// PENDING → ON for a regulator; returns the time it is regulating at
    pub fn confirm_regulating(&mut self, federate: FederateHandle) -> Result<f64, TimeManagerError> {
        let entry = self.entry_mut(federate)?;
        entry.status.set_regulating(TriState::On)?;
        let time = entry.status.current_time();
        info!(federate, time, "time regulation enabled");
        Ok(time)
    }

    pub fn disable_regulating(
        &mut self,
        federate: FederateHandle,
    ) -> Result<Vec<TimeAdvanceGrant>, TimeManagerError> {
        self.entry_mut(federate)?.status.set_regulating(TriState::Off)?;
        self.regulating.remove(&federate);
        self.recalculate_lbts();
        info!(federate, lbts = self.lbts, "time regulation disabled");
        Ok(self.evaluate_advances())
    }

    pub fn begin_constrained(&mut self, federate: FederateHandle) -> Result<(), TimeManagerError> {
        self.entry_mut(federate)?
            .status
            .set_constrained(TriState::Pending)?;
        Ok(())
    }

    /// PENDING → ON for a constrained federate; returns its current time
    pub fn confirm_constrained(&mut self, federate: FederateHandle) -> Result<f64, TimeManagerError> {
        let entry = self.entry_mut(federate)?;
        entry.status.set_constrained(TriState::On)?;
        entry.queue.set_constrained(true);
        let time = entry.status.current_time();
        self.constrained.insert(federate);
        info!(federate, time, "time constrained enabled");
        Ok(time)
    }

    /// Turn constraint off; queued TSO messages become RO
    pub fn disable_constrained(
        &mut self,
        federate: FederateHandle,
    ) -> Result<Vec<TimeAdvanceGrant>, TimeManagerError> {
        let entry = self.entry_mut(federate)?;
        entry.status.set_constrained(TriState::Off)?;
        entry.queue.became_unconstrained();
        self.constrained.remove(&federate);
        info!(federate, "time constrained disabled");
        Ok(self.evaluate_advances())
    }

    pub fn set_asynchronous(
        &mut self,
        federate: FederateHandle,
        enabled: bool,
    ) -> Result<(), TimeManagerError> {
        self.entry_mut(federate)?.status.set_asynchronous(enabled)?;
        Ok(())
    }

    /// Replace a federate's lookahead and re-evaluate pending advances
    pub fn set_lookahead(
        &mut self,
        federate: FederateHandle,
        lookahead: f64,
    ) -> Result<Vec<TimeAdvanceGrant>, TimeManagerError> {
        self.entry_mut(federate)?.status.set_lookahead(lookahead)?;
        if self.regulating.contains(&federate) {
            self.recalculate_lbts();
        }
        Ok(self.evaluate_advances())
    }

    // ========================================================================
    // Advancing
    // ========================================================================

    /// Record an advance request and grant whatever is now grantable
    ///
    /// With `next_event` set the target is clamped to the next queued TSO event.
    pub fn request_advance(
        &mut self,
        federate: FederateHandle,
        time: f64,
        next_event: bool,
    ) -> Result<Vec<TimeAdvanceGrant>, TimeManagerError> {
        let entry = self.entry_mut(federate)?;
        entry.status.check_advance_request(time)?;

        let current = entry.status.current_time();
        let request = if next_event {
            AdvanceRequest {
                time: next_event_target(time, current, entry.queue.next_event_after(current)),
                kind: AdvanceKind::NextEvent { ceiling: time },
            }
        } else {
            AdvanceRequest {
                time,
                kind: AdvanceKind::TimeAdvance,
            }
        };
        entry.status.advance_requested(request)?;
        debug!(federate, requested = time, target = request.time, next_event, "advance requested");

        if self.regulating.contains(&federate) {
            self.recalculate_lbts();
        }
        Ok(self.evaluate_advances())
    }

    /// Queue an incoming message for `federate`
    ///
    /// A new TSO event can lower the target of a pending next-event advance,
    /// so this re-evaluates too. TSO messages from a regulator below its bound
    /// are rejected; those from a joined federate that does not regulate are
    /// queued receive order.
    pub fn deliver(
        &mut self,
        federate: FederateHandle,
        message: Message,
    ) -> Result<Vec<TimeAdvanceGrant>, TimeManagerError> {
        if !self.contains(federate) {
            return Err(TimeManagerError::UnknownFederate(federate));
        }
        let message = self.check_sender(message)?;
        let entry = self.entry_mut(federate)?;
        let timestamped = message.is_timestamped();
        entry.queue.offer(message);

        let waiting_on_event = matches!(
            entry.status.advance(),
            Some(AdvanceRequest {
                kind: AdvanceKind::NextEvent { .. },
                ..
            })
        );
        if timestamped && waiting_on_event {
            Ok(self.evaluate_advances())
        } else {
            Ok(Vec::new())
        }
    }

    /// Apply the sending federate's regulation status to a message
    fn check_sender(&self, message: Message) -> Result<Message, TimeManagerError> {
        let (Some(sender), Some(timestamp)) = (message.source, message.timestamp()) else {
            return Ok(message);
        };
        let Some(status) = self.status(sender) else {
            return Ok(message);
        };
        if status.regulating().is_off() {
            debug!(sender, timestamp, "TSO message from non-regulator queued receive order");
            return Ok(message.into_receive_order());
        }
        status.check_send_timestamp(timestamp)?;
        Ok(message)
    }

    /// Release the next deliverable message for `federate`
    pub fn poll(&mut self, federate: FederateHandle) -> Result<Option<Message>, TimeManagerError> {
        let lbts = self.lbts;
        let entry = self.entry_mut(federate)?;
        let ctx = ReleaseContext {
            constrained: entry.status.is_constrained(),
            asynchronous: entry.status.is_asynchronous(),
            advancing: entry.status.is_advancing(),
            federation_lbts: lbts,
            release_time: entry.status.release_time(),
        };
        Ok(entry.queue.poll(&ctx))
    }

    /// Least incoming time stamp for `federate`
    ///
    /// The smaller of its GALT and the earliest TSO event already queued for
    /// it: no TSO message it has yet to receive can carry an earlier timestamp.
    pub fn lits_for(&self, federate: FederateHandle) -> Option<f64> {
        let queued = self.queue(federate)?.peek_next_tso_timestamp();
        let galt = self.galt_for(federate);
        Some(queued.map_or(galt, |next| next.min(galt)))
    }

    /// Flush `federate`'s queue up to `max_time` and move it as far as allowed
    ///
    /// The federate lands on `max_time`, or its GALT when constrained and that
    /// is earlier, but never before its current time.
    pub fn flush_queue(
        &mut self,
        federate: FederateHandle,
        max_time: f64,
    ) -> Result<FlushOutcome, TimeManagerError> {
        validate_time(max_time)?;
        let galt = self.galt_for(federate);
        let entry = self.entry_mut(federate)?;
        if let Some(requested) = entry.status.requested_time() {
            return Err(TimeStatusError::AdvanceAlreadyInProgress { requested }.into());
        }
        let current = entry.status.current_time();
        if max_time < current {
            return Err(TimeStatusError::AlreadyPassed {
                requested: max_time,
                current,
            }
            .into());
        }

        let include_ro = !entry.status.is_constrained() || entry.status.is_asynchronous();
        let mut flush = entry.queue.flush(max_time, include_ro);
        let mut grant_time = flush.grant_time;
        if entry.status.is_constrained() {
            grant_time = grant_time.min(galt);
        }
        grant_time = grant_time.max(current);
        flush.grant_time = grant_time;

        entry.status.move_to(grant_time)?;
        entry.queue.offer(Message::time_advance_grant(grant_time));
        debug!(
            federate,
            max_time,
            grant_time,
            flushed = flush.messages.len(),
            "queue flushed"
        );

        if self.regulating.contains(&federate) {
            self.recalculate_lbts();
        }
        let released = self.evaluate_advances();

        Ok(FlushOutcome {
            flush,
            grant: TimeAdvanceGrant {
                federate,
                time: grant_time,
            },
            released,
        })
    }

    /// Grant every outstanding advance that has become grantable
    ///
    /// Grants are issued in federate-handle order.
    pub fn evaluate_advances(&mut self) -> Vec<TimeAdvanceGrant> {
        self.retarget_next_events();

        let advancing: Vec<FederateHandle> = self
            .federates
            .iter()
            .filter(|(_, entry)| entry.status.is_advancing())
            .map(|(handle, _)| *handle)
            .collect();

        let mut grants = Vec::new();
        for federate in advancing {
            if let Some(time) = self.grantable_time(federate) {
                if self.grant(federate, time) {
                    grants.push(TimeAdvanceGrant { federate, time });
                }
            }
        }
        grants
    }

    /// Move next-event targets down to newly queued earlier events
    fn retarget_next_events(&mut self) {
        let mut moved_bound = false;
        for (handle, entry) in self.federates.iter_mut() {
            let Some(AdvanceRequest {
                time,
                kind: AdvanceKind::NextEvent { ceiling },
            }) = entry.status.advance()
            else {
                continue;
            };
            let current = entry.status.current_time();
            let target = next_event_target(ceiling, current, entry.queue.next_event_after(current));
            if target != time {
                entry.status.retarget_advance(target);
                debug!(federate = *handle, from = time, to = target, "next-event target moved");
                moved_bound |= self.regulating.contains(handle);
            }
        }
        if moved_bound {
            self.recalculate_lbts();
        }
    }

    /// Time `federate` can be granted right now, if any
    fn grantable_time(&self, federate: FederateHandle) -> Option<f64> {
        let status = self.status(federate)?;
        let target = status.requested_time()?;
        if !status.is_constrained() || target <= self.galt_for(federate) {
            Some(target)
        } else {
            None
        }
    }

    fn grant(&mut self, federate: FederateHandle, time: f64) -> bool {
        let Some(entry) = self.federates.get_mut(&federate) else {
            return false;
        };
        if let Err(err) = entry.status.advance_granted(time) {
            warn!(federate, time, error = %err, "advance grant rejected by federate status");
            return false;
        }
        entry.queue.offer(Message::time_advance_grant(time));
        debug!(federate, time, "advance granted");
        true
    }
}

/// Effective target of a next-event request
///
/// The earliest queued TSO event wins when it lies strictly between the current
/// time and the requested time.
///
/// ```rust
/// use hla_time_core::time::next_event_target;
///
/// assert_eq!(next_event_target(100.0, 0.0, Some(42.0)), 42.0);
/// assert_eq!(next_event_target(100.0, 0.0, Some(150.0)), 100.0);
/// assert_eq!(next_event_target(100.0, 0.0, None), 100.0);
/// ```
pub fn next_event_target(requested: f64, current: f64, next_event: Option<f64>) -> f64 {
    match next_event {
        Some(next) if next > current && next < requested => next,
        _ => requested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constrained(manager: &mut TimeManager, federate: FederateHandle) {
        manager.begin_constrained(federate).unwrap();
        manager.confirm_constrained(federate).unwrap();
    }

    #[test]
    fn test_no_regulators_means_infinite_lbts() {
        let mut manager = TimeManager::new();
        manager.joined_federation(1, None);
        assert_eq!(manager.recalculate_lbts(), f64::INFINITY);
    }

    #[test]
    fn test_galt_excludes_own_bound() {
        let mut manager = TimeManager::new();
        manager.joined_federation(1, None);
        manager.joined_federation(2, None);
        manager.begin_regulating(1, 0.0, 2.0).unwrap();
        manager.begin_regulating(2, 0.0, 7.0).unwrap();

        assert_eq!(manager.lbts(), 2.0);
        assert_eq!(manager.galt_for(1), 7.0);
        assert_eq!(manager.galt_for(2), 2.0);
    }

    #[test]
    fn test_unconstrained_advance_is_immediate() {
        let mut manager = TimeManager::new();
        manager.joined_federation(1, None);
        let grants = manager.request_advance(1, 3.0, false).unwrap();
        assert_eq!(grants, vec![TimeAdvanceGrant { federate: 1, time: 3.0 }]);
        assert_eq!(manager.status(1).unwrap().current_time(), 3.0);
    }

    #[test]
    fn test_mutual_regulators_advance_past_lookahead() {
        let mut manager = TimeManager::new();
        for federate in [1, 2] {
            manager.joined_federation(federate, None);
            manager.begin_regulating(federate, 0.0, 5.0).unwrap();
            manager.confirm_regulating(federate).unwrap();
            constrained(&mut manager, federate);
        }

        assert!(manager.request_advance(1, 10.0, false).unwrap().is_empty());
        assert_eq!(manager.lbts(), 5.0);

        let grants = manager.request_advance(2, 10.0, false).unwrap();
        assert_eq!(
            grants,
            vec![
                TimeAdvanceGrant { federate: 1, time: 10.0 },
                TimeAdvanceGrant { federate: 2, time: 10.0 },
            ]
        );
        assert_eq!(manager.lbts(), 15.0);
    }

    #[test]
    fn test_unknown_federate_is_an_error() {
        let mut manager = TimeManager::new();
        assert_eq!(
            manager.request_advance(9, 1.0, false),
            Err(TimeManagerError::UnknownFederate(9))
        );
    }
}
