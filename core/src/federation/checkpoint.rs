//! Checkpoint - Save/Restore Federation Time State
//!
//! Serializes the complete time-management state of a federation so a
//! federation save can be restored later.
//!
//! # Critical Invariants
//!
//! - **Config Matching**: a snapshot only restores into a federation whose
//!   `TimeConfig` hashes to the same value
//! - **Unique Federates**: every federate handle appears once
//! - **Derived LBTS**: LBTS is recomputed on restore; the stored value is
//!   informational

use crate::events::handler::TimeRequestHandler;
use crate::federation::config::TimeConfig;
use crate::models::time_status::FederateHandle;
use crate::time::manager::{FederateEntry, TimeManager};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Errors saving or restoring a snapshot
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config hash mismatch: snapshot {snapshot}, federation {federation}")]
    ConfigMismatch { snapshot: String, federation: String },

    #[error("snapshot belongs to federation {snapshot}, not {federation}")]
    FederationMismatch { snapshot: Uuid, federation: Uuid },

    #[error("invalid snapshot: {0}")]
    Invalid(String),

    #[error("expected save/restore status {expected}, found {actual}")]
    WrongStatus {
        expected: &'static str,
        actual: &'static str,
    },
}

// ============================================================================
// Snapshot Structures
// ============================================================================

/// Complete time-management state of one federation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSnapshot {
    pub federation: Uuid,

    /// Status and queued messages of every joined federate
    pub federates: Vec<FederateEntry>,

    /// Open regulation barriers
    pub handler: TimeRequestHandler,

    /// Federation LBTS at save time; `None` when unbounded
    pub lbts: Option<f64>,

    /// SHA256 hash of the federation's `TimeConfig`
    pub config_hash: String,
}

impl TimeSnapshot {
    /// Capture the given state
    pub fn capture(
        federation: Uuid,
        config: &TimeConfig,
        time: &TimeManager,
        handler: &TimeRequestHandler,
    ) -> Result<Self, CheckpointError> {
        let lbts = time.lbts();
        Ok(Self {
            federation,
            federates: time.entries().cloned().collect(),
            handler: handler.clone(),
            lbts: lbts.is_finite().then_some(lbts),
            config_hash: compute_config_hash(config)?,
        })
    }

    pub fn to_json(&self) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Rebuild time state, checking the snapshot against `config` first
    pub fn into_state(
        self,
        config: &TimeConfig,
    ) -> Result<(TimeManager, TimeRequestHandler), CheckpointError> {
        let expected = compute_config_hash(config)?;
        if self.config_hash != expected {
            return Err(CheckpointError::ConfigMismatch {
                snapshot: self.config_hash,
                federation: expected,
            });
        }
        validate_snapshot(&self)?;

        let time = TimeManager::from_entries(self.federates);
        let saved = self.lbts.unwrap_or(f64::INFINITY);
        if time.lbts() != saved {
            warn!(saved, restored = time.lbts(), "restored LBTS differs from recorded value");
        }
        Ok((time, self.handler))
    }
}

// ============================================================================
// Config Hashing
// ============================================================================

/// Compute deterministic SHA256 hash of config
///
/// Keys are sorted before hashing so the result does not depend on field
/// order.
pub fn compute_config_hash<T: Serialize>(config: &T) -> Result<String, CheckpointError> {
    use serde_json::Value;
    use std::collections::BTreeMap;

    fn canonicalize(value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<String, Value> =
                    map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(arr) => Value::Array(arr.into_iter().map(canonicalize).collect()),
            other => other,
        }
    }

    let canonical = canonicalize(serde_json::to_value(config)?);
    let json = serde_json::to_string(&canonical)?;

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// Validation
// ============================================================================

/// Check snapshot integrity
///
/// - Federate handles are unique
/// - Every status satisfies the time and lookahead invariants
/// - Open barriers belong to PENDING regulators and name joined federates
pub fn validate_snapshot(snapshot: &TimeSnapshot) -> Result<(), CheckpointError> {
    let mut handles: BTreeSet<FederateHandle> = BTreeSet::new();
    for entry in &snapshot.federates {
        let status = &entry.status;
        if !handles.insert(status.federate()) {
            return Err(CheckpointError::Invalid(format!(
                "federate {} appears more than once",
                status.federate()
            )));
        }
        if !status.current_time().is_finite() || status.current_time() < 0.0 {
            return Err(CheckpointError::Invalid(format!(
                "federate {} has invalid current time {}",
                status.federate(),
                status.current_time()
            )));
        }
        if !status.lookahead().is_finite() || status.lookahead() < 0.0 {
            return Err(CheckpointError::Invalid(format!(
                "federate {} has invalid lookahead {}",
                status.federate(),
                status.lookahead()
            )));
        }
        if let Some(requested) = status.requested_time() {
            if requested <= status.current_time() {
                return Err(CheckpointError::Invalid(format!(
                    "federate {} requests {} but is already at {}",
                    status.federate(),
                    requested,
                    status.current_time()
                )));
            }
        }
    }

    for (regulator, awaiting) in snapshot.handler.open_barriers() {
        let pending = snapshot
            .federates
            .iter()
            .any(|entry| entry.status.federate() == regulator && entry.status.regulating().is_pending());
        if !pending {
            return Err(CheckpointError::Invalid(format!(
                "federate {} has an open regulation barrier but is not a pending regulator",
                regulator
            )));
        }
        if let Some(stranger) = awaiting.iter().find(|f| !handles.contains(*f)) {
            return Err(CheckpointError::Invalid(format!(
                "barrier of federate {} waits on unknown federate {}",
                regulator, stranger
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::config::RegulationBarrier;

    #[test]
    fn test_compute_config_hash_deterministic() {
        let hash1 = compute_config_hash(&TimeConfig::default()).unwrap();
        let hash2 = compute_config_hash(&TimeConfig::default()).unwrap();
        assert_eq!(hash1, hash2, "Same config should produce same hash");
    }

    #[test]
    fn test_compute_config_hash_different_for_different_configs() {
        let immediate = TimeConfig {
            regulation_barrier: RegulationBarrier::Immediate,
            ..TimeConfig::default()
        };

        let hash1 = compute_config_hash(&TimeConfig::default()).unwrap();
        let hash2 = compute_config_hash(&immediate).unwrap();
        assert_ne!(hash1, hash2, "Different configs should produce different hashes");
    }

    #[test]
    fn test_unbounded_lbts_survives_json() {
        let mut time = TimeManager::new();
        time.joined_federation(1, None);
        let snapshot = TimeSnapshot::capture(
            Uuid::nil(),
            &TimeConfig::default(),
            &time,
            &TimeRequestHandler::new(),
        )
        .unwrap();
        assert_eq!(snapshot.lbts, None);

        let back = TimeSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        let (restored, _) = back.into_state(&TimeConfig::default()).unwrap();
        assert_eq!(restored, time);
    }
}
