//! Time-management configuration
//!
//! Loaded from JSON; every field has a default so an empty object is a valid
//! configuration.
//!
//! | Field                    | Default        | Description                                   |
//! |--------------------------|----------------|-----------------------------------------------|
//! | zero_lookahead_epsilon   | 1e-9           | Lookahead stored when a federate asks for 0   |
//! | regulation_barrier       | "acknowledged" | When a new regulator counts as fully enabled  |

use crate::models::time_status::DEFAULT_ZERO_LOOKAHEAD_EPSILON;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors loading or validating a `TimeConfig`
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("zero_lookahead_epsilon must be finite and positive, got {0}")]
    InvalidEpsilon(f64),
}

/// When a federate enabling regulation is switched from PENDING to ON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegulationBarrier {
    /// Wait for every other joined federate to acknowledge the new regulator
    #[default]
    Acknowledged,

    /// Confirm within the enabling request; peers may briefly lag behind
    Immediate,
}

/// Federation time-management settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeConfig {
    #[serde(default = "TimeConfig::default_zero_lookahead_epsilon")]
    pub zero_lookahead_epsilon: f64,

    #[serde(default)]
    pub regulation_barrier: RegulationBarrier,
}

impl TimeConfig {
    /// Parse and validate a JSON configuration
    ///
    /// # Example
    /// ```
    /// use hla_time_core::federation::config::{RegulationBarrier, TimeConfig};
    ///
    /// let config = TimeConfig::from_json_str(r#"{ "regulation_barrier": "immediate" }"#).unwrap();
    /// assert_eq!(config.regulation_barrier, RegulationBarrier::Immediate);
    /// assert_eq!(config.zero_lookahead_epsilon, 1e-9);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: TimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.zero_lookahead_epsilon.is_finite() || self.zero_lookahead_epsilon <= 0.0 {
            return Err(ConfigError::InvalidEpsilon(self.zero_lookahead_epsilon));
        }
        Ok(())
    }

    fn default_zero_lookahead_epsilon() -> f64 {
        DEFAULT_ZERO_LOOKAHEAD_EPSILON
    }
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            zero_lookahead_epsilon: Self::default_zero_lookahead_epsilon(),
            regulation_barrier: RegulationBarrier::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = TimeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, TimeConfig::default());
    }

    #[test]
    fn test_rejects_non_positive_epsilon() {
        let err = TimeConfig::from_json_str(r#"{ "zero_lookahead_epsilon": 0.0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEpsilon(_)));
    }

    #[test]
    fn test_rejects_unknown_barrier() {
        let err = TimeConfig::from_json_str(r#"{ "regulation_barrier": "sleep" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
